//! Mock implementations and sample data for unit tests.

use alloc::alloc::{Layout, alloc_zeroed, dealloc};

use memory_addr::PhysAddr;

use crate::frame::PAGE_SIZE;
use crate::vmx::structs::{EptVpidCaps, VmxBasic, VmxCapabilityReports, VmxCaps};
use crate::vmx::vmcs::HostContext;
use crate::{Hal, HostPhysAddr, HostVirtAddr};

/// A [`Hal`] backed by the host allocator with an identity phys/virt
/// mapping.
pub struct MockHal;

fn frame_layout() -> Layout {
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

impl Hal for MockHal {
    fn alloc_frame() -> Option<HostPhysAddr> {
        let ptr = unsafe { alloc_zeroed(frame_layout()) };
        if ptr.is_null() {
            None
        } else {
            Some(PhysAddr::from(ptr as usize))
        }
    }

    fn dealloc_frame(paddr: HostPhysAddr) {
        unsafe { dealloc(paddr.as_usize() as *mut u8, frame_layout()) }
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from(paddr.as_usize())
    }
}

struct SysInfoIfImpl;

#[crate_interface::impl_interface]
impl crate::SysInfoIf for SysInfoIfImpl {
    fn withdraw_vmx_feature() {}
}

/// Raw capability values in the shape of a mid-2010s Intel part.
pub fn sample_reports() -> VmxCapabilityReports {
    VmxCapabilityReports {
        basic: 0x12u64
            | (0x1000u64 << 32)
            | ((VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK as u64) << 50)
            | (1 << 54)
            | (1 << 55),
        pinbased: 0x0000_007f_0000_0016,
        procbased: 0xfff9_fffe_0401_e172,
        procbased2: Some(0x0000_10ff_0000_0000),
        exit: 0x007f_ffff_0003_6dfb,
        entry: 0x0000_f3ff_0000_11fb,
        ept_vpid: Some(
            (EptVpidCaps::EXECUTE_ONLY
                | EptVpidCaps::PAGE_WALK_LENGTH_4
                | EptVpidCaps::MEMORY_TYPE_WB
                | EptVpidCaps::PAGE_2M
                | EptVpidCaps::INVEPT
                | EptVpidCaps::INVEPT_SINGLE_CONTEXT
                | EptVpidCaps::INVEPT_ALL_CONTEXT
                | EptVpidCaps::INVVPID
                | EptVpidCaps::INVVPID_INDIVIDUAL_ADDR
                | EptVpidCaps::INVVPID_SINGLE_CONTEXT
                | EptVpidCaps::INVVPID_ALL_CONTEXT)
                .bits(),
        ),
        cr0_fixed0: 0x8005_0033,
        cr0_fixed1: 0xffff_ffff,
        cr4_fixed0: 0x2000,
        cr4_fixed1: 0x0037_27ff,
    }
}

/// A negotiated capability store matching [`sample_reports`] with default
/// configuration.
pub fn sample_caps() -> VmxCaps {
    crate::vmx::negotiate(&sample_reports(), &Default::default()).unwrap()
}

/// Arbitrary but self-consistent host-context constants.
pub fn sample_host_context() -> HostContext {
    HostContext {
        stack_top: 0xffff_8000_0123_f000,
        entry_vmexit: 0xffff_8000_0020_0040,
        entry_syscall: 0xffff_8000_0020_0080,
        cr0: 0x8005_003b,
        cr3: 0x0010_1000,
        cr4: 0x0000_26f0,
        code_selector: 0x08,
        data_selector: 0x10,
        task_selector: 0x20,
        gdt_base: 0xffff_8000_0030_0000,
        idt_base: 0xffff_8000_0030_1000,
        tss_base: 0xffff_8000_0030_2000,
        tss_sp0: 0xffff_8000_0030_2004,
        ept_root: PhysAddr::from(0x0023_0000usize),
    }
}
