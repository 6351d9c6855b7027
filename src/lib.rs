#![no_std]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

#[cfg(test)]
extern crate std;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub(crate) mod msr;
        mod frame;
        pub mod uaccess;
        mod vmx;

        pub use frame::PhysFrame;
        pub use uaccess::{FixupEntry, compare_exchange, fixup_table, peek, resume_address};
        pub use vmx::structs::{
            CtrlMask, EptVpidCaps, FeatureControl, FeatureControlFlags, FixedBits, VmxBasic,
            VmxCapabilityReports, VmxCaps, VmxRegion,
        };
        pub use vmx::vmcs::{
            HostContext, Vmcs, VmcsControl16, VmcsControl32, VmcsControl64, VmcsGuest64,
            VmcsHost16, VmcsHost32, VmcsHostNW, VmcsReadOnly32, VmxInstructionError, controls,
            instruction_error, set_ept_pointer,
        };
        pub use vmx::{SysInfoIf, VmxConfig, VmxPerCpuState, has_hardware_support, vmx_caps};
    } else {
        compile_error!("x86_vmx only supports the x86_64 architecture");
    }
}

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use memory_addr::{PhysAddr as HostPhysAddr, VirtAddr as HostVirtAddr};

/// The interface between this crate and the underlying platform: physical
/// frame allocation and the phys-to-virt translation of the direct mapping.
pub trait Hal {
    /// Allocates one 4 KiB physical frame.
    fn alloc_frame() -> Option<HostPhysAddr>;
    /// Returns a previously allocated frame.
    fn dealloc_frame(paddr: HostPhysAddr);
    /// Translates a physical address to a directly-mapped virtual address.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;
}
