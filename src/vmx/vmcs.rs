//! VMCS field encodings and the per-virtual-CPU control-structure
//! lifecycle: allocate, clear, activate, populate.

#![allow(non_camel_case_types)]

use core::sync::atomic::{AtomicU16, Ordering};

use axerrno::AxResult;

use super::instructions;
use super::structs::{VmxCaps, VmxRegion};
use crate::{Hal, HostPhysAddr};

/// VM-execution, VM-exit and VM-entry control bits.
///
/// Only the bits this hypervisor negotiates are named; the capability
/// descriptors decide what actually reaches hardware.
pub mod controls {
    use bitflags::bitflags;

    bitflags! {
        /// Pin-based VM-execution controls.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct PinbasedControls: u32 {
            /// External interrupts cause VM exits.
            const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
            /// Non-maskable interrupts cause VM exits.
            const NMI_EXITING = 1 << 3;
            /// NMIs are subject to virtual-NMI blocking.
            const VIRTUAL_NMIS = 1 << 5;
            /// The VMX-preemption timer counts down in VMX non-root mode.
            const VMX_PREEMPTION_TIMER = 1 << 6;
        }

        /// Primary processor-based VM-execution controls.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct PrimaryControls: u32 {
            const INTERRUPT_WINDOW_EXITING = 1 << 2;
            const HLT_EXITING = 1 << 7;
            const INVLPG_EXITING = 1 << 9;
            const CR3_LOAD_EXITING = 1 << 15;
            const CR3_STORE_EXITING = 1 << 16;
            const CR8_LOAD_EXITING = 1 << 19;
            const CR8_STORE_EXITING = 1 << 20;
            /// Every I/O instruction causes a VM exit.
            const UNCOND_IO_EXITING = 1 << 24;
            const USE_IO_BITMAPS = 1 << 25;
            const MONITOR_TRAP_FLAG = 1 << 27;
            const USE_MSR_BITMAPS = 1 << 28;
            /// The secondary processor-based controls are consulted.
            const SECONDARY_CONTROLS = 1 << 31;
        }

        /// Secondary processor-based VM-execution controls.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct SecondaryControls: u32 {
            const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
            /// Extended page tables translate guest-physical addresses.
            const ENABLE_EPT = 1 << 1;
            const ENABLE_RDTSCP = 1 << 3;
            /// Address-translation caches are tagged with the VPID.
            const ENABLE_VPID = 1 << 5;
            const UNRESTRICTED_GUEST = 1 << 7;
            const ENABLE_INVPCID = 1 << 12;
        }

        /// VM-exit controls.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct ExitControls: u32 {
            const SAVE_DEBUG_CONTROLS = 1 << 2;
            /// Return to a 64-bit host.
            const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
            /// Acknowledge the interrupt controller on external-interrupt
            /// exits.
            const ACK_INTERRUPT_ON_EXIT = 1 << 15;
            const SAVE_IA32_PAT = 1 << 18;
            const LOAD_IA32_PAT = 1 << 19;
            const SAVE_IA32_EFER = 1 << 20;
            const LOAD_IA32_EFER = 1 << 21;
        }

        /// VM-entry controls.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct EntryControls: u32 {
            const LOAD_DEBUG_CONTROLS = 1 << 2;
            const IA32E_MODE_GUEST = 1 << 9;
            const LOAD_IA32_PAT = 1 << 14;
            const LOAD_IA32_EFER = 1 << 15;
        }
    }
}

macro_rules! vmcs_read {
    ($field_enum:ident, $ty:ty) => {
        impl $field_enum {
            /// Read the field from the current VMCS.
            pub fn read(self) -> AxResult<$ty> {
                instructions::vmread(self as u32).map(|v| v as $ty)
            }
        }
    };
}

macro_rules! vmcs_write {
    ($field_enum:ident, $ty:ty) => {
        impl $field_enum {
            /// Write the field of the current VMCS.
            pub fn write(self, value: $ty) -> AxResult {
                instructions::vmwrite(self as u32, value as u64)
            }
        }
    };
}

/// 16-bit control fields.
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum VmcsControl16 {
    /// Virtual-processor identifier.
    VPID = 0x0,
    POSTED_INTERRUPT_NOTIFICATION_VECTOR = 0x2,
    EPTP_INDEX = 0x4,
}
vmcs_read!(VmcsControl16, u16);
vmcs_write!(VmcsControl16, u16);

/// 32-bit control fields.
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum VmcsControl32 {
    PINBASED_EXEC_CONTROLS = 0x4000,
    PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    PAGE_FAULT_ERR_CODE_MASK = 0x4006,
    PAGE_FAULT_ERR_CODE_MATCH = 0x4008,
    CR3_TARGET_COUNT = 0x400a,
    VMEXIT_CONTROLS = 0x400c,
    VMEXIT_MSR_STORE_COUNT = 0x400e,
    VMEXIT_MSR_LOAD_COUNT = 0x4010,
    VMENTRY_CONTROLS = 0x4012,
    VMENTRY_MSR_LOAD_COUNT = 0x4014,
    VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
    TPR_THRESHOLD = 0x401c,
    SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401e,
}
vmcs_read!(VmcsControl32, u32);
vmcs_write!(VmcsControl32, u32);

/// 64-bit control fields.
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum VmcsControl64 {
    IO_BITMAP_A_ADDR = 0x2000,
    IO_BITMAP_B_ADDR = 0x2002,
    MSR_BITMAPS_ADDR = 0x2004,
    /// Extended-page-table pointer: table root plus attribute bits.
    EPTP = 0x201a,
}
vmcs_read!(VmcsControl64, u64);
vmcs_write!(VmcsControl64, u64);

/// 64-bit guest-state fields.
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum VmcsGuest64 {
    /// The guest/host linkage pointer; all-ones means "no parent".
    LINK_PTR = 0x2800,
    IA32_DEBUGCTL = 0x2802,
    IA32_PAT = 0x2804,
    IA32_EFER = 0x2806,
}
vmcs_read!(VmcsGuest64, u64);
vmcs_write!(VmcsGuest64, u64);

/// 16-bit host-state fields.
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum VmcsHost16 {
    ES_SELECTOR = 0xc00,
    CS_SELECTOR = 0xc02,
    SS_SELECTOR = 0xc04,
    DS_SELECTOR = 0xc06,
    FS_SELECTOR = 0xc08,
    GS_SELECTOR = 0xc0a,
    TR_SELECTOR = 0xc0c,
}
vmcs_read!(VmcsHost16, u16);
vmcs_write!(VmcsHost16, u16);

/// 32-bit host-state fields.
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum VmcsHost32 {
    IA32_SYSENTER_CS = 0x4c00,
}
vmcs_read!(VmcsHost32, u32);
vmcs_write!(VmcsHost32, u32);

/// Natural-width host-state fields.
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum VmcsHostNW {
    CR0 = 0x6c00,
    CR3 = 0x6c02,
    CR4 = 0x6c04,
    FS_BASE = 0x6c06,
    GS_BASE = 0x6c08,
    TR_BASE = 0x6c0a,
    GDTR_BASE = 0x6c0c,
    IDTR_BASE = 0x6c0e,
    IA32_SYSENTER_ESP = 0x6c10,
    IA32_SYSENTER_EIP = 0x6c12,
    RSP = 0x6c14,
    RIP = 0x6c16,
}
vmcs_read!(VmcsHostNW, usize);
vmcs_write!(VmcsHostNW, usize);

/// 32-bit read-only data fields.
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum VmcsReadOnly32 {
    VM_INSTRUCTION_ERROR = 0x4400,
}
vmcs_read!(VmcsReadOnly32, u32);

/// VM-instruction error numbers. (SDM Vol. 3C, Section 31.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxInstructionError(u32);

impl VmxInstructionError {
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            0 => "OK",
            1 => "VMCALL executed in VMX root operation",
            2 => "VMCLEAR with invalid physical address",
            3 => "VMCLEAR with VMXON pointer",
            4 => "VMLAUNCH with non-clear VMCS",
            5 => "VMRESUME with non-launched VMCS",
            7 => "VM entry with invalid control field(s)",
            8 => "VM entry with invalid host-state field(s)",
            9 => "VMPTRLD with invalid physical address",
            10 => "VMPTRLD with VMXON pointer",
            11 => "VMPTRLD with incorrect VMCS revision identifier",
            12 => "VMREAD/VMWRITE from/to unsupported VMCS component",
            13 => "VMWRITE to read-only VMCS component",
            15 => "VMXON executed in VMX root operation",
            _ => "unknown VMX instruction error",
        }
    }
}

impl From<u32> for VmxInstructionError {
    fn from(err: u32) -> Self {
        Self(err)
    }
}

/// The error number recorded by the last failing VMX instruction on this
/// CPU.
pub fn instruction_error() -> VmxInstructionError {
    VmcsReadOnly32::VM_INSTRUCTION_ERROR
        .read()
        .unwrap_or(0)
        .into()
}

/// EPT pointer attribute bits: paging-structure cache policy and the
/// walk-length-minus-one encoding.
const EPTP_MEMORY_TYPE_WB: u64 = 6;
const EPTP_PAGE_WALK_LENGTH_4: u64 = 3 << 3;

/// Write the extended-page-table root of the current VMCS, combined with
/// the fixed attribute encoding.
pub fn set_ept_pointer(ept_root: HostPhysAddr) -> AxResult {
    VmcsControl64::EPTP.write(ept_root.as_usize() as u64 | EPTP_MEMORY_TYPE_WB | EPTP_PAGE_WALK_LENGTH_4)
}

/// Allocator for virtual-processor identifiers.
///
/// Shared by every logical CPU; the single atomic increment is all the
/// cross-CPU synchronization structure construction needs. Identifier 0 is
/// the processor's "untagged" value and is never handed out.
static VPID_ALLOCATOR: AtomicU16 = AtomicU16::new(0);

pub(crate) fn alloc_vpid() -> u16 {
    VPID_ALLOCATOR.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// Host execution context to restore on every VM exit, plus the
/// extended-page-table root.
///
/// Every value is an opaque constant owned by the embedder's descriptor
/// table, task and entry-point setup.
#[derive(Debug, Clone, Copy)]
pub struct HostContext {
    /// Host RSP loaded on VM exit.
    pub stack_top: usize,
    /// Host RIP loaded on VM exit.
    pub entry_vmexit: usize,
    /// Fast system-call entry, loaded into the SYSENTER EIP field.
    pub entry_syscall: usize,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub code_selector: u16,
    pub data_selector: u16,
    pub task_selector: u16,
    pub gdt_base: usize,
    pub idt_base: usize,
    /// Base of the running task's state segment.
    pub tss_base: usize,
    /// Address of the running task's privilege-0 stack-pointer slot, loaded
    /// into the SYSENTER ESP field.
    pub tss_sp0: usize,
    /// Physical root of the extended page tables.
    pub ept_root: HostPhysAddr,
}

/// A per-virtual-CPU control structure.
///
/// At most one structure is current on a logical CPU; ownership of
/// "current" moves only through [`Vmcs::activate`], and every field access
/// targets the current structure. The constructor is the only writer in
/// this crate; guest-state updates belong to later subsystems.
#[derive(Debug)]
pub struct Vmcs<H: Hal> {
    region: VmxRegion<H>,
}

impl<H: Hal> Vmcs<H> {
    /// Allocate a zeroed structure stamped with `revision_id`.
    pub fn new(revision_id: u32) -> AxResult<Self> {
        Ok(Self {
            region: VmxRegion::new(revision_id, false)?,
        })
    }

    /// The physical address that identifies this structure to the
    /// processor.
    pub fn phys_addr(&self) -> HostPhysAddr {
        self.region.phys_addr()
    }

    /// Reset the structure to its inactive launch state. Must precede the
    /// first activation; also detaches the structure if it is current.
    pub fn clear(&self) -> AxResult {
        instructions::vmclear(self.phys_addr())
    }

    /// Make this the current structure of the running CPU. All subsequent
    /// field accesses and VM entries on this CPU refer to it.
    pub fn activate(&self) -> AxResult {
        trace!("activating VMCS @ {:#x}", self.phys_addr());
        instructions::vmptrld(self.phys_addr())
    }

    /// Build the baseline structure for the running CPU: clear, activate,
    /// then populate the negotiated control fields and the host context.
    pub fn new_root(caps: &VmxCaps, host: &HostContext) -> AxResult<Self> {
        let vmcs = Self::new(caps.revision_id())?;
        vmcs.clear()?;
        vmcs.activate()?;
        vmcs.setup_controls(caps, host.ept_root)?;
        vmcs.setup_host(host)?;
        Ok(vmcs)
    }

    fn setup_controls(&self, caps: &VmxCaps, ept_root: HostPhysAddr) -> AxResult {
        use controls::*;

        // Intercept external interrupts and NMIs.
        let pin = caps
            .ctrl_pin
            .compose((PinbasedControls::EXTERNAL_INTERRUPT_EXITING | PinbasedControls::NMI_EXITING).bits());
        VmcsControl32::PINBASED_EXEC_CONTROLS.write(pin)?;

        // The processor-based policy lives entirely in the negotiated
        // mandatory masks.
        let cpu = caps.ctrl_cpu.compose(0);
        VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS.write(cpu)?;
        if cpu & PrimaryControls::SECONDARY_CONTROLS.bits() != 0 {
            VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS.write(caps.ctrl_cpu2.compose(0))?;
        }

        // Acknowledge interrupts on exit; return to a 64-bit host.
        let exit = caps.ctrl_exit.compose(
            (ExitControls::ACK_INTERRUPT_ON_EXIT | ExitControls::HOST_ADDRESS_SPACE_SIZE).bits(),
        );
        VmcsControl32::VMEXIT_CONTROLS.write(exit)?;

        let entry = caps.ctrl_entry.compose(0);
        VmcsControl32::VMENTRY_CONTROLS.write(entry)?;

        // Every page fault exits: mask and match both zero.
        VmcsControl32::PAGE_FAULT_ERR_CODE_MASK.write(0)?;
        VmcsControl32::PAGE_FAULT_ERR_CODE_MATCH.write(0)?;
        VmcsControl32::CR3_TARGET_COUNT.write(0)?;

        // No parent structure.
        VmcsGuest64::LINK_PTR.write(u64::MAX)?;

        // The identifier is consumed even when tagging ended up disabled,
        // keeping assignment monotonic across all structures.
        let vpid = alloc_vpid();
        if caps.has_vpid() {
            VmcsControl16::VPID.write(vpid)?;
        }
        if caps.has_ept() {
            set_ept_pointer(ept_root)?;
        }
        Ok(())
    }

    fn setup_host(&self, host: &HostContext) -> AxResult {
        VmcsHost16::CS_SELECTOR.write(host.code_selector)?;
        VmcsHost16::SS_SELECTOR.write(host.data_selector)?;
        VmcsHost16::DS_SELECTOR.write(host.data_selector)?;
        VmcsHost16::ES_SELECTOR.write(host.data_selector)?;
        VmcsHost16::TR_SELECTOR.write(host.task_selector)?;

        VmcsHostNW::CR0.write(host.cr0 as usize)?;
        VmcsHostNW::CR3.write(host.cr3 as usize)?;
        VmcsHostNW::CR4.write(host.cr4 as usize)?;

        VmcsHostNW::TR_BASE.write(host.tss_base)?;
        VmcsHostNW::GDTR_BASE.write(host.gdt_base)?;
        VmcsHostNW::IDTR_BASE.write(host.idt_base)?;

        VmcsHost32::IA32_SYSENTER_CS.write(host.code_selector as u32)?;
        VmcsHostNW::IA32_SYSENTER_ESP.write(host.tss_sp0)?;
        VmcsHostNW::IA32_SYSENTER_EIP.write(host.entry_syscall)?;

        VmcsHostNW::RSP.write(host.stack_top)?;
        VmcsHostNW::RIP.write(host.entry_vmexit)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockHal, sample_caps, sample_host_context};
    use alloc::vec::Vec;
    use axerrno::AxError;
    use memory_addr::PhysAddr;

    fn enter_vmx_operation() {
        instructions::vmxon(PhysAddr::from(0x1000)).unwrap();
    }

    #[test]
    fn field_writes_require_an_active_structure() {
        enter_vmx_operation();
        let vmcs = Vmcs::<MockHal>::new(1).unwrap();
        vmcs.clear().unwrap();

        // Never activated: the write must be rejected.
        let err = VmcsControl32::PINBASED_EXEC_CONTROLS.write(0).unwrap_err();
        assert_eq!(err, AxError::BadState);

        vmcs.activate().unwrap();
        VmcsControl32::PINBASED_EXEC_CONTROLS.write(0x16).unwrap();
        assert_eq!(VmcsControl32::PINBASED_EXEC_CONTROLS.read().unwrap(), 0x16);
    }

    #[test]
    fn activation_transfers_explicitly() {
        enter_vmx_operation();
        let first = Vmcs::<MockHal>::new(1).unwrap();
        let second = Vmcs::<MockHal>::new(1).unwrap();
        first.clear().unwrap();
        second.clear().unwrap();

        first.activate().unwrap();
        VmcsControl32::EXCEPTION_BITMAP.write(0xaa).unwrap();

        second.activate().unwrap();
        VmcsControl32::EXCEPTION_BITMAP.write(0x55).unwrap();

        // Re-activating the first structure sees its own value again.
        first.activate().unwrap();
        assert_eq!(VmcsControl32::EXCEPTION_BITMAP.read().unwrap(), 0xaa);
    }

    #[test]
    fn clearing_the_current_structure_detaches_it() {
        enter_vmx_operation();
        let vmcs = Vmcs::<MockHal>::new(1).unwrap();
        vmcs.clear().unwrap();
        vmcs.activate().unwrap();
        vmcs.clear().unwrap();
        assert_eq!(
            VmcsControl32::EXCEPTION_BITMAP.write(1).unwrap_err(),
            AxError::BadState
        );
    }

    #[test]
    fn root_structure_population() {
        enter_vmx_operation();
        let caps = sample_caps();
        let host = sample_host_context();
        let vmcs = Vmcs::<MockHal>::new_root(&caps, &host).unwrap();

        // The root structure stays current; read the fields back.
        let pin = VmcsControl32::PINBASED_EXEC_CONTROLS.read().unwrap();
        assert_eq!(pin, caps.ctrl_pin.compose(0b1001));
        assert_eq!(pin & caps.ctrl_pin.mandatory, caps.ctrl_pin.mandatory);
        assert_eq!(pin & !caps.ctrl_pin.allowed, 0);

        let cpu = VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS.read().unwrap();
        assert_eq!(cpu, caps.ctrl_cpu.compose(0));
        assert_ne!(cpu & controls::PrimaryControls::SECONDARY_CONTROLS.bits(), 0);

        let cpu2 = VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS.read().unwrap();
        assert_eq!(cpu2, caps.ctrl_cpu2.compose(0));

        assert_eq!(VmcsGuest64::LINK_PTR.read().unwrap(), u64::MAX);
        assert_ne!(VmcsControl16::VPID.read().unwrap(), 0);

        // EPT root ORed with write-back memtype and 4-level walk encoding.
        let eptp = VmcsControl64::EPTP.read().unwrap();
        assert_eq!(eptp, host.ept_root.as_usize() as u64 | 0x1e);

        assert_eq!(VmcsHostNW::RSP.read().unwrap(), host.stack_top);
        assert_eq!(VmcsHostNW::RIP.read().unwrap(), host.entry_vmexit);
        assert_eq!(VmcsHost16::CS_SELECTOR.read().unwrap(), host.code_selector);
        assert_eq!(VmcsHost16::SS_SELECTOR.read().unwrap(), host.data_selector);
        assert_eq!(VmcsHost16::TR_SELECTOR.read().unwrap(), host.task_selector);
        assert_eq!(VmcsHostNW::GDTR_BASE.read().unwrap(), host.gdt_base);
        assert_eq!(VmcsHostNW::IDTR_BASE.read().unwrap(), host.idt_base);
        assert_eq!(VmcsHostNW::IA32_SYSENTER_ESP.read().unwrap(), host.tss_sp0);
        assert_eq!(VmcsHostNW::IA32_SYSENTER_EIP.read().unwrap(), host.entry_syscall);
        assert_eq!(
            VmcsHost32::IA32_SYSENTER_CS.read().unwrap(),
            host.code_selector as u32
        );
    }

    #[test]
    fn root_structure_skips_unavailable_tagging_fields() {
        enter_vmx_operation();
        let mut caps = sample_caps();
        caps.ctrl_cpu2.strip(
            (controls::SecondaryControls::ENABLE_EPT | controls::SecondaryControls::ENABLE_VPID)
                .bits(),
        );
        let host = sample_host_context();
        let _vmcs = Vmcs::<MockHal>::new_root(&caps, &host).unwrap();

        assert_eq!(VmcsControl16::VPID.read().unwrap(), 0);
        assert_eq!(VmcsControl64::EPTP.read().unwrap(), 0);
    }

    #[test]
    fn identifiers_are_unique_across_concurrent_construction() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 16;

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                std::thread::spawn(|| (0..PER_THREAD).map(|_| alloc_vpid()).collect::<Vec<_>>())
            })
            .collect();

        let mut ids: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        let before = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), before);
        assert!(!ids.contains(&0));
    }

    #[test]
    fn instruction_error_strings() {
        assert_eq!(
            VmxInstructionError::from(4).as_str(),
            "VMLAUNCH with non-clear VMCS"
        );
        assert_eq!(
            VmxInstructionError::from(999).as_str(),
            "unknown VMX instruction error"
        );
    }
}
