//! VMX capability reporting and the derived per-category descriptors.

use bit_field::BitField;
use bitflags::bitflags;

use axerrno::{AxResult, ax_err};

use super::vmcs::controls::{PrimaryControls, SecondaryControls};
use crate::frame::PhysFrame;
use crate::msr::{Msr, MsrReadWrite};
use crate::{Hal, HostPhysAddr};

/// A revision-stamped 4 KiB region: the VMXON region or a VMCS.
///
/// The physical address of the region is its processor-visible identity.
#[derive(Debug)]
pub struct VmxRegion<H: Hal> {
    frame: PhysFrame<H>,
}

impl<H: Hal> VmxRegion<H> {
    /// Create an uninitialized placeholder region.
    ///
    /// # Safety
    ///
    /// The caller must ensure the placeholder is never handed to hardware.
    pub const unsafe fn uninit() -> Self {
        Self {
            frame: unsafe { PhysFrame::uninit() },
        }
    }

    /// Allocate a zeroed region and stamp the revision identifier (and, for
    /// shadow VMCSes, the shadow indicator) into its first word.
    pub fn new(revision_id: u32, shadow_indicator: bool) -> AxResult<Self> {
        let frame = PhysFrame::alloc_zero()?;
        unsafe {
            (frame.as_mut_ptr() as *mut u32)
                .write_volatile((revision_id & 0x7fff_ffff) | ((shadow_indicator as u32) << 31));
        }
        Ok(Self { frame })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }
}

/// Decoded `IA32_VMX_BASIC` capability report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxBasic {
    /// The 31-bit VMCS revision identifier used by the processor.
    pub revision_id: u32,
    /// The required size of the VMXON/VMCS regions.
    pub region_size: u16,
    /// Whether physical addresses in VMX structures are limited to 32 bits.
    pub is_32bit_address: bool,
    /// The memory type the processor uses to access the VMCS.
    pub mem_type: u8,
    /// Whether INS/OUTS exits report instruction information.
    pub io_exit_info: bool,
    /// Whether the four control categories have `TRUE_*` capability reports.
    pub vmx_flex_controls: bool,
}

impl MsrReadWrite for VmxBasic {
    const MSR: Msr = Msr::IA32_VMX_BASIC;
}

impl VmxBasic {
    pub const VMX_MEMORY_TYPE_WRITE_BACK: u8 = 6;

    /// Read and decode the register.
    pub fn read() -> Self {
        Self::from(Self::read_raw())
    }
}

impl From<u64> for VmxBasic {
    fn from(msr: u64) -> Self {
        Self {
            revision_id: msr.get_bits(0..31) as u32,
            region_size: msr.get_bits(32..45) as u16,
            is_32bit_address: msr.get_bit(48),
            mem_type: msr.get_bits(50..54) as u8,
            io_exit_info: msr.get_bit(54),
            vmx_flex_controls: msr.get_bit(55),
        }
    }
}

/// The `IA32_FEATURE_CONTROL` register, which firmware uses to lock
/// virtualization on or off.
pub struct FeatureControl;

impl MsrReadWrite for FeatureControl {
    const MSR: Msr = Msr::IA32_FEATURE_CONTROL;
}

impl FeatureControl {
    pub fn read() -> FeatureControlFlags {
        FeatureControlFlags::from_bits_truncate(Self::read_raw())
    }
}

bitflags! {
    /// Relevant bits of `IA32_FEATURE_CONTROL`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
        /// The register is locked; writes fault until the next reset.
        const LOCKED = 1 << 0;
        /// VMXON is permitted inside SMX operation.
        const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
        /// VMXON is permitted outside SMX operation.
        const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
    }
}

bitflags! {
    /// Decoded `IA32_VMX_EPT_VPID_CAP` report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EptVpidCaps: u64 {
        /// Execute-only EPT translations are supported.
        const EXECUTE_ONLY = 1 << 0;
        /// Page-walk length 4 is supported.
        const PAGE_WALK_LENGTH_4 = 1 << 6;
        /// EPT paging structures may be write-back cacheable.
        const MEMORY_TYPE_WB = 1 << 14;
        /// 2 MiB EPT mappings.
        const PAGE_2M = 1 << 16;
        /// 1 GiB EPT mappings.
        const PAGE_1G = 1 << 17;
        /// The INVEPT instruction is implemented.
        const INVEPT = 1 << 20;
        /// EPT accessed/dirty flags.
        const EPT_ACCESSED_DIRTY = 1 << 21;
        const INVEPT_SINGLE_CONTEXT = 1 << 25;
        const INVEPT_ALL_CONTEXT = 1 << 26;
        /// The INVVPID instruction is implemented.
        const INVVPID = 1 << 32;
        const INVVPID_INDIVIDUAL_ADDR = 1 << 40;
        const INVVPID_SINGLE_CONTEXT = 1 << 41;
        const INVVPID_ALL_CONTEXT = 1 << 42;
    }
}

/// Capability descriptor for one control-field category.
///
/// `mandatory` holds the bits the processor requires to be set, `allowed`
/// the bits it permits; everything outside `allowed` must read as zero.
/// Hardware guarantees `mandatory ⊆ allowed` — [`CtrlMask::validate`]
/// refuses a report that breaks this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CtrlMask {
    pub mandatory: u32,
    pub allowed: u32,
}

impl CtrlMask {
    /// Split a raw capability report into its mandatory (low) and allowed
    /// (high) halves.
    pub const fn from_raw(report: u64) -> Self {
        Self {
            mandatory: report as u32,
            allowed: (report >> 32) as u32,
        }
    }

    /// Compose a hardware-legal control-field value from a desired pattern.
    ///
    /// The result is the unique minimal value that carries every mandatory
    /// bit and no disallowed bit, whatever `desired` contains.
    pub const fn compose(&self, desired: u32) -> u32 {
        (desired | self.mandatory) & self.allowed
    }

    /// Whether every bit of `bits` may legally be set in this category.
    pub const fn allows(&self, bits: u32) -> bool {
        self.allowed & bits == bits
    }

    /// Remove `bits` from the category entirely, forcing [`compose`] to
    /// clear them.
    ///
    /// Both halves are stripped so the descriptor stays internally
    /// consistent.
    ///
    /// [`compose`]: CtrlMask::compose
    pub(crate) fn strip(&mut self, bits: u32) {
        self.mandatory &= !bits;
        self.allowed &= !bits;
    }

    pub(crate) fn validate(&self) -> AxResult {
        if self.mandatory & !self.allowed != 0 {
            return ax_err!(InvalidData, "capability report: mandatory bits exceed allowed bits");
        }
        Ok(())
    }
}

/// Fixed-bit requirements for a control register, derived from a
/// FIXED0/FIXED1 report pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixedBits {
    pub must_one: u64,
    pub must_zero: u64,
}

impl FixedBits {
    /// FIXED0 lists the bits that must be 1; the complement of FIXED1 lists
    /// the bits that must be 0.
    pub const fn from_report(fixed0: u64, fixed1: u64) -> Self {
        Self {
            must_one: fixed0,
            must_zero: !fixed1,
        }
    }

    /// Force the fixed bits onto `value`, preserving everything else.
    pub const fn apply(&self, value: u64) -> u64 {
        (value & !self.must_zero) | self.must_one
    }

    /// Whether `value` already satisfies the fixed-bit requirements.
    pub const fn permits(&self, value: u64) -> bool {
        value & self.must_one == self.must_one && value & self.must_zero == 0
    }

    pub(crate) fn validate(&self) -> AxResult {
        if self.must_one & self.must_zero != 0 {
            return ax_err!(InvalidData, "fixed-bit report: contradictory requirements");
        }
        Ok(())
    }
}

/// Raw snapshot of every capability register the negotiation consumes.
///
/// Reading and deriving are split so the derivation stays a pure function
/// over this snapshot: identical snapshots yield identical descriptors, the
/// property that makes redundant per-CPU derivation benign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxCapabilityReports {
    pub basic: u64,
    pub pinbased: u64,
    pub procbased: u64,
    /// Present only when the primary category can activate secondary
    /// controls.
    pub procbased2: Option<u64>,
    pub exit: u64,
    pub entry: u64,
    /// Present only when the secondary category advertises EPT or VPID.
    pub ept_vpid: Option<u64>,
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
}

macro_rules! fixed_pair {
    ($crx:ident) => {{
        paste::paste! {
            (
                Msr::[<IA32_VMX_ $crx _FIXED0>].read(),
                Msr::[<IA32_VMX_ $crx _FIXED1>].read(),
            )
        }
    }};
}

impl VmxCapabilityReports {
    /// Snapshot the capability registers of the running CPU.
    ///
    /// Prefers the `TRUE_*` reports when the basic report advertises them,
    /// and reads the conditional reports only when the categories gating
    /// them are available.
    pub fn read() -> Self {
        let basic_raw = Msr::IA32_VMX_BASIC.read();
        let basic = VmxBasic::from(basic_raw);

        let (pinbased, procbased, exit, entry) = if basic.vmx_flex_controls {
            (
                Msr::IA32_VMX_TRUE_PINBASED_CTLS.read(),
                Msr::IA32_VMX_TRUE_PROCBASED_CTLS.read(),
                Msr::IA32_VMX_TRUE_EXIT_CTLS.read(),
                Msr::IA32_VMX_TRUE_ENTRY_CTLS.read(),
            )
        } else {
            (
                Msr::IA32_VMX_PINBASED_CTLS.read(),
                Msr::IA32_VMX_PROCBASED_CTLS.read(),
                Msr::IA32_VMX_EXIT_CTLS.read(),
                Msr::IA32_VMX_ENTRY_CTLS.read(),
            )
        };

        let procbased2 = CtrlMask::from_raw(procbased)
            .allows(PrimaryControls::SECONDARY_CONTROLS.bits())
            .then(|| Msr::IA32_VMX_PROCBASED_CTLS2.read());

        let ept_vpid = procbased2.and_then(|raw| {
            let mask = CtrlMask::from_raw(raw);
            (mask.allows(SecondaryControls::ENABLE_EPT.bits())
                || mask.allows(SecondaryControls::ENABLE_VPID.bits()))
            .then(|| Msr::IA32_VMX_EPT_VPID_CAP.read())
        });

        let (cr0_fixed0, cr0_fixed1) = fixed_pair!(CR0);
        let (cr4_fixed0, cr4_fixed1) = fixed_pair!(CR4);

        Self {
            basic: basic_raw,
            pinbased,
            procbased,
            procbased2,
            exit,
            entry,
            ept_vpid,
            cr0_fixed0,
            cr0_fixed1,
            cr4_fixed0,
            cr4_fixed1,
        }
    }
}

/// The negotiated capability store for this machine.
///
/// Derived once per boot (redundant derivations on other CPUs are identical
/// by the hardware-homogeneity assumption) and immutable afterwards; every
/// VMCS built on any CPU composes its control fields against these
/// descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxCaps {
    pub basic: VmxBasic,
    pub ctrl_pin: CtrlMask,
    pub ctrl_cpu: CtrlMask,
    pub ctrl_cpu2: CtrlMask,
    pub ctrl_exit: CtrlMask,
    pub ctrl_entry: CtrlMask,
    pub ept_vpid: EptVpidCaps,
    pub fix_cr0: FixedBits,
    pub fix_cr4: FixedBits,
}

impl VmxCaps {
    pub fn revision_id(&self) -> u32 {
        self.basic.revision_id
    }

    pub fn has_secondary(&self) -> bool {
        self.ctrl_cpu.allows(PrimaryControls::SECONDARY_CONTROLS.bits())
    }

    pub fn has_ept(&self) -> bool {
        self.ctrl_cpu2.allows(SecondaryControls::ENABLE_EPT.bits())
    }

    pub fn has_vpid(&self) -> bool {
        self.ctrl_cpu2.allows(SecondaryControls::ENABLE_VPID.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_sets_mandatory_and_clears_disallowed() {
        let cases = [
            (0x0000_0045u32, 0xffff_ffffu32),
            (0x16, 0xf7f9_fffe),
            (0, 0),
            (0x8000_0001, 0x8000_00ff),
        ];
        for (mandatory, allowed) in cases {
            // Only well-formed reports: mandatory must be inside allowed.
            let mask = CtrlMask {
                mandatory: mandatory & allowed,
                allowed,
            };
            for desired in [0u32, 0x9, 0xffff_ffff, 0x1234_5678] {
                let composed = mask.compose(desired);
                assert_eq!(composed & mask.mandatory, mask.mandatory);
                assert_eq!(composed & !mask.allowed, 0);
                // Minimality: nothing beyond desired|mandatory, clipped to
                // allowed.
                assert_eq!(composed, (desired | mask.mandatory) & mask.allowed);
            }
        }
    }

    #[test]
    fn validate_rejects_mandatory_outside_allowed() {
        let mask = CtrlMask {
            mandatory: 0b1010,
            allowed: 0b0010,
        };
        assert!(mask.validate().is_err());
        assert!(
            CtrlMask {
                mandatory: 0b0010,
                allowed: 0b1010,
            }
            .validate()
            .is_ok()
        );
    }

    #[test]
    fn strip_clears_both_halves() {
        let mut mask = CtrlMask {
            mandatory: 0b0110,
            allowed: 0b1110,
        };
        mask.strip(0b0100);
        assert_eq!(mask.mandatory, 0b0010);
        assert_eq!(mask.allowed, 0b1010);
        assert_eq!(mask.compose(0b0100), 0b0010);
    }

    #[test]
    fn fixed_bits_force_and_preserve() {
        // must-one = bit 0 and 5, must-zero = bit 2 and 30.
        let fix = FixedBits::from_report(0x21, !((1 << 2) | (1 << 30)));
        assert!(fix.validate().is_ok());

        let value = 0xdead_beef_u64;
        let applied = fix.apply(value);
        assert_eq!(applied & fix.must_one, fix.must_one);
        assert_eq!(applied & fix.must_zero, 0);
        // Bits outside both masks are untouched.
        let free = !(fix.must_one | fix.must_zero);
        assert_eq!(applied & free, value & free);

        assert!(fix.permits(applied));
        assert!(!fix.permits(0));
    }

    #[test]
    fn fixed_bits_detect_contradiction() {
        // Bit 3 simultaneously must-one and must-zero.
        let fix = FixedBits {
            must_one: 1 << 3,
            must_zero: 1 << 3,
        };
        assert!(fix.validate().is_err());
    }

    #[test]
    fn basic_report_decodes() {
        let raw = 0x12u64
            | (0x1000u64 << 32)
            | ((VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK as u64) << 50)
            | (1 << 54)
            | (1 << 55);
        let basic = VmxBasic::from(raw);
        assert_eq!(basic.revision_id, 0x12);
        assert_eq!(basic.region_size, 0x1000);
        assert!(!basic.is_32bit_address);
        assert_eq!(basic.mem_type, VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK);
        assert!(basic.io_exit_info);
        assert!(basic.vmx_flex_controls);
    }

    #[test]
    fn ctrl_mask_split() {
        let mask = CtrlMask::from_raw(0x0000_00ff_0000_0016);
        assert_eq!(mask.mandatory, 0x16);
        assert_eq!(mask.allowed, 0xff);
        assert!(mask.allows(0x80));
        assert!(!mask.allows(0x100));
    }
}
