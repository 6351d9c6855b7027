use x86_64::registers::control::{Cr0, Cr4, Cr4Flags};

use axerrno::{AxResult, ax_err};
use spin::Once;

use super::instructions;
use super::structs::{
    CtrlMask, EptVpidCaps, FeatureControl, FeatureControlFlags, FixedBits, VmxBasic,
    VmxCapabilityReports, VmxCaps, VmxRegion,
};
use super::vmcs::controls::{PrimaryControls, SecondaryControls};
use super::vmcs::{HostContext, Vmcs};
use super::has_hardware_support;
use crate::Hal;
use crate::frame::PAGE_SIZE;

/// Configuration overrides consumed during capability negotiation.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmxConfig {
    /// Treat the firmware lock as scoped to SMX operation (secure launch
    /// active); demands the stricter in-SMX enable bit.
    pub secure: bool,
    /// Force extended paging off even when hardware supports it.
    pub disable_ept: bool,
    /// Force identifier tagging off even when hardware supports it.
    pub disable_vpid: bool,
}

/// The machine-wide negotiated capability store.
///
/// Each CPU performing bring-up derives the same values from its own
/// capability registers (the hardware-homogeneity assumption); the first
/// derivation wins and later ones merely observe it.
static VMX_CAPS: Once<VmxCaps> = Once::new();

/// The negotiated capabilities, once some CPU completed negotiation.
pub fn vmx_caps() -> Option<&'static VmxCaps> {
    VMX_CAPS.get()
}

/// Per-CPU state for Virtual Machine Extensions (VMX): the VMXON region and
/// the baseline ("root") control structure of this logical CPU.
#[derive(Debug)]
pub struct VmxPerCpuState<H: Hal> {
    /// The VMCS revision identifier supported by this CPU.
    pub(crate) vmcs_revision_id: u32,
    vmx_region: VmxRegion<H>,
    root_vmcs: Option<Vmcs<H>>,
}

impl<H: Hal> VmxPerCpuState<H> {
    pub fn new(_cpu_id: usize) -> AxResult<Self> {
        Ok(Self {
            vmcs_revision_id: 0,
            vmx_region: unsafe { VmxRegion::uninit() },
            root_vmcs: None,
        })
    }

    pub fn is_enabled(&self) -> bool {
        Cr4::read().contains(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS)
    }

    /// The baseline control structure constructed by [`hardware_enable`].
    ///
    /// [`hardware_enable`]: VmxPerCpuState::hardware_enable
    pub fn root_vmcs(&self) -> Option<&Vmcs<H>> {
        self.root_vmcs.as_ref()
    }

    /// Negotiate capabilities and turn on VMX for the running CPU.
    ///
    /// Every failure is a feature-unavailability outcome, not a fatal
    /// condition: the caller keeps running without virtualization. When the
    /// processor lacks the feature entirely, the shared feature report is
    /// corrected through [`crate::SysInfoIf`] before returning.
    pub fn hardware_enable(&mut self, config: &VmxConfig, host: &HostContext) -> AxResult {
        if !has_hardware_support() {
            crate_interface::call_interface!(super::SysInfoIf::withdraw_vmx_feature());
            return ax_err!(Unsupported, "CPU does not support feature VMX");
        }
        if self.is_enabled() {
            return ax_err!(BadState, "VMX is already turned on");
        }

        // Firmware must have locked VMX on; which enable bit is demanded
        // depends on whether we run under a secure launch. (SDM Vol. 3C,
        // Section 23.7)
        let ctrl = FeatureControl::read();
        let required = FeatureControlFlags::LOCKED
            | if config.secure {
                FeatureControlFlags::VMXON_ENABLED_INSIDE_SMX
            } else {
                FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX
            };
        if !ctrl.contains(required) {
            return ax_err!(Unsupported, "VMX disabled by firmware");
        }

        let reports = VmxCapabilityReports::read();

        // Sanity of the basic report. (SDM Vol. 3C, Appendix A.1)
        let basic = VmxBasic::from(reports.basic);
        if basic.region_size as usize != PAGE_SIZE {
            return ax_err!(Unsupported, "VMX region size is not 4K");
        }
        if basic.mem_type != VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK {
            return ax_err!(Unsupported, "VMX memory type is not write-back");
        }
        if basic.is_32bit_address {
            return ax_err!(Unsupported, "32-bit VMX not supported");
        }

        let caps = match VMX_CAPS.get() {
            Some(caps) => *caps,
            None => {
                let caps = negotiate(&reports, config)?;
                *VMX_CAPS.call_once(|| caps)
            }
        };
        self.vmcs_revision_id = caps.revision_id();
        self.vmx_region = VmxRegion::new(self.vmcs_revision_id, false)?;

        // Force the fixed control-register bits: clear every must-be-zero
        // bit, then set every must-be-one bit. CR4.VMXE is among the
        // must-be-one bits, so this also flips the enable switch.
        unsafe {
            Cr0::write_raw(caps.fix_cr0.apply(Cr0::read_raw()));
            Cr4::write_raw(caps.fix_cr4.apply(Cr4::read_raw()));
        }

        instructions::vmxon(self.vmx_region.phys_addr())?;

        let root = Vmcs::new_root(&caps, host)?;
        info!(
            "VMCS:{:#x} REV:{:#x} CPU:{:#x}/{:#x} VPID:{} EPT:{}",
            root.phys_addr(),
            caps.revision_id(),
            caps.ctrl_cpu.allowed,
            caps.ctrl_cpu2.allowed,
            caps.has_vpid(),
            caps.has_ept(),
        );
        self.root_vmcs = Some(root);
        Ok(())
    }

    /// Leave VMX operation on the running CPU.
    pub fn hardware_disable(&mut self) -> AxResult {
        if !self.is_enabled() {
            return ax_err!(BadState, "VMX is not enabled");
        }

        self.root_vmcs = None;
        instructions::vmxoff()?;
        unsafe {
            Cr4::update(|cr4| cr4.remove(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS));
        }
        self.vmx_region = unsafe { VmxRegion::uninit() };
        info!("succeeded to turn off VMX");
        Ok(())
    }
}

/// Derive the negotiated capability store from a capability snapshot.
///
/// Pure: identical snapshots and configuration yield identical results,
/// which is what makes redundant derivation on every CPU benign.
pub(crate) fn negotiate(reports: &VmxCapabilityReports, config: &VmxConfig) -> AxResult<VmxCaps> {
    let basic = VmxBasic::from(reports.basic);

    let ctrl_pin = CtrlMask::from_raw(reports.pinbased);
    let mut ctrl_cpu = CtrlMask::from_raw(reports.procbased);
    let mut ctrl_cpu2 = reports
        .procbased2
        .map(CtrlMask::from_raw)
        .unwrap_or_default();
    let ctrl_exit = CtrlMask::from_raw(reports.exit);
    let ctrl_entry = CtrlMask::from_raw(reports.entry);
    for mask in [ctrl_pin, ctrl_cpu, ctrl_cpu2, ctrl_exit, ctrl_entry] {
        mask.validate()?;
    }

    let ept_vpid = reports
        .ept_vpid
        .map(EptVpidCaps::from_bits_truncate)
        .unwrap_or_default();

    let fix_cr0 = FixedBits::from_report(reports.cr0_fixed0, reports.cr0_fixed1);
    let fix_cr4 = FixedBits::from_report(reports.cr4_fixed0, reports.cr4_fixed1);
    fix_cr0.validate()?;
    fix_cr4.validate()?;

    // Policy of this hypervisor, not a hardware mandate: HLT and all I/O
    // exit unconditionally, secondary controls are active, translation
    // caches are tagged.
    ctrl_cpu.mandatory |= (PrimaryControls::HLT_EXITING
        | PrimaryControls::UNCOND_IO_EXITING
        | PrimaryControls::SECONDARY_CONTROLS)
        .bits();
    ctrl_cpu2.mandatory |= SecondaryControls::ENABLE_VPID.bits();

    // Respect the overrides, and never enable a translation feature whose
    // invalidation instruction is missing.
    if config.disable_ept || !ept_vpid.contains(EptVpidCaps::INVEPT) {
        ctrl_cpu2.strip(SecondaryControls::ENABLE_EPT.bits());
    }
    if config.disable_vpid || !ept_vpid.contains(EptVpidCaps::INVVPID) {
        ctrl_cpu2.strip(SecondaryControls::ENABLE_VPID.bits());
    }

    Ok(VmxCaps {
        basic,
        ctrl_pin,
        ctrl_cpu,
        ctrl_cpu2,
        ctrl_exit,
        ctrl_entry,
        ept_vpid,
        fix_cr0,
        fix_cr4,
    })
}
