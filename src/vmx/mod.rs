mod instructions;
mod percpu;

pub(crate) mod structs;
pub(crate) mod vmcs;

pub use self::percpu::{VmxConfig, VmxPerCpuState, vmx_caps};

#[cfg(test)]
pub(crate) use self::percpu::negotiate;

/// Returns whether the current platform supports the virtualization
/// extension at all.
pub fn has_hardware_support() -> bool {
    if let Some(feature) = raw_cpuid::CpuId::new().get_feature_info() {
        feature.has_vmx()
    } else {
        false
    }
}

/// Interface to the platform's shared hardware-information surface.
///
/// The embedder implements this with [`crate_interface::impl_interface`]; it
/// is invoked when virtualization turns out to be unavailable on a CPU so
/// the advertised feature set can be corrected.
#[crate_interface::def_interface]
pub trait SysInfoIf {
    /// Withdraw the virtualization feature from the shared feature report.
    fn withdraw_vmx_feature();
}
