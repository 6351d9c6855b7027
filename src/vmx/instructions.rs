//! Thin wrappers around the VMX instructions.
//!
//! All VMCS field traffic funnels through [`vmread`]/[`vmwrite`] here, which
//! is also where the activation discipline surfaces: the processor refuses
//! field accesses while no structure is current, and the unit-test mock
//! mirrors that behavior with a thread-local "current" register (one mock
//! logical CPU per test thread).

use axerrno::AxResult;

use crate::HostPhysAddr;

cfg_if::cfg_if! {
    if #[cfg(test)] {
        pub(crate) use self::mock::*;
    } else {
        pub(crate) use self::hw::*;
    }
}

#[cfg(not(test))]
mod hw {
    use super::*;
    use axerrno::ax_err_type;
    use x86::bits64::vmx;
    use x86::vmx::VmFail;

    fn as_axerr(err: VmFail) -> axerrno::AxError {
        match err {
            VmFail::VmFailValid => {
                ax_err_type!(BadState, crate::vmx::vmcs::instruction_error().as_str())
            }
            VmFail::VmFailInvalid => ax_err_type!(BadState, "no current VMCS"),
        }
    }

    pub(crate) fn vmxon(region: HostPhysAddr) -> AxResult {
        unsafe { vmx::vmxon(region.as_usize() as u64).map_err(as_axerr) }
    }

    pub(crate) fn vmxoff() -> AxResult {
        unsafe { vmx::vmxoff().map_err(as_axerr) }
    }

    pub(crate) fn vmclear(vmcs: HostPhysAddr) -> AxResult {
        unsafe { vmx::vmclear(vmcs.as_usize() as u64).map_err(as_axerr) }
    }

    pub(crate) fn vmptrld(vmcs: HostPhysAddr) -> AxResult {
        unsafe { vmx::vmptrld(vmcs.as_usize() as u64).map_err(as_axerr) }
    }

    pub(crate) fn vmread(field: u32) -> AxResult<u64> {
        unsafe { vmx::vmread(field).map_err(as_axerr) }
    }

    pub(crate) fn vmwrite(field: u32, value: u64) -> AxResult {
        unsafe { vmx::vmwrite(field, value).map_err(as_axerr) }
    }
}
