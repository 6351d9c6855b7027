//! Fault-tolerant access to memory of unknown validity.
//!
//! Hypervisor code routinely has to read or update memory whose mapping it
//! does not control (guest-supplied or user-supplied pointers). These
//! primitives perform the access with a single risky instruction and record
//! a recovery point next to it, so that a page fault inside the access
//! degrades to an ordinary error instead of taking the kernel down.
//!
//! The recovery records are collected by the linker into the `extable`
//! section. The trap dispatcher owns the other half of the contract: on a
//! fault it calls [`resume_address`] with the faulting instruction pointer
//! and, on a hit, resumes execution there instead of escalating. Entries are
//! position-independent (self-relative offsets), so the table needs no
//! relocation at load time.

use axerrno::{AxResult, ax_err};

/// One recovery record: the location of an instruction that may fault and
/// the location execution resumes at if it does.
///
/// Both fields are offsets relative to their own address, in the style of
/// exception tables, so the section stays read-only under PIE/KASLR.
#[repr(C)]
#[derive(Debug)]
pub struct FixupEntry {
    fault: i32,
    resume: i32,
}

impl FixupEntry {
    /// Address of the potentially-faulting instruction.
    pub fn fault_addr(&self) -> usize {
        (&raw const self.fault as usize).wrapping_add_signed(self.fault as isize)
    }

    /// Address execution resumes at after a fault.
    pub fn resume_addr(&self) -> usize {
        (&raw const self.resume as usize).wrapping_add_signed(self.resume as isize)
    }
}

unsafe extern "C" {
    static __start_extable: FixupEntry;
    static __stop_extable: FixupEntry;
}

/// The fault-recovery table, as collected by the linker.
///
/// Order is insignificant; lookups treat it as a set.
pub fn fixup_table() -> &'static [FixupEntry] {
    unsafe {
        let start = &raw const __start_extable;
        let stop = &raw const __stop_extable;
        let len = (stop as usize - start as usize) / size_of::<FixupEntry>();
        core::slice::from_raw_parts(start, len)
    }
}

/// Looks up the recovery point for a faulting instruction address.
///
/// Called by the trap dispatcher. `None` means the fault did not come from a
/// fault-tolerant access and must be handled normally.
pub fn resume_address(fault_ip: usize) -> Option<usize> {
    fixup_table()
        .iter()
        .find(|entry| entry.fault_addr() == fault_ip)
        .map(|entry| entry.resume_addr())
}

/// Emits one [`FixupEntry`] for the asm labels `2:` (fault) and `3:`
/// (resume) of the surrounding block.
macro_rules! fixup_record {
    () => {
        concat!(
            ".pushsection extable, \"a\"\n",
            ".balign 8\n",
            ".long 2b - .\n",
            ".long 3b - .\n",
            ".popsection",
        )
    };
}

mod sealed {
    pub trait Sealed {}
}

/// Types a single fault-tolerant load or compare-exchange can transfer.
pub trait Primitive: Copy + PartialEq + sealed::Sealed {
    #[doc(hidden)]
    unsafe fn load(src: *const Self) -> (Self, bool);
    #[doc(hidden)]
    unsafe fn cmpxchg(dst: *mut Self, expected: Self, desired: Self) -> (Self, bool);
}

macro_rules! impl_primitive {
    ($ty:ty, $width:literal, $reg:ident, $modifier:literal, $acc:tt) => {
        impl sealed::Sealed for $ty {}

        impl Primitive for $ty {
            unsafe fn load(src: *const Self) -> (Self, bool) {
                let mut val: $ty = 0;
                let ok: u32;
                unsafe {
                    core::arch::asm!(
                        "xor {ok:e}, {ok:e}",
                        concat!("2: mov {val", $modifier, "}, ", $width, " ptr [{src}]"),
                        "mov {ok:e}, 1",
                        "3:",
                        fixup_record!(),
                        src = in(reg) src,
                        val = inout($reg) val,
                        ok = out(reg) ok,
                        options(nostack),
                    );
                }
                (val, ok != 0)
            }

            unsafe fn cmpxchg(dst: *mut Self, expected: Self, desired: Self) -> (Self, bool) {
                let prev: $ty;
                let ok: u32;
                unsafe {
                    core::arch::asm!(
                        "xor {ok:e}, {ok:e}",
                        concat!("2: lock cmpxchg ", $width, " ptr [{dst}], {new", $modifier, "}"),
                        "mov {ok:e}, 1",
                        "3:",
                        fixup_record!(),
                        dst = in(reg) dst,
                        new = in($reg) desired,
                        ok = out(reg) ok,
                        inout($acc) expected => prev,
                        options(nostack),
                    );
                }
                (prev, ok != 0)
            }
        }
    };
}

impl_primitive!(u8, "byte", reg_byte, "", "al");
impl_primitive!(u16, "word", reg, ":x", "ax");
impl_primitive!(u32, "dword", reg, ":e", "eax");
impl_primitive!(u64, "qword", reg, ":r", "rax");

impl sealed::Sealed for usize {}

impl Primitive for usize {
    unsafe fn load(src: *const Self) -> (Self, bool) {
        let (val, ok) = unsafe { u64::load(src.cast()) };
        (val as usize, ok)
    }

    unsafe fn cmpxchg(dst: *mut Self, expected: Self, desired: Self) -> (Self, bool) {
        let (prev, ok) = unsafe { u64::cmpxchg(dst.cast(), expected as u64, desired as u64) };
        (prev as usize, ok)
    }
}

/// Attempts to load a value from `src`, which may be unmapped.
///
/// A hardware fault during the load is reported as `BadAddress`; the value
/// is returned only when the load completed.
///
/// # Safety
///
/// Must run at a privilege level that may legally touch `src` when it is
/// mapped; `src` must be properly aligned for `T`. The address itself may be
/// invalid, that is the point.
pub unsafe fn peek<T: Primitive>(src: *const T) -> AxResult<T> {
    let (val, ok) = unsafe { T::load(src) };
    if ok {
        Ok(val)
    } else {
        ax_err!(BadAddress, "peek: faulting address")
    }
}

/// Atomically replaces the value at `dst` with `desired` if it currently
/// equals `expected`.
///
/// Returns `Ok(true)` when the swap happened, `Ok(false)` when the current
/// value did not match (the memory is left unchanged), and `BadAddress` when
/// the access itself faulted.
///
/// # Safety
///
/// Same contract as [`peek`], with `dst` writable when mapped.
pub unsafe fn compare_exchange<T: Primitive>(
    dst: *mut T,
    expected: T,
    desired: T,
) -> AxResult<bool> {
    let (prev, ok) = unsafe { T::cmpxchg(dst, expected, desired) };
    if ok {
        Ok(prev == expected)
    } else {
        ax_err!(BadAddress, "compare_exchange: faulting address")
    }
}
