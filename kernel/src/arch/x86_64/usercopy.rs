//! Fault-guarded user memory access.
//!
//! While a copy is in flight the executing CPU raises a per-CPU flag; the
//! page-fault handler, on seeing it, rewinds the faulting instruction
//! pointer to the fixup stub, which makes the copy report failure instead
//! of resolving the fault. See [`crate::mm::user`] for the typed façade.

use core::{
    arch::global_asm,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::config::MAX_CPUS;

static IN_USER_ACCESS: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

global_asm!(
    r#"
    .global cinder_usercopy_raw
    // cinder_usercopy_raw(dst: rdi, src: rsi, len: rdx) -> rax (0 ok, 1 fault)
    cinder_usercopy_raw:
        mov rcx, rdx
        rep movsb
        xor eax, eax
        ret

    .global cinder_usercopy_fixup
    cinder_usercopy_fixup:
        mov eax, 1
        ret
    "#
);

extern "C" {
    #[link_name = "cinder_usercopy_raw"]
    fn usercopy_raw(dst: *mut u8, src: *const u8, len: usize) -> u64;
    #[link_name = "cinder_usercopy_fixup"]
    fn usercopy_fixup() -> u64;
}

/// Is the executing CPU inside a guarded user copy?
pub fn in_user_access() -> bool {
    IN_USER_ACCESS[crate::arch::cpu_id()].load(Ordering::Relaxed)
}

/// Instruction pointer the page-fault handler rewinds to on a guarded fault.
#[cfg(target_os = "none")]
pub fn fixup_address() -> x86_64::VirtAddr {
    x86_64::VirtAddr::new(usercopy_fixup as usize as u64)
}

/// Copy `len` bytes between kernel and user memory, tolerating faults on
/// either side of the copy. Returns `false` if a fault was taken.
///
/// # Safety
///
/// The kernel-side pointer must be valid for `len` bytes; the user-side
/// pointer is the one being guarded and may be anything.
pub unsafe fn copy_guarded(dst: *mut u8, src: *const u8, len: usize) -> bool {
    let cpu = crate::arch::cpu_id();
    IN_USER_ACCESS[cpu].store(true, Ordering::Relaxed);
    // SAFETY: faults inside the raw copy are redirected to the fixup stub by
    // the page-fault handler while the flag is raised.
    let status = unsafe { usercopy_raw(dst, src, len) };
    IN_USER_ACCESS[cpu].store(false, Ordering::Relaxed);
    status == 0
}
