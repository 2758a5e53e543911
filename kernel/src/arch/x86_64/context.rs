//! Thread context layout and the context-switch primitive.
//!
//! Switches are always cooperative from the scheduler's point of view (an
//! interrupt that forces a reschedule returns to kernel code first), so only
//! the callee-saved register set is kept. A freshly built context "returns"
//! into a small stub that forwards the thread argument and jumps to the
//! entry function.

use core::arch::global_asm;

/// Saved CPU state of a suspended thread: just the kernel stack pointer.
/// Everything else lives on that stack in the layout the switch stub below
/// expects.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    rsp: u64,
}

/// Offsets of the callee-saved frame a suspended stack carries, lowest
/// address first: r15, r14, r13, r12, rbx, rbp, return rip.
const FRAME_WORDS: usize = 7;

impl Context {
    /// Context that will be overwritten by the first switch away from the
    /// executing flow (the boot path and idle bootstrap use this).
    pub const fn empty() -> Self {
        Self { rsp: 0 }
    }

    /// Build a context whose first schedule-in enters `entry(arg)` on the
    /// given stack. `stack_top` must be 16-byte aligned and point one past
    /// the usable stack.
    pub fn new_kernel(entry: extern "C" fn(usize) -> !, arg: usize, stack_top: *mut u8) -> Self {
        let frame = (stack_top as usize - FRAME_WORDS * 8) as *mut u64;
        // SAFETY: the caller hands us an exclusive, writable stack of at
        // least FRAME_WORDS * 8 bytes below `stack_top`.
        unsafe {
            frame.add(0).write(0); // r15
            frame.add(1).write(0); // r14
            frame.add(2).write(entry as usize as u64); // r13 -> entry
            frame.add(3).write(arg as u64); // r12 -> arg
            frame.add(4).write(0); // rbx
            frame.add(5).write(0); // rbp
            frame.add(6).write(thread_entry_stub as usize as u64); // rip
        }
        Self { rsp: frame as u64 }
    }
}

global_asm!(
    r#"
    .global cinder_context_switch
    // cinder_context_switch(prev: *mut Context, next: *const Context)
    cinder_context_switch:
        push rbp
        push rbx
        push r12
        push r13
        push r14
        push r15
        mov [rdi], rsp
        mov rsp, [rsi]
        pop r15
        pop r14
        pop r13
        pop r12
        pop rbx
        pop rbp
        ret

    .global cinder_thread_entry_stub
    // First instruction a new thread ever runs: forward the argument left
    // in r12 and tail into the entry function left in r13.
    cinder_thread_entry_stub:
        mov rdi, r12
        call r13
        ud2
    "#
);

extern "C" {
    #[link_name = "cinder_context_switch"]
    fn context_switch_raw(prev: *mut Context, next: *const Context);
    #[link_name = "cinder_thread_entry_stub"]
    fn thread_entry_stub() -> !;
}

/// Switch from the context stored at `prev` to the one at `next`.
///
/// # Safety
///
/// Must be called with interrupts disabled; `prev` must be writable and
/// `next` must hold a frame produced by [`Context::new_kernel`] or a prior
/// switch. Returns when something switches back to `prev`.
pub unsafe fn switch(prev: *mut Context, next: *const Context) {
    // SAFETY: forwarded contract.
    unsafe { context_switch_raw(prev, next) }
}
