//! SYSCALL/SYSRET entry glue.
//!
//! The stub saves user state, moves the argument registers into the frame
//! layout the dispatcher expects, and returns the status in rax. Index
//! validation and argument-count handling live in [`crate::syscall`]; this
//! file is register plumbing only.

use core::arch::global_asm;

use crate::syscall::SyscallFrame;

global_asm!(
    r#"
    .global cinder_syscall_entry
    cinder_syscall_entry:
        // Syscall number in rax; args in rdi rsi rdx r10 r8 r9 per the
        // kernel ABI. rcx/r11 hold the user rip/rflags and are preserved
        // by staying off those registers here.
        push rcx
        push r11
        push rbp
        mov rbp, rsp

        // Build the frame on the stack: six argument words.
        push r9
        push r8
        push r10
        push rdx
        push rsi
        push rdi

        mov rdi, rax        // syscall number
        mov rsi, rsp        // &SyscallFrame
        call cinder_syscall_dispatch

        mov rsp, rbp
        pop rbp
        pop r11
        pop rcx
        sysretq
    "#
);

/// Rust side of the entry stub.
#[no_mangle]
extern "C" fn cinder_syscall_dispatch(number: usize, frame: *const SyscallFrame) -> i64 {
    // SAFETY: the stub just built the frame on the current kernel stack.
    let frame = unsafe { &*frame };
    crate::syscall::dispatch(number, frame)
}

/// Program the SYSCALL MSRs on the executing CPU.
#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::{
        registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star},
        registers::rflags::RFlags,
        VirtAddr,
    };

    extern "C" {
        fn cinder_syscall_entry();
    }

    // SAFETY: standard SYSCALL bring-up; the selectors match the GDT built
    // in gdt::init and the entry symbol is defined above.
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
        LStar::write(VirtAddr::new(cinder_syscall_entry as usize as u64));
        SFMask::write(RFlags::INTERRUPT_FLAG);
        use x86_64::structures::gdt::SegmentSelector;
        use x86_64::PrivilegeLevel;
        // GDT layout from gdt::init: kernel code 1, kernel data 2, user
        // data 3, user code 4.
        let _ = Star::write(
            SegmentSelector::new(4, PrivilegeLevel::Ring3),
            SegmentSelector::new(3, PrivilegeLevel::Ring3),
            SegmentSelector::new(1, PrivilegeLevel::Ring0),
            SegmentSelector::new(2, PrivilegeLevel::Ring0),
        );
    }
}
