//! Interrupt descriptor table and the handlers the core needs: timer tick,
//! reschedule and shootdown IPIs, page faults (including user-copy fault
//! recovery), and double faults on their own IST stack.

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::{gdt, usercopy, RESCHEDULE_VECTOR, SHOOTDOWN_VECTOR, TIMER_VECTOR};
use crate::sync::SpinLock;

/// Legacy PICs remapped out of the exception range; both are masked once the
/// LAPIC timer takes over, but the remap must happen regardless to keep
/// spurious IRQs from landing on exception vectors.
static PICS: SpinLock<ChainedPics> = SpinLock::new(
    // SAFETY: 0x20/0x28 are outside the CPU exception range, the standard
    // remap offsets.
    unsafe { ChainedPics::new(0x20, 0x28) },
);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        // SAFETY: the IST index refers to the dedicated double-fault stack
        // installed in the TSS by gdt::init before interrupts are enabled.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[TIMER_VECTOR].set_handler_fn(timer_interrupt_handler);
        idt[RESCHEDULE_VECTOR].set_handler_fn(reschedule_ipi_handler);
        idt[SHOOTDOWN_VECTOR].set_handler_fn(shootdown_ipi_handler);
        idt
    };
}

/// Build and load the IDT, and remap/mask the legacy PICs. Boot CPU only.
pub fn init() {
    load();
    let mut pics = PICS.lock();
    // SAFETY: remapping the PICs is the standard bring-up sequence; no other
    // code programs them.
    unsafe {
        pics.initialize();
        pics.write_masks(0xFE, 0xFF); // leave only the PIT line open
    }
}

/// Load the already-built IDT on the executing CPU (AP path).
pub fn load() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:?}", stack_frame.instruction_pointer);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("double fault\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    mut stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let addr = x86_64::registers::control::Cr2::read_raw();

    // Fault inside a guarded user copy: rewind to the fixup stub instead of
    // resolving the fault, so the copy returns InvalidAddress.
    if usercopy::in_user_access() {
        // SAFETY: the frame belongs to the interrupted kernel context; the
        // fixup address is a real instruction in this binary.
        unsafe {
            stack_frame
                .as_mut()
                .update(|frame| frame.instruction_pointer = usercopy::fixup_address());
        }
        return;
    }

    let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let exec = error_code.contains(PageFaultErrorCode::INSTRUCTION_FETCH);
    if crate::mm::vas::handle_fault(addr, write, exec).is_ok() {
        return;
    }

    if error_code.contains(PageFaultErrorCode::USER_MODE) {
        log::warn!("user page fault at {:#x}, killing thread", addr);
        crate::sched::thread::kill_current_for_fault();
        return;
    }

    panic!(
        "kernel page fault at {:#x} (error {:?})\n{:#?}",
        addr, error_code, stack_frame
    );
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    super::apic::end_of_interrupt();
    if crate::timer::tick() {
        crate::sched::preempt();
    }
}

extern "x86-interrupt" fn reschedule_ipi_handler(_stack_frame: InterruptStackFrame) {
    super::apic::end_of_interrupt();
    // Returning from the interrupt is enough: the kill flag and run queues
    // are re-checked on the way out.
    crate::sched::preempt();
}

extern "x86-interrupt" fn shootdown_ipi_handler(_stack_frame: InterruptStackFrame) {
    super::apic::end_of_interrupt();
    crate::mm::vas::shootdown_service();
}
