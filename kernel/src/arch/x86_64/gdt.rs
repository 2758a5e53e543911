//! GDT and TSS setup.
//!
//! One GDT per CPU would be needed for true per-CPU TSS state; the core only
//! requires the double-fault IST stack, so a single shared table suffices
//! for the boot path and the APs reload the same one.

use lazy_static::lazy_static;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS, SS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// IST index of the dedicated double-fault stack.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const IST_STACK_SIZE: usize = 4096 * 5;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            static mut STACK: [u8; IST_STACK_SIZE] = [0; IST_STACK_SIZE];
            // SAFETY: STACK is only ever referenced here, to compute the
            // stack top handed to the TSS; the CPU is the sole writer.
            let start = VirtAddr::from_ptr(unsafe { core::ptr::addr_of!(STACK) });
            start + IST_STACK_SIZE as u64
        };
        tss
    };
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code = gdt.append(Descriptor::kernel_code_segment());
        let data = gdt.append(Descriptor::kernel_data_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let tss = gdt.append(Descriptor::tss_segment(&TSS));
        (
            gdt,
            Selectors {
                code,
                data,
                user_code,
                user_data,
                tss,
            },
        )
    };
}

#[allow(dead_code)]
struct Selectors {
    code: SegmentSelector,
    data: SegmentSelector,
    user_code: SegmentSelector,
    user_data: SegmentSelector,
    tss: SegmentSelector,
}

/// Load the GDT, segment registers, and TSS on the executing CPU.
pub fn init() {
    GDT.0.load();
    // SAFETY: the selectors come from the GDT loaded on the line above and
    // stay valid for the kernel's lifetime (the GDT is a static).
    unsafe {
        CS::set_reg(GDT.1.code);
        SS::set_reg(GDT.1.data);
        load_tss(GDT.1.tss);
    }
}
