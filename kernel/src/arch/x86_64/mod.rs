//! x86-64 platform glue: descriptor tables, interrupt vectors, LAPIC/PIC
//! bring-up, and per-CPU identity.

pub mod apic;
pub mod context;
pub mod mmu;
pub mod syscall;
pub mod timer;
pub mod usercopy;

#[cfg(target_os = "none")]
mod gdt;
#[cfg(target_os = "none")]
mod idt;

use core::sync::atomic::{AtomicUsize, Ordering};

/// Interrupt vector used for reschedule IPIs.
pub const RESCHEDULE_VECTOR: u8 = 0xF0;

/// Interrupt vector used for TLB shootdown IPIs.
pub const SHOOTDOWN_VECTOR: u8 = 0xF1;

/// Interrupt vector the timer devices raise.
pub const TIMER_VECTOR: u8 = 0x20;

/// Cached LAPIC id -> kernel CPU id mapping, filled during CPU bring-up.
static CPU_IDS: [AtomicUsize; crate::config::MAX_CPUS] =
    [const { AtomicUsize::new(0) }; crate::config::MAX_CPUS];

/// Kernel CPU id of the executing processor.
///
/// Reads the LAPIC id and translates it through the table built at boot.
/// Before the LAPIC is programmed this returns 0, which is correct: only the
/// boot CPU runs that early.
pub fn current_cpu_id() -> usize {
    #[cfg(target_os = "none")]
    {
        let lapic = apic::local_apic_id();
        CPU_IDS[lapic % crate::config::MAX_CPUS].load(Ordering::Relaxed)
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Register the executing CPU under `cpu_id`. Called once per CPU during
/// bring-up, before the scheduler touches per-CPU state.
pub fn register_cpu(cpu_id: usize) {
    #[cfg(target_os = "none")]
    {
        let lapic = apic::local_apic_id();
        CPU_IDS[lapic % crate::config::MAX_CPUS].store(cpu_id, Ordering::Relaxed);
    }
    #[cfg(not(target_os = "none"))]
    let _ = cpu_id;
}

/// Bring up the boot CPU: descriptor tables, interrupt vectors, legacy PIC
/// remap, and the local APIC.
pub fn init_bsp() {
    #[cfg(target_os = "none")]
    {
        gdt::init();
        idt::init();
        mmu::detect_features();
        apic::init_local();
        syscall::init();
        register_cpu(0);
        apic::record_apic_id(0);
    }
}

/// Bring up an application processor.
#[allow(dead_code)]
pub fn init_ap(cpu_id: usize) {
    #[cfg(target_os = "none")]
    {
        gdt::init();
        idt::load();
        apic::init_local();
        syscall::init();
        register_cpu(cpu_id);
        apic::record_apic_id(cpu_id);
    }
    #[cfg(not(target_os = "none"))]
    let _ = cpu_id;
}
