//! Architecture interface.
//!
//! The core consumes a thin contract: interrupt control, CPU identity,
//! context switching, page-table primitives, IPIs, and the timestamp
//! counter. Everything behind it is x86-64 specific.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{context, mmu, timer, usercopy};

use core::sync::atomic::{AtomicUsize, Ordering};

/// Number of CPUs that have been brought online. The boot CPU sets this once
/// secondary bring-up finishes; until then it reads 1.
static ONLINE_CPUS: AtomicUsize = AtomicUsize::new(1);

/// Record the number of online CPUs after SMP bring-up.
pub fn set_cpu_count(count: usize) {
    ONLINE_CPUS.store(count.max(1), Ordering::Release);
}

/// Number of online CPUs.
pub fn cpu_count() -> usize {
    ONLINE_CPUS.load(Ordering::Acquire)
}

/// Disable local interrupts, returning whether they were enabled before.
#[inline]
pub fn irq_disable() -> bool {
    #[cfg(target_os = "none")]
    {
        let was_enabled = ::x86_64::instructions::interrupts::are_enabled();
        ::x86_64::instructions::interrupts::disable();
        was_enabled
    }
    #[cfg(not(target_os = "none"))]
    {
        false
    }
}

/// Restore the interrupt state saved by [`irq_disable`].
#[inline]
pub fn irq_restore(was_enabled: bool) {
    #[cfg(target_os = "none")]
    if was_enabled {
        ::x86_64::instructions::interrupts::enable();
    }
    #[cfg(not(target_os = "none"))]
    let _ = was_enabled;
}

/// Are local interrupts currently enabled?
#[inline]
pub fn irq_enabled() -> bool {
    #[cfg(target_os = "none")]
    {
        ::x86_64::instructions::interrupts::are_enabled()
    }
    #[cfg(not(target_os = "none"))]
    {
        false
    }
}

/// Identifier of the executing CPU.
#[inline]
pub fn cpu_id() -> usize {
    #[cfg(target_os = "none")]
    {
        self::x86_64::current_cpu_id()
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Enable interrupts and wait for the next one. Used by the idle threads.
#[inline]
pub fn idle_wait() {
    #[cfg(target_os = "none")]
    {
        ::x86_64::instructions::interrupts::enable_and_hlt();
    }
    #[cfg(not(target_os = "none"))]
    {
        core::hint::spin_loop();
    }
}

/// Halt this CPU forever. Terminal error path only.
pub fn halt() -> ! {
    loop {
        #[cfg(target_os = "none")]
        {
            ::x86_64::instructions::interrupts::disable();
            ::x86_64::instructions::hlt();
        }
        #[cfg(not(target_os = "none"))]
        {
            core::hint::spin_loop();
        }
    }
}

/// Ask `cpu` to re-run its scheduler at the next opportunity.
pub fn send_reschedule_ipi(cpu: usize) {
    #[cfg(target_os = "none")]
    self::x86_64::apic::send_ipi(cpu, self::x86_64::RESCHEDULE_VECTOR);
    #[cfg(not(target_os = "none"))]
    let _ = cpu;
}

/// Ask `cpu` to service a pending TLB shootdown request.
pub fn send_shootdown_ipi(cpu: usize) {
    #[cfg(target_os = "none")]
    self::x86_64::apic::send_ipi(cpu, self::x86_64::SHOOTDOWN_VECTOR);
    #[cfg(not(target_os = "none"))]
    let _ = cpu;
}

/// Read the timestamp counter.
#[inline]
pub fn read_tsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: rdtsc reads the timestamp counter; no memory is touched
        // and no CPU state changes.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        0
    }
}
