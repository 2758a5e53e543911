//! Local APIC access: identity, EOI, inter-processor interrupts, and the
//! per-CPU timer. The xAPIC MMIO page is reached through the physical map
//! window, so no dedicated mapping is required.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::MAX_CPUS;

const APIC_PHYS_BASE: u64 = 0xFEE0_0000;

const REG_ID: u64 = 0x020;
const REG_EOI: u64 = 0x0B0;
const REG_SPURIOUS: u64 = 0x0F0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INITIAL: u64 = 0x380;
const REG_TIMER_CURRENT: u64 = 0x390;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

const LVT_TIMER_PERIODIC: u32 = 1 << 17;
const LVT_MASKED: u32 = 1 << 16;
const ICR_DELIVERY_PENDING: u32 = 1 << 12;

/// Kernel CPU id -> LAPIC id, filled during CPU bring-up.
static APIC_IDS: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(0) }; MAX_CPUS];

#[inline]
fn reg(offset: u64) -> *mut u32 {
    crate::mm::phys_to_virt(crate::mm::PhysAddr::new(APIC_PHYS_BASE + offset)).as_mut_ptr()
}

#[inline]
fn read(offset: u64) -> u32 {
    // SAFETY: the LAPIC MMIO page is always present in the physical window
    // and the offsets are architectural register locations.
    unsafe { reg(offset).read_volatile() }
}

#[inline]
fn write(offset: u64, value: u32) {
    // SAFETY: as in `read`; register writes only affect this CPU's APIC.
    unsafe { reg(offset).write_volatile(value) }
}

/// LAPIC id of the executing CPU.
pub fn local_apic_id() -> usize {
    (read(REG_ID) >> 24) as usize
}

/// Record the LAPIC id of the executing CPU under its kernel CPU id.
pub fn record_apic_id(cpu_id: usize) {
    APIC_IDS[cpu_id].store(local_apic_id() as u32, Ordering::Relaxed);
}

/// Software-enable the local APIC with a spurious vector of 0xFF.
pub fn init_local() {
    write(REG_SPURIOUS, 0x100 | 0xFF);
}

/// Signal end-of-interrupt for the in-service vector.
pub fn end_of_interrupt() {
    write(REG_EOI, 0);
}

/// Send a fixed-delivery IPI carrying `vector` to the CPU with kernel id
/// `cpu`.
pub fn send_ipi(cpu: usize, vector: u8) {
    let apic_id = APIC_IDS[cpu % MAX_CPUS].load(Ordering::Relaxed);
    while read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
        core::hint::spin_loop();
    }
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, vector as u32);
}

// ---------------------------------------------------------------------------
// LAPIC timer
// ---------------------------------------------------------------------------

/// Ticks of the (divide-by-16) LAPIC timer per microsecond, calibrated once
/// against the PIT by the boot CPU.
static TIMER_TICKS_PER_US: AtomicU32 = AtomicU32::new(0);

/// Store the calibration result measured during boot.
pub fn set_timer_calibration(ticks_per_us: u32) {
    TIMER_TICKS_PER_US.store(ticks_per_us.max(1), Ordering::Relaxed);
}

/// Has the LAPIC timer been calibrated on this system?
pub fn timer_available() -> bool {
    TIMER_TICKS_PER_US.load(Ordering::Relaxed) != 0
}

/// Program the LAPIC timer to fire `vector` once after `usecs`.
pub fn timer_arm_oneshot(vector: u8, usecs: u64) {
    let ticks = (TIMER_TICKS_PER_US.load(Ordering::Relaxed) as u64).saturating_mul(usecs.max(1));
    write(REG_TIMER_DIVIDE, 0b0011); // divide by 16
    write(REG_LVT_TIMER, vector as u32);
    write(REG_TIMER_INITIAL, ticks.min(u32::MAX as u64) as u32);
}

/// How far the timer has counted down since the last arm. Calibration only.
pub fn timer_elapsed_since_arm() -> u64 {
    let initial = read(REG_TIMER_INITIAL) as u64;
    let current = read(REG_TIMER_CURRENT) as u64;
    initial.saturating_sub(current)
}

/// Mask the LAPIC timer.
pub fn timer_disable() {
    write(REG_LVT_TIMER, LVT_MASKED);
    write(REG_TIMER_INITIAL, 0);
}
