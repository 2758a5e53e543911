//! Hardware timer devices and time-source calibration.
//!
//! The PIT provides a fixed periodic tick and serves as the calibration
//! reference; the LAPIC timer, once calibrated, gives each CPU a
//! programmable one-shot device. The TSC backs `system_time()` when its
//! frequency could be measured.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

use crate::timer::{TimerDevice, TimerMode};

const PIT_FREQUENCY_HZ: u64 = 1_193_182;

/// Measured TSC ticks per microsecond; zero while uncalibrated.
static TSC_TICKS_PER_US: AtomicU64 = AtomicU64::new(0);

/// TSC value captured at calibration time; `system_time` is relative to it.
static TSC_BOOT: AtomicU64 = AtomicU64::new(0);

/// TSC ticks per microsecond, or 0 when the TSC is unusable.
pub fn tsc_ticks_per_us() -> u64 {
    TSC_TICKS_PER_US.load(Ordering::Relaxed)
}

/// Microseconds since calibration, from the TSC.
pub fn tsc_time_us() -> u64 {
    let per_us = TSC_TICKS_PER_US.load(Ordering::Relaxed);
    if per_us == 0 {
        return 0;
    }
    (crate::arch::read_tsc() - TSC_BOOT.load(Ordering::Relaxed)) / per_us
}

#[cfg(target_os = "none")]
mod io {
    use x86_64::instructions::port::Port;

    pub fn pit_program_periodic(hz: u32) {
        let divisor = (super::PIT_FREQUENCY_HZ / hz as u64).clamp(1, 65_535) as u16;
        // SAFETY: ports 0x43/0x40 are the PIT command/channel-0 data ports;
        // rate-generator mode with a 16-bit reload is the standard setup.
        unsafe {
            Port::<u8>::new(0x43).write(0x34u8);
            Port::<u8>::new(0x40).write((divisor & 0xFF) as u8);
            Port::<u8>::new(0x40).write((divisor >> 8) as u8);
        }
    }

    pub fn pit_stop() {
        // Mode 0 with a zero reload leaves the channel idle.
        // SAFETY: as above.
        unsafe {
            Port::<u8>::new(0x43).write(0x30u8);
            Port::<u8>::new(0x40).write(0u8);
            Port::<u8>::new(0x40).write(0u8);
        }
    }

    /// Busy-wait `us` microseconds on PIT channel 2 (speaker gate, no IRQ).
    pub fn pit_spin_us(us: u64) {
        let ticks = (super::PIT_FREQUENCY_HZ * us / 1_000_000).clamp(1, 65_535) as u16;
        // SAFETY: channel 2 in mode 0 counts down once the gate (port 0x61
        // bit 0) is raised; polling OUT2 via bit 5 of port 0x61 is the
        // classic calibration loop and touches nothing else.
        unsafe {
            let mut gate = Port::<u8>::new(0x61);
            let prev = gate.read();
            gate.write((prev & !0x02) | 0x01);
            Port::<u8>::new(0x43).write(0xB0u8);
            Port::<u8>::new(0x42).write((ticks & 0xFF) as u8);
            Port::<u8>::new(0x42).write((ticks >> 8) as u8);
            while gate.read() & 0x20 == 0 {
                core::hint::spin_loop();
            }
            gate.write(prev);
        }
    }
}

/// Measure the TSC and LAPIC timer against a 10 ms PIT interval. Boot CPU,
/// interrupts still disabled.
pub fn calibrate() {
    #[cfg(target_os = "none")]
    {
        const SAMPLE_US: u64 = 10_000;

        super::apic::timer_disable();
        // Let the LAPIC timer free-run from its maximum count during the
        // sample window, then read back how far it got.
        super::apic::timer_arm_oneshot(super::TIMER_VECTOR, u32::MAX as u64);

        let tsc_start = crate::arch::read_tsc();
        io::pit_spin_us(SAMPLE_US);
        let tsc_elapsed = crate::arch::read_tsc() - tsc_start;

        let lapic_elapsed = super::apic::timer_elapsed_since_arm();
        super::apic::timer_disable();

        TSC_TICKS_PER_US.store(tsc_elapsed / SAMPLE_US, Ordering::Relaxed);
        TSC_BOOT.store(crate::arch::read_tsc(), Ordering::Relaxed);
        if lapic_elapsed > 0 {
            super::apic::set_timer_calibration((lapic_elapsed / SAMPLE_US) as u32);
        }

        log::info!(
            "timers calibrated: tsc {} MHz, lapic {} ticks/us",
            tsc_elapsed / SAMPLE_US,
            lapic_elapsed / SAMPLE_US
        );
    }
}

/// The programmable interval timer as a fixed periodic device.
pub struct Pit {
    hz: u32,
}

impl Pit {
    pub const fn new(hz: u32) -> Self {
        Self { hz }
    }
}

impl TimerDevice for Pit {
    fn name(&self) -> &'static str {
        "pit"
    }

    fn mode(&self) -> TimerMode {
        TimerMode::Periodic
    }

    fn enable(&self) {
        #[cfg(target_os = "none")]
        io::pit_program_periodic(self.hz);
    }

    fn disable(&self) {
        #[cfg(target_os = "none")]
        io::pit_stop();
    }

    fn prepare(&self, _usecs: u64) {
        // Periodic device; the tick rate is fixed at enable time.
    }
}

/// The per-CPU local APIC timer as a one-shot device.
pub struct LapicTimer;

impl LapicTimer {
    pub const fn new() -> Self {
        Self
    }

    /// Usable only after calibration against the PIT succeeded.
    pub fn available() -> bool {
        super::apic::timer_available()
    }
}

impl TimerDevice for LapicTimer {
    fn name(&self) -> &'static str {
        "lapic"
    }

    fn mode(&self) -> TimerMode {
        TimerMode::OneShot
    }

    fn enable(&self) {
        // Armed on demand via `prepare`.
    }

    fn disable(&self) {
        #[cfg(target_os = "none")]
        super::apic::timer_disable();
    }

    fn prepare(&self, usecs: u64) {
        #[cfg(target_os = "none")]
        super::apic::timer_arm_oneshot(super::TIMER_VECTOR, usecs);
        #[cfg(not(target_os = "none"))]
        let _ = usecs;
    }
}
