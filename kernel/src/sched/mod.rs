//! Thread scheduler: per-CPU run queues, preemption, sleep/wake, and the
//! thread lifecycle (creation through the reaper).

pub mod scheduler;
pub mod thread;

pub use scheduler::{
    block_current, current_thread, preempt, preempt_disable, preempt_enable, ready, run, sleep_us,
    tick, yield_now,
};
pub use thread::{Thread, ThreadId, ThreadState};

use crate::config::{PRIORITY_IDLE, PRIORITY_KERNEL};

/// Adopt the boot flow as a thread. First scheduler call on every CPU.
pub fn early_init() {
    scheduler::adopt_boot_thread("boot");
}

/// Bring the scheduler fully up on the boot CPU: idle thread, reaper, and
/// the background page zeroer.
pub fn init() {
    let idle = thread::spawn("idle-0", PRIORITY_IDLE, true, scheduler::idle_main, 0)
        .expect("idle thread allocation cannot fail at boot");
    scheduler::set_idle_thread(idle);

    let reaper = thread::spawn("reaper", PRIORITY_KERNEL, true, thread::reaper_main, 0)
        .expect("reaper thread allocation cannot fail at boot");
    run(&reaper, None);

    let zeroer = thread::spawn("page-zeroer", PRIORITY_IDLE - 1, true, page_zeroer_main, 0)
        .expect("zeroer thread allocation cannot fail at boot");
    run(&zeroer, None);

    log::info!("scheduler online: reaper and page zeroer running");
}

/// Scheduler bring-up for an application processor: adopt its boot flow
/// and give it an idle thread. Runs on the AP itself, after
/// `arch::x86_64::init_ap`.
#[allow(dead_code)]
pub fn init_ap() {
    scheduler::adopt_boot_thread("ap-boot");
    let cpu = crate::arch::cpu_id();
    let name = alloc::format!("idle-{}", cpu);
    let idle = thread::spawn(&name, PRIORITY_IDLE, true, scheduler::idle_main, 0)
        .expect("idle thread allocation cannot fail at boot");
    scheduler::set_idle_thread(idle);
}

/// Low-priority background loop keeping the zeroed-page pool topped up and
/// nudging the slab caches to give memory back when frames run short.
fn page_zeroer_main(_arg: usize) {
    loop {
        if !crate::mm::phys::zero_pending() {
            let stats = crate::mm::phys::stats();
            if stats.free_frames < stats.total_frames / 32 {
                crate::mm::heap::reclaim();
            }
            sleep_us(50_000);
        }
    }
}
