//! Thread objects and lifecycle.
//!
//! Threads move CREATED -> READY -> RUNNING and from RUNNING to READY
//! (preemption, yield), SLEEPING (blocking), or DEAD (exit). Dead threads
//! are torn down asynchronously by the reaper so nothing ever frees the
//! stack it is standing on.

use alloc::{
    collections::{BTreeMap, VecDeque},
    string::String,
    sync::{Arc, Weak},
};
use core::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
};

use crate::{
    arch::context::Context,
    config::{KERNEL_STACK_SIZE, PRIORITY_LEVELS},
    error::{KernelError, KernelResult},
    mm::{heap, HeapFlags},
    sync::{waitqueue::WaitEntry, Semaphore, SpinLock, WaitStatus},
    util::IdAllocator,
};

/// Process-wide unique thread id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Thread scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Created = 0,
    Ready = 1,
    Running = 2,
    Sleeping = 3,
    Dead = 4,
}

impl ThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Sleeping,
            _ => Self::Dead,
        }
    }
}

/// Kernel stack backed by the heap's page-backed path.
struct KernelStack {
    base: NonNull<u8>,
}

// SAFETY: the stack is only touched by the owning thread (and the context
// switch primitive); the pointer itself is freely sendable.
unsafe impl Send for KernelStack {}
// SAFETY: as above.
unsafe impl Sync for KernelStack {}

impl KernelStack {
    fn new() -> KernelResult<Self> {
        let base = heap::kmalloc(KERNEL_STACK_SIZE, HeapFlags::empty())?;
        Ok(Self { base })
    }

    fn top(&self) -> *mut u8 {
        // 16-byte aligned top, as the context layout requires.
        let top = self.base.as_ptr() as usize + KERNEL_STACK_SIZE;
        (top & !0xF) as *mut u8
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        heap::kfree(self.base);
    }
}

/// Saved-context cell. Only the scheduler touches it, with interrupts
/// disabled, from the CPU that owns the thread at that instant.
pub struct ContextCell(UnsafeCell<Context>);

// SAFETY: access is serialized by the scheduler's switching discipline.
unsafe impl Send for ContextCell {}
// SAFETY: as above.
unsafe impl Sync for ContextCell {}

impl ContextCell {
    pub fn as_ptr(&self) -> *mut Context {
        self.0.get()
    }
}

/// The schedulable entity.
pub struct Thread {
    id: ThreadId,
    name: String,
    /// Kernel threads cannot be killed and never return to user mode.
    kernel: bool,
    /// Owning process; kernel threads belong to the kernel process.
    process: SpinLock<Option<Weak<crate::process::Process>>>,
    state: AtomicU8,
    priority: AtomicU8,
    max_priority: AtomicU8,
    timeslice_us: AtomicU64,
    preempt_count: AtomicU64,
    preempt_missed: AtomicBool,
    killed: AtomicBool,
    /// Published while the thread sleeps interruptibly, so a kill can claim
    /// the wait and wake it early.
    wait_entry: SpinLock<Option<Arc<WaitEntry>>>,
    /// CPU the thread last ran on (and runs on while RUNNING).
    cpu: AtomicUsize,
    /// True while the thread's register state is live on a CPU. Wakers wait
    /// for this to drop before enqueueing, so a thread is never run on two
    /// CPUs at once.
    on_cpu: AtomicBool,
    kernel_time_us: AtomicU64,
    user_time_us: AtomicU64,
    context: ContextCell,
    /// Entry point and argument handed to the first-switch trampoline.
    entry: fn(usize),
    entry_arg: usize,
    _stack: Option<KernelStack>,
}

impl Thread {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn max_priority(&self) -> u8 {
        self.max_priority.load(Ordering::Relaxed)
    }

    /// Set priority and ceiling together. Scheduler-internal; used for the
    /// idle threads.
    pub(crate) fn set_priority_raw(&self, priority: u8) {
        self.priority.store(priority, Ordering::Relaxed);
        self.max_priority.store(priority, Ordering::Relaxed);
    }

    /// Adjust priority within the thread's ceiling.
    pub fn set_priority(&self, priority: u8) -> KernelResult<()> {
        if priority as usize >= PRIORITY_LEVELS || priority < self.max_priority() {
            return Err(KernelError::InvalidArgument);
        }
        self.priority.store(priority, Ordering::Relaxed);
        Ok(())
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub(crate) fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    pub(crate) fn on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_on_cpu(&self, v: bool) {
        self.on_cpu.store(v, Ordering::Release);
    }

    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.context.as_ptr()
    }

    pub(crate) fn timeslice_us(&self) -> u64 {
        self.timeslice_us.load(Ordering::Relaxed)
    }

    pub(crate) fn consume_timeslice(&self, us: u64) -> bool {
        let left = self.timeslice_us.load(Ordering::Relaxed).saturating_sub(us);
        self.timeslice_us.store(left, Ordering::Relaxed);
        left == 0
    }

    pub(crate) fn reset_timeslice(&self) {
        let levels = PRIORITY_LEVELS as u64;
        let slice = crate::config::TIMESLICE_BASE_US * (levels - self.priority() as u64);
        self.timeslice_us.store(slice, Ordering::Relaxed);
    }

    pub(crate) fn preempt_count(&self) -> u64 {
        self.preempt_count.load(Ordering::Relaxed)
    }

    pub(crate) fn preempt_disable(&self) {
        self.preempt_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true when re-enabling must force the reschedule that was
    /// suppressed inside the critical section.
    pub(crate) fn preempt_enable(&self) -> bool {
        let prev = self.preempt_count.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "preempt_enable without matching disable");
        prev == 1 && self.preempt_missed.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn note_missed_preempt(&self) {
        self.preempt_missed.store(true, Ordering::Relaxed);
    }

    pub(crate) fn set_wait_entry(&self, entry: Option<Arc<WaitEntry>>) {
        *self.wait_entry.lock() = entry;
    }

    pub fn account_kernel_time(&self, us: u64) {
        self.kernel_time_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn account_user_time(&self, us: u64) {
        self.user_time_us.fetch_add(us, Ordering::Relaxed);
    }

    /// (kernel, user) CPU time in microseconds.
    pub fn cpu_time(&self) -> (u64, u64) {
        (
            self.kernel_time_us.load(Ordering::Relaxed),
            self.user_time_us.load(Ordering::Relaxed),
        )
    }

    pub fn process(&self) -> Option<Arc<crate::process::Process>> {
        self.process.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn attach_process(&self, process: &Arc<crate::process::Process>) {
        *self.process.lock() = Some(Arc::downgrade(process));
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id.0)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry and id allocation
// ---------------------------------------------------------------------------

const MAX_THREADS: usize = 65_536;

static THREAD_IDS: SpinLock<Option<IdAllocator>> = SpinLock::new(None);
static THREADS: SpinLock<BTreeMap<u64, Arc<Thread>>> = SpinLock::new(BTreeMap::new());

fn alloc_id() -> KernelResult<ThreadId> {
    let mut ids = THREAD_IDS.lock();
    let ids = ids.get_or_insert_with(|| IdAllocator::new(MAX_THREADS));
    ids.alloc()
        .map(|id| ThreadId(id as u64 + 1))
        .ok_or(KernelError::OutOfMemory)
}

fn free_id(id: ThreadId) {
    let mut ids = THREAD_IDS.lock();
    if let Some(ids) = ids.as_mut() {
        ids.free(id.0 as usize - 1);
    }
}

/// Look up a live thread by id.
pub fn find(id: ThreadId) -> Option<Arc<Thread>> {
    THREADS.lock().get(&id.0).cloned()
}

/// Number of live (unreaped) threads.
pub fn live_count() -> usize {
    THREADS.lock().len()
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

extern "C" fn thread_trampoline(arg: usize) -> ! {
    // First code a thread runs after its first switch-in: finish the switch
    // bookkeeping for whoever ran before us, then drop to the entry point
    // with interrupts on.
    crate::sched::scheduler::finish_switch();
    crate::arch::irq_restore(true);
    let thread = crate::sched::current_thread();
    let _ = arg;
    (thread.entry)(thread.entry_arg);
    exit();
}

/// Create a thread in CREATED state. It does not run until
/// [`run`](crate::sched::run) places it on a run queue.
pub fn spawn(
    name: &str,
    priority: u8,
    kernel: bool,
    entry: fn(usize),
    arg: usize,
) -> KernelResult<Arc<Thread>> {
    if priority as usize >= PRIORITY_LEVELS {
        return Err(KernelError::InvalidArgument);
    }
    let id = alloc_id()?;
    let stack = match KernelStack::new() {
        Ok(stack) => stack,
        Err(e) => {
            free_id(id);
            return Err(e);
        }
    };
    let context = Context::new_kernel(thread_trampoline, 0, stack.top());
    let thread = Arc::new(Thread {
        id,
        name: String::from(name),
        kernel,
        process: SpinLock::new(None),
        state: AtomicU8::new(ThreadState::Created as u8),
        priority: AtomicU8::new(priority),
        max_priority: AtomicU8::new(priority),
        timeslice_us: AtomicU64::new(0),
        preempt_count: AtomicU64::new(0),
        preempt_missed: AtomicBool::new(false),
        killed: AtomicBool::new(false),
        wait_entry: SpinLock::new(None),
        cpu: AtomicUsize::new(crate::arch::cpu_id()),
        on_cpu: AtomicBool::new(false),
        kernel_time_us: AtomicU64::new(0),
        user_time_us: AtomicU64::new(0),
        context: ContextCell(UnsafeCell::new(context)),
        entry,
        entry_arg: arg,
        _stack: Some(stack),
    });
    THREADS.lock().insert(id.0, thread.clone());
    Ok(thread)
}

/// Wrap the flow of control that booted a CPU as a thread, so the scheduler
/// can switch away from it. Also used to represent the host test thread.
pub(crate) fn bootstrap(name: &str, cpu: usize) -> Arc<Thread> {
    fn never(_: usize) {
        unreachable!("bootstrap thread re-entered its trampoline");
    }
    let id = alloc_id().expect("thread id space exhausted at boot");
    let thread = Arc::new(Thread {
        id,
        name: String::from(name),
        kernel: true,
        process: SpinLock::new(None),
        state: AtomicU8::new(ThreadState::Running as u8),
        priority: AtomicU8::new(crate::config::PRIORITY_KERNEL),
        max_priority: AtomicU8::new(0),
        timeslice_us: AtomicU64::new(crate::config::TIMESLICE_BASE_US),
        preempt_count: AtomicU64::new(0),
        preempt_missed: AtomicBool::new(false),
        killed: AtomicBool::new(false),
        wait_entry: SpinLock::new(None),
        cpu: AtomicUsize::new(cpu),
        on_cpu: AtomicBool::new(true),
        kernel_time_us: AtomicU64::new(0),
        user_time_us: AtomicU64::new(0),
        context: ContextCell(UnsafeCell::new(Context::empty())),
        entry: never,
        entry_arg: 0,
        _stack: None,
    });
    THREADS.lock().insert(id.0, thread.clone());
    thread
}

// ---------------------------------------------------------------------------
// Termination, kill, reaper
// ---------------------------------------------------------------------------

/// Terminate the calling thread. Never returns; the reaper frees the
/// thread's resources once its final switch has completed.
pub fn exit() -> ! {
    let thread = crate::sched::current_thread();
    thread.set_state(ThreadState::Dead);
    crate::sched::scheduler::schedule();
    unreachable!("dead thread {} rescheduled", thread.id().0);
}

/// Request asynchronous termination of `thread`.
///
/// Kernel threads cannot be killed. A target in interruptible sleep wakes
/// with `Interrupted`; one running on another CPU is IPI'd so it notices
/// the flag at its next kernel-to-user transition.
pub fn kill(thread: &Arc<Thread>) -> KernelResult<()> {
    if thread.is_kernel() {
        return Err(KernelError::AccessDenied);
    }
    thread.killed.store(true, Ordering::Release);

    let entry = thread.wait_entry.lock().clone();
    if let Some(entry) = entry {
        if entry.claim(WaitStatus::Interrupted) {
            crate::sched::ready(thread.clone());
            return Ok(());
        }
    }

    if thread.state() == ThreadState::Running {
        let cpu = thread.cpu();
        if cpu != crate::arch::cpu_id() {
            crate::arch::send_reschedule_ipi(cpu);
        }
    }
    Ok(())
}

/// Kill the calling thread in response to an unrecoverable fault. Called
/// from the page-fault handler for user-mode faults with no mapping.
pub fn kill_current_for_fault() {
    let thread = crate::sched::current_thread();
    if !thread.is_kernel() {
        thread.killed.store(true, Ordering::Release);
    }
}

static REAPER_QUEUE: SpinLock<VecDeque<Arc<Thread>>> = SpinLock::new(VecDeque::new());
static REAPER_SEM: Semaphore = Semaphore::new("reaper", 0);

/// Hand a dead thread to the reaper. Called from `finish_switch` once the
/// thread's context is no longer live on any CPU.
pub(crate) fn reaper_enqueue(thread: Arc<Thread>) {
    REAPER_QUEUE.lock().push_back(thread);
    REAPER_SEM.up();
}

/// Reaper main loop: unlink dead threads from the registry and their
/// process, return their id, and drop the final reference (which frees the
/// kernel stack and context).
pub(crate) fn reaper_main(_arg: usize) {
    loop {
        let _ = REAPER_SEM.down(crate::sync::FOREVER, false);
        let thread = REAPER_QUEUE.lock().pop_front();
        let Some(thread) = thread else { continue };
        THREADS.lock().remove(&thread.id().0);
        if let Some(process) = thread.process() {
            process.detach_thread(&thread);
        }
        free_id(thread.id());
        log::debug!("reaped thread {} ({})", thread.id().0, thread.name());
        drop(thread);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn spawned_threads_get_unique_ids() {
        fn entry(_: usize) {}
        let a = spawn("a", 16, true, entry, 0).expect("spawn a");
        let b = spawn("b", 16, true, entry, 0).expect("spawn b");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), ThreadState::Created);
        assert!(find(a.id()).is_some());
        // Unlink from the registry so other tests see a clean table.
        THREADS.lock().remove(&a.id().0);
        THREADS.lock().remove(&b.id().0);
        free_id(a.id());
        free_id(b.id());
    }

    #[test]
    fn priority_is_bounded() {
        fn entry(_: usize) {}
        assert!(spawn("bad", PRIORITY_LEVELS as u8, true, entry, 0).is_err());
        let t = spawn("ok", 8, true, entry, 0).expect("spawn");
        // Raising above the ceiling (numerically lower than max) fails.
        assert_eq!(t.set_priority(4), Err(KernelError::InvalidArgument));
        assert!(t.set_priority(12).is_ok());
        assert_eq!(t.priority(), 12);
        THREADS.lock().remove(&t.id().0);
        free_id(t.id());
    }

    #[test]
    fn preempt_counter_balance() {
        fn entry(_: usize) {}
        let t = spawn("preempt", 8, true, entry, 0).expect("spawn");
        t.preempt_disable();
        t.preempt_disable();
        t.note_missed_preempt();
        assert!(!t.preempt_enable());
        assert!(t.preempt_enable(), "missed preemption must force resched");
        THREADS.lock().remove(&t.id().0);
        free_id(t.id());
    }

    #[test]
    fn kernel_threads_cannot_be_killed() {
        fn entry(_: usize) {}
        let t = spawn("kernel", 8, true, entry, 0).expect("spawn");
        assert_eq!(kill(&t), Err(KernelError::AccessDenied));
        assert!(!t.killed());
        THREADS.lock().remove(&t.id().0);
        free_id(t.id());
    }

    #[test]
    fn kill_marks_user_thread() {
        fn entry(_: usize) {}
        let t = spawn("user", 16, false, entry, 0).expect("spawn");
        assert!(kill(&t).is_ok());
        assert!(t.killed());
        THREADS.lock().remove(&t.id().0);
        free_id(t.id());
    }

    #[test]
    fn cpu_time_is_monotonic() {
        fn entry(_: usize) {}
        let t = spawn("time", 16, true, entry, 0).expect("spawn");
        let (k0, u0) = t.cpu_time();
        t.account_kernel_time(100);
        t.account_user_time(50);
        let (k1, u1) = t.cpu_time();
        assert!(k1 >= k0 && u1 >= u0);
        assert_eq!((k1 - k0, u1 - u0), (100, 50));
        THREADS.lock().remove(&t.id().0);
        free_id(t.id());
    }
}
