//! Kernel synchronization primitives.
//!
//! [`SpinLock`] is the only primitive safe in interrupt context; everything
//! else may sleep and sits above the scheduler. The locking discipline is
//! strict: a spinlock is never held across a suspension point.

pub mod condvar;
pub mod mutex;
pub mod once_lock;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;
pub mod waitqueue;

pub use condvar::CondVar;
pub use mutex::Mutex;
pub use once_lock::OnceLock;
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
pub use waitqueue::{WaitEntry, WaitQueue, WaitStatus};

/// Timeout in microseconds for blocking operations: `0` means try (fail
/// immediately with `TimedOut` when unsatisfied), negative means wait
/// indefinitely.
pub type Timeout = i64;

/// The indefinite timeout.
pub const FOREVER: Timeout = -1;

/// The non-blocking "try" timeout.
pub const TRY: Timeout = 0;
