//! Kernel error types.
//!
//! One status enum covers every recoverable failure the core can report.
//! Programmer-contract violations (mapping over an existing entry, unlocking
//! a mutex from the wrong thread, zero-sized allocation, double free) are not
//! errors: they panic, because they indicate a broken invariant rather than a
//! condition the caller can handle.

use core::fmt;

/// Recoverable kernel status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Heap or page allocator exhausted.
    OutOfMemory,
    /// Handle id unknown, closed, or of the wrong type.
    InvalidHandle,
    /// User pointer outside the user range, or unmapped and not pageable.
    InvalidAddress,
    /// Caller-supplied value violates a stated precondition.
    InvalidArgument,
    /// Rights mask insufficient for the requested operation.
    AccessDenied,
    /// Named object (port, handle, mapping) does not exist.
    NotFound,
    /// Id collision on insertion.
    AlreadyExists,
    /// Blocking primitive hit its deadline (or was a failed try).
    TimedOut,
    /// Interruptible wait cancelled by a kill or signal.
    Interrupted,
    /// IPC peer has hung up or the port has closed.
    DestUnreachable,
    /// Optional operation not provided by this object type.
    NotImplemented,
    /// Storage or driver reported a hardware failure.
    DeviceError,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Stable negative integer exported across the system-call boundary.
    /// Non-negative values are success; each error kind keeps its code
    /// forever.
    pub const fn to_status(self) -> i64 {
        match self {
            Self::OutOfMemory => -1,
            Self::InvalidHandle => -2,
            Self::InvalidAddress => -3,
            Self::InvalidArgument => -4,
            Self::AccessDenied => -5,
            Self::NotFound => -6,
            Self::AlreadyExists => -7,
            Self::TimedOut => -8,
            Self::Interrupted => -9,
            Self::DestUnreachable => -10,
            Self::NotImplemented => -11,
            Self::DeviceError => -12,
        }
    }

    /// Inverse of [`to_status`](Self::to_status), for the syscall return path
    /// in tests and user-visible diagnostics.
    pub const fn from_status(status: i64) -> Option<Self> {
        match status {
            -1 => Some(Self::OutOfMemory),
            -2 => Some(Self::InvalidHandle),
            -3 => Some(Self::InvalidAddress),
            -4 => Some(Self::InvalidArgument),
            -5 => Some(Self::AccessDenied),
            -6 => Some(Self::NotFound),
            -7 => Some(Self::AlreadyExists),
            -8 => Some(Self::TimedOut),
            -9 => Some(Self::Interrupted),
            -10 => Some(Self::DestUnreachable),
            -11 => Some(Self::NotImplemented),
            -12 => Some(Self::DeviceError),
            _ => None,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::InvalidHandle => "invalid handle",
            Self::InvalidAddress => "invalid address",
            Self::InvalidArgument => "invalid argument",
            Self::AccessDenied => "access denied",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::TimedOut => "timed out",
            Self::Interrupted => "interrupted",
            Self::DestUnreachable => "destination unreachable",
            Self::NotImplemented => "not implemented",
            Self::DeviceError => "device error",
        };
        f.write_str(msg)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    const ALL: [KernelError; 12] = [
        KernelError::OutOfMemory,
        KernelError::InvalidHandle,
        KernelError::InvalidAddress,
        KernelError::InvalidArgument,
        KernelError::AccessDenied,
        KernelError::NotFound,
        KernelError::AlreadyExists,
        KernelError::TimedOut,
        KernelError::Interrupted,
        KernelError::DestUnreachable,
        KernelError::NotImplemented,
        KernelError::DeviceError,
    ];

    #[test]
    fn status_codes_are_negative_and_distinct() {
        for (i, a) in ALL.iter().enumerate() {
            assert!(a.to_status() < 0);
            for b in ALL.iter().skip(i + 1) {
                assert_ne!(a.to_status(), b.to_status());
            }
        }
    }

    #[test]
    fn status_round_trips() {
        for e in ALL {
            assert_eq!(KernelError::from_status(e.to_status()), Some(e));
        }
        assert_eq!(KernelError::from_status(0), None);
        assert_eq!(KernelError::from_status(-100), None);
    }
}
