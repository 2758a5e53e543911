//! Safe user-memory access.
//!
//! All pointers crossing the user/kernel boundary come through here. Range
//! validation rejects anything outside the user half; the actual copies run
//! under the architecture's fault guard, so a page fault on a bad user
//! address surfaces as `InvalidAddress` instead of a kernel panic.

use alloc::{string::String, vec, vec::Vec};

use crate::{
    config::{USER_BASE, USER_SIZE},
    error::{KernelError, KernelResult},
};

/// Longest string `strdup` will copy, guarding against unterminated user
/// buffers.
pub const STRING_MAX: usize = 4096;

/// Verify `[addr, addr + len)` lies inside the user range.
pub fn validate_range(addr: u64, len: usize) -> KernelResult<()> {
    let end = addr.checked_add(len as u64).ok_or(KernelError::InvalidAddress)?;
    if addr < USER_BASE || end > USER_BASE + USER_SIZE {
        return Err(KernelError::InvalidAddress);
    }
    Ok(())
}

/// Copy `dst.len()` bytes in from user address `uaddr`.
pub fn copy_in(dst: &mut [u8], uaddr: u64) -> KernelResult<()> {
    if dst.is_empty() {
        return Ok(());
    }
    validate_range(uaddr, dst.len())?;
    // SAFETY: the destination is a live kernel slice; the user side is
    // fault-guarded.
    let ok = unsafe {
        crate::arch::usercopy::copy_guarded(dst.as_mut_ptr(), uaddr as *const u8, dst.len())
    };
    if ok {
        Ok(())
    } else {
        Err(KernelError::InvalidAddress)
    }
}

/// Copy `src` out to user address `uaddr`.
pub fn copy_out(uaddr: u64, src: &[u8]) -> KernelResult<()> {
    if src.is_empty() {
        return Ok(());
    }
    validate_range(uaddr, src.len())?;
    // SAFETY: the source is a live kernel slice; the user side is
    // fault-guarded.
    let ok = unsafe {
        crate::arch::usercopy::copy_guarded(uaddr as *mut u8, src.as_ptr(), src.len())
    };
    if ok {
        Ok(())
    } else {
        Err(KernelError::InvalidAddress)
    }
}

/// Copy in a `len`-byte buffer.
pub fn copy_in_vec(uaddr: u64, len: usize) -> KernelResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    copy_in(&mut buf, uaddr)?;
    Ok(buf)
}

/// Length of the NUL-terminated user string at `uaddr`, scanned in guarded
/// chunks. Fails with `InvalidArgument` when no terminator appears within
/// `max` bytes.
pub fn strlen(uaddr: u64, max: usize) -> KernelResult<usize> {
    let mut scanned = 0;
    let mut chunk = [0u8; 256];
    while scanned < max {
        let step = chunk.len().min(max - scanned);
        copy_in(&mut chunk[..step], uaddr + scanned as u64)?;
        if let Some(pos) = chunk[..step].iter().position(|&b| b == 0) {
            return Ok(scanned + pos);
        }
        scanned += step;
    }
    Err(KernelError::InvalidArgument)
}

/// Duplicate the NUL-terminated user string at `uaddr` into kernel memory.
pub fn strdup(uaddr: u64) -> KernelResult<String> {
    let len = strlen(uaddr, STRING_MAX)?;
    let bytes = copy_in_vec(uaddr, len)?;
    String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn range_validation_bounds() {
        assert!(validate_range(USER_BASE, 4096).is_ok());
        assert!(validate_range(USER_BASE + USER_SIZE - 4096, 4096).is_ok());
        assert_eq!(
            validate_range(USER_BASE - 1, 1),
            Err(KernelError::InvalidAddress)
        );
        assert_eq!(
            validate_range(USER_BASE + USER_SIZE - 1, 2),
            Err(KernelError::InvalidAddress)
        );
        assert_eq!(
            validate_range(u64::MAX - 1, 16),
            Err(KernelError::InvalidAddress),
            "overflowing ranges must be rejected"
        );
        assert_eq!(validate_range(0, 1), Err(KernelError::InvalidAddress));
    }

    #[test]
    fn kernel_addresses_never_validate() {
        assert_eq!(
            validate_range(crate::config::KERNEL_HEAP_BASE, 8),
            Err(KernelError::InvalidAddress)
        );
        assert_eq!(
            validate_range(crate::config::PHYS_MAP_BASE, 8),
            Err(KernelError::InvalidAddress)
        );
    }

    #[test]
    fn copies_reject_bad_ranges_before_touching_memory() {
        let mut buf = [0u8; 8];
        assert_eq!(copy_in(&mut buf, 0x10), Err(KernelError::InvalidAddress));
        assert_eq!(copy_out(0x10, &buf), Err(KernelError::InvalidAddress));
        // Zero-length copies are trivially fine anywhere valid.
        assert!(copy_in(&mut [], USER_BASE).is_ok());
    }
}
