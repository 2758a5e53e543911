//! Compile-time kernel configuration.
//!
//! Every tunable the core subsystems share lives here. The kernel carries no
//! runtime configuration; it is stateless across boots.

/// Size of a page frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of CPUs the kernel will bring up.
pub const MAX_CPUS: usize = 16;

/// Number of run-queue priority levels. Level 0 is the highest priority,
/// `PRIORITY_LEVELS - 1` is reserved for the idle threads.
pub const PRIORITY_LEVELS: usize = 32;

/// Default priority for new kernel threads.
pub const PRIORITY_KERNEL: u8 = 8;

/// Default priority for new user threads.
pub const PRIORITY_DEFAULT: u8 = 16;

/// Idle priority level.
pub const PRIORITY_IDLE: u8 = (PRIORITY_LEVELS - 1) as u8;

/// Base timeslice in microseconds; the timeslice of a thread at level N is
/// `TIMESLICE_BASE_US * (PRIORITY_LEVELS - N)`.
pub const TIMESLICE_BASE_US: u64 = 1_000;

/// Size of a thread's kernel stack in bytes (must be a multiple of
/// [`PAGE_SIZE`]).
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Largest payload a single IPC message may carry, in bytes.
pub const MESSAGE_MAX: usize = 16 * 1024;

/// Number of messages an IPC endpoint queues before senders block.
pub const QUEUE_MAX: u32 = 256;

/// Upper bound on handle-table slots per process.
pub const HANDLE_TABLE_MAX: usize = 1024;

// ---------------------------------------------------------------------------
// Virtual address layout
// ---------------------------------------------------------------------------

/// Lowest user-space virtual address. The first 4 MiB are left unmapped so
/// null-pointer dereferences (with a healthy margin) always fault.
pub const USER_BASE: u64 = 0x0000_0000_0040_0000;

/// Size of the user half of every address space.
pub const USER_SIZE: u64 = 0x0000_7FFF_FFC0_0000 - USER_BASE;

/// Base of the direct physical-memory window in kernel space.
pub const PHYS_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Size of the direct physical-memory window (64 TiB covers any PC).
pub const PHYS_MAP_SIZE: u64 = 0x0000_4000_0000_0000;

/// Base of the kernel heap range handed to the virtual-range allocator.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_C000_0000_0000;

/// Size of the kernel heap range.
pub const KERNEL_HEAP_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Bytes of the bootstrap heap that carries allocations made before the slab
/// layer is online.
pub const BOOT_HEAP_SIZE: usize = 2 * 1024 * 1024;

/// Compile-time log level filter for the serial logger.
pub const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;
