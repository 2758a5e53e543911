//! Small shared utilities.

pub mod id_alloc;

pub use id_alloc::IdAllocator;
