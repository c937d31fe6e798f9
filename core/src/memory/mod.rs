//! Host allocation and value lifecycle tracking.
mod allocator;
mod arena;

pub use allocator::{AllocatorStats, HostAllocator};
pub use arena::{TensorArena, TensorHandle};
