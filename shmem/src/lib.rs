//! A work queue shared between processes through a named shared-memory segment.
//!
//! One process creates the pool with [`SharedQueue::create`]; every other
//! worker maps it with [`SharedQueue::attach`]. Items are copied into nodes
//! carved from the segment and linked by offset, so each process may map the
//! segment at a different address.

mod alloc;
pub mod core;
mod errors;
mod local;
mod queue;
mod sync;

pub use crate::alloc::{AllocStats, MIN_BLOCK_SIZE};
pub use crate::core::{min_pool_size, SharedMemoryPool, ShmemConfig, ShmemConfigBuilder};
pub use crate::errors::{QueueError, Result};
pub use crate::local::LocalQueue;
pub use crate::queue::{QueueStats, SharedQueue, TryGet, WorkQueue};
