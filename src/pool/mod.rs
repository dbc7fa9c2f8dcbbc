//! Shared chunk pool
//!
//! The pool owns every chunk that is not currently held by a per-context allocator:
//! chunks ready for reuse sit in an available index, released chunks wait in a fence
//! ordered queue until the GPU has finished with them.

mod index;
mod manager;
mod stale;

pub use index::{BestFitIndex, ChunkIndex, FifoIndex};
pub use manager::{ChunkManager, PoolStats};
pub use stale::StaleQueue;

use crate::chunk::{DynamicPage, PageFactory, SlotGroup, SlotGroupFactory};
use crate::device::Device;

/// Pool of upload pages, indexed by size for best-fit reuse.
pub type DynamicMemoryManager<D> =
    ChunkManager<PageFactory<D>, BestFitIndex<DynamicPage<<D as Device>::Buffer>>>;

/// Pool of uniform slot groups, reused in release order.
pub type SlotPoolManager<D> =
    ChunkManager<SlotGroupFactory<D>, FifoIndex<SlotGroup<<D as Device>::SlotGroup>>>;
