//! Fence-gated two-tier suballocation of GPU upload memory and handle pools.
//!
//! Each rendering context owns a cheap, lock-free allocator ([`DynamicHeap`] for bytes,
//! [`DynamicSlotAllocator`] for handle slots). These carve small per-frame allocations out
//! of coarse chunks taken from a shared, mutex-guarded [`ChunkManager`]. At the end of a
//! frame the chunks go back to the pool tagged with a fence value, and only become
//! reusable once the GPU reports that fence as completed.
//!
//! ```
//! use std::sync::Arc;
//! use dynheap::{
//!     ChunkManager, ChunkManagerConfig, CompletionTracker, DynamicHeap, DynamicHeapConfig,
//!     FenceCounter, HostDevice,
//! };
//!
//! let pool = Arc::new(ChunkManager::for_pages(
//!     HostDevice::new("host"),
//!     ChunkManagerConfig::default(),
//! )?);
//! let fences = FenceCounter::new();
//! let mut heap = DynamicHeap::new(pool.clone(), DynamicHeapConfig::default());
//!
//! let constants = heap.allocate(256, 256).expect("out of upload memory");
//! assert_eq!(constants.offset % 256, 0);
//!
//! heap.finish_frame(fences.submit());
//! fences.signal_all();
//! pool.reclaim_stale(fences.completed_fence_value());
//!
//! drop(heap);
//! pool.destroy(fences.completed_fence_value())?;
//! # Ok::<(), dynheap::HeapError>(())
//! ```

pub mod chunk;
pub mod config;
pub mod device;
pub mod error;
pub mod fence;
pub mod heap;
pub mod host;
pub mod linear;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod pool;
pub mod size;
pub mod slots;

pub use chunk::{
    Chunk, ChunkFactory, ChunkId, DynamicPage, PageFactory, SlotGroup, SlotGroupFactory,
};
pub use config::{ChunkManagerConfig, DynamicHeapConfig};
pub use device::{Device, GpuAddress, SlotGroupSpec};
pub use error::{DeviceError, HeapError, HeapResult};
pub use fence::{CompletionTracker, FenceCounter};
pub use heap::{DynamicAllocation, DynamicHeap};
pub use host::HostDevice;
pub use linear::{LinearAllocator, LinearStats};
pub use pool::{
    BestFitIndex, ChunkIndex, ChunkManager, DynamicMemoryManager, FifoIndex, PoolStats,
    SlotPoolManager,
};
pub use slots::{DynamicSlotAllocator, SharedSlot, SharedSlotAllocator, Slot};
