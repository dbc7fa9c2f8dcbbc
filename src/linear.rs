//! Per-context bump allocation over pool chunks.
//!
//! [`LinearAllocator`] is the fast path shared by the byte heap and the slot allocator.
//! It owns the chunks it acquired during the current frame, carves sequential ranges out
//! of the newest one, and gives all of them back to the pool in
//! [`finish_frame`](LinearAllocator::finish_frame). It never locks; the pool is touched
//! only when the current chunk is exhausted and at the end of the frame.

use std::sync::Arc;

use crate::chunk::{Chunk, ChunkFactory};
use crate::pool::{ChunkIndex, ChunkManager};
use crate::size::{checked_align_up, grow_to_fit};

/// Usage counters of a per-context allocator, in the chunk's size unit.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinearStats {
    pub current_used: u64,
    pub current_allocated: u64,
    pub peak_used: u64,
    pub peak_allocated: u64,
    /// Frames finished so far.
    pub frames: u64,
    /// Requests that could not be served because no chunk could be obtained.
    pub failed_allocations: u64,
}

impl LinearStats {
    /// Peak used over peak allocated, in percent.
    pub fn peak_utilization(&self) -> f64 {
        self.peak_used as f64 / self.peak_allocated.max(1) as f64 * 100.0
    }
}

/// Bump allocator drawing its chunks from a shared [`ChunkManager`].
pub struct LinearAllocator<F, I>
where
    F: ChunkFactory,
    I: ChunkIndex<F::Chunk>,
{
    manager: Arc<ChunkManager<F, I>>,
    name: String,
    nominal_size: u64,
    /// Chunks acquired this frame; the last one is current.
    chunks: Vec<F::Chunk>,
    /// Cursor into the current chunk, `None` while no chunk is held.
    offset: Option<u64>,
    available: u64,
    stats: LinearStats,
}

impl<F, I> LinearAllocator<F, I>
where
    F: ChunkFactory,
    I: ChunkIndex<F::Chunk>,
{
    pub fn new(
        manager: Arc<ChunkManager<F, I>>,
        name: impl Into<String>,
        nominal_size: u64,
    ) -> Self {
        assert!(nominal_size > 0, "nominal chunk size must be non-zero");
        Self {
            manager,
            name: name.into(),
            nominal_size,
            chunks: Vec::new(),
            offset: None,
            available: 0,
            stats: LinearStats::default(),
        }
    }

    /// Reserves `size` units aligned to `alignment` and returns the chunk holding them
    /// together with the aligned offset.
    ///
    /// When the current chunk cannot fit the request, a new chunk of the smallest
    /// power-of-two multiple of the nominal size that holds `size` is taken from the
    /// pool. Returns `None` if the pool cannot provide one.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<(&F::Chunk, u64)> {
        assert!(
            alignment.is_power_of_two(),
            "Alignment ({}) must be power of 2",
            alignment
        );

        // Request plus the padding needed to align `offset`; `None` on overflow.
        let padded = |offset: u64| {
            let aligned = checked_align_up(offset, alignment)?;
            size.checked_add(aligned - offset)
        };

        let fits = self
            .offset
            .and_then(padded)
            .is_some_and(|adjusted| adjusted <= self.available);
        if !fits {
            let Some(chunk_size) = grow_to_fit(self.nominal_size, size) else {
                log::error!(
                    "{}: request of {} exceeds the largest possible chunk",
                    self.name,
                    size
                );
                self.stats.failed_allocations += 1;
                return None;
            };
            match self.manager.allocate_chunk(chunk_size) {
                Ok(chunk) => {
                    self.offset = Some(0);
                    self.available = chunk.size();
                    self.stats.current_allocated += chunk.size();
                    self.stats.peak_allocated =
                        self.stats.peak_allocated.max(self.stats.current_allocated);
                    self.chunks.push(chunk);
                }
                Err(e) => {
                    log::error!("{}: cannot serve request of {}: {}", self.name, size, e);
                    self.stats.failed_allocations += 1;
                    return None;
                }
            }
        }

        let offset = self.offset?;
        let adjusted = padded(offset).filter(|adjusted| *adjusted <= self.available)?;
        let aligned = offset + (adjusted - size);
        self.available -= adjusted;
        self.offset = Some(offset + adjusted);

        self.stats.current_used += size;
        self.stats.peak_used = self.stats.peak_used.max(self.stats.current_used);

        let chunk = self.chunks.last()?;
        debug_assert!(aligned + size <= chunk.size());
        Some((chunk, aligned))
    }

    /// Hands every chunk acquired this frame to the pool, to be reused once
    /// `fence_value` has completed, and returns to the empty state.
    pub fn finish_frame(&mut self, fence_value: u64) {
        if !self.chunks.is_empty() {
            log::trace!(
                "{}: releasing {} chunk(s) at fence {}",
                self.name,
                self.chunks.len(),
                fence_value
            );
            self.manager.discard_chunks(self.chunks.drain(..), fence_value);
        }

        self.offset = None;
        self.available = 0;
        self.stats.current_allocated = 0;
        self.stats.current_used = 0;
        self.stats.frames += 1;
    }

    pub fn current_chunk(&self) -> Option<&F::Chunk> {
        self.offset.and_then(|_| self.chunks.last())
    }

    /// Chunks held since the last [`finish_frame`](Self::finish_frame).
    pub fn chunks(&self) -> &[F::Chunk] {
        &self.chunks
    }

    /// Units left in the current chunk.
    pub fn remaining(&self) -> u64 {
        self.available
    }

    pub fn stats(&self) -> LinearStats {
        self.stats
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nominal_size(&self) -> u64 {
        self.nominal_size
    }

    pub fn manager(&self) -> &Arc<ChunkManager<F, I>> {
        &self.manager
    }
}

impl<F, I> Drop for LinearAllocator<F, I>
where
    F: ChunkFactory,
    I: ChunkIndex<F::Chunk>,
{
    fn drop(&mut self) {
        if !self.chunks.is_empty() {
            log::error!(
                "{}: {} chunk(s) have not been released, \
                 which indicates finish_frame() has not been called",
                self.name,
                self.chunks.len()
            );
            debug_assert!(
                std::thread::panicking(),
                "{} dropped while holding chunks",
                self.name
            );
        }
    }
}
