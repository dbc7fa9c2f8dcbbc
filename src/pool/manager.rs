use parking_lot::Mutex;

use super::index::{BestFitIndex, ChunkIndex, FifoIndex};
use super::stale::StaleQueue;
use crate::chunk::{
    Chunk, ChunkFactory, ChunkId, DynamicPage, PageFactory, SlotGroup, SlotGroupFactory,
};
use crate::config::ChunkManagerConfig;
use crate::device::{Device, SlotGroupSpec};
use crate::error::{HeapError, HeapResult};
use crate::size::format_memory_size;

/// Snapshot of a pool's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Chunks created over the pool's lifetime, reserved ones included.
    pub chunks_created: usize,
    /// Sum of the sizes of all created chunks.
    pub created_size: u64,
    pub available_chunks: usize,
    pub available_size: u64,
    pub stale_chunks: usize,
    pub peak_stale_chunks: usize,
    /// Stale queue went over the warning threshold and has not yet drained to half of it.
    pub stale_warning_active: bool,
}

impl PoolStats {
    /// Chunks currently held by per-context allocators.
    pub fn outstanding_chunks(&self) -> usize {
        self.chunks_created - self.available_chunks - self.stale_chunks
    }
}

struct PoolState<C, I> {
    available: I,
    stale: StaleQueue<C>,
    chunks_created: usize,
    created_size: u64,
    over_threshold: bool,
    destroyed: bool,
    destroy_failed: bool,
}

/// Shared pool of reusable chunks.
///
/// Per-context allocators take chunks with [`allocate_chunk`](Self::allocate_chunk) and
/// hand them back at the end of a frame with [`discard_chunks`](Self::discard_chunks),
/// tagged with the fence value their GPU work signals. A discarded chunk becomes
/// available again once [`reclaim_stale`](Self::reclaim_stale) is called with a completed
/// fence value at least as high. The pool only compares fence values; it never waits.
///
/// One mutex guards all bookkeeping. It is never held across a device call.
///
/// The pool must be torn down with [`destroy`](Self::destroy) once the device is idle and
/// every per-context allocator has finished its frame.
pub struct ChunkManager<F, I = BestFitIndex<<F as ChunkFactory>::Chunk>>
where
    F: ChunkFactory,
{
    factory: F,
    config: ChunkManagerConfig,
    state: Mutex<PoolState<F::Chunk, I>>,
}

impl<F, I> ChunkManager<F, I>
where
    F: ChunkFactory,
    I: ChunkIndex<F::Chunk>,
{
    /// Creates the pool and reserves `config.reserve_chunks` chunks of
    /// `config.reserve_size`.
    pub fn new(factory: F, config: ChunkManagerConfig) -> HeapResult<Self> {
        let mut available = I::default();
        let mut created_size = 0;
        for _ in 0..config.reserve_chunks {
            let chunk = factory.create_chunk(config.reserve_size)?;
            created_size += chunk.size();
            available.insert(chunk);
        }

        if config.reserve_chunks > 0 {
            log::info!(
                "{}: reserved {} {}(s), {} total",
                config.name,
                config.reserve_chunks,
                factory.kind(),
                format_memory_size(created_size, 2)
            );
        }

        Ok(Self {
            factory,
            state: Mutex::new(PoolState {
                available,
                stale: StaleQueue::default(),
                chunks_created: config.reserve_chunks,
                created_size,
                over_threshold: false,
                destroyed: false,
                destroy_failed: false,
            }),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Returns the smallest available chunk of at least `min_size`, or creates one of
    /// exactly `min_size` if none is available.
    ///
    /// Device failures are logged and returned; they are never retried.
    pub fn allocate_chunk(&self, min_size: u64) -> HeapResult<F::Chunk> {
        let min_size = min_size.max(1);
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(HeapError::PoolDestroyed(self.config.name.clone()));
            }
            if let Some(chunk) = state.available.take(min_size) {
                debug_assert!(chunk.size() >= min_size);
                log::trace!(
                    "{}: reusing {} {} ({} for a request of {})",
                    self.config.name,
                    self.factory.kind(),
                    chunk.id(),
                    chunk.size(),
                    min_size
                );
                return Ok(chunk);
            }
        }

        let chunk = self.factory.create_chunk(min_size).inspect_err(|e| {
            log::error!("{}: {}", self.config.name, e);
        })?;
        debug_assert!(chunk.size() >= min_size);

        let mut state = self.state.lock();
        state.chunks_created += 1;
        state.created_size += chunk.size();
        Ok(chunk)
    }

    /// Queues `chunks` until `fence_value` has completed.
    pub fn discard_chunks<It>(&self, chunks: It, fence_value: u64)
    where
        It: IntoIterator<Item = F::Chunk>,
    {
        let mut state = self.state.lock();
        if state.destroyed {
            drop(state);
            let count = chunks.into_iter().count();
            log::error!(
                "{}: {} {}(s) discarded after destroy(); released immediately",
                self.config.name,
                count,
                self.factory.kind()
            );
            return;
        }

        for chunk in chunks {
            let id = chunk.id();
            if !state.stale.push(chunk, fence_value) {
                log::warn!(
                    "{}: {} {} released with fence {} out of order",
                    self.config.name,
                    self.factory.kind(),
                    id,
                    fence_value
                );
            }
        }

        if let Some(threshold) = self.config.stale_warning_threshold {
            let len = state.stale.len();
            if len > threshold && !state.over_threshold {
                state.over_threshold = true;
                log::warn!(
                    "{}: {} stale {}s waiting on fence {:?}; GPU completion is lagging",
                    self.config.name,
                    len,
                    self.factory.kind(),
                    state.stale.oldest_fence_value()
                );
            }
        }
    }

    /// Moves every chunk whose fence value is at most `completed_fence_value` back to
    /// the available set. Returns the number of chunks reclaimed.
    pub fn reclaim_stale(&self, completed_fence_value: u64) -> usize {
        let mut state = self.state.lock();
        self.reclaim_locked(&mut state, completed_fence_value)
    }

    /// Puts chunks the GPU never used, or has provably finished with, straight back into
    /// the available set.
    pub fn return_chunks<It>(&self, chunks: It)
    where
        It: IntoIterator<Item = F::Chunk>,
    {
        let mut state = self.state.lock();
        for mut chunk in chunks {
            self.factory.recycle(&mut chunk);
            state.available.insert(chunk);
        }
    }

    /// True if the chunk with `id` is in the available set.
    pub fn is_available(&self, id: ChunkId) -> bool {
        self.state.lock().available.contains(id)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        Self::stats_locked(&state)
    }

    /// Releases every chunk once the GPU has finished with all of them.
    ///
    /// Fails with a precondition violation if chunks are still waiting on fences beyond
    /// `last_completed_fence_value`, or if a per-context allocator still holds chunks.
    pub fn destroy(&self, last_completed_fence_value: u64) -> HeapResult<PoolStats> {
        let (stats, chunks) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(HeapError::PoolDestroyed(self.config.name.clone()));
            }

            self.reclaim_locked(&mut state, last_completed_fence_value);
            if !state.stale.is_empty() {
                let count = state.stale.len();
                log::error!(
                    "{}: not all stale {}s have been released and are still in use; \
                     the device must be idled before calling destroy()",
                    self.config.name,
                    self.factory.kind()
                );
                state.destroy_failed = true;
                return Err(HeapError::StaleChunksInFlight { count });
            }

            let stats = Self::stats_locked(&state);
            let outstanding = stats.outstanding_chunks();
            if outstanding > 0 {
                log::error!(
                    "{}: {} {}(s) still held by per-context allocators",
                    self.config.name,
                    outstanding,
                    self.factory.kind()
                );
                state.destroy_failed = true;
                return Err(HeapError::ChunksOutstanding { count: outstanding });
            }

            state.destroyed = true;
            (stats, state.available.drain())
        };

        log::info!(
            "{} usage stats: {} {}(s) created, total allocated: {}, peak stale queue depth: {}",
            self.config.name,
            stats.chunks_created,
            self.factory.kind(),
            format_memory_size(stats.created_size, 2),
            stats.peak_stale_chunks
        );

        drop(chunks);
        Ok(stats)
    }

    fn reclaim_locked(
        &self,
        state: &mut PoolState<F::Chunk, I>,
        completed_fence_value: u64,
    ) -> usize {
        let mut reclaimed = 0;
        while let Some(mut chunk) = state.stale.pop_ready(completed_fence_value) {
            self.factory.recycle(&mut chunk);
            state.available.insert(chunk);
            reclaimed += 1;
        }

        if state.over_threshold {
            let rearm = self
                .config
                .stale_warning_threshold
                .is_none_or(|threshold| state.stale.len() <= threshold / 2);
            if rearm {
                state.over_threshold = false;
            }
        }

        if reclaimed > 0 {
            log::debug!(
                "{}: reclaimed {} {}(s) at fence {}",
                self.config.name,
                reclaimed,
                self.factory.kind(),
                completed_fence_value
            );
        }
        reclaimed
    }

    fn stats_locked(state: &PoolState<F::Chunk, I>) -> PoolStats {
        PoolStats {
            chunks_created: state.chunks_created,
            created_size: state.created_size,
            available_chunks: state.available.len(),
            available_size: state.available.total_size(),
            stale_chunks: state.stale.len(),
            peak_stale_chunks: state.stale.peak_len(),
            stale_warning_active: state.over_threshold,
        }
    }
}

impl<D: Device> ChunkManager<PageFactory<D>, BestFitIndex<DynamicPage<D::Buffer>>> {
    /// Pool of upload pages created on `device`.
    pub fn for_pages(device: D, config: ChunkManagerConfig) -> HeapResult<Self> {
        let factory = PageFactory::new(device, format!("{} page", config.name));
        Self::new(factory, config)
    }
}

impl<D: Device> ChunkManager<SlotGroupFactory<D>, FifoIndex<SlotGroup<D::SlotGroup>>> {
    /// Pool of slot groups shaped by `spec`. Reserved groups always use the spec's size.
    pub fn for_slot_groups(
        device: D,
        spec: SlotGroupSpec,
        mut config: ChunkManagerConfig,
    ) -> HeapResult<Self> {
        config.reserve_size = u64::from(spec.slots_per_group);
        Self::new(SlotGroupFactory::new(device, spec), config)
    }

    pub fn slots_per_group(&self) -> u32 {
        self.factory.spec().slots_per_group
    }
}

impl<F, I> Drop for ChunkManager<F, I>
where
    F: ChunkFactory,
{
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.destroyed {
            return;
        }
        let leaked = state.chunks_created;
        if leaked > 0 && state.destroy_failed {
            // destroy() already reported the violation to the caller.
            log::error!(
                "{}: dropped after a failed destroy(); releasing {} {}(s) regardless",
                self.config.name,
                leaked,
                self.factory.kind()
            );
        } else if leaked > 0 {
            log::error!(
                "{}: {} {}(s) not destroyed; the pool must be explicitly destroyed with destroy()",
                self.config.name,
                leaked,
                self.factory.kind()
            );
            debug_assert!(
                std::thread::panicking(),
                "{} dropped without destroy()",
                self.config.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostDevice;
    use crate::pool::DynamicMemoryManager;
    use std::sync::Arc;

    fn page_pool(
        device: Arc<HostDevice>,
        reserve: usize,
        size: u64,
    ) -> DynamicMemoryManager<Arc<HostDevice>> {
        let config = ChunkManagerConfig {
            name: "test pool".to_string(),
            reserve_chunks: reserve,
            reserve_size: size,
            ..Default::default()
        };
        ChunkManager::for_pages(device, config).unwrap()
    }

    #[test]
    fn test_reserved_chunks_are_available() {
        let device = Arc::new(HostDevice::new("host"));
        let pool = page_pool(device.clone(), 3, 1024);
        let stats = pool.stats();
        assert_eq!(stats.chunks_created, 3);
        assert_eq!(stats.available_chunks, 3);
        assert_eq!(stats.available_size, 3072);
        assert_eq!(device.allocated_bytes(), 3072);

        pool.destroy(0).unwrap();
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_allocate_chunk_best_fit_then_create() {
        let device = Arc::new(HostDevice::new("host"));
        let pool = page_pool(device.clone(), 0, 1024);

        let small = pool.allocate_chunk(1024).unwrap();
        let big = pool.allocate_chunk(8192).unwrap();
        assert_eq!(small.size(), 1024);
        assert_eq!(big.size(), 8192);
        pool.return_chunks([small, big]);

        let reused = pool.allocate_chunk(2000).unwrap();
        assert_eq!(reused.size(), 8192);
        assert_eq!(pool.stats().chunks_created, 2);

        let fresh = pool.allocate_chunk(16384).unwrap();
        assert_eq!(fresh.size(), 16384);
        assert_eq!(pool.stats().chunks_created, 3);

        pool.return_chunks([reused, fresh]);
        pool.destroy(0).unwrap();
    }

    #[test]
    fn test_discarded_chunk_waits_for_fence() {
        let device = Arc::new(HostDevice::new("host"));
        let pool = page_pool(device, 0, 1024);

        let chunk = pool.allocate_chunk(1024).unwrap();
        let id = chunk.id();
        pool.discard_chunks([chunk], 5);

        assert_eq!(pool.reclaim_stale(4), 0);
        assert!(!pool.is_available(id));
        assert_eq!(pool.stats().stale_chunks, 1);

        assert_eq!(pool.reclaim_stale(5), 1);
        assert!(pool.is_available(id));
        pool.destroy(5).unwrap();
    }

    #[test]
    fn test_destroy_with_stale_chunks_fails() {
        let device = Arc::new(HostDevice::new("host"));
        let pool = page_pool(device, 0, 1024);

        let chunk = pool.allocate_chunk(1024).unwrap();
        pool.discard_chunks([chunk], 9);

        let err = pool.destroy(8).unwrap_err();
        assert!(matches!(err, HeapError::StaleChunksInFlight { count: 1 }));
        assert!(err.is_precondition_violation());

        pool.destroy(9).unwrap();
    }

    #[test]
    fn test_destroy_with_outstanding_chunk_fails() {
        let device = Arc::new(HostDevice::new("host"));
        let pool = page_pool(device, 1, 1024);

        let chunk = pool.allocate_chunk(512).unwrap();
        let err = pool.destroy(0).unwrap_err();
        assert!(matches!(err, HeapError::ChunksOutstanding { count: 1 }));

        pool.discard_chunks([chunk], 1);
        pool.destroy(1).unwrap();
        assert!(matches!(
            pool.allocate_chunk(1),
            Err(HeapError::PoolDestroyed(_))
        ));
    }

    #[test]
    fn test_device_failure_is_surfaced() {
        let device = Arc::new(HostDevice::with_budget("tiny", 4096));
        let pool = page_pool(device, 0, 1024);

        let err = pool.allocate_chunk(8192).unwrap_err();
        assert!(matches!(
            err,
            HeapError::DeviceResourceCreationFailure { size: 8192, .. }
        ));
        assert_eq!(pool.stats().chunks_created, 0);
        pool.destroy(0).unwrap();
    }

    #[test]
    fn test_slot_groups_are_reset_on_reclaim() {
        let device = Arc::new(HostDevice::new("host"));
        let spec = SlotGroupSpec {
            name: "sets".to_string(),
            slots_per_group: 16,
        };
        let pool =
            ChunkManager::for_slot_groups(device.clone(), spec, ChunkManagerConfig::default())
                .unwrap();
        assert_eq!(pool.slots_per_group(), 16);

        let group = pool.allocate_chunk(16).unwrap();
        assert_eq!(group.capacity(), 16);
        assert!(pool.allocate_chunk(17).is_err());

        pool.discard_chunks([group], 2);
        pool.reclaim_stale(2);
        assert_eq!(device.group_resets(), 1);
        pool.destroy(2).unwrap();
    }

    #[test]
    fn test_stale_warning_arms_and_rearms_at_half_threshold() {
        let device = Arc::new(HostDevice::new("host"));
        let config = ChunkManagerConfig {
            name: "lagging pool".to_string(),
            stale_warning_threshold: Some(4),
            ..Default::default()
        };
        let pool = ChunkManager::for_pages(device, config).unwrap();

        for fence in 1..=5 {
            let chunk = pool.allocate_chunk(256).unwrap();
            pool.discard_chunks([chunk], fence);
            assert_eq!(pool.stats().stale_warning_active, fence > 4);
        }

        // Three left: still above half the threshold.
        pool.reclaim_stale(2);
        assert!(pool.stats().stale_warning_active);

        pool.reclaim_stale(3);
        assert_eq!(pool.stats().stale_chunks, 2);
        assert!(!pool.stats().stale_warning_active);

        // Re-armed: going over again trips the warning again.
        for fence in 6..=8 {
            let chunk = pool.allocate_chunk(256).unwrap();
            pool.discard_chunks([chunk], fence);
        }
        assert_eq!(pool.stats().stale_chunks, 5);
        assert!(pool.stats().stale_warning_active);

        pool.destroy(8).unwrap();
    }

    #[test]
    fn test_discard_after_destroy_releases_immediately() {
        let device = Arc::new(HostDevice::new("host"));
        let pool = page_pool(device.clone(), 0, 1024);

        let stray = pool.factory().create_chunk(1024).unwrap();
        assert_eq!(device.allocated_bytes(), 1024);
        pool.destroy(0).unwrap();

        pool.discard_chunks([stray], 1);
        assert_eq!(device.allocated_bytes(), 0);
        assert_eq!(pool.stats().stale_chunks, 0);
    }

    #[test]
    fn test_drop_after_failed_destroy_only_logs() {
        let device = Arc::new(HostDevice::new("host"));
        let pool = page_pool(device.clone(), 0, 1024);

        let chunk = pool.allocate_chunk(1024).unwrap();
        pool.discard_chunks([chunk], 3);
        assert!(pool.destroy(1).is_err());

        drop(pool);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_stats_track_peak_stale_depth() {
        let device = Arc::new(HostDevice::new("host"));
        let pool = page_pool(device, 0, 256);
        let chunks: Vec<_> = (0..4).map(|_| pool.allocate_chunk(256).unwrap()).collect();
        pool.discard_chunks(chunks, 1);
        pool.reclaim_stale(1);

        let stats = pool.stats();
        assert_eq!(stats.peak_stale_chunks, 4);
        assert_eq!(stats.stale_chunks, 0);
        assert_eq!(stats.outstanding_chunks(), 0);
        pool.destroy(1).unwrap();
    }
}
