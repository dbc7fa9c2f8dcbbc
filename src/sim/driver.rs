//! Frame loop driving per-context allocators on blocking worker threads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use dynheap::{
    CompletionTracker, Device, DynamicHeap, DynamicHeapConfig, DynamicMemoryManager,
    DynamicSlotAllocator, FenceCounter, SlotPoolManager,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Per-context work done each frame
#[derive(Debug, Clone, Copy)]
pub struct WorkloadConfig {
    pub allocations_per_frame: usize,
    pub min_allocation: u64,
    pub max_allocation: u64,
    pub slots_per_frame: usize,
}

/// Configuration for the frame loop
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub contexts: usize,
    /// Frames to run; `None` runs until cancelled
    pub frames: Option<u64>,
    /// Submitted frames the GPU may lag behind before the CPU waits
    pub frames_in_flight: u64,
    pub gpu_latency: Duration,
    pub page_size: u64,
    pub workload: WorkloadConfig,
}

/// Outcome of a run
#[derive(Debug, Clone, Default)]
pub struct SimReport {
    pub frames: u64,
    pub last_completed_fence: u64,
    pub bytes_allocated: u64,
    pub slots_allocated: u64,
    pub failed_allocations: u64,
}

struct RenderContext<D: Device> {
    id: usize,
    heap: DynamicHeap<D>,
    slots: Option<DynamicSlotAllocator<D>>,
    rng: StdRng,
    bytes_allocated: u64,
    slots_allocated: u64,
    failed_allocations: u64,
}

impl<D: Device> RenderContext<D> {
    fn run_frame(&mut self, fence_value: u64, workload: &WorkloadConfig) {
        for _ in 0..workload.allocations_per_frame {
            let size = self
                .rng
                .gen_range(workload.min_allocation..=workload.max_allocation);
            let alignment = 1u64 << self.rng.gen_range(0..=8u32);
            match self.heap.allocate_tagged(size, alignment, self.id as u64) {
                Some(allocation) => {
                    // SAFETY: the allocation belongs to the frame being recorded.
                    if let Some(bytes) = unsafe { allocation.as_mut_slice() } {
                        bytes.fill(self.id as u8);
                    }
                    self.bytes_allocated += size;
                }
                None => {
                    // Out of upload memory: drop the rest of this frame's work.
                    log::warn!(
                        "context {}: allocation of {} bytes failed, skipping rest of frame",
                        self.id,
                        size
                    );
                    self.failed_allocations += 1;
                    break;
                }
            }
        }

        if let Some(slots) = self.slots.as_mut() {
            for _ in 0..workload.slots_per_frame {
                if slots.allocate().is_none() {
                    self.failed_allocations += 1;
                    break;
                }
                self.slots_allocated += 1;
            }
            slots.finish_frame(fence_value);
        }

        self.heap.finish_frame(fence_value);
        log::trace!("context {}: finished frame at fence {}", self.id, fence_value);
    }
}

/// Runs the frame loop until the frame count is reached or `cancel` fires, then waits
/// for the simulated GPU to retire every submitted fence.
pub async fn run_simulation<D: Device>(
    page_pool: Arc<DynamicMemoryManager<D>>,
    slot_pool: Option<Arc<SlotPoolManager<D>>>,
    config: &SimConfig,
    cancel: CancellationToken,
) -> Result<SimReport> {
    let fences = Arc::new(FenceCounter::new());

    let (gpu_tx, mut gpu_rx) = mpsc::unbounded_channel::<u64>();
    let gpu = {
        let fences = fences.clone();
        let latency = config.gpu_latency;
        tokio::spawn(async move {
            while let Some(fence_value) = gpu_rx.recv().await {
                tokio::time::sleep(latency).await;
                fences.signal(fence_value);
            }
        })
    };

    let mut contexts: Vec<RenderContext<D>> = (0..config.contexts)
        .map(|id| RenderContext {
            id,
            heap: DynamicHeap::new(
                page_pool.clone(),
                DynamicHeapConfig {
                    name: format!("context {} dynamic heap", id),
                    page_size: config.page_size,
                },
            ),
            slots: slot_pool.as_ref().map(|pool| {
                DynamicSlotAllocator::new(pool.clone(), format!("context {} slots", id))
            }),
            rng: StdRng::seed_from_u64(id as u64),
            bytes_allocated: 0,
            slots_allocated: 0,
            failed_allocations: 0,
        })
        .collect();

    log::info!(
        "Running {} context(s), {} frame(s) in flight, GPU latency {:?}",
        config.contexts,
        config.frames_in_flight,
        config.gpu_latency
    );

    let mut frames = 0u64;
    'frames: while config.frames.is_none_or(|limit| frames < limit) {
        if cancel.is_cancelled() {
            log::info!("Cancellation requested, stopping after {} frame(s)", frames);
            break;
        }

        let fence_value = fences.next_fence_value();
        let workload = config.workload;
        let mut tasks = JoinSet::new();
        for mut context in contexts.drain(..) {
            tasks.spawn_blocking(move || {
                context.run_frame(fence_value, &workload);
                context
            });
        }
        while let Some(joined) = tasks.join_next().await {
            contexts.push(joined.context("Context worker panicked")?);
        }

        let submitted = fences.submit();
        debug_assert_eq!(submitted, fence_value);
        gpu_tx
            .send(submitted)
            .context("Simulated GPU stopped accepting work")?;
        frames += 1;

        let frames_in_flight = config.frames_in_flight.max(1);
        while fences.last_submitted() - fences.completed_fence_value() >= frames_in_flight {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Cancellation requested while waiting for the GPU");
                    break 'frames;
                }
                _ = tokio::time::sleep(Duration::from_millis(1)) => {}
            }
        }

        let completed = fences.completed_fence_value();
        page_pool.reclaim_stale(completed);
        if let Some(pool) = slot_pool.as_ref() {
            pool.reclaim_stale(completed);
        }

        if frames % 100 == 0 {
            let stats = page_pool.stats();
            log::info!(
                "frame {}: {} page(s) created, {} available, {} stale",
                frames,
                stats.chunks_created,
                stats.available_chunks,
                stats.stale_chunks
            );
        }
    }

    // Let the GPU drain everything that was submitted.
    drop(gpu_tx);
    gpu.await.context("Simulated GPU task failed")?;
    debug_assert!(fences.is_idle());

    let mut report = SimReport {
        frames,
        last_completed_fence: fences.completed_fence_value(),
        ..Default::default()
    };
    for context in contexts {
        report.bytes_allocated += context.bytes_allocated;
        report.slots_allocated += context.slots_allocated;
        report.failed_allocations += context.failed_allocations;
    }
    Ok(report)
}
