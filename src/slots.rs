//! Slot allocators over the shared pool of slot groups.
//!
//! [`DynamicSlotAllocator`] is the per-context variant: it hands out slots sequentially
//! from its current group and releases whole groups at the end of the frame. Individual
//! slots cannot be released; the group is the unit of deferral.
//!
//! [`SharedSlotAllocator`] is shared between contexts and supports releasing single
//! slots. A released slot goes back to its group's free list once its fence completes.
//! Dropping a [`SharedSlot`] releases it at the next fence value of the allocator's
//! [`CompletionTracker`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk::{Chunk, ChunkId, SlotGroup, SlotGroupFactory};
use crate::device::Device;
use crate::error::{DeviceError, HeapError, HeapResult};
use crate::fence::CompletionTracker;
use crate::linear::{LinearAllocator, LinearStats};
use crate::pool::{FifoIndex, SlotPoolManager, StaleQueue};

/// Slot handed out by [`DynamicSlotAllocator`]. Valid until the next `finish_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub group: ChunkId,
    /// Raw device handle of the owning group.
    pub group_handle: u64,
    pub index: u32,
}

/// Per-context slot allocator.
pub struct DynamicSlotAllocator<D: Device> {
    inner: LinearAllocator<SlotGroupFactory<D>, FifoIndex<SlotGroup<D::SlotGroup>>>,
    peak_group_count: usize,
}

impl<D: Device> DynamicSlotAllocator<D> {
    pub fn new(manager: Arc<SlotPoolManager<D>>, name: impl Into<String>) -> Self {
        let slots_per_group = u64::from(manager.slots_per_group());
        Self {
            inner: LinearAllocator::new(manager, name, slots_per_group),
            peak_group_count: 0,
        }
    }

    /// Takes the next slot, requesting a new group when the current one is exhausted.
    /// Returns `None` if no group could be obtained.
    pub fn allocate(&mut self) -> Option<Slot> {
        let (group, index) = self.inner.allocate(1, 1)?;
        let slot = Slot {
            group: group.id(),
            group_handle: group.handle(),
            index: index as u32,
        };
        self.peak_group_count = self.peak_group_count.max(self.inner.chunks().len());
        Some(slot)
    }

    /// Releases every group used this frame, reusable once `fence_value` completes.
    pub fn finish_frame(&mut self, fence_value: u64) {
        self.inner.finish_frame(fence_value);
    }

    pub fn allocated_group_count(&self) -> usize {
        self.inner.chunks().len()
    }

    pub fn peak_group_count(&self) -> usize {
        self.peak_group_count
    }

    pub fn stats(&self) -> LinearStats {
        self.inner.stats()
    }

    pub fn manager(&self) -> &Arc<SlotPoolManager<D>> {
        self.inner.manager()
    }
}

impl<D: Device> Drop for DynamicSlotAllocator<D> {
    fn drop(&mut self) {
        log::info!(
            "{} usage stats: peak group count: {}, peak slots used: {}",
            self.inner.name(),
            self.peak_group_count,
            self.inner.stats().peak_used
        );
    }
}

/// Fence-ordered queue of released slots, shared by an allocator and its live slots.
struct SlotReleaser {
    name: String,
    tracker: Arc<dyn CompletionTracker>,
    released: Mutex<StaleQueue<(ChunkId, u32)>>,
}

impl SlotReleaser {
    fn push(&self, group: ChunkId, index: u32, fence_value: u64) {
        if !self.released.lock().push((group, index), fence_value) {
            log::debug!(
                "{}: slot {}:{} released out of fence order",
                self.name,
                group,
                index
            );
        }
    }
}

/// Slot handed out by [`SharedSlotAllocator`].
///
/// Not `Clone`: releasing consumes the slot, so it cannot be released twice. A slot
/// dropped without [`SharedSlotAllocator::release`] is released at the tracker's next
/// fence value, since work recorded so far may still reference it.
#[must_use = "dropping a slot releases it at the next fence value"]
pub struct SharedSlot {
    group: ChunkId,
    group_handle: u64,
    index: u32,
    releaser: Option<Arc<SlotReleaser>>,
}

impl SharedSlot {
    pub fn group(&self) -> ChunkId {
        self.group
    }

    /// Raw device handle of the owning group.
    pub fn group_handle(&self) -> u64 {
        self.group_handle
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for SharedSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSlot")
            .field("group", &self.group)
            .field("group_handle", &self.group_handle)
            .field("index", &self.index)
            .finish()
    }
}

impl Drop for SharedSlot {
    fn drop(&mut self) {
        if let Some(releaser) = self.releaser.take() {
            let fence_value = releaser.tracker.next_fence_value();
            releaser.push(self.group, self.index, fence_value);
        }
    }
}

struct SharedGroup<G> {
    group: SlotGroup<G>,
    free: Vec<u32>,
    next: u32,
}

impl<G> SharedGroup<G> {
    fn take(&mut self) -> Option<u32> {
        match self.free.pop() {
            Some(index) => Some(index),
            None if self.next < self.group.capacity() => {
                self.next += 1;
                Some(self.next - 1)
            }
            None => None,
        }
    }
}

struct SharedState<G> {
    groups: Vec<SharedGroup<G>>,
    live: usize,
}

/// Thread-safe slot allocator supporting release of individual slots.
pub struct SharedSlotAllocator<D: Device> {
    manager: Arc<SlotPoolManager<D>>,
    releaser: Arc<SlotReleaser>,
    state: Mutex<SharedState<D::SlotGroup>>,
}

impl<D: Device> SharedSlotAllocator<D> {
    /// `tracker` supplies the fence value for slots that are dropped instead of released.
    pub fn new(
        manager: Arc<SlotPoolManager<D>>,
        name: impl Into<String>,
        tracker: Arc<dyn CompletionTracker>,
    ) -> Self {
        Self {
            manager,
            releaser: Arc::new(SlotReleaser {
                name: name.into(),
                tracker,
                released: Mutex::new(StaleQueue::default()),
            }),
            state: Mutex::new(SharedState {
                groups: Vec::new(),
                live: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.releaser.name
    }

    fn slot(&self, group: &SlotGroup<D::SlotGroup>, index: u32) -> SharedSlot {
        SharedSlot {
            group: group.id(),
            group_handle: group.handle(),
            index,
            releaser: Some(self.releaser.clone()),
        }
    }

    /// Takes a free slot from any owned group, or from a new group if all are full.
    pub fn allocate(&self) -> HeapResult<SharedSlot> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for shared in state.groups.iter_mut() {
            if let Some(index) = shared.take() {
                state.live += 1;
                return Ok(self.slot(&shared.group, index));
            }
        }

        let group = self
            .manager
            .allocate_chunk(u64::from(self.manager.slots_per_group()))?;
        log::debug!("{}: acquired slot group {}", self.name(), group.id());
        let mut shared = SharedGroup {
            group,
            free: Vec::new(),
            next: 0,
        };
        let Some(index) = shared.take() else {
            let capacity = shared.group.capacity();
            self.manager.return_chunks([shared.group]);
            return Err(HeapError::DeviceResourceCreationFailure {
                kind: "slot group",
                size: u64::from(capacity),
                source: DeviceError::Backend("slot group has no slots".to_string()),
            });
        };
        let slot = self.slot(&shared.group, index);
        state.groups.push(shared);
        state.live += 1;
        Ok(slot)
    }

    /// Releases `slot` once `fence_value` has completed.
    pub fn release(&self, mut slot: SharedSlot, fence_value: u64) {
        let Some(releaser) = slot.releaser.take() else {
            return;
        };
        if !Arc::ptr_eq(&releaser, &self.releaser) {
            log::error!(
                "{}: slot {}:{} belongs to allocator '{}'",
                self.name(),
                slot.group,
                slot.index,
                releaser.name
            );
        }
        releaser.push(slot.group, slot.index, fence_value);
    }

    /// Returns slots whose fence is at most `completed_fence_value` to their group.
    pub fn release_stale(&self, completed_fence_value: u64) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut released = self.releaser.released.lock();
        let mut freed = 0;
        while let Some((group_id, index)) = released.pop_ready(completed_fence_value) {
            let Some(shared) = state.groups.iter_mut().find(|g| g.group.id() == group_id) else {
                log::error!("{}: released slot of unknown group {}", self.name(), group_id);
                continue;
            };
            debug_assert!(!shared.free.contains(&index), "slot released twice");
            shared.free.push(index);
            state.live = state.live.saturating_sub(1);
            freed += 1;
        }
        freed
    }

    /// Slots handed out and not yet returned to their group.
    pub fn live_slots(&self) -> usize {
        self.state.lock().live
    }

    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    /// Gives every group back to the pool once all slots have been released and their
    /// fences have completed.
    pub fn destroy(&self, last_completed_fence_value: u64) -> HeapResult<()> {
        self.release_stale(last_completed_fence_value);
        let groups = {
            let mut state = self.state.lock();
            if state.live > 0 {
                log::error!(
                    "{}: {} slot(s) still allocated or awaiting their fence",
                    self.name(),
                    state.live
                );
                return Err(HeapError::ChunksOutstanding { count: state.live });
            }
            std::mem::take(&mut state.groups)
        };
        log::info!("{}: returning {} slot group(s)", self.name(), groups.len());
        self.manager
            .return_chunks(groups.into_iter().map(|shared| shared.group));
        Ok(())
    }
}

impl<D: Device> Drop for SharedSlotAllocator<D> {
    fn drop(&mut self) {
        let groups = self.state.get_mut().groups.len();
        if groups > 0 {
            log::error!(
                "{}: {} slot group(s) not returned; call destroy() before dropping",
                self.name(),
                groups
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkManagerConfig;
    use crate::device::SlotGroupSpec;
    use crate::fence::FenceCounter;
    use crate::host::HostDevice;
    use crate::pool::ChunkManager;

    fn slot_pool(slots: u32) -> Arc<SlotPoolManager<Arc<HostDevice>>> {
        let spec = SlotGroupSpec {
            name: "test sets".to_string(),
            slots_per_group: slots,
        };
        let config = ChunkManagerConfig {
            name: "slot pool".to_string(),
            ..Default::default()
        };
        let device = Arc::new(HostDevice::new("host"));
        Arc::new(ChunkManager::for_slot_groups(device, spec, config).unwrap())
    }

    #[test]
    fn test_slots_are_sequential_within_group() {
        let manager = slot_pool(4);
        let mut slots = DynamicSlotAllocator::new(manager.clone(), "ctx slots");

        let taken: Vec<Slot> = (0..6).map(|_| slots.allocate().unwrap()).collect();
        let indices: Vec<u32> = taken.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 0, 1]);
        assert_eq!(taken[0].group, taken[3].group);
        assert_ne!(taken[3].group, taken[4].group);
        assert_eq!(slots.allocated_group_count(), 2);
        assert_eq!(slots.peak_group_count(), 2);

        slots.finish_frame(1);
        assert_eq!(slots.allocated_group_count(), 0);
        assert_eq!(manager.stats().stale_chunks, 2);
        manager.destroy(1).unwrap();
    }

    #[test]
    fn test_groups_recycle_after_fence() {
        let manager = slot_pool(2);
        let mut slots = DynamicSlotAllocator::new(manager.clone(), "ctx slots");

        let first = slots.allocate().unwrap();
        slots.finish_frame(1);

        let second = slots.allocate().unwrap();
        assert_ne!(first.group, second.group);
        slots.finish_frame(2);

        manager.reclaim_stale(1);
        let third = slots.allocate().unwrap();
        assert_eq!(third.group, first.group);
        assert_eq!(third.index, 0);
        slots.finish_frame(3);

        assert_eq!(manager.stats().chunks_created, 2);
        manager.destroy(3).unwrap();
    }

    #[test]
    fn test_shared_slots_return_after_fence() {
        let manager = slot_pool(2);
        let fences = Arc::new(FenceCounter::new());
        let shared = SharedSlotAllocator::new(manager.clone(), "shared slots", fences);

        let a = shared.allocate().unwrap();
        let b = shared.allocate().unwrap();
        assert_eq!(a.group(), b.group());
        assert_eq!(shared.live_slots(), 2);

        let (a_group, a_index) = (a.group(), a.index());
        shared.release(a, 5);
        assert_eq!(shared.release_stale(4), 0);

        let c = shared.allocate().unwrap();
        assert_ne!(c.group(), a_group);
        assert_eq!(shared.group_count(), 2);

        assert_eq!(shared.release_stale(5), 1);
        let d = shared.allocate().unwrap();
        assert_eq!((d.group(), d.index()), (a_group, a_index));

        assert!(shared.destroy(5).is_err());
        for slot in [b, c, d] {
            shared.release(slot, 6);
        }
        shared.destroy(6).unwrap();
        assert_eq!(shared.group_count(), 0);
        manager.destroy(6).unwrap();
    }

    #[test]
    fn test_dropped_shared_slot_is_released_at_next_fence() {
        let manager = slot_pool(4);
        let fences = Arc::new(FenceCounter::new());
        let shared = SharedSlotAllocator::new(manager.clone(), "shared slots", fences.clone());

        let slot = shared.allocate().unwrap();
        let (group, index) = (slot.group(), slot.index());
        assert_eq!(fences.submit(), 1);
        drop(slot);

        // Work recorded before the drop signals fence 2 at the earliest.
        assert_eq!(shared.release_stale(1), 0);
        assert_eq!(shared.live_slots(), 1);
        assert!(shared.destroy(1).is_err());

        fences.signal(fences.submit());
        assert_eq!(shared.release_stale(fences.completed_fence_value()), 1);
        assert_eq!(shared.live_slots(), 0);

        let again = shared.allocate().unwrap();
        assert_eq!((again.group(), again.index()), (group, index));
        shared.release(again, 3);

        shared.destroy(3).unwrap();
        manager.destroy(3).unwrap();
    }

    #[test]
    fn test_slot_released_through_other_allocator_returns_home() {
        let manager = slot_pool(4);
        let fences: Arc<FenceCounter> = Arc::new(FenceCounter::new());
        let first = SharedSlotAllocator::new(manager.clone(), "first", fences.clone());
        let second = SharedSlotAllocator::new(manager.clone(), "second", fences);

        let slot = first.allocate().unwrap();
        second.release(slot, 1);
        assert_eq!(second.release_stale(1), 0);
        assert_eq!(first.release_stale(1), 1);

        first.destroy(1).unwrap();
        second.destroy(1).unwrap();
        manager.destroy(1).unwrap();
    }
}
