//! Per-context upload heap.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::chunk::{Chunk, ChunkId, DynamicPage, PageFactory};
use crate::config::DynamicHeapConfig;
use crate::device::{Device, GpuAddress};
use crate::linear::{LinearAllocator, LinearStats};
use crate::pool::{BestFitIndex, DynamicMemoryManager};
use crate::size::format_memory_size;

/// Range of an upload page handed out for the current frame.
///
/// The range stays valid until the producing heap's next
/// [`finish_frame`](DynamicHeap::finish_frame); after that the page may be reused by
/// another context once its fence completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicAllocation {
    pub chunk: ChunkId,
    pub offset: u64,
    pub size: u64,
    pub cpu_address: Option<NonNull<u8>>,
    pub gpu_address: GpuAddress,
    /// Frame of the producing heap this allocation belongs to.
    pub frame: u64,
    /// Caller-supplied tag, 0 if none.
    pub tag: u64,
}

impl DynamicAllocation {
    /// Copies `data` to the start of the allocation.
    ///
    /// # Safety
    ///
    /// The allocation must be from the producing heap's current frame and its pool must
    /// not have been destroyed.
    ///
    /// # Panics
    ///
    /// Panics if the page is not mapped or `data` is longer than the allocation.
    pub unsafe fn write(&self, data: &[u8]) {
        assert!(data.len() as u64 <= self.size, "write past end of allocation");
        let dst = self.cpu_address.expect("allocation is not CPU visible");
        // SAFETY: the range lies within the mapped page per the caller's contract.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len()) };
    }

    /// Mutable view of the allocation's bytes, if the page is mapped.
    ///
    /// # Safety
    ///
    /// Same contract as [`write`](Self::write); in addition the caller must not create
    /// overlapping views.
    pub unsafe fn as_mut_slice<'a>(&self) -> Option<&'a mut [u8]> {
        self.cpu_address
            .map(|ptr| unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize) })
    }
}

/// Per-context linear allocator for transient upload data.
///
/// Not thread-safe by contract: each context owns its heap. Every frame ends with
/// [`finish_frame`](Self::finish_frame), which hands the frame's pages back to the shared
/// [`DynamicMemoryManager`].
pub struct DynamicHeap<D: Device> {
    inner: LinearAllocator<PageFactory<D>, BestFitIndex<DynamicPage<D::Buffer>>>,
}

impl<D: Device> DynamicHeap<D> {
    pub fn new(manager: Arc<DynamicMemoryManager<D>>, config: DynamicHeapConfig) -> Self {
        Self {
            inner: LinearAllocator::new(manager, config.name, config.page_size),
        }
    }

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// Returns `None` when no page could be obtained; the caller should treat this as
    /// insufficient memory for the frame.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<DynamicAllocation> {
        self.allocate_tagged(size, alignment, 0)
    }

    /// Same as [`allocate`](Self::allocate) and records `tag` in the allocation.
    pub fn allocate_tagged(
        &mut self,
        size: u64,
        alignment: u64,
        tag: u64,
    ) -> Option<DynamicAllocation> {
        let frame = self.inner.stats().frames;
        let (page, offset) = self.inner.allocate(size, alignment)?;
        Some(DynamicAllocation {
            chunk: page.id(),
            offset,
            size,
            cpu_address: page.cpu_address(offset),
            gpu_address: page.gpu_address(offset),
            frame,
            tag,
        })
    }

    /// Releases this frame's pages to the pool, reusable once `fence_value` completes.
    pub fn finish_frame(&mut self, fence_value: u64) {
        self.inner.finish_frame(fence_value);
    }

    /// Index of the frame allocations are currently stamped with.
    pub fn frame(&self) -> u64 {
        self.inner.stats().frames
    }

    pub fn current_page(&self) -> Option<&DynamicPage<D::Buffer>> {
        self.inner.current_chunk()
    }

    /// Pages held since the last [`finish_frame`](Self::finish_frame).
    pub fn pages(&self) -> &[DynamicPage<D::Buffer>] {
        self.inner.chunks()
    }

    pub fn allocated_page_count(&self) -> usize {
        self.inner.chunks().len()
    }

    pub fn stats(&self) -> LinearStats {
        self.inner.stats()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn page_size(&self) -> u64 {
        self.inner.nominal_size()
    }

    pub fn manager(&self) -> &Arc<DynamicMemoryManager<D>> {
        self.inner.manager()
    }
}

impl<D: Device> Drop for DynamicHeap<D> {
    fn drop(&mut self) {
        let stats = self.inner.stats();
        log::info!(
            "{} usage stats: peak used/peak allocated size: {}/{}. Peak utilization: {:.1}%",
            self.inner.name(),
            format_memory_size(stats.peak_used, 2),
            format_memory_size(stats.peak_allocated, 2),
            stats.peak_utilization()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkManagerConfig;
    use crate::host::HostDevice;
    use crate::pool::ChunkManager;

    fn heap(page_size: u64) -> DynamicHeap<Arc<HostDevice>> {
        let device = Arc::new(HostDevice::new("host"));
        let manager = Arc::new(
            ChunkManager::for_pages(device, ChunkManagerConfig::default()).unwrap(),
        );
        DynamicHeap::new(
            manager,
            DynamicHeapConfig {
                name: "test heap".to_string(),
                page_size,
            },
        )
    }

    #[test]
    fn test_allocation_addresses_track_offset() {
        let mut heap = heap(4096);
        let a = heap.allocate(100, 16).unwrap();
        let b = heap.allocate(100, 256).unwrap();

        assert_eq!(a.chunk, b.chunk);
        assert_eq!(b.offset, 256);
        assert_eq!(b.gpu_address.0 - a.gpu_address.0, 256);
        let (pa, pb) = (a.cpu_address.unwrap(), b.cpu_address.unwrap());
        assert_eq!(pb.as_ptr() as usize - pa.as_ptr() as usize, 256);

        heap.finish_frame(1);
        heap.manager().destroy(1).unwrap();
    }

    #[test]
    fn test_writes_land_in_page_memory() {
        let mut heap = heap(1024);
        let alloc = heap.allocate(4, 4).unwrap();
        unsafe {
            alloc.write(&[1, 2, 3, 4]);
            assert_eq!(alloc.as_mut_slice().unwrap(), &[1, 2, 3, 4]);
        }

        let page = heap.current_page().unwrap();
        assert!(page.is_mapped());
        let mut readback = [0u8; 4];
        page.buffer().read(alloc.offset as usize, &mut readback).unwrap();
        assert_eq!(readback, [1, 2, 3, 4]);

        heap.finish_frame(1);
        heap.manager().destroy(1).unwrap();
    }

    #[test]
    fn test_allocations_are_stamped_with_frame_and_tag() {
        let mut heap = heap(1024);
        assert_eq!(heap.allocate(8, 8).unwrap().frame, 0);
        heap.finish_frame(1);

        let alloc = heap.allocate_tagged(8, 8, 42).unwrap();
        assert_eq!(alloc.frame, 1);
        assert_eq!(alloc.tag, 42);
        assert_eq!(heap.frame(), 1);

        heap.finish_frame(2);
        heap.manager().destroy(2).unwrap();
    }
}
