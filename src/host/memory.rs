use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::device::{Device, GpuAddress, SlotGroupSpec};
use crate::error::DeviceError;
use crate::size::align_up;

/// Alignment of host buffers and of their fake device addresses.
const HOST_PAGE_ALIGNMENT: u64 = 64 * 1024;
/// Start of the fake device address space, so that no buffer sits at address 0.
const GPU_ADDRESS_BASE: u64 = 0x1_0000_0000;

/// Buffer allocated by [`HostDevice`].
#[derive(Debug)]
pub struct HostBuffer {
    data: NonNull<u8>,
    layout: Layout,
    gpu_address: GpuAddress,
    accounting: Arc<AtomicU64>,
}

// SAFETY: the allocation is exclusively owned by the buffer.
unsafe impl Send for HostBuffer {}

impl HostBuffer {
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Copies the buffer contents out, as the GPU would see them.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), DeviceError> {
        if offset + dst.len() > self.len() {
            return Err(DeviceError::Backend(format!(
                "read of {} bytes at {} past end of {} byte buffer",
                dst.len(),
                offset,
                self.len()
            )));
        }
        // SAFETY: range checked above; the allocation lives as long as `self`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data.as_ptr().add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        self.accounting
            .fetch_sub(self.layout.size() as u64, Ordering::AcqRel);
        // SAFETY: allocated in `HostDevice::create_buffer` with this layout.
        unsafe { dealloc(self.data.as_ptr(), self.layout) };
    }
}

/// Group of slots created by [`HostDevice`]. Slots are plain indices.
#[derive(Debug)]
pub struct HostSlotGroup {
    handle: u64,
    slots: u32,
    resets: u32,
}

impl HostSlotGroup {
    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Number of times the group was reset for reuse.
    pub fn resets(&self) -> u32 {
        self.resets
    }
}

/// [`Device`] backed by system memory.
#[derive(Debug)]
pub struct HostDevice {
    name: String,
    budget: Option<u64>,
    allocated: Arc<AtomicU64>,
    next_address: AtomicU64,
    next_group: AtomicU64,
    buffers_created: AtomicU64,
    group_resets: AtomicU32,
}

impl HostDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            budget: None,
            allocated: Arc::new(AtomicU64::new(0)),
            next_address: AtomicU64::new(GPU_ADDRESS_BASE),
            next_group: AtomicU64::new(1),
            buffers_created: AtomicU64::new(0),
            group_resets: AtomicU32::new(0),
        }
    }

    /// Device that refuses buffers once `bytes` are live.
    pub fn with_budget(name: impl Into<String>, bytes: u64) -> Self {
        Self {
            budget: Some(bytes),
            ..Self::new(name)
        }
    }

    /// Bytes held by live buffers.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn buffers_created(&self) -> u64 {
        self.buffers_created.load(Ordering::Acquire)
    }

    pub fn slot_groups_created(&self) -> u64 {
        self.next_group.load(Ordering::Acquire) - 1
    }

    pub fn group_resets(&self) -> u32 {
        self.group_resets.load(Ordering::Acquire)
    }

    fn reserve(&self, size: u64) -> Result<(), DeviceError> {
        let Some(budget) = self.budget else {
            self.allocated.fetch_add(size, Ordering::AcqRel);
            return Ok(());
        };
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(size).filter(|total| *total <= budget)
            })
            .map(|_| ())
            .map_err(|current| DeviceError::OutOfMemory {
                requested: size,
                available: budget.saturating_sub(current),
            })
    }
}

impl Device for HostDevice {
    type Buffer = HostBuffer;
    type SlotGroup = HostSlotGroup;

    fn name(&self) -> &str {
        &self.name
    }

    fn create_buffer(&self, size: u64, name: &str) -> Result<Self::Buffer, DeviceError> {
        if size == 0 {
            return Err(DeviceError::Backend(format!(
                "cannot create zero-sized buffer '{}'",
                name
            )));
        }
        let layout = Layout::from_size_align(size as usize, HOST_PAGE_ALIGNMENT as usize)
            .map_err(|e| DeviceError::Backend(format!("invalid layout for '{}': {}", name, e)))?;

        self.reserve(size)?;
        // SAFETY: layout has a non-zero size.
        let Some(data) = NonNull::new(unsafe { alloc_zeroed(layout) }) else {
            self.allocated.fetch_sub(size, Ordering::AcqRel);
            return Err(DeviceError::OutOfMemory {
                requested: size,
                available: 0,
            });
        };

        let gpu_address = GpuAddress(
            self.next_address
                .fetch_add(align_up(size, HOST_PAGE_ALIGNMENT), Ordering::Relaxed),
        );
        self.buffers_created.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "{}: created buffer '{}' of {} bytes at 0x{:x}",
            self.name,
            name,
            size,
            gpu_address.0
        );

        Ok(HostBuffer {
            data,
            layout,
            gpu_address,
            accounting: self.allocated.clone(),
        })
    }

    fn map_for_cpu_access(
        &self,
        buffer: &mut Self::Buffer,
    ) -> Result<Option<NonNull<u8>>, DeviceError> {
        Ok(Some(buffer.data))
    }

    fn gpu_address(&self, buffer: &Self::Buffer) -> GpuAddress {
        buffer.gpu_address
    }

    fn create_slot_group(&self, spec: &SlotGroupSpec) -> Result<Self::SlotGroup, DeviceError> {
        if spec.slots_per_group == 0 {
            return Err(DeviceError::Backend(format!(
                "slot group '{}' must hold at least one slot",
                spec.name
            )));
        }
        Ok(HostSlotGroup {
            handle: self.next_group.fetch_add(1, Ordering::Relaxed),
            slots: spec.slots_per_group,
            resets: 0,
        })
    }

    fn slot_group_handle(&self, group: &Self::SlotGroup) -> u64 {
        group.handle
    }

    fn reset_slot_group(&self, group: &mut Self::SlotGroup) {
        group.resets += 1;
        self.group_resets.fetch_add(1, Ordering::Relaxed);
    }
}
