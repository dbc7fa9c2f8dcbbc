//! Leaf resources recycled by the shared pool.
//!
//! A chunk is either a mapped upload page ([`DynamicPage`]) or a fixed-capacity handle
//! group ([`SlotGroup`]). Chunks are move-only: one live value owns exactly one device
//! resource, and the resource is released when the value is dropped.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::{Device, GpuAddress, SlotGroupSpec};
use crate::error::{DeviceError, HeapError, HeapResult};
use crate::size::format_memory_size;

/// Identity of a chunk, stable across recycling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A resource the pool can hand out, take back and reuse.
pub trait Chunk: Send + 'static {
    fn id(&self) -> ChunkId;

    /// Capacity in the chunk's own unit (bytes for pages, slots for groups).
    fn size(&self) -> u64;
}

/// Creates chunks of one kind and prepares them for reuse.
pub trait ChunkFactory: Send + Sync + 'static {
    type Chunk: Chunk;

    /// Short description used in logs and errors.
    fn kind(&self) -> &'static str;

    /// Creates a chunk whose size is at least `size`.
    fn create_chunk(&self, size: u64) -> HeapResult<Self::Chunk>;

    /// Called when a chunk leaves the deferred queue, before it becomes available again.
    fn recycle(&self, _chunk: &mut Self::Chunk) {}
}

/// Mapped upload buffer carved up by [`DynamicHeap`](crate::heap::DynamicHeap).
pub struct DynamicPage<B> {
    id: ChunkId,
    buffer: B,
    size: u64,
    gpu_address: GpuAddress,
    cpu_address: Option<NonNull<u8>>,
}

// SAFETY: the mapped pointer is owned by the page and only dereferenced by the single
// context that currently holds it.
unsafe impl<B: Send> Send for DynamicPage<B> {}

impl<B> DynamicPage<B> {
    /// Creates and maps a buffer of `size` bytes.
    pub fn new<D>(device: &D, id: ChunkId, size: u64, name: &str) -> HeapResult<Self>
    where
        D: Device<Buffer = B>,
    {
        let creation_failure = |source: DeviceError| HeapError::DeviceResourceCreationFailure {
            kind: "dynamic page",
            size,
            source,
        };

        let mut buffer = device.create_buffer(size, name).map_err(creation_failure)?;
        let cpu_address = device
            .map_for_cpu_access(&mut buffer)
            .map_err(creation_failure)?;
        let gpu_address = device.gpu_address(&buffer);

        log::info!(
            "Created dynamic memory page {}. Size: {}; GPU virtual address 0x{:x}",
            id,
            format_memory_size(size, 2),
            gpu_address.0
        );

        Ok(Self {
            id,
            buffer,
            size,
            gpu_address,
            cpu_address,
        })
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn gpu_address(&self, offset: u64) -> GpuAddress {
        self.gpu_address.offset(offset)
    }

    /// CPU pointer `offset` bytes into the page, if the page is mapped.
    pub fn cpu_address(&self, offset: u64) -> Option<NonNull<u8>> {
        debug_assert!(offset <= self.size);
        // SAFETY: offset stays within the mapped range of `size` bytes.
        self.cpu_address
            .map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) })
    }

    pub fn is_mapped(&self) -> bool {
        self.cpu_address.is_some()
    }
}

impl<B> Chunk for DynamicPage<B>
where
    B: Send + 'static,
{
    fn id(&self) -> ChunkId {
        self.id
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl<B> fmt::Debug for DynamicPage<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicPage")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("gpu_address", &self.gpu_address)
            .field("mapped", &self.cpu_address.is_some())
            .finish()
    }
}

/// Creates [`DynamicPage`]s on a device.
pub struct PageFactory<D> {
    device: D,
    name: String,
    next_id: AtomicU64,
}

impl<D: Device> PageFactory<D> {
    pub fn new(device: D, name: impl Into<String>) -> Self {
        Self {
            device,
            name: name.into(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: Device> ChunkFactory for PageFactory<D> {
    type Chunk = DynamicPage<D::Buffer>;

    fn kind(&self) -> &'static str {
        "dynamic page"
    }

    fn create_chunk(&self, size: u64) -> HeapResult<Self::Chunk> {
        let id = ChunkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        DynamicPage::new(&self.device, id, size, &self.name)
    }
}

/// Group of interchangeable slots handed out by the slot allocators.
pub struct SlotGroup<G> {
    id: ChunkId,
    group: G,
    handle: u64,
    capacity: u32,
}

impl<G> SlotGroup<G> {
    pub fn group(&self) -> &G {
        &self.group
    }

    /// Raw device handle of the group.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl<G> Chunk for SlotGroup<G>
where
    G: Send + 'static,
{
    fn id(&self) -> ChunkId {
        self.id
    }

    fn size(&self) -> u64 {
        u64::from(self.capacity)
    }
}

impl<G> fmt::Debug for SlotGroup<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGroup")
            .field("id", &self.id)
            .field("handle", &format_args!("0x{:x}", self.handle))
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Creates uniform [`SlotGroup`]s from a [`SlotGroupSpec`].
pub struct SlotGroupFactory<D> {
    device: D,
    spec: SlotGroupSpec,
    next_id: AtomicU64,
}

impl<D: Device> SlotGroupFactory<D> {
    pub fn new(device: D, spec: SlotGroupSpec) -> Self {
        Self {
            device,
            spec,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn spec(&self) -> &SlotGroupSpec {
        &self.spec
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: Device> ChunkFactory for SlotGroupFactory<D> {
    type Chunk = SlotGroup<D::SlotGroup>;

    fn kind(&self) -> &'static str {
        "slot group"
    }

    fn create_chunk(&self, size: u64) -> HeapResult<Self::Chunk> {
        let capacity = self.spec.slots_per_group;
        if size > u64::from(capacity) {
            return Err(HeapError::DeviceResourceCreationFailure {
                kind: self.kind(),
                size,
                source: DeviceError::Backend(format!(
                    "'{}' groups hold {} slots",
                    self.spec.name, capacity
                )),
            });
        }

        let group = self.device.create_slot_group(&self.spec).map_err(|source| {
            HeapError::DeviceResourceCreationFailure {
                kind: self.kind(),
                size,
                source,
            }
        })?;
        let handle = self.device.slot_group_handle(&group);
        let id = ChunkId(self.next_id.fetch_add(1, Ordering::Relaxed));

        log::info!(
            "Created slot group '{}' {} with {} slots",
            self.spec.name,
            id,
            capacity
        );

        Ok(SlotGroup {
            id,
            group,
            handle,
            capacity,
        })
    }

    fn recycle(&self, chunk: &mut Self::Chunk) {
        self.device.reset_slot_group(&mut chunk.group);
    }
}
