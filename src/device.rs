use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::DeviceError;

/// Device virtual address of a byte in a GPU buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GpuAddress(pub u64);

impl GpuAddress {
    pub const NULL: GpuAddress = GpuAddress(0);

    pub fn offset(self, bytes: u64) -> GpuAddress {
        GpuAddress(self.0 + bytes)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Shape of a fixed-capacity handle group (a descriptor pool, for example).
#[derive(Debug, Clone)]
pub struct SlotGroupSpec {
    /// Debug name given to every group created from this spec.
    pub name: String,
    /// Number of slots each group can hand out.
    pub slots_per_group: u32,
}

impl Default for SlotGroupSpec {
    fn default() -> Self {
        Self {
            name: "dynamic slot group".to_string(),
            slots_per_group: 1024,
        }
    }
}

/// Resource creation capability the pools draw their chunks from.
pub trait Device: Send + Sync + 'static {
    /// Byte-addressable buffer resource.
    type Buffer: Send + 'static;
    /// Fixed-capacity handle group resource.
    type SlotGroup: Send + 'static;

    fn name(&self) -> &str;

    /// Creates an upload buffer of at least `size` bytes.
    fn create_buffer(&self, size: u64, name: &str) -> Result<Self::Buffer, DeviceError>;

    /// Maps `buffer` for CPU writes. `None` means the buffer is not host visible.
    fn map_for_cpu_access(
        &self,
        buffer: &mut Self::Buffer,
    ) -> Result<Option<NonNull<u8>>, DeviceError>;

    /// Base device address of `buffer`.
    fn gpu_address(&self, buffer: &Self::Buffer) -> GpuAddress;

    /// Creates a group of `spec.slots_per_group` slots.
    fn create_slot_group(&self, spec: &SlotGroupSpec) -> Result<Self::SlotGroup, DeviceError>;

    /// Raw handle used by callers to refer to the group in GPU commands.
    fn slot_group_handle(&self, group: &Self::SlotGroup) -> u64;

    /// Returns every slot of `group` to the unused state.
    fn reset_slot_group(&self, group: &mut Self::SlotGroup);
}

impl<T> Device for Arc<T>
where
    T: Device,
{
    type Buffer = T::Buffer;
    type SlotGroup = T::SlotGroup;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn create_buffer(&self, size: u64, name: &str) -> Result<Self::Buffer, DeviceError> {
        (**self).create_buffer(size, name)
    }

    fn map_for_cpu_access(
        &self,
        buffer: &mut Self::Buffer,
    ) -> Result<Option<NonNull<u8>>, DeviceError> {
        (**self).map_for_cpu_access(buffer)
    }

    fn gpu_address(&self, buffer: &Self::Buffer) -> GpuAddress {
        (**self).gpu_address(buffer)
    }

    fn create_slot_group(&self, spec: &SlotGroupSpec) -> Result<Self::SlotGroup, DeviceError> {
        (**self).create_slot_group(spec)
    }

    fn slot_group_handle(&self, group: &Self::SlotGroup) -> u64 {
        (**self).slot_group_handle(group)
    }

    fn reset_slot_group(&self, group: &mut Self::SlotGroup) {
        (**self).reset_slot_group(group)
    }
}
