use std::convert::Infallible;
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{CL_DEVICE_TYPE_GPU, Device as ClDevice, get_device_ids};
use opencl3::memory::{Buffer, CL_MAP_WRITE, CL_MEM_ALLOC_HOST_PTR, CL_MEM_READ_ONLY, ClMem};
use opencl3::platform::get_platforms;
use opencl3::types::{CL_BLOCKING, cl_mem};

use crate::device::{Device, GpuAddress, SlotGroupSpec};
use crate::error::DeviceError;

/// Configuration for selecting the OpenCL device
#[derive(Debug, Clone, Default)]
pub struct OpenClDeviceConfig {
    /// Index of the GPU device on the platform
    pub device_index: usize,
    /// Index of the OpenCL platform
    pub platform_index: usize,
}

/// Upload buffer in host-accessible device memory, mapped for its whole lifetime.
pub struct OpenClBuffer {
    buffer: Buffer<u8>,
    mapped: *mut c_void,
    queue: Arc<CommandQueue>,
}

// SAFETY: the mapping is owned by the buffer; OpenCL objects are thread-safe.
unsafe impl Send for OpenClBuffer {}

impl OpenClBuffer {
    pub fn raw(&self) -> cl_mem {
        self.buffer.get()
    }
}

impl Drop for OpenClBuffer {
    fn drop(&mut self) {
        if self.mapped.is_null() {
            return;
        }
        // SAFETY: `mapped` was returned by enqueue_map_buffer for this buffer.
        let unmapped = unsafe {
            self.queue
                .enqueue_unmap_mem_object(self.buffer.get(), self.mapped, &[])
        };
        match unmapped.and_then(|_| self.queue.finish()) {
            Ok(_) => {}
            Err(e) => log::warn!("Failed to unmap OpenCL buffer: {}", e),
        }
    }
}

/// [`Device`] creating upload pages on an OpenCL GPU.
///
/// OpenCL has no descriptor-pool equivalent, so slot groups are unsupported. It also
/// exposes no device virtual addresses: the `cl_mem` handle stands in for the base
/// address of each page.
pub struct OpenClDevice {
    name: String,
    context: Context,
    queue: Arc<CommandQueue>,
    max_alloc_size: u64,
}

impl OpenClDevice {
    /// Initializes OpenCL and selects a GPU device.
    pub fn new(config: &OpenClDeviceConfig) -> Result<Self, DeviceError> {
        let backend = |what: &str| {
            let what = what.to_string();
            move |e: opencl3::error_codes::ClError| DeviceError::Backend(format!("{}: {}", what, e))
        };

        let platforms = get_platforms().map_err(backend("Failed to get OpenCL platforms"))?;
        let platform = platforms.get(config.platform_index).ok_or_else(|| {
            DeviceError::Backend(format!(
                "OpenCL platform index {} out of range ({} available)",
                config.platform_index,
                platforms.len()
            ))
        })?;

        let device_ids = get_device_ids(platform.id(), CL_DEVICE_TYPE_GPU)
            .map_err(backend("Failed to get GPU devices"))?;
        let device_id = *device_ids.get(config.device_index).ok_or_else(|| {
            DeviceError::Backend(format!(
                "GPU device index {} out of range ({} available)",
                config.device_index,
                device_ids.len()
            ))
        })?;
        let device = ClDevice::new(device_id);
        let name = device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string());
        let max_alloc_size = device
            .max_mem_alloc_size()
            .map_err(backend("Failed to query max allocation size"))?;

        let context =
            Context::from_device(&device).map_err(backend("Failed to create OpenCL context"))?;
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&context, 0)
            .map_err(backend("Failed to create command queue"))?;

        log::info!(
            "Using OpenCL device '{}' (max allocation {} MB)",
            name,
            max_alloc_size / (1024 * 1024)
        );

        Ok(Self {
            name,
            context,
            queue: Arc::new(queue),
            max_alloc_size,
        })
    }
}

impl Device for OpenClDevice {
    type Buffer = OpenClBuffer;
    type SlotGroup = Infallible;

    fn name(&self) -> &str {
        &self.name
    }

    fn create_buffer(&self, size: u64, name: &str) -> Result<Self::Buffer, DeviceError> {
        if size > self.max_alloc_size {
            return Err(DeviceError::OutOfMemory {
                requested: size,
                available: self.max_alloc_size,
            });
        }
        // SAFETY: no host pointer is passed; the runtime allocates the storage.
        let buffer = unsafe {
            Buffer::<u8>::create(
                &self.context,
                CL_MEM_READ_ONLY | CL_MEM_ALLOC_HOST_PTR,
                size as usize,
                ptr::null_mut(),
            )
        }
        .map_err(|e| DeviceError::Backend(format!("Failed to create buffer '{}': {}", name, e)))?;

        Ok(OpenClBuffer {
            buffer,
            mapped: ptr::null_mut(),
            queue: self.queue.clone(),
        })
    }

    fn map_for_cpu_access(
        &self,
        buffer: &mut Self::Buffer,
    ) -> Result<Option<NonNull<u8>>, DeviceError> {
        let size = buffer
            .buffer
            .size()
            .map_err(|e| DeviceError::Backend(format!("Failed to query buffer size: {}", e)))?;
        let mut mapped: cl_mem = ptr::null_mut();
        // SAFETY: blocking map of the whole buffer; the pointer stays valid until unmap.
        unsafe {
            self.queue.enqueue_map_buffer(
                &mut buffer.buffer,
                CL_BLOCKING,
                CL_MAP_WRITE,
                0,
                size,
                &mut mapped,
                &[],
            )
        }
        .map_err(|e| DeviceError::Backend(format!("Failed to map buffer: {}", e)))?;

        buffer.mapped = mapped;
        Ok(NonNull::new(mapped.cast::<u8>()))
    }

    fn gpu_address(&self, buffer: &Self::Buffer) -> GpuAddress {
        GpuAddress(buffer.raw() as u64)
    }

    fn create_slot_group(&self, _spec: &SlotGroupSpec) -> Result<Self::SlotGroup, DeviceError> {
        Err(DeviceError::Unsupported("slot groups on OpenCL devices"))
    }

    fn slot_group_handle(&self, group: &Self::SlotGroup) -> u64 {
        match *group {}
    }

    fn reset_slot_group(&self, group: &mut Self::SlotGroup) {
        match *group {}
    }
}
