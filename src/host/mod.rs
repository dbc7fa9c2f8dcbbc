//! System-memory device
//!
//! Emulates an upload heap in host memory: buffers are page-aligned allocations that are
//! permanently mapped, and device addresses are handed out from a fake address space.
//! An optional byte budget makes the device run out of memory on demand.

mod memory;

pub use memory::{HostBuffer, HostDevice, HostSlotGroup};
