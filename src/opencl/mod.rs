//! OpenCL module for GPU upload pages
//!
//! This module creates dynamic pages on a GPU via OpenCL: device selection, buffer
//! allocation in host-accessible memory, and mapping for CPU writes.

mod memory;

pub use memory::{OpenClBuffer, OpenClDevice, OpenClDeviceConfig};
