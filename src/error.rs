//! Error types shared by the pool, the per-context allocators and the devices.

use thiserror::Error;

/// Failure reported by a [`Device`](crate::device::Device) capability.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device has no room left for a resource of the requested size.
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    /// The device cannot create this kind of resource at all.
    #[error("unsupported by device: {0}")]
    Unsupported(&'static str),

    /// The backend API returned an error.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by [`ChunkManager`](crate::pool::ChunkManager) and its callers.
#[derive(Debug, Error)]
pub enum HeapError {
    /// The device refused to create a chunk. Never retried internally.
    #[error("failed to create {kind} of size {size}: {source}")]
    DeviceResourceCreationFailure {
        kind: &'static str,
        size: u64,
        #[source]
        source: DeviceError,
    },

    /// Teardown found chunks whose fence has not completed yet.
    #[error(
        "{count} stale chunk(s) are still in use by the GPU; \
         idle the device before destroying the pool"
    )]
    StaleChunksInFlight { count: usize },

    /// Teardown found chunks still owned by a per-context allocator.
    #[error(
        "{count} chunk(s) are still held by per-context allocators; \
         call finish_frame before destroying the pool"
    )]
    ChunksOutstanding { count: usize },

    /// The pool was already destroyed.
    #[error("pool '{0}' has been destroyed")]
    PoolDestroyed(String),
}

impl HeapError {
    /// True for programmer errors that must not be handled at runtime.
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            HeapError::StaleChunksInFlight { .. }
                | HeapError::ChunksOutstanding { .. }
                | HeapError::PoolDestroyed(_)
        )
    }
}

pub type HeapResult<T> = Result<T, HeapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_failure_is_not_a_precondition_violation() {
        let err = HeapError::DeviceResourceCreationFailure {
            kind: "dynamic page",
            size: 4096,
            source: DeviceError::OutOfMemory {
                requested: 4096,
                available: 0,
            },
        };
        assert!(!err.is_precondition_violation());
        assert!(err.to_string().contains("dynamic page"));
        assert!(HeapError::ChunksOutstanding { count: 1 }.is_precondition_violation());
    }
}
