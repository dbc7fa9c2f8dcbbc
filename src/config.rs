//! Configuration for the shared pools and the per-context allocators.

/// Shared pool settings.
#[derive(Debug, Clone)]
pub struct ChunkManagerConfig {
    /// Name used in log output.
    pub name: String,
    /// Chunks created up front at construction.
    pub reserve_chunks: usize,
    /// Size of each reserved chunk.
    pub reserve_size: u64,
    /// Deferred-queue depth above which a warning is logged. `None` disables it.
    pub stale_warning_threshold: Option<usize>,
}

impl Default for ChunkManagerConfig {
    fn default() -> Self {
        Self {
            name: "dynamic memory manager".to_string(),
            reserve_chunks: 0,
            reserve_size: 64 * 1024,
            stale_warning_threshold: Some(1024),
        }
    }
}

/// Per-context upload heap settings.
#[derive(Debug, Clone)]
pub struct DynamicHeapConfig {
    /// Name used in log output.
    pub name: String,
    /// Nominal page size. Larger requests grow it by powers of two.
    pub page_size: u64,
}

impl Default for DynamicHeapConfig {
    fn default() -> Self {
        Self {
            name: "dynamic heap".to_string(),
            page_size: 64 * 1024,
        }
    }
}
