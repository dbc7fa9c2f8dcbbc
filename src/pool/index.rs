use std::collections::{BTreeMap, VecDeque};

use crate::chunk::{Chunk, ChunkId};

/// Set of chunks ready for reuse.
pub trait ChunkIndex<C: Chunk>: Default + Send + 'static {
    fn insert(&mut self, chunk: C);

    /// Removes a chunk whose size is at least `min_size`.
    fn take(&mut self, min_size: u64) -> Option<C>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the sizes of all indexed chunks.
    fn total_size(&self) -> u64;

    fn contains(&self, id: ChunkId) -> bool;

    /// Removes every chunk.
    fn drain(&mut self) -> Vec<C>;
}

/// Size-ordered index returning the smallest chunk that fits.
///
/// Chunks of equal size are reused oldest first.
pub struct BestFitIndex<C> {
    by_size: BTreeMap<u64, VecDeque<C>>,
    len: usize,
    total_size: u64,
}

impl<C> Default for BestFitIndex<C> {
    fn default() -> Self {
        Self {
            by_size: BTreeMap::new(),
            len: 0,
            total_size: 0,
        }
    }
}

impl<C: Chunk> ChunkIndex<C> for BestFitIndex<C> {
    fn insert(&mut self, chunk: C) {
        let size = chunk.size();
        self.by_size.entry(size).or_default().push_back(chunk);
        self.len += 1;
        self.total_size += size;
    }

    fn take(&mut self, min_size: u64) -> Option<C> {
        let size = *self.by_size.range(min_size..).next()?.0;
        let bucket = self.by_size.get_mut(&size)?;
        let chunk = bucket.pop_front()?;
        if bucket.is_empty() {
            self.by_size.remove(&size);
        }
        self.len -= 1;
        self.total_size -= size;
        Some(chunk)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn total_size(&self) -> u64 {
        self.total_size
    }

    fn contains(&self, id: ChunkId) -> bool {
        self.by_size.values().flatten().any(|c| c.id() == id)
    }

    fn drain(&mut self) -> Vec<C> {
        self.len = 0;
        self.total_size = 0;
        std::mem::take(&mut self.by_size)
            .into_values()
            .flatten()
            .collect()
    }
}

/// Release-ordered queue for chunks of uniform size.
pub struct FifoIndex<C> {
    queue: VecDeque<C>,
    total_size: u64,
}

impl<C> Default for FifoIndex<C> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            total_size: 0,
        }
    }
}

impl<C: Chunk> ChunkIndex<C> for FifoIndex<C> {
    fn insert(&mut self, chunk: C) {
        self.total_size += chunk.size();
        self.queue.push_back(chunk);
    }

    fn take(&mut self, min_size: u64) -> Option<C> {
        // Uniform sizes make this the front entry in practice.
        let pos = self.queue.iter().position(|c| c.size() >= min_size)?;
        let chunk = self.queue.remove(pos)?;
        self.total_size -= chunk.size();
        Some(chunk)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn total_size(&self) -> u64 {
        self.total_size
    }

    fn contains(&self, id: ChunkId) -> bool {
        self.queue.iter().any(|c| c.id() == id)
    }

    fn drain(&mut self) -> Vec<C> {
        self.total_size = 0;
        self.queue.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestChunk {
        id: u64,
        size: u64,
    }

    impl Chunk for TestChunk {
        fn id(&self) -> ChunkId {
            ChunkId(self.id)
        }

        fn size(&self) -> u64 {
            self.size
        }
    }

    fn chunk(id: u64, size: u64) -> TestChunk {
        TestChunk { id, size }
    }

    #[test]
    fn test_best_fit_picks_smallest_sufficient() {
        let mut index = BestFitIndex::default();
        index.insert(chunk(0, 4096));
        index.insert(chunk(1, 1024));
        index.insert(chunk(2, 2048));
        assert_eq!(index.total_size(), 7168);

        let taken = index.take(1500).unwrap();
        assert_eq!(taken.id, 2);
        assert_eq!(index.len(), 2);
        assert_eq!(index.total_size(), 5120);

        assert!(index.take(8192).is_none());
        assert_eq!(index.take(1).unwrap().id, 1);
    }

    #[test]
    fn test_best_fit_equal_sizes_oldest_first() {
        let mut index = BestFitIndex::default();
        index.insert(chunk(7, 1024));
        index.insert(chunk(3, 1024));
        assert_eq!(index.take(1024).unwrap().id, 7);
        assert!(index.contains(ChunkId(3)));
        assert!(!index.contains(ChunkId(7)));
        assert_eq!(index.take(1024).unwrap().id, 3);
        assert!(index.is_empty());
    }

    #[test]
    fn test_fifo_reuses_in_release_order() {
        let mut index = FifoIndex::default();
        index.insert(chunk(5, 64));
        index.insert(chunk(1, 64));
        assert_eq!(index.take(64).unwrap().id, 5);
        assert!(index.take(128).is_none());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_drain_empties_index() {
        let mut index = BestFitIndex::default();
        index.insert(chunk(0, 16));
        index.insert(chunk(1, 32));
        index.insert(chunk(2, 32));
        let drained = index.drain();
        assert_eq!(drained.len(), 3);
        assert!(index.is_empty());
        assert_eq!(index.total_size(), 0);
    }
}
