use std::collections::HashMap;
use std::sync::Arc;

use dynheap::{
    Chunk, ChunkManager, ChunkManagerConfig, ChunkId, DynamicHeap, DynamicHeapConfig, HostDevice,
};
use proptest::prelude::*;

fn request() -> impl Strategy<Value = (u64, u64)> {
    (1u64..=6000, 0u32..=12).prop_map(|(size, shift)| (size, 1u64 << shift))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn allocations_are_aligned_and_contained(
        frames in prop::collection::vec(prop::collection::vec(request(), 1..40), 1..5),
        page_size in prop::sample::select(vec![1024u64, 4096, 65536]),
    ) {
        let device = Arc::new(HostDevice::new("host"));
        let pool = Arc::new(
            ChunkManager::for_pages(device.clone(), ChunkManagerConfig::default()).unwrap(),
        );
        let mut heap = DynamicHeap::new(
            pool.clone(),
            DynamicHeapConfig { name: "prop heap".to_string(), page_size },
        );

        for (fence, requests) in (1u64..).zip(frames.iter()) {
            let mut used: HashMap<ChunkId, Vec<(u64, u64)>> = HashMap::new();
            for &(size, alignment) in requests {
                let alloc = heap.allocate(size, alignment).unwrap();
                prop_assert_eq!(alloc.offset % alignment, 0);
                prop_assert_eq!(alloc.gpu_address.0 % alignment, 0);
                used.entry(alloc.chunk).or_default().push((alloc.offset, alloc.size));
            }

            let capacities: HashMap<ChunkId, u64> =
                heap.pages().iter().map(|page| (page.id(), page.size())).collect();
            for (chunk, ranges) in &used {
                let capacity = capacities[chunk];
                let total: u64 = ranges.iter().map(|(_, size)| size).sum();
                prop_assert!(total <= capacity);
                for &(offset, size) in ranges {
                    prop_assert!(offset + size <= capacity);
                }
                for pair in ranges.windows(2) {
                    prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
                }
            }

            heap.finish_frame(fence);
            pool.reclaim_stale(fence);
        }

        drop(heap);
        pool.destroy(frames.len() as u64).unwrap();
        prop_assert_eq!(device.allocated_bytes(), 0);
    }
}

#[test]
#[should_panic(expected = "must be power of 2")]
fn non_power_of_two_alignment_panics() {
    let pool = Arc::new(
        ChunkManager::for_pages(HostDevice::new("host"), ChunkManagerConfig::default()).unwrap(),
    );
    let mut heap = DynamicHeap::new(pool, DynamicHeapConfig::default());
    heap.allocate(64, 48);
}
