use std::collections::VecDeque;

/// Items waiting for a fence value to complete, ordered by that value.
///
/// Releases normally arrive in fence order and are appended. A release carrying a lower
/// value than the back of the queue is inserted at its sorted position, so a scan from
/// the front can always stop at the first entry that is not ready.
pub struct StaleQueue<T> {
    entries: VecDeque<(u64, T)>,
    peak_len: usize,
    out_of_order: u64,
}

impl<T> Default for StaleQueue<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            peak_len: 0,
            out_of_order: 0,
        }
    }
}

impl<T> StaleQueue<T> {
    /// Queues `item` until `fence_value` completes. Returns false if the release was out
    /// of fence order.
    pub fn push(&mut self, item: T, fence_value: u64) -> bool {
        let in_order = self
            .entries
            .back()
            .is_none_or(|(last, _)| *last <= fence_value);
        if in_order {
            self.entries.push_back((fence_value, item));
        } else {
            let pos = self.entries.partition_point(|(fence, _)| *fence <= fence_value);
            self.entries.insert(pos, (fence_value, item));
            self.out_of_order += 1;
        }
        self.peak_len = self.peak_len.max(self.entries.len());
        in_order
    }

    /// Pops the front item if its fence value is at most `completed_fence_value`.
    pub fn pop_ready(&mut self, completed_fence_value: u64) -> Option<T> {
        match self.entries.front() {
            Some((fence, _)) if *fence <= completed_fence_value => {
                self.entries.pop_front().map(|(_, item)| item)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peak_len(&self) -> usize {
        self.peak_len
    }

    /// Number of releases that arrived out of fence order.
    pub fn out_of_order_releases(&self) -> u64 {
        self.out_of_order
    }

    /// Fence value the front entry waits for.
    pub fn oldest_fence_value(&self) -> Option<u64> {
        self.entries.front().map(|(fence, _)| *fence)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.entries.iter().map(|(fence, item)| (*fence, item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_only_completed_front() {
        let mut queue = StaleQueue::default();
        queue.push("a", 1);
        queue.push("b", 2);
        queue.push("c", 2);
        queue.push("d", 5);

        assert_eq!(queue.pop_ready(0), None);
        assert_eq!(queue.pop_ready(2), Some("a"));
        assert_eq!(queue.pop_ready(2), Some("b"));
        assert_eq!(queue.pop_ready(2), Some("c"));
        assert_eq!(queue.pop_ready(4), None);
        assert_eq!(queue.oldest_fence_value(), Some(5));
        assert_eq!(queue.peak_len(), 4);
    }

    #[test]
    fn test_out_of_order_release_is_sorted_in() {
        let mut queue = StaleQueue::default();
        assert!(queue.push(1, 10));
        assert!(queue.push(2, 12));
        assert!(!queue.push(3, 11));
        assert_eq!(queue.out_of_order_releases(), 1);

        let fences: Vec<u64> = queue.iter().map(|(f, _)| f).collect();
        assert_eq!(fences, vec![10, 11, 12]);

        assert_eq!(queue.pop_ready(11), Some(1));
        assert_eq!(queue.pop_ready(11), Some(3));
        assert_eq!(queue.pop_ready(11), None);
        assert_eq!(queue.len(), 1);
    }
}
