//! Fence values and completion tracking.
//!
//! A fence value marks a point in the GPU submission stream. The pool never waits on a
//! fence; it only compares the completed value it is handed against the value a chunk
//! was released with.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of fence values, typically owned by the command queue.
pub trait CompletionTracker: Send + Sync {
    /// Value that the next submission will signal.
    fn next_fence_value(&self) -> u64;

    /// Highest value whose work has fully finished. Never decreases.
    fn completed_fence_value(&self) -> u64;
}

/// Atomic [`CompletionTracker`] driven by whoever submits and retires GPU work.
#[derive(Debug)]
pub struct FenceCounter {
    next: AtomicU64,
    completed: AtomicU64,
}

impl Default for FenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceCounter {
    /// Starts with nothing completed and the first submission signaling 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            completed: AtomicU64::new(0),
        }
    }

    /// Reserves the value the caller will signal for its submission.
    pub fn submit(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// Records completion of `value`. Lower values than already reported are ignored.
    pub fn signal(&self, value: u64) {
        let prev = self.completed.fetch_max(value, Ordering::AcqRel);
        if value > prev {
            log::trace!("fence completed {} -> {}", prev, value);
        }
    }

    /// Marks every submitted value as finished.
    pub fn signal_all(&self) -> u64 {
        let last = self.last_submitted();
        self.signal(last);
        last
    }

    /// Last value handed out by [`submit`](Self::submit), 0 if none.
    pub fn last_submitted(&self) -> u64 {
        self.next.load(Ordering::Acquire) - 1
    }

    pub fn is_idle(&self) -> bool {
        self.completed_fence_value() >= self.last_submitted()
    }
}

impl CompletionTracker for FenceCounter {
    fn next_fence_value(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    fn completed_fence_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}
