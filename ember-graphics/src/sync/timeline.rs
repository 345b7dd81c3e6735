//! Long-lived timeline over a single fence.

use super::{Fence, FenceDesc, SyncPoint};
use crate::queue::Queue;
use crate::resource::Handle;

/// A monotone counter paired with one fence for the lifetime of a device.
/// Callers draw increasing values and turn them into sync points at will.
pub struct TimelineSync {
    fence: Handle<Fence>,
    next_value: u64,
}

impl TimelineSync {
    pub fn new() -> Self {
        Self::with_fence(Fence::new(FenceDesc::default(), "TimelineSyncFence"))
    }

    pub fn with_fence(fence: Handle<Fence>) -> Self {
        Self {
            fence,
            next_value: 1,
        }
    }

    /// GPU-reached value.
    pub fn current_value(&self) -> u64 {
        self.fence.completed_value()
    }

    pub fn acquire_next_value(&mut self) -> u64 {
        let value = self.next_value;
        self.next_value += 1;
        value
    }

    /// Allocate and signal the next value from `queue`.
    pub fn signal(&mut self, queue: &dyn Queue) -> u64 {
        let value = self.acquire_next_value();
        queue.signal(&self.fence, value);
        value
    }

    pub fn wait(&self, queue: &dyn Queue, value: u64) {
        queue.wait(&self.fence, value);
    }

    pub fn wait_cpu(&self, value: u64, timeout_ms: u64) -> bool {
        self.fence.wait(value, timeout_ms)
    }

    pub fn sync_point(&self, value: u64) -> SyncPoint {
        SyncPoint::new(self.fence.clone(), value)
    }

    pub fn fence(&self) -> &Handle<Fence> {
        &self.fence
    }
}

impl Default for TimelineSync {
    fn default() -> Self {
        Self::new()
    }
}
