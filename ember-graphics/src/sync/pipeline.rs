//! Queue-to-queue synchronization.

use super::{Fence, FenceDesc, SyncPoint};
use crate::queue::Queue;
use crate::resource::Handle;

#[cfg(debug_assertions)]
const MAX_QUEUES: usize = 8;

/// Producer/consumer sync between queues over one shared fence.
///
/// In debug builds a per-frame sync graph rejects circular waits before they
/// are enqueued: a cycle between queues is a guaranteed deadlock on hardware.
pub struct PipelineSync {
    fence: Handle<Fence>,
    next_value: u64,
    #[cfg(debug_assertions)]
    sync_graph: [[bool; MAX_QUEUES]; MAX_QUEUES],
}

impl PipelineSync {
    pub fn new() -> Self {
        Self::with_fence(Fence::new(FenceDesc::default(), "PipelineSyncFence"))
    }

    pub fn with_fence(fence: Handle<Fence>) -> Self {
        Self {
            fence,
            next_value: 1,
            #[cfg(debug_assertions)]
            sync_graph: [[false; MAX_QUEUES]; MAX_QUEUES],
        }
    }

    /// Allocate the next timeline value and signal it from `from_queue`.
    pub fn insert_sync_point(&mut self, from_queue: &dyn Queue) -> SyncPoint {
        let value = self.next_value;
        self.next_value += 1;
        from_queue.signal(&self.fence, value);
        SyncPoint::new(self.fence.clone(), value)
    }

    /// Enqueue a GPU-side wait for `sync_point` on `queue`.
    pub fn wait_for_sync_point(&self, queue: &dyn Queue, sync_point: &SyncPoint) {
        queue.wait(&sync_point.fence, sync_point.value);
    }

    /// Signal on `from`, wait on `to`. Returns false if the edge would close
    /// a cycle in this frame's sync graph (debug builds); the request is then
    /// reported and not enqueued.
    pub fn sync_queues(&mut self, from: &dyn Queue, to: &dyn Queue) -> bool {
        #[cfg(debug_assertions)]
        {
            let from_index = from.queue_index() as usize;
            let to_index = to.queue_index() as usize;
            if from_index < MAX_QUEUES && to_index < MAX_QUEUES {
                if self.has_path(to_index, from_index) {
                    log::error!(
                        "circular queue sync {} -> {} would deadlock; request rejected",
                        from.description(),
                        to.description()
                    );
                    debug_assert!(false, "circular queue dependency");
                    return false;
                }
                self.sync_graph[from_index][to_index] = true;
            }
        }
        let sp = self.insert_sync_point(from);
        self.wait_for_sync_point(to, &sp);
        true
    }

    pub fn graphics_to_compute(&mut self, graphics: &dyn Queue, compute: &dyn Queue) -> bool {
        self.sync_queues(graphics, compute)
    }

    pub fn compute_to_graphics(&mut self, compute: &dyn Queue, graphics: &dyn Queue) -> bool {
        self.sync_queues(compute, graphics)
    }

    /// Clear the debug sync graph. Call once per frame.
    pub fn reset_frame_graph(&mut self) {
        #[cfg(debug_assertions)]
        {
            self.sync_graph = [[false; MAX_QUEUES]; MAX_QUEUES];
        }
    }

    pub fn fence(&self) -> &Handle<Fence> {
        &self.fence
    }

    /// DFS over recorded edges: is `to` reachable from `from`?
    #[cfg(debug_assertions)]
    fn has_path(&self, from: usize, to: usize) -> bool {
        let mut visited = [false; MAX_QUEUES];
        let mut stack = vec![from];
        visited[from] = true;
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            for (next, &edge) in self.sync_graph[current].iter().enumerate() {
                if edge && !visited[next] {
                    visited[next] = true;
                    stack.push(next);
                }
            }
        }
        false
    }
}

impl Default for PipelineSync {
    fn default() -> Self {
        Self::new()
    }
}
