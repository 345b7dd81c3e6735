//! Abstract queues and the command recording contracts.
//!
//! The core records *what* must happen (barriers, copies, draws) through the
//! context traits below; a backend translates each call to its native
//! command list. Queues are the submission boundary and the only place
//! GPU-side signal/wait edges are created.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::resource::{Handle, Resource, ResourceHeader, TypedResource};
use crate::state::TransitionBarrier;
use crate::sync::{Fence, SyncPoint};
use crate::{QueueType, ResourceId, ResourceKind};

//=============================================================================
// Queue
//=============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub submissions: u64,
    pub command_lists: u64,
    pub signals: u64,
    pub waits: u64,
}

/// One hardware execution engine. Implementations are internally locked;
/// the whole surface is callable from any thread.
pub trait Queue: Send + Sync {
    fn queue_type(&self) -> QueueType;

    /// Stable index used by the debug sync graph (unique per queue).
    fn queue_index(&self) -> u32;

    fn description(&self) -> &str;

    /// Submit closed command lists in order.
    fn execute(&self, lists: &[Handle<CommandList>]);

    /// Enqueue a GPU-side signal of `fence` to `value`.
    fn signal(&self, fence: &Fence, value: u64);

    /// Enqueue a GPU-side wait until `fence` reaches `value`.
    fn wait(&self, fence: &Fence, value: u64);

    /// CPU wait for everything previously submitted to this queue, via the
    /// queue's own last-value fence. Returns false on timeout.
    fn flush(&self) -> bool;

    /// Ticks per second of the queue's timestamp counter.
    fn timestamp_frequency(&self) -> u64;

    fn insert_debug_marker(&self, name: &str, color: u32);
    fn begin_debug_event(&self, name: &str, color: u32);
    fn end_debug_event(&self);

    /// Drop a breadcrumb value into the queue's crash-forensics stream.
    fn insert_breadcrumb(&self, value: u32);

    fn stats(&self) -> QueueStats;

    /// The queue's own submission fence.
    fn fence(&self) -> &Handle<Fence>;

    /// Enqueue a GPU wait on another queue's fence.
    fn wait_for_queue(&self, other: &dyn Queue, value: u64) {
        self.wait(other.fence(), value);
    }
}

//=============================================================================
// Command list
//=============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandListState {
    Recording = 0,
    Closed = 1,
}

/// Recorded commands awaiting submission. The core never inspects the
/// contents; it carries the backend object and the open/closed state.
pub struct CommandList {
    header: ResourceHeader,
    queue_type: QueueType,
    native: AtomicU64,
    state: AtomicU8,
}

impl CommandList {
    pub fn new(queue_type: QueueType, name: &str) -> Handle<CommandList> {
        let list = Self {
            header: ResourceHeader::new(ResourceKind::CommandList),
            queue_type,
            native: AtomicU64::new(0),
            state: AtomicU8::new(CommandListState::Recording as u8),
        };
        if !name.is_empty() {
            list.header.set_debug_name(name);
        }
        Handle::new(list)
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn close(&self) {
        self.state
            .store(CommandListState::Closed as u8, Ordering::Release);
    }

    pub fn reopen(&self) {
        self.state
            .store(CommandListState::Recording as u8, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CommandListState::Closed as u8
    }

    pub fn native(&self) -> u64 {
        self.native.load(Ordering::Acquire)
    }

    pub fn set_native(&self, value: u64) {
        self.native.store(value, Ordering::Release);
    }
}

impl Resource for CommandList {
    fn header(&self) -> &ResourceHeader {
        &self.header
    }
}

impl TypedResource for CommandList {
    const KIND: ResourceKind = ResourceKind::CommandList;
}

//=============================================================================
// Command allocator
//=============================================================================

/// Backing memory for one or more command lists.
///
/// The allocator cannot be reset while the GPU may still be replaying lists
/// recorded from it; the tagged wait fence tracks that point.
pub struct CommandAllocator {
    header: ResourceHeader,
    queue_type: QueueType,
    wait: Mutex<Option<SyncPoint>>,
    allocated_bytes: AtomicU64,
    used_bytes: AtomicU64,
}

impl CommandAllocator {
    pub fn new(queue_type: QueueType, name: &str) -> Handle<CommandAllocator> {
        let allocator = Self {
            header: ResourceHeader::new(ResourceKind::CommandAllocator),
            queue_type,
            wait: Mutex::new(None),
            allocated_bytes: AtomicU64::new(0),
            used_bytes: AtomicU64::new(0),
        };
        if !name.is_empty() {
            allocator.header.set_debug_name(name);
        }
        Handle::new(allocator)
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Tag the fence point after which the allocator's memory is reusable.
    pub fn set_wait_fence(&self, fence: Handle<Fence>, value: u64) {
        *self.wait.lock().unwrap() = Some(SyncPoint::new(fence, value));
    }

    pub fn wait_fence_value(&self) -> u64 {
        self.wait.lock().unwrap().as_ref().map_or(0, |sp| sp.value)
    }

    pub fn is_wait_complete(&self) -> bool {
        self.wait
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, SyncPoint::is_complete)
    }

    /// The GPU may still be consuming lists recorded from this allocator.
    pub fn is_in_use(&self) -> bool {
        !self.is_wait_complete()
    }

    /// Reclaim backing memory. Fails while in use.
    pub fn reset(&self) -> bool {
        if self.is_in_use() {
            log::warn!(
                "reset of command allocator #{} refused: still in use by the GPU",
                self.header.id()
            );
            return false;
        }
        *self.wait.lock().unwrap() = None;
        self.used_bytes.store(0, Ordering::Release);
        true
    }

    pub fn allocated_memory(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    pub fn used_memory(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    pub fn memory_usage_ratio(&self) -> f32 {
        let allocated = self.allocated_memory();
        if allocated == 0 {
            0.0
        } else {
            self.used_memory() as f32 / allocated as f32
        }
    }

    /// Backend bookkeeping as lists record into this allocator.
    pub fn note_memory(&self, allocated: u64, used: u64) {
        self.allocated_bytes.store(allocated, Ordering::Release);
        self.used_bytes.store(used, Ordering::Release);
    }
}

impl Resource for CommandAllocator {
    fn header(&self) -> &ResourceHeader {
        &self.header
    }
}

impl TypedResource for CommandAllocator {
    const KIND: ResourceKind = ResourceKind::CommandAllocator;
}

//=============================================================================
// Command allocator pool
//=============================================================================

#[derive(Default)]
struct PoolShelf {
    free: Vec<Handle<CommandAllocator>>,
    in_use: Vec<Handle<CommandAllocator>>,
}

/// Hands out allocators by queue type, reclaiming them as their tagged
/// fences complete.
pub struct CommandAllocatorPool {
    shelves: Mutex<[PoolShelf; QueueType::COUNT]>,
}

impl CommandAllocatorPool {
    pub fn new() -> Self {
        Self {
            shelves: Mutex::new(Default::default()),
        }
    }

    /// Seed the pool with a fresh allocator.
    pub fn add(&self, allocator: Handle<CommandAllocator>) {
        let mut shelves = self.shelves.lock().unwrap();
        shelves[allocator.queue_type().index()].free.push(allocator);
    }

    /// Pop a reusable allocator, reclaiming completed ones first. Returns
    /// `None` when the pool is dry; the caller creates a new allocator
    /// through the device and seeds it back later.
    pub fn obtain(&self, queue_type: QueueType) -> Option<Handle<CommandAllocator>> {
        self.process_completed();
        let mut shelves = self.shelves.lock().unwrap();
        let allocator = shelves[queue_type.index()].free.pop()?;
        allocator.reset();
        Some(allocator)
    }

    /// Return an allocator whose lists were just submitted; it becomes free
    /// once `fence` reaches `value`.
    pub fn release(&self, allocator: Handle<CommandAllocator>, fence: Handle<Fence>, value: u64) {
        allocator.set_wait_fence(fence, value);
        let mut shelves = self.shelves.lock().unwrap();
        shelves[allocator.queue_type().index()]
            .in_use
            .push(allocator);
    }

    /// Move completed allocators back to the free shelves. Returns how many
    /// became reusable.
    pub fn process_completed(&self) -> usize {
        let mut shelves = self.shelves.lock().unwrap();
        let mut reclaimed = 0;
        for shelf in shelves.iter_mut() {
            let mut index = 0;
            while index < shelf.in_use.len() {
                if shelf.in_use[index].is_wait_complete() {
                    let allocator = shelf.in_use.swap_remove(index);
                    shelf.free.push(allocator);
                    reclaimed += 1;
                } else {
                    index += 1;
                }
            }
        }
        reclaimed
    }

    pub fn pooled_count(&self, queue_type: QueueType) -> usize {
        self.shelves.lock().unwrap()[queue_type.index()].free.len()
    }

    pub fn in_use_count(&self, queue_type: QueueType) -> usize {
        self.shelves.lock().unwrap()[queue_type.index()]
            .in_use
            .len()
    }
}

impl Default for CommandAllocatorPool {
    fn default() -> Self {
        Self::new()
    }
}

//=============================================================================
// Recording contexts
//=============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ShadingRate {
    #[default]
    Rate1x1,
    Rate1x2,
    Rate2x1,
    Rate2x2,
    Rate2x4,
    Rate4x2,
    Rate4x4,
}

/// Base recording surface: barriers, copies, queries, debug markers.
/// Every state requirement an operation implies is routed through
/// [`crate::AutoBarrierScope`] before the operation itself is recorded.
pub trait TransferContext {
    fn queue_type(&self) -> QueueType;

    //=====================================================================
    // Barriers
    //=====================================================================

    fn transition_barrier(&mut self, barrier: &TransitionBarrier);
    fn uav_barrier(&mut self, resource: Option<ResourceId>);
    fn aliasing_barrier(&mut self, before: Option<ResourceId>, after: Option<ResourceId>);

    /// Commit barriers recorded since the last flush to the native stream.
    fn flush_barriers(&mut self);

    //=====================================================================
    // Copies
    //=====================================================================

    fn copy_buffer_region(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    );

    #[allow(clippy::too_many_arguments)]
    fn copy_buffer_to_texture(
        &mut self,
        dst: ResourceId,
        subresource: u32,
        origin: [u32; 3],
        src: ResourceId,
        src_offset: u64,
        row_pitch: u32,
        slice_pitch: u32,
    );

    fn copy_texture_to_buffer(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        row_pitch: u32,
        src: ResourceId,
        subresource: u32,
    );

    //=====================================================================
    // Queries
    //=====================================================================

    fn begin_query(&mut self, heap: ResourceId, index: u32);
    fn end_query(&mut self, heap: ResourceId, index: u32);
    fn resolve_query_data(
        &mut self,
        heap: ResourceId,
        start: u32,
        count: u32,
        dst: ResourceId,
        dst_offset: u64,
    );

    //=====================================================================
    // Debug
    //=====================================================================

    fn insert_debug_marker(&mut self, name: &str, color: u32);
    fn begin_debug_event(&mut self, name: &str, color: u32);
    fn end_debug_event(&mut self);
}

/// Compute-capable recording surface.
pub trait ComputeContext: TransferContext {
    fn set_compute_pipeline(&mut self, pipeline: u64);
    fn set_root_constants(&mut self, index: u32, data: &[u32]);
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
    fn dispatch_indirect(&mut self, args: ResourceId, args_offset: u64);
    fn clear_uav_uint(&mut self, resource: ResourceId, values: [u32; 4]);
    fn clear_uav_float(&mut self, resource: ResourceId, values: [f32; 4]);
}

/// Full graphics recording surface.
pub trait GraphicsContext: ComputeContext {
    fn set_graphics_pipeline(&mut self, pipeline: u64);

    fn begin_render_pass(&mut self, color_targets: &[ResourceId], depth_target: Option<ResourceId>);
    fn end_render_pass(&mut self);

    fn set_viewport(&mut self, viewport: &Viewport);
    fn set_scissor(&mut self, rect: &ScissorRect);
    fn set_depth_bounds(&mut self, min: f32, max: f32);
    fn set_shading_rate(&mut self, rate: ShadingRate);

    fn set_vertex_buffer(&mut self, slot: u32, buffer: ResourceId, offset: u64, stride: u32);
    fn set_index_buffer(&mut self, buffer: ResourceId, offset: u64, sixteen_bit: bool);

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    );
    fn draw_indirect(&mut self, args: ResourceId, args_offset: u64, draw_count: u32);

    /// Indirect execution through a backend command signature.
    fn execute_indirect(&mut self, signature: u64, args: ResourceId, args_offset: u64, max_count: u32);

    fn dispatch_mesh(&mut self, x: u32, y: u32, z: u32);
    fn dispatch_rays(&mut self, width: u32, height: u32, depth: u32);
}

//=============================================================================
// Test support
//=============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::sync::FenceDesc;

    /// A queue standing in for a GPU that executes instantly (or, when
    /// stalled, never).
    pub struct ImmediateQueue {
        queue_type: QueueType,
        index: u32,
        fence: Handle<Fence>,
        stalled: bool,
        stats: Mutex<QueueStats>,
        gpu_waits: AtomicU64,
    }

    impl ImmediateQueue {
        pub fn new(queue_type: QueueType, index: u32) -> Self {
            Self {
                queue_type,
                index,
                fence: Fence::new(FenceDesc::default(), "ImmediateQueueFence"),
                stalled: false,
                stats: Mutex::new(QueueStats::default()),
                gpu_waits: AtomicU64::new(0),
            }
        }

        pub fn graphics() -> Self {
            Self::new(QueueType::Graphics, 0)
        }

        /// A hung GPU: signals are enqueued but never complete.
        pub fn stalled() -> Self {
            let mut queue = Self::graphics();
            queue.stalled = true;
            queue
        }

        pub fn gpu_waits(&self) -> u64 {
            self.gpu_waits.load(Ordering::Relaxed)
        }
    }

    impl Queue for ImmediateQueue {
        fn queue_type(&self) -> QueueType {
            self.queue_type
        }

        fn queue_index(&self) -> u32 {
            self.index
        }

        fn description(&self) -> &str {
            "immediate-test-queue"
        }

        fn execute(&self, lists: &[Handle<CommandList>]) {
            let mut stats = self.stats.lock().unwrap();
            stats.submissions += 1;
            stats.command_lists += lists.len() as u64;
        }

        fn signal(&self, fence: &Fence, value: u64) {
            self.stats.lock().unwrap().signals += 1;
            if self.stalled {
                fence.note_signal_enqueued(value);
            } else {
                fence.signal(value);
            }
        }

        fn wait(&self, _fence: &Fence, _value: u64) {
            self.stats.lock().unwrap().waits += 1;
            self.gpu_waits.fetch_add(1, Ordering::Relaxed);
        }

        fn flush(&self) -> bool {
            self.fence
                .wait(self.fence.last_signaled_value(), if self.stalled { 1 } else { 0 })
        }

        fn timestamp_frequency(&self) -> u64 {
            1_000_000_000
        }

        fn insert_debug_marker(&self, _name: &str, _color: u32) {}
        fn begin_debug_event(&self, _name: &str, _color: u32) {}
        fn end_debug_event(&self) {}
        fn insert_breadcrumb(&self, _value: u32) {}

        fn stats(&self) -> QueueStats {
            *self.stats.lock().unwrap()
        }

        fn fence(&self) -> &Handle<Fence> {
            &self.fence
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::FenceDesc;

    #[test]
    fn allocator_reset_requires_completion() {
        let fence = Fence::new(FenceDesc::default(), "");
        let allocator = CommandAllocator::new(QueueType::Graphics, "alloc");
        assert!(allocator.reset());

        allocator.set_wait_fence(fence.clone(), 3);
        assert!(allocator.is_in_use());
        assert!(!allocator.reset());

        fence.signal(3);
        assert!(allocator.is_wait_complete());
        assert!(allocator.reset());
    }

    #[test]
    fn allocator_memory_ratio() {
        let allocator = CommandAllocator::new(QueueType::Copy, "");
        assert_eq!(allocator.memory_usage_ratio(), 0.0);
        allocator.note_memory(1024, 256);
        assert!((allocator.memory_usage_ratio() - 0.25).abs() < f32::EPSILON);
        assert!(allocator.reset());
        assert_eq!(allocator.used_memory(), 0);
    }

    #[test]
    fn pool_reclaims_completed_allocators() {
        let fence = Fence::new(FenceDesc::default(), "");
        let pool = CommandAllocatorPool::new();
        pool.add(CommandAllocator::new(QueueType::Graphics, "a"));

        let allocator = pool.obtain(QueueType::Graphics).unwrap();
        assert!(pool.obtain(QueueType::Graphics).is_none());

        pool.release(allocator, fence.clone(), 1);
        assert_eq!(pool.in_use_count(QueueType::Graphics), 1);
        // Fence not reached: still busy.
        assert!(pool.obtain(QueueType::Graphics).is_none());

        fence.signal(1);
        assert_eq!(pool.process_completed(), 1);
        assert_eq!(pool.pooled_count(QueueType::Graphics), 1);
        assert!(pool.obtain(QueueType::Graphics).is_some());
    }

    #[test]
    fn pool_separates_queue_types() {
        let pool = CommandAllocatorPool::new();
        pool.add(CommandAllocator::new(QueueType::Copy, ""));
        assert!(pool.obtain(QueueType::Graphics).is_none());
        assert!(pool.obtain(QueueType::Copy).is_some());
    }

    #[test]
    fn command_list_state_transitions() {
        let list = CommandList::new(QueueType::Graphics, "list");
        assert!(!list.is_closed());
        list.close();
        assert!(list.is_closed());
        list.reopen();
        assert!(!list.is_closed());
    }
}
