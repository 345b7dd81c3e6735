//! Shared test double: a device whose GPU executes copies at record time and
//! whose queues signal fences synchronously (or never, to model a hang).

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ember_graphics::queue::{
    CommandAllocator, CommandList, ComputeContext, Queue, QueueStats, TransferContext,
};
use ember_graphics::{
    Buffer, BufferDesc, DeferredDeleteQueue, Device, Fence, FenceDesc, Handle, QueryHeap,
    QueryHeapDesc, QueueType, ResourceId, Texture, TextureDesc, TransitionBarrier,
};

type BufferMap = Arc<Mutex<HashMap<ResourceId, Handle<Buffer>>>>;
type TextureBytes = Arc<Mutex<HashMap<(ResourceId, u32), Vec<u8>>>>;

//=============================================================================
// Queue
//=============================================================================

pub struct TestQueue {
    queue_type: QueueType,
    index: u32,
    fence: Handle<Fence>,
    stalled: AtomicBool,
    stats: Mutex<QueueStats>,
}

impl TestQueue {
    pub fn new(queue_type: QueueType, index: u32) -> Self {
        Self {
            queue_type,
            index,
            fence: Fence::new(FenceDesc::default(), "test-queue-fence"),
            stalled: AtomicBool::new(false),
            stats: Mutex::new(QueueStats::default()),
        }
    }

    /// Stop completing signals: the GPU hangs from here on.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }
}

impl Queue for TestQueue {
    fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    fn queue_index(&self) -> u32 {
        self.index
    }

    fn description(&self) -> &str {
        "test-queue"
    }

    fn execute(&self, lists: &[Handle<CommandList>]) {
        let mut stats = self.stats.lock().unwrap();
        stats.submissions += 1;
        stats.command_lists += lists.len() as u64;
    }

    fn signal(&self, fence: &Fence, value: u64) {
        self.stats.lock().unwrap().signals += 1;
        if self.stalled.load(Ordering::SeqCst) {
            fence.note_signal_enqueued(value);
        } else {
            fence.signal(value);
        }
    }

    fn wait(&self, _fence: &Fence, _value: u64) {
        self.stats.lock().unwrap().waits += 1;
    }

    fn flush(&self) -> bool {
        let timeout = if self.stalled.load(Ordering::SeqCst) { 1 } else { 0 };
        self.fence.wait(self.fence.last_signaled_value(), timeout)
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

//=============================================================================
// Context
//=============================================================================

/// Records barriers and executes copies immediately against mapped shadows.
pub struct TestContext {
    pub transitions: Vec<TransitionBarrier>,
    pub flushes: usize,
    pub uav_barriers: usize,
    pub dispatches: Vec<[u32; 3]>,
    buffers: BufferMap,
    texture_bytes: TextureBytes,
}

impl TestContext {
    fn new(buffers: BufferMap, texture_bytes: TextureBytes) -> Self {
        Self {
            transitions: Vec::new(),
            flushes: 0,
            uav_barriers: 0,
            dispatches: Vec::new(),
            buffers,
            texture_bytes,
        }
    }

    fn buffer(&self, id: ResourceId) -> Option<Handle<Buffer>> {
        self.buffers.lock().unwrap().get(&id).cloned()
    }
}

impl TransferContext for TestContext {
    fn queue_type(&self) -> QueueType {
        QueueType::Graphics
    }

    fn transition_barrier(&mut self, barrier: &TransitionBarrier) {
        self.transitions.push(*barrier);
    }

    fn uav_barrier(&mut self, _resource: Option<ResourceId>) {
        self.uav_barriers += 1;
    }

    fn aliasing_barrier(&mut self, _before: Option<ResourceId>, _after: Option<ResourceId>) {}

    fn flush_barriers(&mut self) {
        self.flushes += 1;
    }

    fn copy_buffer_region(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    ) {
        if let (Some(src_buffer), Some(dst_buffer)) = (self.buffer(src), self.buffer(dst)) {
            let mut bytes = vec![0u8; size as usize];
            if src_buffer.read_mapped(src_offset, &mut bytes) {
                dst_buffer.write_mapped(dst_offset, &bytes);
            }
        }
    }

    fn copy_buffer_to_texture(
        &mut self,
        dst: ResourceId,
        subresource: u32,
        _origin: [u32; 3],
        src: ResourceId,
        src_offset: u64,
        row_pitch: u32,
        slice_pitch: u32,
    ) {
        if let Some(src_buffer) = self.buffer(src) {
            let mut bytes = vec![0u8; slice_pitch.max(row_pitch) as usize];
            if src_buffer.read_mapped(src_offset, &mut bytes) {
                self.texture_bytes
                    .lock()
                    .unwrap()
                    .insert((dst, subresource), bytes);
            }
        }
    }

    fn copy_texture_to_buffer(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        _row_pitch: u32,
        src: ResourceId,
        subresource: u32,
    ) {
        let bytes = self
            .texture_bytes
            .lock()
            .unwrap()
            .get(&(src, subresource))
            .cloned();
        if let (Some(bytes), Some(dst_buffer)) = (bytes, self.buffer(dst)) {
            dst_buffer.write_mapped(dst_offset, &bytes);
        }
    }

    fn begin_query(&mut self, _heap: ResourceId, _index: u32) {}
    fn end_query(&mut self, _heap: ResourceId, _index: u32) {}
    fn resolve_query_data(
        &mut self,
        _heap: ResourceId,
        _start: u32,
        _count: u32,
        _dst: ResourceId,
        _dst_offset: u64,
    ) {
    }

    fn insert_debug_marker(&mut self, _name: &str, _color: u32) {}
    fn begin_debug_event(&mut self, _name: &str, _color: u32) {}
    fn end_debug_event(&mut self) {}
}

impl ComputeContext for TestContext {
    fn set_compute_pipeline(&mut self, _pipeline: u64) {}
    fn set_root_constants(&mut self, _index: u32, _data: &[u32]) {}

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.dispatches.push([x, y, z]);
    }

    fn dispatch_indirect(&mut self, _args: ResourceId, _args_offset: u64) {}
    fn clear_uav_uint(&mut self, _resource: ResourceId, _values: [u32; 4]) {}
    fn clear_uav_float(&mut self, _resource: ResourceId, _values: [f32; 4]) {}
}

//=============================================================================
// Device
//=============================================================================

#[derive(Clone)]
pub struct TestDevice {
    graphics: Arc<TestQueue>,
    copy: Arc<TestQueue>,
    deferred: Arc<DeferredDeleteQueue>,
    next_address: Arc<AtomicU64>,
    buffers: BufferMap,
    texture_bytes: TextureBytes,
    evictions: Arc<Mutex<Vec<ResourceId>>>,
    made_resident: Arc<Mutex<Vec<ResourceId>>>,
    streaming_requests: Arc<Mutex<Vec<(ResourceId, u32)>>>,
}

impl TestDevice {
    pub fn new() -> Self {
        Self {
            graphics: Arc::new(TestQueue::new(QueueType::Graphics, 0)),
            copy: Arc::new(TestQueue::new(QueueType::Copy, 2)),
            deferred: DeferredDeleteQueue::new(),
            next_address: Arc::new(AtomicU64::new(0x1000_0000)),
            buffers: Arc::new(Mutex::new(HashMap::new())),
            texture_bytes: Arc::new(Mutex::new(HashMap::new())),
            evictions: Arc::new(Mutex::new(Vec::new())),
            made_resident: Arc::new(Mutex::new(Vec::new())),
            streaming_requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn arc(&self) -> Arc<dyn Device> {
        Arc::new(self.clone())
    }

    pub fn context(&self) -> TestContext {
        TestContext::new(self.buffers.clone(), self.texture_bytes.clone())
    }

    pub fn graphics(&self) -> &TestQueue {
        &self.graphics
    }

    pub fn evictions(&self) -> Vec<ResourceId> {
        self.evictions.lock().unwrap().clone()
    }

    pub fn made_resident(&self) -> Vec<ResourceId> {
        self.made_resident.lock().unwrap().clone()
    }

    pub fn streaming_requests(&self) -> Vec<(ResourceId, u32)> {
        self.streaming_requests.lock().unwrap().clone()
    }
}

impl Device for TestDevice {
    fn create_buffer(&self, desc: &BufferDesc, name: &str) -> Option<Handle<Buffer>> {
        let address = self
            .next_address
            .fetch_add(desc.size.max(1).next_power_of_two(), Ordering::Relaxed);
        let buffer = Buffer::new(*desc, address, name);
        self.buffers
            .lock()
            .unwrap()
            .insert(buffer.id(), buffer.clone());
        Some(buffer)
    }

    fn create_texture(&self, desc: &TextureDesc, name: &str) -> Option<Handle<Texture>> {
        Some(Texture::new(*desc, name))
    }

    fn create_fence(&self, desc: &FenceDesc, name: &str) -> Option<Handle<Fence>> {
        Some(Fence::new(*desc, name))
    }

    fn create_query_heap(&self, desc: &QueryHeapDesc, name: &str) -> Option<Handle<QueryHeap>> {
        Some(QueryHeap::new(*desc, name))
    }

    fn create_command_allocator(&self, queue_type: QueueType) -> Option<Handle<CommandAllocator>> {
        Some(CommandAllocator::new(queue_type, "test-allocator"))
    }

    fn graphics_queue(&self) -> Arc<dyn Queue> {
        self.graphics.clone()
    }

    fn copy_queue(&self) -> Option<Arc<dyn Queue>> {
        Some(self.copy.clone())
    }

    fn obtain_transfer_context(&self, _queue_type: QueueType) -> Option<Box<dyn TransferContext>> {
        Some(Box::new(self.context()))
    }

    fn execute_context(&self, context: Box<dyn TransferContext>) {
        drop(context);
    }

    fn deferred_delete_queue(&self) -> &Arc<DeferredDeleteQueue> {
        &self.deferred
    }

    fn wait_idle(&self) {}

    fn make_resident(&self, resource: ResourceId) -> bool {
        self.made_resident.lock().unwrap().push(resource);
        true
    }

    fn evict(&self, resource: ResourceId) {
        self.evictions.lock().unwrap().push(resource);
    }

    fn request_stream_level(&self, resource: ResourceId, level: u32) {
        self.streaming_requests.lock().unwrap().push((resource, level));
    }
}
