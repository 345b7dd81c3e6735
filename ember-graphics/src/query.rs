//! GPU queries: frame-buffered allocation, occlusion management,
//! conditional rendering and the HiZ pyramid.

use crate::device::Device;
use crate::queue::{ComputeContext, TransferContext};
use crate::resource::{Buffer, Handle, Resource, ResourceHeader, Texture, TypedResource};
use crate::state::{AutoBarrierScope, GlobalStateManager};
use crate::{
    BufferDesc, BufferUsage, HeapType, PixelFormat, ResourceKind, TextureDesc, TextureUsage,
    ALL_SUBRESOURCES,
};
use std::collections::HashMap;

//=============================================================================
// Query types
//=============================================================================

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum QueryType {
    /// Counts visible samples.
    Occlusion,
    /// Any-sample-visible flag.
    BinaryOcclusion,
    Timestamp,
    PipelineStatistics,
    StreamOutputStatistics,
    Predication,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct PipelineStatisticsFlags: u32 {
        const IA_VERTICES    = 1 << 0;
        const IA_PRIMITIVES  = 1 << 1;
        const VS_INVOCATIONS = 1 << 2;
        const GS_INVOCATIONS = 1 << 3;
        const GS_PRIMITIVES  = 1 << 4;
        const C_INVOCATIONS  = 1 << 5;
        const C_PRIMITIVES   = 1 << 6;
        const PS_INVOCATIONS = 1 << 7;
        const HS_INVOCATIONS = 1 << 8;
        const DS_INVOCATIONS = 1 << 9;
        const CS_INVOCATIONS = 1 << 10;
        const AS_INVOCATIONS = 1 << 11;
        const MS_INVOCATIONS = 1 << 12;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct QueryHeapDesc {
    pub query_type: QueryType,
    pub count: u32,
    pub pipeline_statistics: PipelineStatisticsFlags,
}

impl QueryHeapDesc {
    pub fn timestamp(count: u32) -> Self {
        Self {
            query_type: QueryType::Timestamp,
            count,
            pipeline_statistics: PipelineStatisticsFlags::empty(),
        }
    }

    pub fn occlusion(count: u32) -> Self {
        Self {
            query_type: QueryType::Occlusion,
            count,
            pipeline_statistics: PipelineStatisticsFlags::empty(),
        }
    }

    pub fn binary_occlusion(count: u32) -> Self {
        Self {
            query_type: QueryType::BinaryOcclusion,
            count,
            pipeline_statistics: PipelineStatisticsFlags::empty(),
        }
    }

    pub fn pipeline_statistics(count: u32, flags: PipelineStatisticsFlags) -> Self {
        Self {
            query_type: QueryType::PipelineStatistics,
            count,
            pipeline_statistics: flags,
        }
    }
}

//=============================================================================
// Query results
//=============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OcclusionResult {
    pub visible_samples: u64,
}

impl OcclusionResult {
    pub fn is_visible(&self) -> bool {
        self.visible_samples > 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStatisticsResult {
    pub ia_vertices: u64,
    pub ia_primitives: u64,
    pub vs_invocations: u64,
    pub gs_invocations: u64,
    pub gs_primitives: u64,
    pub c_invocations: u64,
    pub c_primitives: u64,
    pub ps_invocations: u64,
    pub hs_invocations: u64,
    pub ds_invocations: u64,
    pub cs_invocations: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamOutputStatisticsResult {
    pub primitives_written: u64,
    pub primitives_storage_needed: u64,
}

impl StreamOutputStatisticsResult {
    pub fn has_overflow(&self) -> bool {
        self.primitives_storage_needed > self.primitives_written
    }
}

//=============================================================================
// QueryHeap
//=============================================================================

pub struct QueryHeap {
    header: ResourceHeader,
    desc: QueryHeapDesc,
    native: std::sync::atomic::AtomicU64,
}

impl QueryHeap {
    pub fn new(desc: QueryHeapDesc, name: &str) -> Handle<QueryHeap> {
        let heap = Self {
            header: ResourceHeader::new(ResourceKind::QueryHeap),
            desc,
            native: std::sync::atomic::AtomicU64::new(0),
        };
        if !name.is_empty() {
            heap.header.set_debug_name(name);
        }
        Handle::new(heap)
    }

    pub fn id(&self) -> crate::ResourceId {
        self.header.id()
    }

    pub fn query_type(&self) -> QueryType {
        self.desc.query_type
    }

    pub fn query_count(&self) -> u32 {
        self.desc.count
    }

    pub fn pipeline_statistics(&self) -> PipelineStatisticsFlags {
        self.desc.pipeline_statistics
    }

    /// Bytes one resolved query occupies.
    pub fn query_result_size(&self) -> u32 {
        match self.desc.query_type {
            QueryType::PipelineStatistics => std::mem::size_of::<PipelineStatisticsResult>() as u32,
            QueryType::StreamOutputStatistics => {
                std::mem::size_of::<StreamOutputStatisticsResult>() as u32
            }
            _ => 8,
        }
    }

    pub fn native(&self) -> u64 {
        self.native.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn set_native(&self, value: u64) {
        self.native.store(value, std::sync::atomic::Ordering::Release);
    }
}

impl Resource for QueryHeap {
    fn header(&self) -> &ResourceHeader {
        &self.header
    }
}

impl TypedResource for QueryHeap {
    const KIND: ResourceKind = ResourceKind::QueryHeap;
}

//=============================================================================
// QueryAllocator
//=============================================================================

#[derive(Clone)]
pub struct QueryAllocation {
    pub heap: Handle<QueryHeap>,
    pub start_index: u32,
    pub count: u32,
}

impl QueryAllocation {
    pub fn is_valid(&self) -> bool {
        self.count > 0
    }
}

struct QueryFrame {
    heap: Handle<QueryHeap>,
    result_buffer: Handle<Buffer>,
    allocated: u32,
    resolved: bool,
}

/// One query heap and result buffer per in-flight frame; allocation is a
/// bump within the current frame's heap.
pub struct QueryAllocator {
    frames: Vec<QueryFrame>,
    queries_per_frame: u32,
    current: usize,
}

impl QueryAllocator {
    pub fn new(
        device: &dyn Device,
        query_type: QueryType,
        queries_per_frame: u32,
        num_buffered_frames: u32,
    ) -> Option<Self> {
        let mut frames = Vec::with_capacity(num_buffered_frames.max(1) as usize);
        for _ in 0..num_buffered_frames.max(1) {
            let heap = device.create_query_heap(
                &QueryHeapDesc {
                    query_type,
                    count: queries_per_frame,
                    pipeline_statistics: PipelineStatisticsFlags::empty(),
                },
                "query-heap",
            )?;
            let result_size = u64::from(queries_per_frame) * u64::from(heap.query_result_size());
            let result_buffer = device.create_buffer(
                &BufferDesc {
                    size: result_size,
                    heap_type: HeapType::Readback,
                    usage: BufferUsage::QUERY_RESOLVE | BufferUsage::COPY_DST,
                },
                "query-results",
            )?;
            frames.push(QueryFrame {
                heap,
                result_buffer,
                allocated: 0,
                resolved: false,
            });
        }
        Some(Self {
            frames,
            queries_per_frame,
            current: 0,
        })
    }

    pub fn begin_frame(&mut self, frame_index: u32) {
        self.current = frame_index as usize % self.frames.len();
        let frame = &mut self.frames[self.current];
        frame.allocated = 0;
        frame.resolved = false;
    }

    /// Overflow returns `None`; the caller skips its query this frame.
    pub fn allocate(&mut self, count: u32) -> Option<QueryAllocation> {
        let frame = &mut self.frames[self.current];
        if frame.allocated + count > self.queries_per_frame {
            return None;
        }
        let allocation = QueryAllocation {
            heap: frame.heap.clone(),
            start_index: frame.allocated,
            count,
        };
        frame.allocated += count;
        Some(allocation)
    }

    pub fn available_count(&self) -> u32 {
        self.queries_per_frame - self.frames[self.current].allocated
    }

    /// Record the resolve of everything allocated this frame into the
    /// frame's result buffer.
    pub fn record_resolve(&self, context: &mut dyn TransferContext) {
        let frame = &self.frames[self.current];
        if frame.allocated > 0 {
            context.resolve_query_data(
                frame.heap.id(),
                0,
                frame.allocated,
                frame.result_buffer.id(),
                0,
            );
        }
    }

    /// Mark the frame's results as resolved; the backend completes the read
    /// by fence.
    pub fn end_frame(&mut self) {
        self.frames[self.current].resolved = true;
    }

    pub fn are_results_ready(&self, frame_index: u32) -> bool {
        self.frames[frame_index as usize % self.frames.len()].resolved
    }

    pub fn result_buffer(&self, frame_index: u32) -> &Handle<Buffer> {
        &self.frames[frame_index as usize % self.frames.len()].result_buffer
    }

    pub fn heap(&self, frame_index: u32) -> &Handle<QueryHeap> {
        &self.frames[frame_index as usize % self.frames.len()].heap
    }

    pub fn allocated_count(&self) -> u32 {
        self.frames[self.current].allocated
    }
}

//=============================================================================
// OcclusionQueryManager
//=============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OcclusionQueryId {
    pub index: u32,
}

impl OcclusionQueryId {
    pub fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }

    pub fn invalid() -> Self {
        Self { index: u32::MAX }
    }
}

/// Wraps a [`QueryAllocator`] for occlusion queries and caches per-query
/// sample counts once resolved.
pub struct OcclusionQueryManager {
    allocator: QueryAllocator,
    binary: bool,
    frame_allocations: Vec<QueryAllocation>,
    results: Vec<OcclusionResult>,
    result_count: u32,
}

impl OcclusionQueryManager {
    pub fn new(
        device: &dyn Device,
        max_queries: u32,
        num_buffered_frames: u32,
        use_binary_occlusion: bool,
    ) -> Option<Self> {
        let query_type = if use_binary_occlusion {
            QueryType::BinaryOcclusion
        } else {
            QueryType::Occlusion
        };
        Some(Self {
            allocator: QueryAllocator::new(device, query_type, max_queries, num_buffered_frames)?,
            binary: use_binary_occlusion,
            frame_allocations: Vec::new(),
            results: vec![OcclusionResult::default(); max_queries as usize],
            result_count: 0,
        })
    }

    pub fn begin_frame(&mut self, frame_index: u32) {
        self.allocator.begin_frame(frame_index);
        self.frame_allocations.clear();
    }

    pub fn begin_query(&mut self, context: &mut dyn TransferContext) -> OcclusionQueryId {
        let Some(allocation) = self.allocator.allocate(1) else {
            return OcclusionQueryId::invalid();
        };
        context.begin_query(allocation.heap.id(), allocation.start_index);
        let id = OcclusionQueryId {
            index: self.frame_allocations.len() as u32,
        };
        self.frame_allocations.push(allocation);
        id
    }

    pub fn end_query(&mut self, context: &mut dyn TransferContext, id: OcclusionQueryId) {
        let Some(allocation) = self
            .frame_allocations
            .get(id.index as usize)
        else {
            return;
        };
        context.end_query(allocation.heap.id(), allocation.start_index);
    }

    /// Record the frame's resolve and flag it.
    pub fn end_frame(&mut self, context: &mut dyn TransferContext) {
        self.allocator.record_resolve(context);
        self.allocator.end_frame();
    }

    /// Install resolved sample counts (from the readback path).
    pub fn apply_results(&mut self, samples: &[u64]) {
        let count = samples.len().min(self.results.len());
        for (result, &sample) in self.results.iter_mut().zip(samples.iter().take(count)) {
            result.visible_samples = sample;
        }
        self.result_count = count as u32;
    }

    pub fn results_ready(&self, frame_index: u32) -> bool {
        self.allocator.are_results_ready(frame_index)
    }

    pub fn result(&self, id: OcclusionQueryId) -> OcclusionResult {
        if !id.is_valid() || id.index >= self.result_count {
            return OcclusionResult::default();
        }
        self.results[id.index as usize]
    }

    pub fn is_visible(&self, id: OcclusionQueryId) -> bool {
        self.result(id).is_visible()
    }

    pub fn query_count(&self) -> u32 {
        self.frame_allocations.len() as u32
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    pub fn result_buffer(&self, frame_index: u32) -> &Handle<Buffer> {
        self.allocator.result_buffer(frame_index)
    }

    pub fn heap(&self, frame_index: u32) -> &Handle<QueryHeap> {
        self.allocator.heap(frame_index)
    }
}

//=============================================================================
// ConditionalRendering
//=============================================================================

#[derive(Clone, Copy, Debug)]
struct TrackedObject {
    query: Option<u32>,
    visible: bool,
    tested: bool,
}

impl Default for TrackedObject {
    fn default() -> Self {
        Self {
            query: None,
            // Optimistic visibility: draw until a query proves otherwise.
            visible: true,
            tested: false,
        }
    }
}

/// Per-object occlusion bracketing with previous-frame decisions.
pub struct ConditionalRendering {
    objects: HashMap<u32, TrackedObject>,
}

impl ConditionalRendering {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
        }
    }

    pub fn register_object(&mut self, object_id: u32) {
        self.objects.entry(object_id).or_default();
    }

    pub fn unregister_object(&mut self, object_id: u32) {
        self.objects.remove(&object_id);
    }

    /// Bracket start: issues an occlusion query for the object's proxy.
    pub fn begin_occlusion_test(
        &mut self,
        context: &mut dyn TransferContext,
        manager: &mut OcclusionQueryManager,
        object_id: u32,
    ) {
        let id = manager.begin_query(context);
        if !id.is_valid() {
            log::warn!("occlusion query pool exhausted; object {object_id} stays optimistic");
            return;
        }
        self.objects.entry(object_id).or_default().query = Some(id.index);
    }

    pub fn end_occlusion_test(
        &mut self,
        context: &mut dyn TransferContext,
        manager: &mut OcclusionQueryManager,
        object_id: u32,
    ) {
        if let Some(object) = self.objects.get(&object_id) {
            if let Some(query) = object.query {
                manager.end_query(context, OcclusionQueryId { index: query });
            }
        }
    }

    /// Whether the object should be drawn, based on the last resolved test.
    /// Unknown objects and objects without data draw (optimistic).
    pub fn begin_conditional_draw(&self, object_id: u32) -> bool {
        self.objects
            .get(&object_id)
            .map_or(true, |object| object.visible)
    }

    pub fn end_conditional_draw(&self) {}

    /// Consume resolved sample counts: `resolve(query_index)` returns the
    /// samples for a query issued in an earlier frame, `None` while still in
    /// flight.
    pub fn end_frame<F: Fn(u32) -> Option<u64>>(&mut self, resolve: F) {
        for object in self.objects.values_mut() {
            if let Some(query) = object.query {
                if let Some(samples) = resolve(query) {
                    object.visible = samples > 0;
                    object.tested = true;
                    object.query = None;
                }
            }
        }
    }

    pub fn is_tested(&self, object_id: u32) -> bool {
        self.objects.get(&object_id).is_some_and(|o| o.tested)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

impl Default for ConditionalRendering {
    fn default() -> Self {
        Self::new()
    }
}

//=============================================================================
// HiZ buffer
//=============================================================================

/// Mip-chained R32F depth pyramid for GPU occlusion tests. The min-reduce
/// pipeline itself is bound by the backend; this records the states and
/// dispatches.
pub struct HiZBuffer {
    texture: Handle<Texture>,
    width: u32,
    height: u32,
    mip_count: u32,
}

impl HiZBuffer {
    pub fn new(device: &dyn Device, width: u32, height: u32) -> Option<Self> {
        let mip_count = mip_chain_length(width, height);
        let texture = device.create_texture(
            &TextureDesc {
                width,
                height,
                mip_level_count: mip_count,
                format: PixelFormat::R32Float,
                usage: TextureUsage::RESOURCE | TextureUsage::STORAGE,
                ..Default::default()
            },
            "hiz-pyramid",
        )?;
        Some(Self {
            texture,
            width,
            height,
            mip_count,
        })
    }

    pub fn resize(&mut self, device: &dyn Device, width: u32, height: u32) -> bool {
        if width == self.width && height == self.height {
            return true;
        }
        match Self::new(device, width, height) {
            Some(rebuilt) => {
                *self = rebuilt;
                true
            }
            None => false,
        }
    }

    /// Record the downsample chain: depth → mip 0, then a min-reduction per
    /// mip. One 8×8 workgroup per tile.
    pub fn generate(
        &mut self,
        context: &mut dyn ComputeContext,
        global: Option<&GlobalStateManager>,
        depth: &Handle<Texture>,
    ) {
        {
            let mut scope = AutoBarrierScope::new(&mut *context, global);
            scope.use_as_shader_resource(depth, ALL_SUBRESOURCES);
            scope.use_as_uav(&self.texture, 0);
            scope.finalize();
        }
        context.dispatch(self.width.div_ceil(8), self.height.div_ceil(8), 1);

        for mip in 1..self.mip_count {
            {
                let mut scope = AutoBarrierScope::new(&mut *context, global);
                scope.use_as_shader_resource(&self.texture, mip - 1);
                scope.use_as_uav(&self.texture, mip);
                scope.finalize();
            }
            let mip_width = (self.width >> mip).max(1);
            let mip_height = (self.height >> mip).max(1);
            context.dispatch(mip_width.div_ceil(8), mip_height.div_ceil(8), 1);
        }
    }

    /// The full pyramid; consumers view every mip through an SRV created at
    /// the device boundary.
    pub fn texture(&self) -> &Handle<Texture> {
        &self.texture
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

fn mip_chain_length(width: u32, height: u32) -> u32 {
    let mut max_dim = width.max(height);
    let mut count = 1;
    while max_dim > 1 {
        max_dim >>= 1;
        count += 1;
    }
    count
}
