//! Ember graphics core.
//!
//! A thin, vendor-neutral layer over explicit graphics APIs: resource
//! lifetime, memory sub-allocation, state tracking and barriers, fences and
//! frame pacing, residency, queries and readback. Backends translate the
//! contracts defined here to a native API; renderers build on top. The core
//! decides nothing about what gets drawn — only that what is drawn is safe,
//! synchronized, and resident.

mod alloc;
mod device;
mod error;
mod hal;
mod query;
mod readback;
mod residency;
mod resource;
mod state;
mod sync;
mod upload;

pub mod queue;

pub use alloc::{
    BufferAllocation, BufferPool, BufferPoolConfig, ConstantBufferAllocator, DynamicBufferManager,
    LinearBufferAllocator, MultiSizeBufferPool, RingBufferAllocator,
};
pub use device::{Device, DeviceLostCallback, SwapChain};
pub use error::{CapacityError, NotSupportedError};
pub use hal::{
    register_core_variables, ConsoleRegistry, ConsoleValue, FileHandle, LogOutputDevice,
    OutputDevice, PlatformAffinity, PlatformFile, PlatformMemory, PlatformTime, PlatformTls,
    SeekOrigin, SetBy, Verbosity,
};
pub use query::{
    ConditionalRendering, HiZBuffer, OcclusionQueryId, OcclusionQueryManager, OcclusionResult,
    PipelineStatisticsFlags, PipelineStatisticsResult, QueryAllocation, QueryAllocator, QueryHeap,
    QueryHeapDesc, QueryType, StreamOutputStatisticsResult,
};
pub use readback::{
    AsyncReadbackRing, BufferReadback, CapturedImage, OcclusionQueryReadback, ScreenCapture,
    TextureReadback,
};
pub use residency::{
    ResidencyConfig, ResidencyPriority, ResidencyStatus, ResidencyManager,
    TextureStreamingManager,
};
pub use resource::{
    cast, Buffer, DeferredDeleteQueue, Handle, Resource, ResourceHeader, Texture, TypedResource,
};
pub use state::{
    AliasingBarrier, AutoBarrierScope, BarrierBatch, BarrierFlags, GlobalStateManager,
    ResourceStateTracker, SplitBarrier, SplitBarrierBatch, StateValidator, SubresourceStateMap,
    TrackedResourceState, TransitionBarrier, UavBarrier, ValidationStats,
    MAX_BARRIERS_PER_BATCH, MAX_SPLIT_BARRIERS, MESSAGE_ACCESS_MISMATCH,
    MESSAGE_REDUNDANT_TRANSITION,
};
pub use sync::{
    Event, Fence, FenceDesc, FenceFlags, FenceValueTracker, FrameSync, PipelineSync, SyncPoint,
    SyncPointWaiter, TimelineSync, WaitResult, DEFAULT_WAIT_TIMEOUT_MS, MAX_BUFFERED_FRAMES,
    MAX_SYNC_POINTS, WAIT_INFINITE,
};
pub use upload::{
    AsyncUploadHandle, AsyncUploadManager, BufferUploadRequest, MipGeneration,
    TextureLoadOptions, TextureLoader, TextureStagingAllocation, TextureUploadRequest,
    UploadBatch, UploadHeap, UploadStatus,
};

//=============================================================================
// Identity
//=============================================================================

/// Process-unique, monotonically assigned resource identifier.
pub type ResourceId = u64;

/// Refers to every subresource of a resource at once.
pub const ALL_SUBRESOURCES: u32 = u32::MAX;

/// What a resource is, as a 16-bit tag. One concrete type per tag; the tag is
/// the only downcasting mechanism (no RTTI).
#[repr(u16)]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ResourceKind {
    Unknown = 0,
    Buffer,
    Texture,
    ShaderResourceView,
    UnorderedAccessView,
    RenderTargetView,
    DepthStencilView,
    ConstantBufferView,
    Sampler,
    Shader,
    GraphicsPipeline,
    ComputePipeline,
    RootSignature,
    CommandList,
    CommandAllocator,
    Fence,
    DescriptorHeap,
    QueryHeap,
    SwapChain,
    AccelerationStructure,
    ShaderBindingTable,
    Heap,
    InputLayout,
    ShaderLibrary,
}

impl ResourceKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Buffer => "Buffer",
            Self::Texture => "Texture",
            Self::ShaderResourceView => "SRV",
            Self::UnorderedAccessView => "UAV",
            Self::RenderTargetView => "RTV",
            Self::DepthStencilView => "DSV",
            Self::ConstantBufferView => "CBV",
            Self::Sampler => "Sampler",
            Self::Shader => "Shader",
            Self::GraphicsPipeline => "GraphicsPipeline",
            Self::ComputePipeline => "ComputePipeline",
            Self::RootSignature => "RootSignature",
            Self::CommandList => "CommandList",
            Self::CommandAllocator => "CommandAllocator",
            Self::Fence => "Fence",
            Self::DescriptorHeap => "DescriptorHeap",
            Self::QueryHeap => "QueryHeap",
            Self::SwapChain => "SwapChain",
            Self::AccelerationStructure => "AccelerationStructure",
            Self::ShaderBindingTable => "ShaderBindingTable",
            Self::Heap => "Heap",
            Self::InputLayout => "InputLayout",
            Self::ShaderLibrary => "ShaderLibrary",
        }
    }

    /// Whether the kind occupies GPU memory directly.
    pub fn is_gpu_resource(self) -> bool {
        matches!(
            self,
            Self::Buffer | Self::Texture | Self::AccelerationStructure
        )
    }

    pub fn is_view(self) -> bool {
        matches!(
            self,
            Self::ShaderResourceView
                | Self::UnorderedAccessView
                | Self::RenderTargetView
                | Self::DepthStencilView
                | Self::ConstantBufferView
        )
    }
}

//=============================================================================
// Resource states
//=============================================================================

bitflags::bitflags! {
    /// GPU access state of a resource or subresource.
    ///
    /// Read-only states are bit-distinct so that hardware which supports
    /// combined read access can OR them together; write states require exact
    /// match. `COMMON` is the empty set.
    #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Default)]
    pub struct ResourceState: u32 {
        const VERTEX_BUFFER      = 1 << 0;
        const CONSTANT_BUFFER    = 1 << 1;
        const INDEX_BUFFER       = 1 << 2;
        const RENDER_TARGET      = 1 << 3;
        const UNORDERED_ACCESS   = 1 << 4;
        const DEPTH_WRITE        = 1 << 5;
        const DEPTH_READ         = 1 << 6;
        const SHADER_RESOURCE    = 1 << 7;
        const INDIRECT_ARGUMENT  = 1 << 9;
        const COPY_DEST          = 1 << 10;
        const COPY_SOURCE        = 1 << 11;
        const RESOLVE_DEST       = 1 << 12;
        const RESOLVE_SOURCE     = 1 << 13;
        const SHADING_RATE       = 1 << 14;
        const PRESENT            = 1 << 15;
    }
}

impl ResourceState {
    /// The `COMMON`/idle state: no access bits set.
    pub const COMMON: Self = Self::empty();

    /// States that may be held simultaneously by hardware.
    pub const READ_ONLY: Self = Self::SHADER_RESOURCE
        .union(Self::COPY_SOURCE)
        .union(Self::DEPTH_READ)
        .union(Self::INDIRECT_ARGUMENT)
        .union(Self::VERTEX_BUFFER)
        .union(Self::INDEX_BUFFER)
        .union(Self::CONSTANT_BUFFER)
        .union(Self::RESOLVE_SOURCE);

    pub fn is_read_only(self) -> bool {
        !self.is_empty() && Self::READ_ONLY.contains(self)
    }

    pub fn is_write(self) -> bool {
        self.intersects(
            Self::RENDER_TARGET
                .union(Self::UNORDERED_ACCESS)
                .union(Self::DEPTH_WRITE)
                .union(Self::COPY_DEST)
                .union(Self::RESOLVE_DEST)
                .union(Self::PRESENT),
        )
    }
}

//=============================================================================
// Queues
//=============================================================================

/// The three engine classes of a modern explicit API.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum QueueType {
    Graphics,
    Compute,
    Copy,
}

impl QueueType {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Compute => 1,
            Self::Copy => 2,
        }
    }
}

//=============================================================================
// Memory & formats
//=============================================================================

/// Which heap class backs a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HeapType {
    /// Device-local, not CPU-visible.
    #[default]
    Default,
    /// CPU-write, GPU-read staging memory. Persistently mapped.
    Upload,
    /// GPU-write, CPU-read memory for readback. Persistently mapped.
    Readback,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct BufferUsage: u32 {
        const VERTEX        = 1 << 0;
        const INDEX         = 1 << 1;
        const CONSTANT      = 1 << 2;
        const STORAGE       = 1 << 3;
        const INDIRECT      = 1 << 4;
        const COPY_SRC      = 1 << 5;
        const COPY_DST      = 1 << 6;
        const QUERY_RESOLVE = 1 << 7;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct TextureUsage: u32 {
        const RESOURCE = 1 << 0;
        const STORAGE  = 1 << 1;
        const TARGET   = 1 << 2;
        const DEPTH    = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
    }
}

/// Minimal pixel format set the core itself reasons about (staging pitches,
/// readback sizes, HiZ). Backend-specific formats cross the boundary as raw
/// numeric values via [`Device::to_native_format`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    R8Unorm,
    Rg8Unorm,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Uint,
    Rgb10a2Unorm,
    Depth32Float,
    Bc1Unorm,
    Bc1UnormSrgb,
    Bc3Unorm,
    Bc3UnormSrgb,
    Bc7Unorm,
}

impl PixelFormat {
    /// Bytes per pixel; 0 for block-compressed formats, which have no
    /// per-pixel size. The row-staging paths reject those with
    /// [`NotSupportedError`].
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rg8Unorm | Self::R16Float => 2,
            Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Rg16Float
            | Self::R32Float
            | Self::R32Uint
            | Self::Rgb10a2Unorm
            | Self::Depth32Float => 4,
            Self::Rgba16Float | Self::Rg32Float => 8,
            Self::Rgba32Float => 16,
            Self::Bc1Unorm | Self::Bc1UnormSrgb | Self::Bc3Unorm | Self::Bc3UnormSrgb
            | Self::Bc7Unorm => 0,
        }
    }

    /// 4×4-block formats: uploaded pre-swizzled by the backend, never staged
    /// row by row here.
    pub fn is_block_compressed(self) -> bool {
        matches!(
            self,
            Self::Bc1Unorm | Self::Bc1UnormSrgb | Self::Bc3Unorm | Self::Bc3UnormSrgb | Self::Bc7Unorm
        )
    }
}

/// Texture copies require row starts at this alignment.
pub const ROW_PITCH_ALIGNMENT: u32 = 256;

/// Constant-buffer views require offsets and sizes at this alignment.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

//=============================================================================
// Resource descriptors
//=============================================================================

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc {
    pub size: u64,
    pub heap_type: HeapType,
    pub usage: BufferUsage,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            size: 0,
            heap_type: HeapType::Default,
            usage: BufferUsage::empty(),
        }
    }
}

impl BufferDesc {
    pub fn upload(size: u64) -> Self {
        Self {
            size,
            heap_type: HeapType::Upload,
            usage: BufferUsage::COPY_SRC,
        }
    }

    pub fn readback(size: u64) -> Self {
        Self {
            size,
            heap_type: HeapType::Readback,
            usage: BufferUsage::COPY_DST,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_level_count: u32,
    pub array_layer_count: u32,
    pub sample_count: u32,
    pub format: PixelFormat,
    pub usage: TextureUsage,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            depth: 1,
            mip_level_count: 1,
            array_layer_count: 1,
            sample_count: 1,
            format: PixelFormat::Rgba8Unorm,
            usage: TextureUsage::RESOURCE,
        }
    }
}

impl TextureDesc {
    /// Individually state-tracked units: mips × array layers.
    pub fn subresource_count(&self) -> u32 {
        self.mip_level_count.max(1) * self.array_layer_count.max(1)
    }

    pub fn subresource_index(&self, mip: u32, layer: u32) -> u32 {
        mip + layer * self.mip_level_count.max(1)
    }
}

//=============================================================================
// Multi-adapter mask
//=============================================================================

/// Adapter affinity mask. Bit N selects GPU N.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuMask {
    pub mask: u32,
}

pub const INVALID_GPU_INDEX: u32 = u32::MAX;

impl GpuMask {
    pub const ALL: Self = Self { mask: u32::MAX };

    pub fn single(index: u32) -> Self {
        Self { mask: 1 << index }
    }

    pub fn first_index(self) -> u32 {
        if self.mask == 0 {
            INVALID_GPU_INDEX
        } else {
            self.mask.trailing_zeros()
        }
    }

    pub fn bit_count(self) -> u32 {
        self.mask.count_ones()
    }

    pub fn contains(self, index: u32) -> bool {
        index < 32 && self.mask & (1 << index) != 0
    }
}

impl Default for GpuMask {
    fn default() -> Self {
        Self::single(0)
    }
}
