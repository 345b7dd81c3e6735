//! CPU→GPU staging: upload heap, batched uploads, async copy-queue uploads
//! and the texture loader.

use std::sync::Arc;

use crate::alloc::{BufferAllocation, RingBufferAllocator};
use crate::device::Device;
use crate::error::{CapacityError, NotSupportedError};
use crate::queue::{Queue, TransferContext};
use crate::resource::{Handle, Texture};
use crate::sync::{Fence, FenceDesc, SyncPoint};
use crate::{
    HeapType, PixelFormat, QueueType, TextureDesc, TextureUsage, ROW_PITCH_ALIGNMENT,
};

//=============================================================================
// Requests
//=============================================================================

#[derive(Clone, Copy)]
pub struct BufferUploadRequest<'a> {
    pub dst: &'a Handle<crate::Buffer>,
    pub dst_offset: u64,
    pub data: &'a [u8],
}

#[derive(Clone, Copy)]
pub struct TextureUploadRequest<'a> {
    pub dst: &'a Handle<Texture>,
    pub subresource: u32,
    pub dst_origin: [u32; 3],
    pub data: &'a [u8],
    /// Source row pitch in bytes; 0 means tightly packed at the staging
    /// pitch.
    pub src_row_pitch: u32,
    pub src_slice_pitch: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl<'a> TextureUploadRequest<'a> {
    pub fn whole_mip(dst: &'a Handle<Texture>, subresource: u32, data: &'a [u8]) -> Self {
        let desc = dst.desc();
        let mip = subresource % desc.mip_level_count.max(1);
        Self {
            dst,
            subresource,
            dst_origin: [0; 3],
            data,
            src_row_pitch: 0,
            src_slice_pitch: 0,
            width: (desc.width >> mip).max(1),
            height: (desc.height >> mip).max(1),
            depth: 1,
        }
    }
}

//=============================================================================
// UploadHeap
//=============================================================================

#[derive(Debug)]
pub struct TextureStagingAllocation {
    pub allocation: BufferAllocation,
    pub row_pitch: u32,
    pub slice_pitch: u32,
}

/// Frame-ring staging memory, mapped once for CPU writes.
pub struct UploadHeap {
    ring: RingBufferAllocator,
}

impl UploadHeap {
    pub fn new(device: &dyn Device, size: u64, num_buffered_frames: u32) -> Option<Self> {
        Some(Self {
            ring: RingBufferAllocator::new(device, size, num_buffered_frames, HeapType::Upload)?,
        })
    }

    pub fn begin_frame(&mut self, frame_index: u32, completed_frame: u64) {
        self.ring.begin_frame(frame_index, completed_frame);
    }

    /// `frame_number` is the fence value that will be signaled after this
    /// frame's copies execute.
    pub fn end_frame(&mut self, frame_number: u64) {
        self.ring.end_frame(frame_number);
    }

    /// CPU-writable staging span with a GPU address.
    pub fn allocate_staging(&mut self, size: u64, alignment: u64) -> BufferAllocation {
        let alignment = if alignment > 0 { alignment } else { 256 };
        self.ring.allocate(size, alignment)
    }

    /// Staging span for one mip of a texture, row pitch aligned to the
    /// 256-byte copy rule.
    ///
    /// Block-compressed formats have no per-pixel row layout and are
    /// rejected; heap exhaustion returns an invalid allocation for the
    /// caller to check.
    pub fn allocate_texture_staging(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<TextureStagingAllocation, NotSupportedError> {
        let bytes_per_pixel = format.bytes_per_pixel();
        if bytes_per_pixel == 0 {
            return Err(NotSupportedError {
                feature: "row staging for block-compressed formats",
                capability_hint: "PixelFormat::is_block_compressed",
            });
        }
        let row_pitch = (width * bytes_per_pixel + ROW_PITCH_ALIGNMENT - 1) & !(ROW_PITCH_ALIGNMENT - 1);
        let slice_pitch = row_pitch * height;
        Ok(TextureStagingAllocation {
            allocation: self.ring.allocate(u64::from(slice_pitch), 512),
            row_pitch,
            slice_pitch,
        })
    }

    /// Stage `request.data` and record the GPU-side copy. Returns false when
    /// staging is exhausted; the caller retries next frame.
    pub fn upload_buffer(&mut self, context: &mut dyn TransferContext, request: &BufferUploadRequest) -> bool {
        if request.data.is_empty() {
            return false;
        }
        let staging = self.allocate_staging(request.data.len() as u64, 256);
        if !staging.is_valid() {
            log::warn!(
                "upload heap exhausted staging {} bytes for buffer #{}",
                request.data.len(),
                request.dst.id()
            );
            return false;
        }
        staging.write_bytes(request.data);
        context.copy_buffer_region(
            request.dst.id(),
            request.dst_offset,
            staging.buffer_id(),
            staging.offset,
            request.data.len() as u64,
        );
        true
    }

    /// Stage a texture subresource row by row (the source pitch rarely
    /// matches the aligned staging pitch) and record the copy.
    pub fn upload_texture(&mut self, context: &mut dyn TransferContext, request: &TextureUploadRequest) -> bool {
        if request.data.is_empty() {
            return false;
        }
        let format = request.dst.desc().format;
        let staging = match self.allocate_texture_staging(request.width, request.height, format) {
            Ok(staging) => staging,
            Err(err) => {
                log::warn!("texture upload to #{} rejected: {err}", request.dst.id());
                return false;
            }
        };
        if !staging.allocation.is_valid() {
            log::warn!(
                "upload heap exhausted staging {}x{} texture #{}",
                request.width,
                request.height,
                request.dst.id()
            );
            return false;
        }

        let src_pitch = if request.src_row_pitch > 0 {
            request.src_row_pitch
        } else {
            request.width * format.bytes_per_pixel()
        };
        let copy_pitch = src_pitch.min(staging.row_pitch) as usize;

        for row in 0..request.height as usize {
            let src_start = row * src_pitch as usize;
            let src_end = (src_start + copy_pitch).min(request.data.len());
            if src_start >= src_end {
                break;
            }
            staging.allocation.write_bytes_at(
                (row * staging.row_pitch as usize) as u64,
                &request.data[src_start..src_end],
            );
        }

        context.copy_buffer_to_texture(
            request.dst.id(),
            request.subresource,
            request.dst_origin,
            staging.allocation.buffer_id(),
            staging.allocation.offset,
            staging.row_pitch,
            if staging.slice_pitch > 0 {
                staging.slice_pitch
            } else {
                staging.row_pitch * request.height
            },
        );
        true
    }

    pub fn size(&self) -> u64 {
        self.ring.total_size()
    }

    pub fn used_size(&self) -> u64 {
        self.ring.used_size()
    }

    pub fn buffer(&self) -> &Handle<crate::Buffer> {
        self.ring.buffer()
    }
}

//=============================================================================
// UploadBatch
//=============================================================================

/// Collects upload requests and executes them in one pass. Cleared after
/// execution.
pub struct UploadBatch<'a> {
    buffers: Vec<BufferUploadRequest<'a>>,
    textures: Vec<TextureUploadRequest<'a>>,
    max_requests: usize,
    total_data_size: u64,
}

impl<'a> UploadBatch<'a> {
    pub fn new(max_requests: usize) -> Self {
        Self {
            buffers: Vec::new(),
            textures: Vec::new(),
            max_requests: max_requests.max(1),
            total_data_size: 0,
        }
    }

    pub fn add_buffer(&mut self, request: BufferUploadRequest<'a>) -> Result<(), CapacityError> {
        self.check_capacity()?;
        self.total_data_size += request.data.len() as u64;
        self.buffers.push(request);
        Ok(())
    }

    pub fn add_texture(&mut self, request: TextureUploadRequest<'a>) -> Result<(), CapacityError> {
        self.check_capacity()?;
        self.total_data_size += request.data.len() as u64;
        self.textures.push(request);
        Ok(())
    }

    fn check_capacity(&self) -> Result<(), CapacityError> {
        if self.request_count() >= self.max_requests {
            return Err(CapacityError {
                what: "upload batch",
                capacity: self.max_requests,
            });
        }
        Ok(())
    }

    /// Returns how many requests were uploaded.
    pub fn execute(&mut self, heap: &mut UploadHeap, context: &mut dyn TransferContext) -> usize {
        let mut uploaded = 0;
        for request in &self.buffers {
            if heap.upload_buffer(context, request) {
                uploaded += 1;
            }
        }
        for request in &self.textures {
            if heap.upload_texture(context, request) {
                uploaded += 1;
            }
        }
        self.clear();
        uploaded
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.textures.clear();
        self.total_data_size = 0;
    }

    pub fn request_count(&self) -> usize {
        self.buffers.len() + self.textures.len()
    }

    pub fn total_data_size(&self) -> u64 {
        self.total_data_size
    }
}

//=============================================================================
// AsyncUploadManager
//=============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Ticket for an asynchronous upload. Remains valid after completion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AsyncUploadHandle {
    pub id: u64,
}

impl AsyncUploadHandle {
    pub fn is_valid(&self) -> bool {
        self.id != 0
    }

    pub fn invalid() -> Self {
        Self::default()
    }
}

struct PendingUpload {
    handle: AsyncUploadHandle,
    fence_value: u64,
    status: UploadStatus,
}

/// Streams uploads through the copy queue (when the device has one),
/// gating consumers with a dedicated fence. Each frame's recorded copies
/// are submitted at `end_frame` and complete at one fence value.
pub struct AsyncUploadManager {
    device: Arc<dyn Device>,
    copy_queue: Option<Arc<dyn Queue>>,
    heap: UploadHeap,
    fence: Handle<Fence>,
    next_fence_value: u64,
    last_submitted_value: u64,
    next_handle_id: u64,
    pending: Vec<PendingUpload>,
    context: Option<Box<dyn TransferContext>>,
}

const DEFAULT_ASYNC_HEAP_SIZE: u64 = 64 * 1024 * 1024;

impl AsyncUploadManager {
    pub fn new(device: Arc<dyn Device>) -> Option<Self> {
        Self::with_heap_size(device, DEFAULT_ASYNC_HEAP_SIZE)
    }

    pub fn with_heap_size(device: Arc<dyn Device>, heap_size: u64) -> Option<Self> {
        let heap = UploadHeap::new(device.as_ref(), heap_size, 3)?;
        let fence = device.create_fence(&FenceDesc::default(), "async-upload-fence")?;
        let copy_queue = device.copy_queue();
        if copy_queue.is_none() {
            log::info!("no copy queue available; async uploads will ride the graphics queue");
        }
        Some(Self {
            device,
            copy_queue,
            heap,
            fence,
            next_fence_value: 1,
            last_submitted_value: 0,
            next_handle_id: 1,
            pending: Vec::new(),
            context: None,
        })
    }

    /// Promote finished uploads and recycle their staging.
    pub fn begin_frame(&mut self, frame_index: u32) {
        let completed = self.fence.completed_value();
        self.pending.retain_mut(|upload| {
            if upload.fence_value <= completed {
                upload.status = UploadStatus::Completed;
                false
            } else {
                true
            }
        });
        self.heap.begin_frame(frame_index, completed);
    }

    /// Submit this frame's recorded copies on the copy queue and signal the
    /// frame's fence value.
    pub fn end_frame(&mut self) {
        if let Some(context) = self.context.take() {
            let value = self.next_fence_value;
            self.next_fence_value += 1;

            self.device.execute_context(context);
            let queue = self
                .copy_queue
                .clone()
                .unwrap_or_else(|| self.device.graphics_queue());
            queue.signal(&self.fence, value);
            self.last_submitted_value = value;
            self.heap.end_frame(value);
        } else if self.last_submitted_value > 0 {
            self.heap.end_frame(self.last_submitted_value);
        }
    }

    pub fn upload_buffer_async(&mut self, request: &BufferUploadRequest) -> AsyncUploadHandle {
        let fence_value = self.next_fence_value;
        let Some(mut context) = self.frame_context() else {
            return AsyncUploadHandle::invalid();
        };
        if !self.heap.upload_buffer(context.as_mut(), request) {
            self.context = Some(context);
            return AsyncUploadHandle::invalid();
        }
        self.context = Some(context);
        self.track(fence_value)
    }

    pub fn upload_texture_async(&mut self, request: &TextureUploadRequest) -> AsyncUploadHandle {
        let fence_value = self.next_fence_value;
        let Some(mut context) = self.frame_context() else {
            return AsyncUploadHandle::invalid();
        };
        if !self.heap.upload_texture(context.as_mut(), request) {
            self.context = Some(context);
            return AsyncUploadHandle::invalid();
        }
        self.context = Some(context);
        self.track(fence_value)
    }

    pub fn status(&self, handle: AsyncUploadHandle) -> UploadStatus {
        self.pending
            .iter()
            .find(|upload| upload.handle == handle)
            .map_or(UploadStatus::Completed, |upload| upload.status)
    }

    /// Wait for one upload. An upload recorded this frame only completes
    /// after [`AsyncUploadManager::end_frame`] submits it, so waiting before
    /// then times out.
    pub fn wait(&self, handle: AsyncUploadHandle, timeout_ms: u64) -> bool {
        match self.pending.iter().find(|upload| upload.handle == handle) {
            Some(upload) => self.fence.wait(upload.fence_value, timeout_ms),
            None => true,
        }
    }

    /// Wait for every outstanding upload.
    pub fn wait_all(&mut self, timeout_ms: u64) -> bool {
        let max_value = self
            .pending
            .iter()
            .filter(|upload| upload.status != UploadStatus::Completed)
            .map(|upload| upload.fence_value)
            .max();
        match max_value {
            Some(value) => {
                let ok = self.fence.wait(value, timeout_ms);
                if ok {
                    self.pending.clear();
                }
                ok
            }
            None => true,
        }
    }

    /// Gate for consumers: complete once every upload submitted so far has
    /// landed.
    pub fn sync_point(&self) -> Option<SyncPoint> {
        if self.last_submitted_value == 0 {
            return None;
        }
        Some(SyncPoint::new(self.fence.clone(), self.last_submitted_value))
    }

    /// Make `queue` wait GPU-side for all submitted uploads.
    pub fn wait_on_queue(&self, queue: &dyn Queue) {
        if self.last_submitted_value > 0 {
            queue.wait(&self.fence, self.last_submitted_value);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn fence(&self) -> &Handle<Fence> {
        &self.fence
    }

    fn frame_context(&mut self) -> Option<Box<dyn TransferContext>> {
        match self.context.take() {
            Some(context) => Some(context),
            None => {
                let context = self.device.obtain_transfer_context(QueueType::Copy);
                if context.is_none() {
                    log::error!("no transfer context available for async upload");
                }
                context
            }
        }
    }

    fn track(&mut self, fence_value: u64) -> AsyncUploadHandle {
        let handle = AsyncUploadHandle {
            id: self.next_handle_id,
        };
        self.next_handle_id += 1;
        self.pending.push(PendingUpload {
            handle,
            fence_value,
            status: UploadStatus::InProgress,
        });
        handle
    }
}

//=============================================================================
// TextureLoader
//=============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MipGeneration {
    /// Single mip only.
    #[default]
    None,
    /// Mips are part of the source data.
    Precomputed,
    /// Generate at load time with the backend's compute pass.
    Runtime,
}

#[derive(Clone, Debug, Default)]
pub struct TextureLoadOptions {
    pub mip_generation: MipGeneration,
    pub srgb: bool,
    pub debug_name: String,
}

/// Creates textures and feeds their initial contents through staging. Bulk
/// loads go through the async manager; small one-shot loads use a private
/// synchronous heap.
pub struct TextureLoader {
    device: Arc<dyn Device>,
    sync_heap: UploadHeap,
}

const SYNC_LOADER_HEAP_SIZE: u64 = 16 * 1024 * 1024;

impl TextureLoader {
    pub fn new(device: Arc<dyn Device>) -> Option<Self> {
        let sync_heap = UploadHeap::new(device.as_ref(), SYNC_LOADER_HEAP_SIZE, 3)?;
        Some(Self { device, sync_heap })
    }

    /// Create a single-mip texture from tightly packed pixels and record its
    /// upload on `context`.
    pub fn load_from_raw_data(
        &mut self,
        context: &mut dyn TransferContext,
        data: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
        options: &TextureLoadOptions,
    ) -> Option<Handle<Texture>> {
        if data.is_empty() || width == 0 || height == 0 {
            return None;
        }
        let format = resolve_format(format, options.srgb);
        let mip_level_count = match options.mip_generation {
            MipGeneration::Runtime => full_mip_count(width, height),
            _ => 1,
        };
        let mut usage = TextureUsage::RESOURCE | TextureUsage::COPY_DST;
        if options.mip_generation == MipGeneration::Runtime {
            usage |= TextureUsage::STORAGE;
        }
        let desc = TextureDesc {
            width,
            height,
            mip_level_count,
            format,
            usage,
            ..Default::default()
        };
        let texture = self.device.create_texture(&desc, &options.debug_name)?;

        let request = TextureUploadRequest {
            dst: &texture,
            subresource: 0,
            dst_origin: [0; 3],
            data,
            src_row_pitch: 0,
            src_slice_pitch: 0,
            width,
            height,
            depth: 1,
        };
        if !self.sync_heap.upload_texture(context, &request) {
            return None;
        }
        if options.mip_generation == MipGeneration::Runtime {
            self.device.generate_mipmaps(context, &texture);
        }
        Some(texture)
    }

    /// Create a texture with precomputed mips, staging each level.
    pub fn load_from_mip_data(
        &mut self,
        context: &mut dyn TransferContext,
        mip_data: &[&[u8]],
        mip_row_pitches: &[u32],
        width: u32,
        height: u32,
        format: PixelFormat,
        options: &TextureLoadOptions,
    ) -> Option<Handle<Texture>> {
        if mip_data.is_empty() || mip_data.len() != mip_row_pitches.len() {
            return None;
        }
        let format = resolve_format(format, options.srgb);
        let desc = TextureDesc {
            width,
            height,
            mip_level_count: mip_data.len() as u32,
            format,
            usage: TextureUsage::RESOURCE | TextureUsage::COPY_DST,
            ..Default::default()
        };
        let texture = self.device.create_texture(&desc, &options.debug_name)?;

        for (mip, (data, &row_pitch)) in mip_data.iter().zip(mip_row_pitches).enumerate() {
            let request = TextureUploadRequest {
                dst: &texture,
                subresource: mip as u32,
                dst_origin: [0; 3],
                data,
                src_row_pitch: row_pitch,
                src_slice_pitch: 0,
                width: (width >> mip).max(1),
                height: (height >> mip).max(1),
                depth: 1,
            };
            if !self.sync_heap.upload_texture(context, &request) {
                return None;
            }
        }
        Some(texture)
    }

    /// Queue bulk mip uploads through the async manager. Returns one handle
    /// per mip actually queued.
    pub fn load_async(
        &mut self,
        uploads: &mut AsyncUploadManager,
        texture: &Handle<Texture>,
        mip_data: &[&[u8]],
    ) -> Vec<AsyncUploadHandle> {
        mip_data
            .iter()
            .enumerate()
            .map(|(mip, data)| {
                uploads.upload_texture_async(&TextureUploadRequest::whole_mip(
                    texture, mip as u32, data,
                ))
            })
            .filter(AsyncUploadHandle::is_valid)
            .collect()
    }

    /// Backend compute pass hook.
    pub fn generate_mipmaps(&self, context: &mut dyn TransferContext, texture: &Handle<Texture>) {
        self.device.generate_mipmaps(context, texture);
    }

    pub fn begin_frame(&mut self, frame_index: u32, completed_frame: u64) {
        self.sync_heap.begin_frame(frame_index, completed_frame);
    }

    pub fn end_frame(&mut self, frame_number: u64) {
        self.sync_heap.end_frame(frame_number);
    }
}

fn resolve_format(format: PixelFormat, srgb: bool) -> PixelFormat {
    if srgb && format == PixelFormat::Rgba8Unorm {
        PixelFormat::Rgba8UnormSrgb
    } else {
        format
    }
}

fn full_mip_count(width: u32, height: u32) -> u32 {
    let mut max_dim = width.max(height);
    let mut count = 1;
    while max_dim > 1 {
        max_dim >>= 1;
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::MockDevice;
    use crate::{Buffer, BufferDesc};

    #[test]
    fn upload_buffer_round_trip() {
        let device = MockDevice::new();
        let mut heap = UploadHeap::new(&device, 1024 * 1024, 3).unwrap();
        let mut ctx = device.recording_context();

        let dst = device
            .create_buffer(&BufferDesc::readback(256), "upload-dst")
            .unwrap();
        let payload: Vec<u8> = (0..64u8).collect();

        heap.begin_frame(0, 0);
        assert!(heap.upload_buffer(
            &mut ctx,
            &BufferUploadRequest {
                dst: &dst,
                dst_offset: 16,
                data: &payload,
            }
        ));
        heap.end_frame(1);

        let mut out = vec![0u8; 64];
        assert!(dst.read_mapped(16, &mut out));
        assert_eq!(out, payload);
    }

    #[test]
    fn upload_texture_repitches_rows() {
        let device = MockDevice::new();
        let mut heap = UploadHeap::new(&device, 1024 * 1024, 3).unwrap();
        let mut ctx = device.recording_context();

        // 8x4 RGBA8: tight pitch 32, staging pitch 256.
        let texture = Texture::new(
            TextureDesc {
                width: 8,
                height: 4,
                ..Default::default()
            },
            "repitch",
        );
        let data: Vec<u8> = (0..128u8).collect();

        heap.begin_frame(0, 0);
        assert!(heap.upload_texture(
            &mut ctx,
            &TextureUploadRequest::whole_mip(&texture, 0, &data)
        ));
        heap.end_frame(1);

        let staged = ctx.texture_subresource_bytes(texture.id(), 0).unwrap();
        // Row 1 starts at the aligned pitch, carrying source bytes 32..64.
        assert_eq!(&staged[0..32], &data[0..32]);
        assert_eq!(&staged[256..288], &data[32..64]);
    }

    #[test]
    fn staging_pitch_is_aligned() {
        let device = MockDevice::new();
        let mut heap = UploadHeap::new(&device, 1024 * 1024, 3).unwrap();
        heap.begin_frame(0, 0);
        let staging = heap
            .allocate_texture_staging(100, 7, PixelFormat::Rgba8Unorm)
            .unwrap();
        assert!(staging.allocation.is_valid());
        assert_eq!(staging.row_pitch, 512); // 400 -> 512
        assert_eq!(staging.slice_pitch, 512 * 7);
    }

    #[test]
    fn block_compressed_staging_is_not_supported() {
        let device = MockDevice::new();
        let mut heap = UploadHeap::new(&device, 1024 * 1024, 3).unwrap();
        heap.begin_frame(0, 0);

        let err = heap
            .allocate_texture_staging(64, 64, PixelFormat::Bc1Unorm)
            .unwrap_err();
        assert!(err.to_string().contains("not supported"));

        // A texture upload against a block-compressed target fails cleanly.
        let mut ctx = device.recording_context();
        let texture = Texture::new(
            TextureDesc {
                width: 64,
                height: 64,
                format: PixelFormat::Bc7Unorm,
                ..Default::default()
            },
            "bc7",
        );
        let blocks = vec![0u8; 64 * 64];
        assert!(!heap.upload_texture(
            &mut ctx,
            &TextureUploadRequest::whole_mip(&texture, 0, &blocks)
        ));
        assert!(ctx.texture_subresource_bytes(texture.id(), 0).is_none());
    }

    #[test]
    fn upload_batch_executes_and_clears() {
        let device = MockDevice::new();
        let mut heap = UploadHeap::new(&device, 1024 * 1024, 3).unwrap();
        let mut ctx = device.recording_context();
        heap.begin_frame(0, 0);

        let dst_a = device.create_buffer(&BufferDesc::readback(64), "a").unwrap();
        let dst_b = device.create_buffer(&BufferDesc::readback(64), "b").unwrap();
        let bytes_a = [1u8; 16];
        let bytes_b = [2u8; 16];

        let mut batch = UploadBatch::new(8);
        assert!(batch
            .add_buffer(BufferUploadRequest {
                dst: &dst_a,
                dst_offset: 0,
                data: &bytes_a,
            })
            .is_ok());
        assert!(batch
            .add_buffer(BufferUploadRequest {
                dst: &dst_b,
                dst_offset: 0,
                data: &bytes_b,
            })
            .is_ok());
        assert_eq!(batch.total_data_size(), 32);

        assert_eq!(batch.execute(&mut heap, &mut ctx), 2);
        assert_eq!(batch.request_count(), 0);
        assert_eq!(batch.total_data_size(), 0);

        let mut out = [0u8; 16];
        dst_b.read_mapped(0, &mut out);
        assert_eq!(out, bytes_b);
    }

    #[test]
    fn upload_batch_respects_capacity() {
        let device = MockDevice::new();
        let dst = device.create_buffer(&BufferDesc::readback(64), "").unwrap();
        let texture = Texture::new(Default::default(), "");
        let bytes = [0u8; 4];
        let mut batch = UploadBatch::new(1);
        assert!(batch
            .add_buffer(BufferUploadRequest {
                dst: &dst,
                dst_offset: 0,
                data: &bytes,
            })
            .is_ok());
        let err = batch
            .add_texture(TextureUploadRequest::whole_mip(&texture, 0, &bytes))
            .unwrap_err();
        assert_eq!(err.capacity, 1);
        assert_eq!(batch.request_count(), 1);
    }

    #[test]
    fn async_upload_completes_after_end_frame() {
        let device = MockDevice::new();
        let mut uploads = AsyncUploadManager::with_heap_size(device.arc(), 1024 * 1024).unwrap();
        let dst = device
            .create_buffer(&BufferDesc::readback(64), "async-dst")
            .unwrap();
        let payload = [9u8; 32];

        uploads.begin_frame(0);
        let handle = uploads.upload_buffer_async(&BufferUploadRequest {
            dst: &dst,
            dst_offset: 0,
            data: &payload,
        });
        assert!(handle.is_valid());
        assert_eq!(uploads.status(handle), UploadStatus::InProgress);
        // Recorded but not submitted: the fence cannot have advanced.
        assert!(!uploads.wait(handle, 1));

        uploads.end_frame();
        assert!(uploads.wait(handle, 0));
        assert!(uploads.sync_point().unwrap().is_complete());

        uploads.begin_frame(1);
        assert_eq!(uploads.status(handle), UploadStatus::Completed);
        assert_eq!(uploads.pending_count(), 0);

        let mut out = [0u8; 32];
        dst.read_mapped(0, &mut out);
        assert_eq!(out, payload);
    }

    #[test]
    fn async_wait_all_covers_every_upload() {
        let device = MockDevice::new();
        let mut uploads = AsyncUploadManager::with_heap_size(device.arc(), 1024 * 1024).unwrap();
        let dst = device.create_buffer(&BufferDesc::readback(256), "").unwrap();
        let payload = [3u8; 16];

        uploads.begin_frame(0);
        let a = uploads.upload_buffer_async(&BufferUploadRequest {
            dst: &dst,
            dst_offset: 0,
            data: &payload,
        });
        let b = uploads.upload_buffer_async(&BufferUploadRequest {
            dst: &dst,
            dst_offset: 64,
            data: &payload,
        });
        assert!(a.is_valid() && b.is_valid());
        uploads.end_frame();

        assert!(uploads.wait_all(1_000));
        assert_eq!(uploads.pending_count(), 0);
    }

    #[test]
    fn loader_creates_and_uploads_raw_texture() {
        let device = MockDevice::new();
        let mut loader = TextureLoader::new(device.arc()).unwrap();
        let mut ctx = device.recording_context();

        let pixels = vec![0xabu8; 16 * 16 * 4];
        loader.begin_frame(0, 0);
        let texture = loader
            .load_from_raw_data(
                &mut ctx,
                &pixels,
                16,
                16,
                PixelFormat::Rgba8Unorm,
                &TextureLoadOptions {
                    debug_name: "raw-load".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(texture.desc().mip_level_count, 1);
        assert!(ctx.texture_subresource_bytes(texture.id(), 0).is_some());
    }

    #[test]
    fn loader_mip_chain_counts() {
        assert_eq!(full_mip_count(1, 1), 1);
        assert_eq!(full_mip_count(256, 256), 9);
        assert_eq!(full_mip_count(512, 64), 10);

        let device = MockDevice::new();
        let mut loader = TextureLoader::new(device.arc()).unwrap();
        let mut ctx = device.recording_context();
        loader.begin_frame(0, 0);

        let mip0 = vec![1u8; 8 * 8 * 4];
        let mip1 = vec![2u8; 4 * 4 * 4];
        let texture = loader
            .load_from_mip_data(
                &mut ctx,
                &[&mip0, &mip1],
                &[32, 16],
                8,
                8,
                PixelFormat::Rgba8Unorm,
                &TextureLoadOptions::default(),
            )
            .unwrap();
        assert_eq!(texture.desc().mip_level_count, 2);
        assert!(ctx.texture_subresource_bytes(texture.id(), 1).is_some());
    }

    #[test]
    fn exhausted_staging_reports_failure() {
        let device = MockDevice::new();
        let mut heap = UploadHeap::new(&device, 1024, 3).unwrap();
        let mut ctx = device.recording_context();
        let dst: Handle<Buffer> = device.create_buffer(&BufferDesc::readback(8192), "").unwrap();
        let big = vec![0u8; 4096];

        heap.begin_frame(0, 0);
        assert!(!heap.upload_buffer(
            &mut ctx,
            &BufferUploadRequest {
                dst: &dst,
                dst_offset: 0,
                data: &big,
            }
        ));
    }
}
