//! GPU→CPU data return: readback buffers, frame-latency rings, occlusion
//! result caching and screen capture.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::device::Device;
use crate::query::QueryHeap;
use crate::queue::TransferContext;
use crate::resource::{Buffer, Handle, Texture};
use crate::sync::SyncPoint;
use crate::{BufferDesc, PixelFormat, ROW_PITCH_ALIGNMENT};

//=============================================================================
// BufferReadback
//=============================================================================

/// A buffer in the readback heap plus the sync point its last copy completes
/// at. `get_data` is only meaningful once [`BufferReadback::is_ready`].
pub struct BufferReadback {
    buffer: Handle<Buffer>,
    sync: Option<SyncPoint>,
    size: u64,
}

impl BufferReadback {
    pub fn new(device: &dyn Device, max_size: u64, name: &str) -> Option<Self> {
        let buffer = device.create_buffer(&BufferDesc::readback(max_size), name)?;
        Some(Self {
            buffer,
            sync: None,
            size: max_size,
        })
    }

    /// Record a GPU→CPU copy of `size` bytes from `src`.
    pub fn enqueue_copy(
        &mut self,
        context: &mut dyn TransferContext,
        src: &Handle<Buffer>,
        src_offset: u64,
        size: u64,
    ) -> bool {
        if size > self.size {
            log::warn!(
                "readback of {size} bytes exceeds readback buffer capacity {}",
                self.size
            );
            return false;
        }
        context.copy_buffer_region(self.buffer.id(), 0, src.id(), src_offset, size);
        // A new copy invalidates the previous completion point.
        self.sync = None;
        true
    }

    /// Attach the sync point of the submission carrying the copy.
    pub fn mark_submitted(&mut self, sync: SyncPoint) {
        self.sync = Some(sync);
    }

    pub fn is_ready(&self) -> bool {
        self.sync.as_ref().is_some_and(SyncPoint::is_complete)
    }

    pub fn wait(&self, timeout_ms: u64) -> bool {
        match &self.sync {
            Some(sync) => sync.wait_timeout(timeout_ms),
            None => false,
        }
    }

    pub fn get_data(&self, out: &mut [u8]) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.buffer.read_mapped(0, out)
    }

    pub fn read_typed<T: Pod>(&self) -> Option<T> {
        let mut value = T::zeroed();
        if self.get_data(bytemuck::bytes_of_mut(&mut value)) {
            Some(value)
        } else {
            None
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn buffer(&self) -> &Handle<Buffer> {
        &self.buffer
    }
}

//=============================================================================
// TextureReadback
//=============================================================================

/// Same pattern as [`BufferReadback`] with the row pitch of the source
/// subresource baked in.
pub struct TextureReadback {
    buffer: Handle<Buffer>,
    sync: Option<SyncPoint>,
    width: u32,
    height: u32,
    format: PixelFormat,
    row_pitch: u32,
}

impl TextureReadback {
    pub fn new(
        device: &dyn Device,
        width: u32,
        height: u32,
        format: PixelFormat,
        name: &str,
    ) -> Option<Self> {
        if format.is_block_compressed() {
            log::warn!("texture readback of block-compressed formats is not supported");
            return None;
        }
        let row_pitch =
            (width * format.bytes_per_pixel() + ROW_PITCH_ALIGNMENT - 1) & !(ROW_PITCH_ALIGNMENT - 1);
        let size = u64::from(row_pitch) * u64::from(height);
        let buffer = device.create_buffer(&BufferDesc::readback(size), name)?;
        Some(Self {
            buffer,
            sync: None,
            width,
            height,
            format,
            row_pitch,
        })
    }

    pub fn enqueue_copy(
        &mut self,
        context: &mut dyn TransferContext,
        src: &Handle<Texture>,
        mip_level: u32,
        array_slice: u32,
    ) {
        let subresource = src.desc().subresource_index(mip_level, array_slice);
        context.copy_texture_to_buffer(self.buffer.id(), 0, self.row_pitch, src.id(), subresource);
        self.sync = None;
    }

    pub fn mark_submitted(&mut self, sync: SyncPoint) {
        self.sync = Some(sync);
    }

    pub fn is_ready(&self) -> bool {
        self.sync.as_ref().is_some_and(SyncPoint::is_complete)
    }

    pub fn wait(&self, timeout_ms: u64) -> bool {
        match &self.sync {
            Some(sync) => sync.wait_timeout(timeout_ms),
            None => false,
        }
    }

    pub fn get_data(&self, out: &mut [u8]) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.buffer.read_mapped(0, out)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn row_pitch(&self) -> u32 {
        self.row_pitch
    }

    pub fn data_size(&self) -> u64 {
        u64::from(self.row_pitch) * u64::from(self.height)
    }

    pub fn buffer(&self) -> &Handle<Buffer> {
        &self.buffer
    }
}

//=============================================================================
// AsyncReadbackRing
//=============================================================================

/// Ring of N readback slots: writes go to the current slot, reads come from
/// the oldest, giving N-1 frames of latency and no CPU stall.
pub struct AsyncReadbackRing<T: Pod, const N: usize = 3> {
    slots: Vec<BufferReadback>,
    write_index: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Pod, const N: usize> AsyncReadbackRing<T, N> {
    pub fn new(device: &dyn Device, name: &str) -> Option<Self> {
        debug_assert!(N >= 2, "need at least 2 slots for async readback");
        let mut slots = Vec::with_capacity(N);
        for _ in 0..N {
            slots.push(BufferReadback::new(
                device,
                std::mem::size_of::<T>() as u64,
                name,
            )?);
        }
        Some(Self {
            slots,
            write_index: 0,
            _marker: std::marker::PhantomData,
        })
    }

    /// Record this frame's copy into the current slot and advance.
    pub fn enqueue_copy(
        &mut self,
        context: &mut dyn TransferContext,
        src: &Handle<Buffer>,
        src_offset: u64,
    ) {
        let size = std::mem::size_of::<T>() as u64;
        self.slots[self.write_index].enqueue_copy(context, src, src_offset, size);
        self.write_index = (self.write_index + 1) % N;
    }

    /// Attach the submission sync point to the slot just written.
    pub fn mark_submitted(&mut self, sync: SyncPoint) {
        let last = (self.write_index + N - 1) % N;
        self.slots[last].mark_submitted(sync);
    }

    /// Oldest slot's data: at least 1 and at most N-1 frames old.
    pub fn try_get_result(&self, out: &mut T) -> bool {
        let read_index = (self.write_index + 1) % N;
        let slot = &self.slots[read_index];
        if !slot.is_ready() {
            return false;
        }
        slot.get_data(bytemuck::bytes_of_mut(out))
    }

    /// Newest completed data, scanning backward from the last write.
    pub fn get_latest_or_default(&self, default: T) -> T {
        for age in 1..=N {
            let index = (self.write_index + N - age) % N;
            if self.slots[index].is_ready() {
                if let Some(value) = self.slots[index].read_typed::<T>() {
                    return value;
                }
            }
        }
        default
    }

    pub const fn latency() -> usize {
        N - 1
    }
}

//=============================================================================
// OcclusionQueryReadback
//=============================================================================

const OCCLUSION_READBACK_LATENCY: usize = 2;

struct OcclusionSlot {
    readback: BufferReadback,
    cached: Vec<u64>,
    cache_valid: bool,
}

/// Two-slot ring of sample-count readbacks: the far slot is read and cached
/// at frame end, queries are answered from the cache.
pub struct OcclusionQueryReadback {
    slots: Vec<OcclusionSlot>,
    current: usize,
    max_queries: u32,
}

impl OcclusionQueryReadback {
    pub fn new(device: &dyn Device, max_queries: u32) -> Option<Self> {
        let size = u64::from(max_queries) * 8;
        let mut slots = Vec::with_capacity(OCCLUSION_READBACK_LATENCY);
        for _ in 0..OCCLUSION_READBACK_LATENCY {
            slots.push(OcclusionSlot {
                readback: BufferReadback::new(device, size, "occlusion-readback")?,
                cached: vec![0; max_queries as usize],
                cache_valid: false,
            });
        }
        Some(Self {
            slots,
            current: 0,
            max_queries,
        })
    }

    /// Resolve `count` queries straight into the current slot's buffer.
    pub fn enqueue_readback(
        &mut self,
        context: &mut dyn TransferContext,
        query_heap: &Handle<QueryHeap>,
        start_query: u32,
        query_count: u32,
    ) {
        let slot = &mut self.slots[self.current];
        context.resolve_query_data(
            query_heap.id(),
            start_query,
            query_count.min(self.max_queries),
            slot.readback.buffer().id(),
            0,
        );
        slot.readback.sync = None;
    }

    pub fn mark_submitted(&mut self, sync: SyncPoint) {
        self.slots[self.current].readback.mark_submitted(sync);
    }

    /// Cache the far slot's results (if its fence landed) and rotate.
    pub fn on_frame_end(&mut self) {
        let read_index = (self.current + 1) % OCCLUSION_READBACK_LATENCY;
        let slot = &mut self.slots[read_index];
        if slot.readback.is_ready() {
            let mut bytes = vec![0u8; (self.max_queries * 8) as usize];
            if slot.readback.get_data(&mut bytes) {
                slot.cached.copy_from_slice(bytemuck::cast_slice(&bytes));
                slot.cache_valid = true;
            }
        }
        self.current = read_index;
    }

    /// Sample count of query `index` from the most recently cached frame,
    /// `None` while no resolved data exists yet.
    pub fn query_result(&self, index: u32) -> Option<u64> {
        if index >= self.max_queries {
            return None;
        }
        let slot = &self.slots[self.current];
        if !slot.cache_valid {
            return None;
        }
        Some(slot.cached[index as usize])
    }

    /// Visibility with the no-data-means-visible default.
    pub fn is_visible(&self, index: u32, sample_threshold: u64) -> bool {
        match self.query_result(index) {
            Some(samples) => samples >= sample_threshold,
            None => true,
        }
    }

    pub fn max_queries(&self) -> u32 {
        self.max_queries
    }
}

//=============================================================================
// ScreenCapture
//=============================================================================

pub struct CapturedImage {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub row_pitch: u32,
    pub data: Vec<u8>,
}

type CaptureCallback = Box<dyn FnOnce(CapturedImage) + Send>;

/// Lazily sized backbuffer readback. Encoding to an image file format is the
/// caller's business; this hands out raw rows.
pub struct ScreenCapture {
    device: Arc<dyn Device>,
    readback: Option<TextureReadback>,
    in_flight: bool,
    callback: Option<CaptureCallback>,
}

impl ScreenCapture {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            readback: None,
            in_flight: false,
            callback: None,
        }
    }

    /// Record a capture of `backbuffer` mip 0.
    pub fn capture(&mut self, context: &mut dyn TransferContext, backbuffer: &Handle<Texture>) -> bool {
        if self.in_flight {
            log::warn!("screen capture already in flight; request dropped");
            return false;
        }
        let desc = *backbuffer.desc();
        let needs_recreate = self.readback.as_ref().map_or(true, |r| {
            r.width() != desc.width || r.height() != desc.height || r.format() != desc.format
        });
        if needs_recreate {
            self.readback = TextureReadback::new(
                self.device.as_ref(),
                desc.width,
                desc.height,
                desc.format,
                "screen-capture",
            );
            if self.readback.is_none() {
                return false;
            }
        }
        self.readback
            .as_mut()
            .expect("readback allocated above")
            .enqueue_copy(context, backbuffer, 0, 0);
        self.in_flight = true;
        true
    }

    /// Capture with a completion callback, fired from
    /// [`ScreenCapture::try_retrieve`].
    pub fn capture_async(
        &mut self,
        context: &mut dyn TransferContext,
        backbuffer: &Handle<Texture>,
        callback: CaptureCallback,
    ) -> bool {
        if !self.capture(context, backbuffer) {
            return false;
        }
        self.callback = Some(callback);
        true
    }

    pub fn mark_submitted(&mut self, sync: SyncPoint) {
        if let Some(readback) = self.readback.as_mut() {
            readback.mark_submitted(sync);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.in_flight && self.readback.as_ref().is_some_and(TextureReadback::is_ready)
    }

    /// Pull the finished image out, invoking the async callback if one was
    /// registered.
    pub fn try_retrieve(&mut self) -> Option<CapturedImage> {
        if !self.is_ready() {
            return None;
        }
        let readback = self.readback.as_ref().expect("in flight implies readback");
        let mut data = vec![0u8; readback.data_size() as usize];
        if !readback.get_data(&mut data) {
            return None;
        }
        self.in_flight = false;
        let image = CapturedImage {
            width: readback.width(),
            height: readback.height(),
            format: readback.format(),
            row_pitch: readback.row_pitch(),
            data,
        };
        if let Some(callback) = self.callback.take() {
            let clone = CapturedImage {
                width: image.width,
                height: image.height,
                format: image.format,
                row_pitch: image.row_pitch,
                data: image.data.clone(),
            };
            callback(clone);
        }
        Some(image)
    }
}
