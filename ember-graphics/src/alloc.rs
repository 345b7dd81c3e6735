//! CPU→GPU buffer sub-allocation.
//!
//! None of these allocators are internally synchronized: every mutating API
//! takes `&mut self`, so thread confinement is enforced by the type system
//! rather than by convention. One allocator instance per thread, or external
//! mutual exclusion.

use std::sync::Arc;

use bytemuck::Pod;

use crate::device::Device;
use crate::resource::{Buffer, Handle};
use crate::{BufferDesc, BufferUsage, HeapType, ResourceId, CONSTANT_BUFFER_ALIGNMENT};

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

//=============================================================================
// BufferAllocation
//=============================================================================

/// A span handed out by an allocator. Only upload-heap allocators produce a
/// non-null CPU pointer. Allocation failure is an invalid span: callers must
/// check [`BufferAllocation::is_valid`].
#[derive(Clone, Default)]
pub struct BufferAllocation {
    pub buffer: Option<Handle<Buffer>>,
    pub offset: u64,
    pub size: u64,
    pub gpu_address: u64,
    cpu_ptr: *mut u8,
}

// The CPU pointer targets the backing buffer's mapped storage, which is
// Send + Sync; exclusivity of the span is the allocator's contract.
unsafe impl Send for BufferAllocation {}
unsafe impl Sync for BufferAllocation {}

impl BufferAllocation {
    pub fn invalid() -> Self {
        Self::default()
    }

    pub(crate) fn new(buffer: &Handle<Buffer>, offset: u64, size: u64) -> Self {
        let cpu_ptr = buffer.mapped_ptr();
        Self {
            gpu_address: buffer.gpu_address() + offset,
            cpu_ptr: if cpu_ptr.is_null() {
                cpu_ptr
            } else {
                unsafe { cpu_ptr.add(offset as usize) }
            },
            buffer: Some(buffer.clone()),
            offset,
            size,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.buffer.is_some() && self.size > 0
    }

    pub fn buffer_id(&self) -> ResourceId {
        self.buffer.as_ref().map_or(0, |b| b.id())
    }

    /// Writable staging pointer; null for device-local spans.
    pub fn cpu_ptr(&self) -> *mut u8 {
        self.cpu_ptr
    }

    pub fn write_bytes(&self, data: &[u8]) -> bool {
        self.write_bytes_at(0, data)
    }

    pub fn write_bytes_at(&self, offset: u64, data: &[u8]) -> bool {
        if self.cpu_ptr.is_null() || offset + data.len() as u64 > self.size {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.cpu_ptr.add(offset as usize),
                data.len(),
            );
        }
        true
    }

    pub fn write<T: Pod>(&self, value: &T) -> bool {
        self.write_bytes(bytemuck::bytes_of(value))
    }

    pub fn write_slice<T: Pod>(&self, values: &[T]) -> bool {
        self.write_bytes(bytemuck::cast_slice(values))
    }
}

impl std::fmt::Debug for BufferAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocation")
            .field("buffer", &self.buffer_id())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

//=============================================================================
// LinearBufferAllocator
//=============================================================================

/// Bump allocator over one backing buffer; the whole arena is released at
/// once by [`LinearBufferAllocator::reset`].
pub struct LinearBufferAllocator {
    buffer: Handle<Buffer>,
    total_size: u64,
    offset: u64,
}

impl LinearBufferAllocator {
    pub fn new(device: &dyn Device, size: u64, heap_type: HeapType) -> Option<Self> {
        let desc = BufferDesc {
            size,
            heap_type,
            usage: BufferUsage::COPY_SRC,
        };
        let buffer = device.create_buffer(&desc, "linear-allocator")?;
        Some(Self {
            buffer,
            total_size: size,
            offset: 0,
        })
    }

    pub fn allocate(&mut self, size: u64, alignment: u64) -> BufferAllocation {
        let alignment = alignment.max(1);
        let aligned = align_up(self.offset, alignment);
        if aligned + size > self.total_size {
            return BufferAllocation::invalid();
        }
        self.offset = aligned + size;
        BufferAllocation::new(&self.buffer, aligned, size)
    }

    pub fn allocate_typed<T: Pod>(&mut self, count: u32) -> BufferAllocation {
        self.allocate(
            std::mem::size_of::<T>() as u64 * u64::from(count),
            std::mem::align_of::<T>() as u64,
        )
    }

    /// Release the whole arena (frame end).
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    pub fn used_size(&self) -> u64 {
        self.offset
    }

    pub fn remaining_size(&self) -> u64 {
        self.total_size - self.offset
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn buffer(&self) -> &Handle<Buffer> {
        &self.buffer
    }
}

//=============================================================================
// RingBufferAllocator
//=============================================================================

#[derive(Clone, Copy, Default)]
struct FrameMark {
    /// 0 marks a free slot; real frame numbers start at 1.
    frame_number: u64,
    offset: u64,
}

/// Multi-frame ring: allocations for frame F stay untouched until the frame
/// fence reports F complete.
pub struct RingBufferAllocator {
    buffer: Handle<Buffer>,
    total_size: u64,
    head: u64,
    tail: u64,
    frames: Vec<FrameMark>,
    current_frame: usize,
}

impl RingBufferAllocator {
    pub fn new(device: &dyn Device, size: u64, num_frames: u32, heap_type: HeapType) -> Option<Self> {
        let desc = BufferDesc {
            size,
            heap_type,
            usage: BufferUsage::COPY_SRC,
        };
        let buffer = device.create_buffer(&desc, "ring-allocator")?;
        Some(Self {
            buffer,
            total_size: size,
            head: 0,
            tail: 0,
            frames: vec![FrameMark::default(); num_frames.max(1) as usize],
            current_frame: 0,
        })
    }

    /// Release the marks of frames the GPU has completed and pull the tail
    /// up to the oldest still-active mark.
    pub fn begin_frame(&mut self, frame_index: u32, completed_frame: u64) {
        self.current_frame = frame_index as usize % self.frames.len();

        for mark in &mut self.frames {
            if mark.frame_number > 0 && mark.frame_number <= completed_frame {
                mark.frame_number = 0;
            }
        }

        let mut oldest = self.head;
        let mut found_active = false;
        for mark in &self.frames {
            if mark.frame_number > 0 && (!found_active || mark.offset < oldest) {
                oldest = mark.offset;
                found_active = true;
            }
        }
        self.tail = if found_active { oldest } else { self.head };
    }

    /// Stamp the current slot with `frame_number` (must be > 0) at the
    /// current head.
    pub fn end_frame(&mut self, frame_number: u64) {
        debug_assert!(frame_number > 0, "frame numbers start at 1");
        self.frames[self.current_frame] = FrameMark {
            frame_number,
            offset: self.head,
        };
    }

    /// Wraps past the end of the buffer; fails when wrapping would run into
    /// the tail of a frame still in flight.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> BufferAllocation {
        let alignment = alignment.max(1);
        let mut aligned_head = align_up(self.head, alignment);

        if aligned_head + size > self.total_size {
            aligned_head = 0;
            if aligned_head + size > self.tail {
                return BufferAllocation::invalid();
            }
        } else if self.head < self.tail && aligned_head + size > self.tail {
            return BufferAllocation::invalid();
        }

        self.head = aligned_head + size;
        BufferAllocation::new(&self.buffer, aligned_head, size)
    }

    pub fn allocate_typed<T: Pod>(&mut self, count: u32) -> BufferAllocation {
        self.allocate(
            std::mem::size_of::<T>() as u64 * u64::from(count),
            std::mem::align_of::<T>() as u64,
        )
    }

    pub fn used_size(&self) -> u64 {
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            self.total_size - self.tail + self.head
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn buffer(&self) -> &Handle<Buffer> {
        &self.buffer
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }
}

//=============================================================================
// BufferPool
//=============================================================================

#[derive(Clone, Copy, Debug)]
pub struct BufferPoolConfig {
    pub block_size: u64,
    pub initial_block_count: u32,
    /// 0 means unlimited.
    pub max_block_count: u32,
    pub heap_type: HeapType,
    pub usage: BufferUsage,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            block_size: 0,
            initial_block_count: 16,
            max_block_count: 0,
            heap_type: HeapType::Default,
            usage: BufferUsage::empty(),
        }
    }
}

/// Fixed-size blocks with a free list.
pub struct BufferPool {
    device: Arc<dyn Device>,
    config: BufferPoolConfig,
    free: Vec<Handle<Buffer>>,
    total_count: u32,
}

impl BufferPool {
    pub fn new(device: Arc<dyn Device>, config: BufferPoolConfig) -> Self {
        let mut pool = Self {
            device,
            config,
            free: Vec::with_capacity(config.initial_block_count as usize),
            total_count: 0,
        };
        for _ in 0..config.initial_block_count {
            if let Some(buffer) = pool.create_block() {
                pool.free.push(buffer);
            }
        }
        pool
    }

    pub fn acquire(&mut self) -> Option<Handle<Buffer>> {
        if let Some(buffer) = self.free.pop() {
            return Some(buffer);
        }
        if self.config.max_block_count > 0 && self.total_count >= self.config.max_block_count {
            return None;
        }
        self.create_block()
    }

    pub fn release(&mut self, buffer: Handle<Buffer>) {
        debug_assert_eq!(buffer.size(), self.config.block_size);
        self.free.push(buffer);
    }

    pub fn block_size(&self) -> u64 {
        self.config.block_size
    }

    pub fn available_count(&self) -> u32 {
        self.free.len() as u32
    }

    pub fn total_count(&self) -> u32 {
        self.total_count
    }

    fn create_block(&mut self) -> Option<Handle<Buffer>> {
        let desc = BufferDesc {
            size: self.config.block_size,
            heap_type: self.config.heap_type,
            usage: self.config.usage,
        };
        let buffer = self.device.create_buffer(&desc, "pool-block")?;
        self.total_count += 1;
        Some(buffer)
    }
}

//=============================================================================
// MultiSizeBufferPool
//=============================================================================

/// Ordered set of pools with distinct block sizes. Not thread-safe.
pub struct MultiSizeBufferPool {
    pools: Vec<BufferPool>,
}

impl MultiSizeBufferPool {
    pub fn new(device: Arc<dyn Device>, sizes: &[u64], heap_type: HeapType) -> Self {
        let mut sorted: Vec<u64> = sizes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let pools = sorted
            .into_iter()
            .map(|block_size| {
                BufferPool::new(
                    Arc::clone(&device),
                    BufferPoolConfig {
                        block_size,
                        initial_block_count: 4,
                        heap_type,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self { pools }
    }

    /// Smallest pool whose blocks fit `min_size`.
    pub fn acquire(&mut self, min_size: u64) -> Option<Handle<Buffer>> {
        self.pools
            .iter_mut()
            .find(|pool| pool.block_size() >= min_size)
            .and_then(BufferPool::acquire)
    }

    /// Route back by exact block size; unknown sizes just drop the handle.
    pub fn release(&mut self, buffer: Handle<Buffer>) {
        let size = buffer.size();
        match self.pools.iter_mut().find(|pool| pool.block_size() == size) {
            Some(pool) => pool.release(buffer),
            None => {
                log::warn!("released buffer of size {size} does not match any pool; dropping");
            }
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

//=============================================================================
// ConstantBufferAllocator
//=============================================================================

/// Triple-buffered ring with the 256-byte constant-buffer alignment forced
/// on every span.
pub struct ConstantBufferAllocator {
    ring: RingBufferAllocator,
    current_frame_index: u32,
}

impl ConstantBufferAllocator {
    pub fn new(device: &dyn Device, size: u64) -> Option<Self> {
        Some(Self {
            ring: RingBufferAllocator::new(device, size, 3, HeapType::Upload)?,
            current_frame_index: 0,
        })
    }

    pub fn begin_frame(&mut self, frame_index: u32) {
        self.current_frame_index = frame_index;
        self.ring
            .begin_frame(frame_index, u64::from(frame_index.saturating_sub(1)));
    }

    pub fn end_frame(&mut self) {
        self.ring.end_frame(u64::from(self.current_frame_index).max(1));
    }

    /// Size is rounded up to the constant-buffer alignment.
    pub fn allocate(&mut self, size: u64) -> BufferAllocation {
        let aligned_size = align_up(size, CONSTANT_BUFFER_ALIGNMENT);
        self.ring.allocate(aligned_size, CONSTANT_BUFFER_ALIGNMENT)
    }

    pub fn allocate_typed<T: Pod>(&mut self) -> BufferAllocation {
        self.allocate(std::mem::size_of::<T>() as u64)
    }

    pub fn allocate_and_write<T: Pod>(&mut self, value: &T) -> BufferAllocation {
        let allocation = self.allocate_typed::<T>();
        if allocation.is_valid() {
            allocation.write(value);
        }
        allocation
    }

    pub fn buffer(&self) -> &Handle<Buffer> {
        self.ring.buffer()
    }
}

//=============================================================================
// DynamicBufferManager
//=============================================================================

const DEFAULT_UPLOAD_SIZE: u64 = 64 * 1024 * 1024;
const DEFAULT_CONSTANT_SIZE: u64 = 16 * 1024 * 1024;

/// Per-frame transient data: an upload ring for vertex/index scratch plus a
/// constant-buffer ring, advanced together.
pub struct DynamicBufferManager {
    upload: RingBufferAllocator,
    constant: ConstantBufferAllocator,
}

impl DynamicBufferManager {
    pub fn new(device: &dyn Device) -> Option<Self> {
        Self::with_sizes(device, DEFAULT_UPLOAD_SIZE, DEFAULT_CONSTANT_SIZE)
    }

    pub fn with_sizes(device: &dyn Device, upload_size: u64, constant_size: u64) -> Option<Self> {
        Some(Self {
            upload: RingBufferAllocator::new(device, upload_size, 3, HeapType::Upload)?,
            constant: ConstantBufferAllocator::new(device, constant_size)?,
        })
    }

    pub fn begin_frame(&mut self, frame_index: u32, completed_frame: u64) {
        self.upload.begin_frame(frame_index, completed_frame);
        self.constant.begin_frame(frame_index);
    }

    pub fn end_frame(&mut self, frame_number: u64) {
        self.upload.end_frame(frame_number);
        self.constant.end_frame();
    }

    pub fn allocate_upload(&mut self, size: u64, alignment: u64) -> BufferAllocation {
        self.upload.allocate(size, alignment)
    }

    pub fn allocate_constant(&mut self, size: u64) -> BufferAllocation {
        self.constant.allocate(size)
    }

    pub fn allocate_constant_data<T: Pod>(&mut self, value: &T) -> BufferAllocation {
        self.constant.allocate_and_write(value)
    }

    pub fn allocate_vertices<T: Pod>(&mut self, vertices: &[T]) -> BufferAllocation {
        let allocation = self.upload.allocate(
            std::mem::size_of_val(vertices) as u64,
            std::mem::align_of::<T>() as u64,
        );
        if allocation.is_valid() {
            allocation.write_slice(vertices);
        }
        allocation
    }

    pub fn allocate_indices_u16(&mut self, indices: &[u16]) -> BufferAllocation {
        let allocation = self
            .upload
            .allocate(std::mem::size_of_val(indices) as u64, 2);
        if allocation.is_valid() {
            allocation.write_slice(indices);
        }
        allocation
    }

    pub fn allocate_indices_u32(&mut self, indices: &[u32]) -> BufferAllocation {
        let allocation = self
            .upload
            .allocate(std::mem::size_of_val(indices) as u64, 4);
        if allocation.is_valid() {
            allocation.write_slice(indices);
        }
        allocation
    }

    pub fn upload_allocator(&mut self) -> &mut RingBufferAllocator {
        &mut self.upload
    }

    pub fn constant_allocator(&mut self) -> &mut ConstantBufferAllocator {
        &mut self.constant
    }
}
