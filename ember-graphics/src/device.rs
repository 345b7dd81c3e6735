//! The device boundary.
//!
//! The core never talks to a native API; it asks the [`Device`] for
//! resources, queues and contexts, and records through the context traits.
//! Backends implement this trait; the core and its tests consume it.

use std::sync::Arc;

use crate::query::{QueryHeap, QueryHeapDesc};
use crate::queue::{CommandAllocator, Queue, TransferContext};
use crate::resource::{Buffer, DeferredDeleteQueue, Handle, Texture};
use crate::sync::{Fence, FenceDesc};
use crate::{BufferDesc, PixelFormat, QueueType, ResourceId, TextureDesc};

/// Invoked once when a wait timeout or backend fault marks the device lost.
/// The argument describes the trigger. Implementations typically capture a
/// crash dump and retrieve queue breadcrumbs.
pub type DeviceLostCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Factory and ownership root for everything the core builds on.
pub trait Device: Send + Sync {
    //=====================================================================
    // Factories
    //=====================================================================

    fn create_buffer(&self, desc: &BufferDesc, name: &str) -> Option<Handle<Buffer>>;
    fn create_texture(&self, desc: &TextureDesc, name: &str) -> Option<Handle<Texture>>;
    fn create_fence(&self, desc: &FenceDesc, name: &str) -> Option<Handle<Fence>>;
    fn create_query_heap(&self, desc: &QueryHeapDesc, name: &str) -> Option<Handle<QueryHeap>>;
    fn create_command_allocator(&self, queue_type: QueueType) -> Option<Handle<CommandAllocator>>;

    //=====================================================================
    // Queues & contexts
    //=====================================================================

    fn graphics_queue(&self) -> Arc<dyn Queue>;

    fn compute_queue(&self) -> Option<Arc<dyn Queue>> {
        None
    }

    fn copy_queue(&self) -> Option<Arc<dyn Queue>> {
        None
    }

    /// Obtain a recording surface for `queue_type`. Returned to the device
    /// through [`Device::execute_context`].
    fn obtain_transfer_context(&self, queue_type: QueueType) -> Option<Box<dyn TransferContext>>;

    /// Close and submit a context on the matching queue.
    fn execute_context(&self, context: Box<dyn TransferContext>);

    //=====================================================================
    // Lifetime
    //=====================================================================

    fn deferred_delete_queue(&self) -> &Arc<DeferredDeleteQueue>;

    /// Block until every queue is drained.
    fn wait_idle(&self);

    //=====================================================================
    // Residency & streaming hooks
    //=====================================================================

    /// Bring an evicted resource back into GPU memory.
    fn make_resident(&self, resource: ResourceId) -> bool {
        log::trace!("make_resident #{resource} (no backend action)");
        true
    }

    /// Demote a resource out of GPU memory, keeping its handle alive.
    fn evict(&self, resource: ResourceId) {
        log::trace!("evict #{resource} (no backend action)");
    }

    /// Kick a streaming request toward `level` for a streamable texture.
    fn request_stream_level(&self, resource: ResourceId, level: u32) {
        log::trace!("stream request #{resource} -> level {level} (no backend action)");
    }

    /// Record a compute mip-chain generation pass. Backend-provided.
    fn generate_mipmaps(&self, _context: &mut dyn TransferContext, texture: &Handle<Texture>) {
        log::trace!("generate_mipmaps for #{} skipped (no backend pass)", texture.id());
    }

    //=====================================================================
    // Format boundary
    //=====================================================================

    /// Numeric native format. The default numbering is the portable
    /// fallback; real backends map to their API's format enum.
    fn to_native_format(&self, format: PixelFormat) -> u32 {
        portable_format_index(format)
    }

    fn from_native_format(&self, native: u32) -> Option<PixelFormat> {
        PORTABLE_FORMAT_TABLE
            .iter()
            .find(|(_, index)| *index == native)
            .map(|(format, _)| *format)
    }
}

const PORTABLE_FORMAT_TABLE: &[(PixelFormat, u32)] = &[
    (PixelFormat::Rgba8Unorm, 1),
    (PixelFormat::Rgba8UnormSrgb, 2),
    (PixelFormat::Bgra8Unorm, 3),
    (PixelFormat::R8Unorm, 4),
    (PixelFormat::Rg8Unorm, 5),
    (PixelFormat::R16Float, 6),
    (PixelFormat::Rg16Float, 7),
    (PixelFormat::Rgba16Float, 8),
    (PixelFormat::R32Float, 9),
    (PixelFormat::Rg32Float, 10),
    (PixelFormat::Rgba32Float, 11),
    (PixelFormat::R32Uint, 12),
    (PixelFormat::Rgb10a2Unorm, 13),
    (PixelFormat::Depth32Float, 14),
    (PixelFormat::Bc1Unorm, 15),
    (PixelFormat::Bc1UnormSrgb, 16),
    (PixelFormat::Bc3Unorm, 17),
    (PixelFormat::Bc3UnormSrgb, 18),
    (PixelFormat::Bc7Unorm, 19),
];

fn portable_format_index(format: PixelFormat) -> u32 {
    PORTABLE_FORMAT_TABLE
        .iter()
        .find(|(f, _)| *f == format)
        .map(|(_, index)| *index)
        .unwrap_or(0)
}

//=============================================================================
// Test support
//=============================================================================


//=============================================================================
// Swap chain boundary
//=============================================================================

/// Presentation surface, consumed at its interface only.
pub trait SwapChain: Send + Sync {
    fn backbuffer_count(&self) -> u32;
    fn current_backbuffer_index(&self) -> u32;
    fn current_backbuffer(&self) -> Handle<Texture>;
    fn format(&self) -> PixelFormat;

    /// Flip. Returns false when the surface is lost and must be resized or
    /// recreated.
    fn present(&self) -> bool;

    fn resize(&self, width: u32, height: u32) -> bool;
}
