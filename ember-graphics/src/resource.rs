//! Resource identity, intrusive reference counting and deferred deletion.
//!
//! Every GPU object embeds a [`ResourceHeader`] carrying its kind tag, a
//! process-unique id, the atomic refcount and the debug name. Ownership is
//! expressed through [`Handle`], which releases the object when the last
//! reference drops — either destroying it immediately or parking it on the
//! device's [`DeferredDeleteQueue`] until the GPU has retired the frame that
//! last used it.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::{BufferDesc, HeapType, ResourceId, ResourceKind, TextureDesc, ROW_PITCH_ALIGNMENT};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

fn generate_resource_id() -> ResourceId {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

//=============================================================================
// ResourceHeader
//=============================================================================

/// Shared base state embedded in every resource.
pub struct ResourceHeader {
    kind: ResourceKind,
    id: ResourceId,
    refs: AtomicU32,
    pending_delete: AtomicBool,
    debug_name: Mutex<String>,
    deferred_queue: Mutex<Option<Arc<DeferredDeleteQueue>>>,
}

impl ResourceHeader {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            id: generate_resource_id(),
            refs: AtomicU32::new(1),
            pending_delete: AtomicBool::new(false),
            debug_name: Mutex::new(String::new()),
            deferred_queue: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Increment the refcount. Returns the new count.
    pub fn add_ref(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrement the refcount. Returns the new count; when it returns 0 the
    /// caller owns the object and must finalize it. Acquire-release ordering
    /// makes the zero observation unique across threads.
    pub fn release(&self) -> u32 {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "release() on a dead resource");
        prev - 1
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }

    pub fn set_debug_name(&self, name: &str) {
        *self.debug_name.lock().unwrap() = name.to_string();
    }

    pub fn debug_name(&self) -> String {
        self.debug_name.lock().unwrap().clone()
    }

    pub fn has_debug_name(&self) -> bool {
        !self.debug_name.lock().unwrap().is_empty()
    }

    /// Route the final release through `queue` instead of destroying
    /// immediately. The object is retired at the queue's current fence value.
    pub fn mark_for_deferred_delete(&self, queue: &Arc<DeferredDeleteQueue>) {
        *self.deferred_queue.lock().unwrap() = Some(Arc::clone(queue));
        self.pending_delete.store(true, Ordering::Release);
    }

    pub fn is_pending_delete(&self) -> bool {
        self.pending_delete.load(Ordering::Acquire)
    }

    fn take_deferred_queue(&self) -> Option<Arc<DeferredDeleteQueue>> {
        self.deferred_queue.lock().unwrap().take()
    }
}

impl fmt::Debug for ResourceHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHeader")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("refs", &self.ref_count())
            .finish()
    }
}

//=============================================================================
// Resource traits
//=============================================================================

/// Implemented by every refcounted GPU object.
pub trait Resource: Send + Sync + 'static {
    fn header(&self) -> &ResourceHeader;
}

/// A resource kind with exactly one concrete Rust type behind it. This 1:1
/// mapping is what makes [`cast`] sound without RTTI.
pub trait TypedResource: Resource + Sized {
    const KIND: ResourceKind;
}

/// Tag-checked downcast from an erased resource reference.
pub fn cast<T: TypedResource>(resource: &dyn Resource) -> Option<&T> {
    if resource.header().kind() == T::KIND {
        // One concrete type per kind, so the erased object is a T.
        Some(unsafe { &*(resource as *const dyn Resource as *const T) })
    } else {
        None
    }
}

//=============================================================================
// Handle
//=============================================================================

/// Owning smart reference to a refcounted resource.
///
/// Cloning adds a reference, dropping releases one; the object is destroyed
/// (or deferred) exactly when the count reaches zero. Equality is pointer
/// identity.
pub struct Handle<T: Resource> {
    ptr: NonNull<T>,
}

// The pointee is heap-allocated and `Resource: Send + Sync`.
unsafe impl<T: Resource> Send for Handle<T> {}
unsafe impl<T: Resource> Sync for Handle<T> {}

impl<T: Resource> Handle<T> {
    /// Box `value` and take ownership of its initial reference.
    pub fn new(value: T) -> Self {
        debug_assert_eq!(value.header().ref_count(), 1);
        let ptr = Box::into_raw(Box::new(value));
        Self {
            ptr: unsafe { NonNull::new_unchecked(ptr) },
        }
    }

    /// Adopt an already-counted pointer without incrementing (factory output
    /// or a pointer previously produced by [`Handle::detach`]).
    ///
    /// # Safety
    /// `ptr` must originate from `Handle::detach`/`Box::into_raw` of the same
    /// type and carry a reference this handle is allowed to consume.
    pub unsafe fn adopt(ptr: *mut T) -> Self {
        Self {
            ptr: NonNull::new_unchecked(ptr),
        }
    }

    /// Release ownership without touching the refcount.
    pub fn detach(self) -> *mut T {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }

    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    pub fn id(&self) -> ResourceId {
        self.header().id()
    }

    pub fn ref_count(&self) -> u32 {
        self.header().ref_count()
    }

    /// Same pointee?
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: Resource> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Resource> Clone for Handle<T> {
    fn clone(&self) -> Self {
        self.header().add_ref();
        Self { ptr: self.ptr }
    }
}

impl<T: Resource> Drop for Handle<T> {
    fn drop(&mut self) {
        if self.header().release() == 0 {
            unsafe { finalize(self.ptr) };
        }
    }
}

impl<T: Resource> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: Resource> Eq for Handle<T> {}

impl<T: Resource> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handle<{}>#{}",
            self.header().kind().name(),
            self.header().id()
        )
    }
}

/// Runs with the unique zero-refcount observation: either destroys the
/// object now or parks it on its deferred-delete queue.
unsafe fn finalize<T: Resource>(ptr: NonNull<T>) {
    let boxed: Box<T> = Box::from_raw(ptr.as_ptr());
    if boxed.header().is_pending_delete() {
        if let Some(queue) = boxed.header().take_deferred_queue() {
            queue.park(boxed);
            return;
        }
    }
    drop(boxed);
}

//=============================================================================
// DeferredDeleteQueue
//=============================================================================

struct ParkedResource {
    object: Box<dyn Resource>,
    retire_at: u64,
}

/// Holds resources whose final reference dropped while the GPU may still be
/// reading them. Owned by the device and drained once per frame against the
/// frame fence's completed value.
pub struct DeferredDeleteQueue {
    retire_value: AtomicU64,
    parked: Mutex<Vec<ParkedResource>>,
}

impl DeferredDeleteQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            retire_value: AtomicU64::new(0),
            parked: Mutex::new(Vec::new()),
        })
    }

    /// Fence value newly parked resources must outlive. Updated by the device
    /// at frame end.
    pub fn set_retire_value(&self, value: u64) {
        self.retire_value.store(value, Ordering::Release);
    }

    pub fn retire_value(&self) -> u64 {
        self.retire_value.load(Ordering::Acquire)
    }

    fn park<T: Resource>(&self, object: Box<T>) {
        let retire_at = self.retire_value();
        log::trace!(
            "deferring delete of {} #{} until fence value {}",
            object.header().kind().name(),
            object.header().id(),
            retire_at
        );
        self.parked.lock().unwrap().push(ParkedResource {
            object,
            retire_at,
        });
    }

    /// Destroy every parked resource whose retire value has completed.
    /// Returns how many were destroyed.
    pub fn drain_completed(&self, completed_value: u64) -> usize {
        let mut parked = self.parked.lock().unwrap();
        let before = parked.len();
        parked.retain(|p| {
            if p.retire_at > completed_value {
                return true;
            }
            log::trace!(
                "destroying deferred {} #{}",
                p.object.header().kind().name(),
                p.object.header().id()
            );
            false
        });
        before - parked.len()
    }

    /// Destroy everything regardless of fence progress (device teardown).
    pub fn flush_all(&self) -> usize {
        let mut parked = self.parked.lock().unwrap();
        let count = parked.len();
        parked.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.parked.lock().unwrap().len()
    }
}

//=============================================================================
// Mapped storage
//=============================================================================

/// Persistently mapped CPU bytes of an upload/readback buffer.
///
/// Writes happen through raw pointers handed out by the allocators; the
/// frame-retention discipline of those allocators guarantees no two writers
/// alias a region while the GPU reads it.
pub(crate) struct MappedStorage {
    bytes: Box<[UnsafeCell<u8>]>,
}

unsafe impl Send for MappedStorage {}
unsafe impl Sync for MappedStorage {}

impl MappedStorage {
    fn zeroed(size: usize) -> Self {
        let mut v = Vec::with_capacity(size);
        v.resize_with(size, || UnsafeCell::new(0));
        Self {
            bytes: v.into_boxed_slice(),
        }
    }

    pub fn ptr(&self) -> *mut u8 {
        self.bytes.as_ptr() as *mut u8
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

//=============================================================================
// Buffer
//=============================================================================

/// A linear GPU allocation. Upload/readback buffers are persistently mapped
/// and expose a CPU pointer; device-local buffers do not.
pub struct Buffer {
    header: ResourceHeader,
    desc: BufferDesc,
    gpu_address: u64,
    native: AtomicU64,
    mapped: Option<MappedStorage>,
}

impl Buffer {
    pub fn new(desc: BufferDesc, gpu_address: u64, name: &str) -> Handle<Buffer> {
        let mapped = match desc.heap_type {
            HeapType::Default => None,
            HeapType::Upload | HeapType::Readback => Some(MappedStorage::zeroed(desc.size as usize)),
        };
        let buffer = Self {
            header: ResourceHeader::new(ResourceKind::Buffer),
            desc,
            gpu_address,
            native: AtomicU64::new(0),
            mapped,
        };
        if !name.is_empty() {
            buffer.header.set_debug_name(name);
        }
        Handle::new(buffer)
    }

    pub fn id(&self) -> crate::ResourceId {
        self.header.id()
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn size(&self) -> u64 {
        self.desc.size
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// CPU pointer to the mapped range, null for device-local buffers.
    pub fn mapped_ptr(&self) -> *mut u8 {
        self.mapped
            .as_ref()
            .map_or(std::ptr::null_mut(), MappedStorage::ptr)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Backend object behind this buffer (opaque to the core).
    pub fn native(&self) -> u64 {
        self.native.load(Ordering::Acquire)
    }

    pub fn set_native(&self, value: u64) {
        self.native.store(value, Ordering::Release);
    }

    /// Read mapped bytes out (readback path).
    ///
    /// Returns false if the buffer is not mapped or the range is out of
    /// bounds.
    pub fn read_mapped(&self, offset: u64, out: &mut [u8]) -> bool {
        let Some(mapped) = self.mapped.as_ref() else {
            return false;
        };
        let end = offset as usize + out.len();
        if end > mapped.len() {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapped.ptr().add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        true
    }

    /// Write bytes into the mapped range (staging path).
    pub fn write_mapped(&self, offset: u64, data: &[u8]) -> bool {
        let Some(mapped) = self.mapped.as_ref() else {
            return false;
        };
        let end = offset as usize + data.len();
        if end > mapped.len() {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.ptr().add(offset as usize), data.len());
        }
        true
    }
}

impl Resource for Buffer {
    fn header(&self) -> &ResourceHeader {
        &self.header
    }
}

impl TypedResource for Buffer {
    const KIND: ResourceKind = ResourceKind::Buffer;
}

//=============================================================================
// Texture
//=============================================================================

pub struct Texture {
    header: ResourceHeader,
    desc: TextureDesc,
    native: AtomicU64,
}

impl Texture {
    pub fn new(desc: TextureDesc, name: &str) -> Handle<Texture> {
        let texture = Self {
            header: ResourceHeader::new(ResourceKind::Texture),
            desc,
            native: AtomicU64::new(0),
        };
        if !name.is_empty() {
            texture.header.set_debug_name(name);
        }
        Handle::new(texture)
    }

    pub fn id(&self) -> crate::ResourceId {
        self.header.id()
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn subresource_count(&self) -> u32 {
        self.desc.subresource_count()
    }

    /// Row pitch of mip 0 when staged for copy, honoring the 256-byte rule.
    pub fn aligned_row_pitch(&self) -> u32 {
        let tight = self.desc.width * self.desc.format.bytes_per_pixel();
        (tight + ROW_PITCH_ALIGNMENT - 1) & !(ROW_PITCH_ALIGNMENT - 1)
    }

    /// Conservative per-layer byte size when staged for copy.
    pub fn slice_pitch(&self) -> u32 {
        self.aligned_row_pitch() * self.desc.height
    }

    pub fn native(&self) -> u64 {
        self.native.load(Ordering::Acquire)
    }

    pub fn set_native(&self, value: u64) {
        self.native.store(value, Ordering::Release);
    }
}

impl Resource for Texture {
    fn header(&self) -> &ResourceHeader {
        &self.header
    }
}

impl TypedResource for Texture {
    const KIND: ResourceKind = ResourceKind::Texture;
}
