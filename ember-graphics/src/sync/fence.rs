//! Monotonic GPU timeline fence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use super::{deadline_after, remaining, Event};
use crate::queue::Queue;
use crate::resource::{Handle, Resource, ResourceHeader, TypedResource};
use crate::ResourceKind;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct FenceFlags: u32 {
        /// Shareable across processes.
        const SHARED        = 1 << 0;
        const CROSS_ADAPTER = 1 << 1;
        const MONITORED     = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FenceDesc {
    pub initial_value: u64,
    pub flags: FenceFlags,
}

struct PendingEvent {
    value: u64,
    event: Arc<Event>,
}

/// The CPU-visible completed value lives here; backends drive it forward by
/// calling [`Fence::signal`] when the GPU passes a signal command. The value
/// never decreases.
pub struct Fence {
    header: ResourceHeader,
    flags: FenceFlags,
    /// Mirror of the mutex-guarded value for lock-free polling.
    completed: AtomicU64,
    last_signaled: AtomicU64,
    state: Mutex<u64>,
    condvar: Condvar,
    events: Mutex<Vec<PendingEvent>>,
    shared_handle: AtomicU64,
}

impl Fence {
    pub fn new(desc: FenceDesc, name: &str) -> Handle<Fence> {
        let fence = Self {
            header: ResourceHeader::new(ResourceKind::Fence),
            flags: desc.flags,
            completed: AtomicU64::new(desc.initial_value),
            last_signaled: AtomicU64::new(desc.initial_value),
            state: Mutex::new(desc.initial_value),
            condvar: Condvar::new(),
            events: Mutex::new(Vec::new()),
            shared_handle: AtomicU64::new(0),
        };
        if !name.is_empty() {
            fence.header.set_debug_name(name);
        }
        Handle::new(fence)
    }

    /// Current completed value. Single atomic load, monotonically
    /// non-decreasing.
    pub fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn last_signaled_value(&self) -> u64 {
        self.last_signaled.load(Ordering::Acquire)
    }

    pub fn is_completed(&self, value: u64) -> bool {
        self.completed_value() >= value
    }

    /// Advance the completed value to `max(completed, value)` and wake
    /// waiters. Called by backends when the GPU reaches a signal, and by
    /// tests standing in for one.
    pub fn signal(&self, value: u64) {
        self.note_signal_enqueued(value);
        let mut state = self.state.lock().unwrap();
        if value <= *state {
            return;
        }
        *state = value;
        self.completed.store(value, Ordering::Release);
        self.condvar.notify_all();
        drop(state);
        self.fire_events(value);
    }

    /// Record that a signal for `value` has been enqueued GPU-side. Keeps
    /// `completed <= last_signaled`.
    pub fn note_signal_enqueued(&self, value: u64) {
        self.last_signaled.fetch_max(value, Ordering::AcqRel);
    }

    /// Block until `completed >= value` or the timeout elapses. Returns
    /// whether the value completed.
    pub fn wait(&self, value: u64, timeout_ms: u64) -> bool {
        if self.is_completed(value) {
            return true;
        }
        let deadline = deadline_after(timeout_ms);
        let mut state = self.state.lock().unwrap();
        while *state < value {
            match remaining(deadline) {
                Some(left) => {
                    if left.is_zero() {
                        return false;
                    }
                    let (guard, result) = self.condvar.wait_timeout(state, left).unwrap();
                    state = guard;
                    if result.timed_out() && *state < value {
                        return false;
                    }
                }
                None => {
                    state = self.condvar.wait(state).unwrap();
                }
            }
        }
        true
    }

    /// Wait until any of `values` completes: the smallest value gates them
    /// all on a single timeline.
    pub fn wait_any(&self, values: &[u64], timeout_ms: u64) -> bool {
        match values.iter().min() {
            Some(&min) => self.wait(min, timeout_ms),
            None => true,
        }
    }

    /// Wait until all of `values` complete.
    pub fn wait_all(&self, values: &[u64], timeout_ms: u64) -> bool {
        match values.iter().max() {
            Some(&max) => self.wait(max, timeout_ms),
            None => true,
        }
    }

    /// Signal `event` once the completed value reaches `value`. Fires
    /// immediately if it already has.
    pub fn set_event_on_completion(&self, value: u64, event: &Arc<Event>) {
        if self.is_completed(value) {
            event.signal();
            return;
        }
        self.events.lock().unwrap().push(PendingEvent {
            value,
            event: Arc::clone(event),
        });
        // The completed value may have advanced between the check and the
        // push; re-check so no event is stranded.
        if self.is_completed(value) {
            self.fire_events(self.completed_value());
        }
    }

    fn fire_events(&self, completed: u64) {
        let mut events = self.events.lock().unwrap();
        events.retain(|pending| {
            if pending.value <= completed {
                pending.event.signal();
                false
            } else {
                true
            }
        });
    }

    pub fn flags(&self) -> FenceFlags {
        self.flags
    }

    /// OS sharing handle, if the backend attached one.
    pub fn shared_handle(&self) -> Option<u64> {
        if !self.flags.contains(FenceFlags::SHARED) {
            return None;
        }
        match self.shared_handle.load(Ordering::Acquire) {
            0 => None,
            handle => Some(handle),
        }
    }

    pub fn set_shared_handle(&self, handle: u64) {
        self.shared_handle.store(handle, Ordering::Release);
    }
}

impl Resource for Fence {
    fn header(&self) -> &ResourceHeader {
        &self.header
    }
}

impl TypedResource for Fence {
    const KIND: ResourceKind = ResourceKind::Fence;
}

//=============================================================================
// FenceValueTracker
//=============================================================================

/// Pairs a fence with the next value to signal on it.
pub struct FenceValueTracker {
    fence: Handle<Fence>,
    next_value: u64,
}

impl FenceValueTracker {
    pub fn new(fence: Handle<Fence>) -> Self {
        let next_value = fence.completed_value() + 1;
        Self { fence, next_value }
    }

    /// Allocate the next value and enqueue a signal for it on `queue`.
    pub fn signal(&mut self, queue: &dyn Queue) -> u64 {
        let value = self.next_value;
        self.next_value += 1;
        queue.signal(&self.fence, value);
        value
    }

    pub fn peek_next(&self) -> u64 {
        self.next_value
    }

    pub fn wait_cpu(&self, value: u64, timeout_ms: u64) -> bool {
        self.fence.wait(value, timeout_ms)
    }

    pub fn completed_value(&self) -> u64 {
        self.fence.completed_value()
    }

    pub fn is_completed(&self, value: u64) -> bool {
        self.fence.is_completed(value)
    }

    pub fn fence(&self) -> &Handle<Fence> {
        &self.fence
    }
}
