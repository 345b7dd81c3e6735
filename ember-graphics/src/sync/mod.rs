//! Synchronization fabric: fences, sync points and their compositions.
//!
//! Every CPU-side wait in the crate funnels through [`Fence::wait`] and takes
//! an explicit timeout, so a hung GPU becomes a detectable fault instead of
//! an unbounded block.

mod fence;
mod frame;
mod pipeline;
mod timeline;
mod waiter;

pub use fence::{Fence, FenceDesc, FenceFlags, FenceValueTracker};
pub use frame::{FrameSync, MAX_BUFFERED_FRAMES};
pub use pipeline::PipelineSync;
pub use timeline::TimelineSync;
pub use waiter::{SyncPointWaiter, WaitResult, MAX_SYNC_POINTS};

use crate::resource::Handle;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default deadline for frame-level waits. Exceeding it is treated as a lost
/// device, not a long frame.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;

/// Wait forever. Callers using this acknowledge they give up hang detection.
pub const WAIT_INFINITE: u64 = u64::MAX;

//=============================================================================
// SyncPoint
//=============================================================================

/// A point on a GPU timeline: complete once `fence.completed_value() >= value`.
#[derive(Clone, Debug)]
pub struct SyncPoint {
    pub fence: Handle<Fence>,
    pub value: u64,
}

impl SyncPoint {
    pub fn new(fence: Handle<Fence>, value: u64) -> Self {
        Self { fence, value }
    }

    /// Non-blocking completion check.
    pub fn is_complete(&self) -> bool {
        self.fence.is_completed(self.value)
    }

    /// Wait with the frame-level default deadline.
    pub fn wait(&self) -> bool {
        self.wait_timeout(DEFAULT_WAIT_TIMEOUT_MS)
    }

    pub fn wait_timeout(&self, timeout_ms: u64) -> bool {
        self.fence.wait(self.value, timeout_ms)
    }
}

impl PartialEq for SyncPoint {
    fn eq(&self, other: &Self) -> bool {
        self.fence == other.fence && self.value == other.value
    }
}

impl Eq for SyncPoint {}

//=============================================================================
// Event
//=============================================================================

/// Manual-reset OS-event stand-in used by `Fence::set_event_on_completion`.
pub struct Event {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        *self.signaled.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    pub fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock().unwrap()
    }

    pub fn wait(&self, timeout_ms: u64) -> bool {
        let deadline = deadline_after(timeout_ms);
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            match remaining(deadline) {
                Some(left) => {
                    let (guard, result) = self.condvar.wait_timeout(signaled, left).unwrap();
                    signaled = guard;
                    if result.timed_out() && !*signaled {
                        return false;
                    }
                }
                None => {
                    signaled = self.condvar.wait(signaled).unwrap();
                }
            }
        }
        true
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// `None` means "no deadline" (infinite wait).
pub(crate) fn deadline_after(timeout_ms: u64) -> Option<Instant> {
    if timeout_ms == WAIT_INFINITE {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(timeout_ms))
    }
}

/// Time left until `deadline`; `None` for infinite, zero when expired.
pub(crate) fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}
