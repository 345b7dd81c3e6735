//! Waiting on multiple sync points, possibly on different fences.

use super::{deadline_after, SyncPoint};
use crate::error::CapacityError;
use std::time::Instant;

pub const MAX_SYNC_POINTS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// Index of the first completed sync point.
    Completed(usize),
    TimedOut,
}

/// Bounded collection of sync points with all/any wait semantics.
pub struct SyncPointWaiter {
    points: Vec<SyncPoint>,
}

impl SyncPointWaiter {
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    /// Fails once the fixed capacity is reached; the sync point is dropped.
    pub fn add(&mut self, sync_point: SyncPoint) -> Result<(), CapacityError> {
        if self.points.len() >= MAX_SYNC_POINTS {
            let err = CapacityError {
                what: "sync point waiter",
                capacity: MAX_SYNC_POINTS,
            };
            log::warn!("{err}; sync point dropped");
            return Err(err);
        }
        self.points.push(sync_point);
        Ok(())
    }

    /// Wait each point in turn. The timeout applies per point, matching the
    /// underlying fence waits.
    pub fn wait_all(&self, timeout_ms: u64) -> bool {
        self.points.iter().all(|sp| sp.wait_timeout(timeout_ms))
    }

    /// Poll (yielding) until any point completes or the deadline passes.
    /// Fences may differ, so there is no single value to block on.
    pub fn wait_any(&self, timeout_ms: u64) -> WaitResult {
        if self.points.is_empty() {
            return WaitResult::TimedOut;
        }
        let deadline = deadline_after(timeout_ms);
        loop {
            for (index, sp) in self.points.iter().enumerate() {
                if sp.is_complete() {
                    return WaitResult::Completed(index);
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return WaitResult::TimedOut;
                }
            }
            std::thread::yield_now();
        }
    }

    pub fn all_completed(&self) -> bool {
        self.points.iter().all(SyncPoint::is_complete)
    }

    pub fn any_completed(&self) -> bool {
        self.points.iter().any(SyncPoint::is_complete)
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl Default for SyncPointWaiter {
    fn default() -> Self {
        Self::new()
    }
}
