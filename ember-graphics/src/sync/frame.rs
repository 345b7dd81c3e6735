//! Frame pacing: at most D frames in flight.

use super::{Fence, FenceDesc, SyncPoint, DEFAULT_WAIT_TIMEOUT_MS};
use crate::device::DeviceLostCallback;
use crate::queue::Queue;
use crate::resource::Handle;

pub const MAX_BUFFERED_FRAMES: usize = 4;

/// Frame-latency ring over a single fence.
///
/// `begin_frame` blocks until the frame that previously occupied the current
/// slot has retired on the GPU; `end_frame` stamps the slot with the new
/// frame number and enqueues the matching queue signal. A timed-out wait is
/// interpreted as a lost device: the callback fires once and the ring
/// refuses further frames.
pub struct FrameSync {
    fence: Handle<Fence>,
    buffered_frames: u32,
    frame_index: u32,
    frame_number: u64,
    slot_values: [u64; MAX_BUFFERED_FRAMES],
    wait_timeout_ms: u64,
    device_lost: bool,
    on_device_lost: Option<DeviceLostCallback>,
}

impl FrameSync {
    pub fn new(buffered_frames: u32) -> Self {
        Self::with_fence(
            Fence::new(FenceDesc::default(), "FrameSyncFence"),
            buffered_frames,
        )
    }

    pub fn with_fence(fence: Handle<Fence>, buffered_frames: u32) -> Self {
        let buffered_frames = buffered_frames.clamp(1, MAX_BUFFERED_FRAMES as u32);
        Self {
            fence,
            buffered_frames,
            frame_index: 0,
            frame_number: 0,
            slot_values: [0; MAX_BUFFERED_FRAMES],
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            device_lost: false,
            on_device_lost: None,
        }
    }

    pub fn set_device_lost_callback(&mut self, callback: DeviceLostCallback) {
        self.on_device_lost = Some(callback);
    }

    /// Tuning knob (`r.Ember.FrameWaitTimeoutMs`); the default is the
    /// 30-second device-lost deadline.
    pub fn set_wait_timeout_ms(&mut self, timeout_ms: u64) {
        self.wait_timeout_ms = timeout_ms.max(1);
    }

    /// Wait for the current slot's previous occupant. Returns false when the
    /// device is lost (now or previously); no further frames are accepted.
    pub fn begin_frame(&mut self) -> bool {
        if self.device_lost {
            return false;
        }
        let gate = self.slot_values[self.frame_index as usize];
        if gate > 0 && !self.fence.is_completed(gate) && !self.fence.wait(gate, self.wait_timeout_ms)
        {
            log::error!(
                "frame fence wait for value {} timed out after {} ms; treating device as lost",
                gate,
                self.wait_timeout_ms
            );
            self.mark_device_lost("frame fence timeout");
            return false;
        }
        true
    }

    /// Advance the frame number, stamp the slot, signal `queue`.
    pub fn end_frame(&mut self, queue: &dyn Queue) {
        if self.device_lost {
            return;
        }
        self.frame_number += 1;
        self.slot_values[self.frame_index as usize] = self.frame_number;
        queue.signal(&self.fence, self.frame_number);
        self.frame_index = (self.frame_number % u64::from(self.buffered_frames)) as u32;
    }

    pub fn current_frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn current_frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn completed_frame_number(&self) -> u64 {
        self.fence.completed_value()
    }

    pub fn frames_in_flight(&self) -> u32 {
        (self.frame_number - self.completed_frame_number()) as u32
    }

    pub fn buffered_frames(&self) -> u32 {
        self.buffered_frames
    }

    pub fn current_frame_sync_point(&self) -> SyncPoint {
        SyncPoint::new(self.fence.clone(), self.slot_values[self.frame_index as usize])
    }

    pub fn frame_sync_point(&self, frame_number: u64) -> SyncPoint {
        SyncPoint::new(self.fence.clone(), frame_number)
    }

    pub fn wait_for_frame(&self, frame_number: u64, timeout_ms: u64) -> bool {
        self.fence.is_completed(frame_number) || self.fence.wait(frame_number, timeout_ms)
    }

    /// Drain every in-flight frame (shutdown path).
    pub fn wait_for_all_frames(&mut self) {
        if self.frame_number == 0 || self.device_lost {
            return;
        }
        if !self.fence.wait(self.frame_number, self.wait_timeout_ms) {
            log::error!("wait for all frames timed out; treating device as lost");
            self.mark_device_lost("flush timeout");
        }
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    pub fn fence(&self) -> &Handle<Fence> {
        &self.fence
    }

    fn mark_device_lost(&mut self, reason: &str) {
        if self.device_lost {
            return;
        }
        self.device_lost = true;
        if let Some(callback) = &self.on_device_lost {
            callback(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::test_support::ImmediateQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn frames_cycle_through_slots() {
        let queue = ImmediateQueue::graphics();
        let mut sync = FrameSync::new(3);
        for expected_index in [1u32, 2, 0, 1] {
            assert!(sync.begin_frame());
            sync.end_frame(&queue);
            assert_eq!(sync.current_frame_index(), expected_index);
        }
        assert_eq!(sync.current_frame_number(), 4);
        // The immediate queue signals synchronously, so nothing is in flight.
        assert_eq!(sync.frames_in_flight(), 0);
    }

    #[test]
    fn begin_frame_blocks_on_unfinished_slot_then_times_out() {
        // A queue that never signals models a hung GPU.
        let queue = ImmediateQueue::stalled();
        let lost = Arc::new(AtomicUsize::new(0));
        let lost_probe = lost.clone();

        let mut sync = FrameSync::new(2);
        sync.set_wait_timeout_ms(5);
        sync.set_device_lost_callback(Arc::new(move |_| {
            lost_probe.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(sync.begin_frame());
        sync.end_frame(&queue); // frame 1 occupies slot 0
        assert!(sync.begin_frame());
        sync.end_frame(&queue); // frame 2 occupies slot 1

        // Slot 0 still holds unretired frame 1.
        assert!(!sync.begin_frame());
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert!(sync.is_device_lost());

        // Once lost, nothing else fires.
        assert!(!sync.begin_frame());
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_for_frame_uses_fence() {
        let queue = ImmediateQueue::graphics();
        let mut sync = FrameSync::new(2);
        sync.begin_frame();
        sync.end_frame(&queue);
        assert!(sync.wait_for_frame(1, 0));
        assert!(!sync.wait_for_frame(2, 1));
    }
}
