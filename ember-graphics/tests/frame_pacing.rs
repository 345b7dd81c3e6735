//! Frame pacing, ring retention and device-loss detection.

mod common;

use common::{TestDevice, TestQueue};
use ember_graphics::queue::Queue;
use ember_graphics::{
    Fence, FenceDesc, FenceValueTracker, FrameSync, HeapType, PipelineSync, QueueType,
    RingBufferAllocator, SyncPoint, SyncPointWaiter, TimelineSync, WaitResult,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const KIB: u64 = 1024;

#[test]
fn fence_values_never_regress() {
    let fence = Fence::new(FenceDesc::default(), "monotonic");
    let mut last = 0;
    for value in [1u64, 5, 3, 5, 9, 2] {
        fence.signal(value);
        let completed = fence.completed_value();
        assert!(completed >= last);
        last = completed;
    }
    assert_eq!(last, 9);
}

#[test]
fn frame_sync_ring_upload_under_triple_buffering() {
    // The ring allocator's retention follows the frame fence: memory
    // recorded by frame F is reusable only once F completes.
    let device = TestDevice::new();
    let mut ring = RingBufferAllocator::new(&device, 1024 * KIB, 3, HeapType::Upload).unwrap();

    ring.begin_frame(0, 0);
    assert!(ring.allocate(400 * KIB, 1).is_valid());
    assert!(ring.allocate(400 * KIB, 1).is_valid());
    assert!(!ring.allocate(400 * KIB, 1).is_valid());
    ring.end_frame(1);

    ring.begin_frame(1, 0);
    let wrapped = ring.allocate(400 * KIB, 1);
    assert!(wrapped.is_valid());
    assert_eq!(wrapped.offset, 0);
    ring.end_frame(2);

    ring.begin_frame(2, 1);
    let after_completion = ring.allocate(400 * KIB, 1);
    assert!(after_completion.is_valid());
    assert_eq!(after_completion.offset, 400 * KIB);
}

#[test]
fn ring_data_is_not_overwritten_before_completion() {
    let device = TestDevice::new();
    let mut ring = RingBufferAllocator::new(&device, 1024 * KIB, 3, HeapType::Upload).unwrap();

    ring.begin_frame(0, 0);
    let first = ring.allocate(800 * KIB, 1);
    assert!(first.is_valid());
    first.write_bytes(&vec![0x5a; 1024]);
    ring.end_frame(1);

    // Frame 2 wraps, then runs up against frame 1's retained region.
    ring.begin_frame(1, 0);
    let wrapped = ring.allocate(400 * KIB, 1);
    assert!(wrapped.is_valid());
    assert_eq!(wrapped.offset, 0);
    assert!(!ring.allocate(500 * KIB, 1).is_valid());
    let fits = ring.allocate(300 * KIB, 1);
    assert!(fits.is_valid());
    assert_eq!(fits.offset, 400 * KIB);
    ring.end_frame(2);

    // Once frame 1 completes its region is reusable.
    ring.begin_frame(2, 1);
    assert!(ring.allocate(300 * KIB, 1).is_valid());
}

#[test]
fn frame_sync_timeout_invokes_device_lost_once() {
    // A fence that never advances: begin_frame after filling every slot
    // times out and reports device loss exactly once.
    let queue = TestQueue::new(QueueType::Graphics, 0);
    queue.stall();

    let lost = Arc::new(AtomicUsize::new(0));
    let lost_probe = lost.clone();

    let mut frames = FrameSync::new(4);
    frames.set_wait_timeout_ms(10);
    frames.set_device_lost_callback(Arc::new(move |reason| {
        assert!(!reason.is_empty());
        lost_probe.fetch_add(1, Ordering::SeqCst);
    }));

    for _ in 0..4 {
        assert!(frames.begin_frame());
        frames.end_frame(&queue);
    }
    assert_eq!(frames.frames_in_flight(), 4);

    assert!(!frames.begin_frame());
    assert_eq!(lost.load(Ordering::SeqCst), 1);
    assert!(frames.is_device_lost());

    // Lost devices accept no further frames and fire no further callbacks.
    assert!(!frames.begin_frame());
    frames.end_frame(&queue);
    assert_eq!(frames.current_frame_number(), 4);
    assert_eq!(lost.load(Ordering::SeqCst), 1);
}

#[test]
fn frame_sync_flows_when_gpu_keeps_up() {
    let queue = TestQueue::new(QueueType::Graphics, 0);
    let mut frames = FrameSync::new(2);
    for _ in 0..10 {
        assert!(frames.begin_frame());
        frames.end_frame(&queue);
    }
    assert_eq!(frames.current_frame_number(), 10);
    assert_eq!(frames.completed_frame_number(), 10);
    assert!(frames.current_frame_sync_point().is_complete());
}

#[test]
fn pipeline_sync_orders_producer_consumer() {
    let device = TestDevice::new();
    let graphics = device.graphics();
    let copy = TestQueue::new(QueueType::Copy, 2);

    let mut sync = PipelineSync::new();
    let sp = sync.insert_sync_point(graphics);
    assert!(sp.is_complete());
    sync.wait_for_sync_point(&copy, &sp);
    assert_eq!(copy.stats().waits, 1);

    assert!(sync.sync_queues(graphics, &copy));
    sync.reset_frame_graph();
    assert!(sync.sync_queues(&copy, graphics));
}

#[test]
fn timeline_and_tracker_compose() {
    let device = TestDevice::new();
    let queue = device.graphics();

    let mut timeline = TimelineSync::new();
    let first = timeline.signal(queue);
    let second = timeline.signal(queue);
    assert!(timeline.wait_cpu(second, 0));
    assert!(timeline.sync_point(first).is_complete());

    let fence = Fence::new(FenceDesc::default(), "tracker");
    let mut tracker = FenceValueTracker::new(fence);
    assert_eq!(tracker.peek_next(), 1);
    let value = tracker.signal(queue);
    assert_eq!(value, 1);
    assert!(tracker.is_completed(value));
    assert!(tracker.wait_cpu(value, 0));
}

#[test]
fn waiter_reports_first_completion() {
    let slow = Fence::new(FenceDesc::default(), "slow");
    let fast = Fence::new(FenceDesc::default(), "fast");

    let mut waiter = SyncPointWaiter::new();
    waiter.add(SyncPoint::new(slow.clone(), 1)).unwrap();
    waiter.add(SyncPoint::new(fast.clone(), 1)).unwrap();

    assert_eq!(waiter.wait_any(1), WaitResult::TimedOut);
    fast.signal(1);
    assert_eq!(waiter.wait_any(1_000), WaitResult::Completed(1));
    assert!(!waiter.all_completed());

    slow.signal(1);
    assert!(waiter.wait_all(0));
}
