//! Upload → execute → readback round trips across the CPU/GPU boundary.

mod common;

use common::TestDevice;
use ember_graphics::queue::Queue;
use ember_graphics::{
    AsyncReadbackRing, AsyncUploadManager, BufferDesc, BufferReadback, BufferUploadRequest,
    Device, Fence, FenceDesc, SyncPoint, TextureReadback, TextureUploadRequest, UploadBatch,
    UploadHeap, UploadStatus, TextureDesc,
};

#[test]
fn buffer_upload_round_trip_returns_input_verbatim() {
    let device = TestDevice::new();
    let mut heap = UploadHeap::new(&device, 1024 * 1024, 3).unwrap();
    let mut ctx = device.context();

    let target = device
        .create_buffer(&BufferDesc::upload(4096), "roundtrip-target")
        .unwrap();
    let payload: Vec<u8> = (0..255u8).cycle().take(4096).collect();

    heap.begin_frame(0, 0);
    assert!(heap.upload_buffer(
        &mut ctx,
        &BufferUploadRequest {
            dst: &target,
            dst_offset: 0,
            data: &payload,
        }
    ));
    heap.end_frame(1);

    // Execution completed (instant GPU); read it back.
    let mut readback = BufferReadback::new(&device, 4096, "roundtrip-read").unwrap();
    let fence = Fence::new(FenceDesc::default(), "roundtrip-fence");
    assert!(readback.enqueue_copy(&mut ctx, &target, 0, 4096));
    fence.signal(1);
    readback.mark_submitted(SyncPoint::new(fence, 1));

    let mut out = vec![0u8; 4096];
    assert!(readback.is_ready());
    assert!(readback.get_data(&mut out));
    assert_eq!(out, payload);
}

#[test]
fn texture_upload_round_trip_through_staging() {
    let device = TestDevice::new();
    let mut heap = UploadHeap::new(&device, 1024 * 1024, 3).unwrap();
    let mut ctx = device.context();

    let texture = device
        .create_texture(
            &TextureDesc {
                width: 16,
                height: 8,
                ..Default::default()
            },
            "tex-roundtrip",
        )
        .unwrap();
    let pixels: Vec<u8> = (0..16 * 8 * 4u32).map(|v| v as u8).collect();

    heap.begin_frame(0, 0);
    assert!(heap.upload_texture(
        &mut ctx,
        &TextureUploadRequest::whole_mip(&texture, 0, &pixels)
    ));
    heap.end_frame(1);

    let mut readback = TextureReadback::new(
        &device,
        16,
        8,
        texture.desc().format,
        "tex-read",
    )
    .unwrap();
    readback.enqueue_copy(&mut ctx, &texture, 0, 0);
    let fence = Fence::new(FenceDesc::default(), "tex-fence");
    fence.signal(1);
    readback.mark_submitted(SyncPoint::new(fence, 1));

    assert!(readback.is_ready());
    assert_eq!(readback.row_pitch(), 256);
    let mut rows = vec![0u8; readback.data_size() as usize];
    assert!(readback.get_data(&mut rows));

    // Each row lands at the aligned pitch with the source bytes intact.
    let tight_pitch = 16 * 4;
    for row in 0..8usize {
        let staged = &rows[row * 256..row * 256 + tight_pitch];
        let source = &pixels[row * tight_pitch..(row + 1) * tight_pitch];
        assert_eq!(staged, source);
    }
}

#[test]
fn batched_uploads_land_together() {
    let device = TestDevice::new();
    let mut heap = UploadHeap::new(&device, 1024 * 1024, 3).unwrap();
    let mut ctx = device.context();
    heap.begin_frame(0, 0);

    let targets: Vec<_> = (0..4)
        .map(|i| {
            device
                .create_buffer(&BufferDesc::upload(64), &format!("batch-{i}"))
                .unwrap()
        })
        .collect();
    let payloads: Vec<[u8; 32]> = (0..4).map(|i| [i as u8 + 1; 32]).collect();

    let mut batch = UploadBatch::new(16);
    for (target, payload) in targets.iter().zip(&payloads) {
        assert!(batch
            .add_buffer(BufferUploadRequest {
                dst: target,
                dst_offset: 0,
                data: payload,
            })
            .is_ok());
    }
    assert_eq!(batch.total_data_size(), 128);
    assert_eq!(batch.execute(&mut heap, &mut ctx), 4);

    for (target, payload) in targets.iter().zip(&payloads) {
        let mut out = [0u8; 32];
        assert!(target.read_mapped(0, &mut out));
        assert_eq!(&out, payload);
    }
}

#[test]
fn async_uploads_complete_via_copy_queue_fence() {
    let device = TestDevice::new();
    let mut uploads = AsyncUploadManager::with_heap_size(device.arc(), 1024 * 1024).unwrap();
    let target = device
        .create_buffer(&BufferDesc::upload(128), "async-target")
        .unwrap();
    let payload = [0x77u8; 128];

    uploads.begin_frame(0);
    let handle = uploads.upload_buffer_async(&BufferUploadRequest {
        dst: &target,
        dst_offset: 0,
        data: &payload,
    });
    assert!(handle.is_valid());
    assert_eq!(uploads.status(handle), UploadStatus::InProgress);
    assert!(uploads.sync_point().is_none());

    uploads.end_frame();
    let gate = uploads.sync_point().unwrap();
    assert!(gate.is_complete());
    assert!(uploads.wait(handle, 0));

    // Graphics consumers can also gate GPU-side.
    uploads.wait_on_queue(device.graphics());
    assert_eq!(device.graphics().stats().waits, 1);

    uploads.begin_frame(1);
    assert_eq!(uploads.status(handle), UploadStatus::Completed);

    let mut out = [0u8; 128];
    assert!(target.read_mapped(0, &mut out));
    assert_eq!(out, payload);
}

#[test]
fn async_readback_ring_has_bounded_latency() {
    let device = TestDevice::new();
    let mut ctx = device.context();
    let source = device
        .create_buffer(&BufferDesc::upload(8), "counter")
        .unwrap();

    let mut ring: AsyncReadbackRing<u64, 3> = AsyncReadbackRing::new(&device, "latency").unwrap();
    let fence = Fence::new(FenceDesc::default(), "latency-fence");

    let mut observed = Vec::new();
    for frame in 1..=6u64 {
        source.write_mapped(0, &frame.to_le_bytes());
        ring.enqueue_copy(&mut ctx, &source, 0);
        fence.signal(frame);
        ring.mark_submitted(SyncPoint::new(fence.clone(), frame));

        let mut value = 0u64;
        if ring.try_get_result(&mut value) {
            observed.push((frame, value));
        }
    }

    // Data is always previous-frame data, no older than N-1 frames.
    for (frame, value) in observed {
        assert!(value < frame);
        assert!(frame - value <= 2, "frame {frame} saw stale value {value}");
    }
    assert_eq!(ring.get_latest_or_default(0), 6);
}
