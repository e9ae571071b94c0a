use keystone_gpu::sync::{SyncDirection, SyncGranularity};
use keystone_gpu::{
    Event, Fence, FrameSyncManager, GpuError, HostSync, RawDevice, Semaphore, SyncCaps, SyncObject,
};
use keystone_test::MockDevice;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn raw(device: &Arc<MockDevice>) -> Arc<dyn RawDevice> {
    device.clone()
}

fn unsupported<T>(result: keystone_gpu::Result<T>) -> bool {
    matches!(result, Err(GpuError::UnsupportedOperation(_)))
}

#[test]
fn fence_is_observed_but_never_signalled_by_the_host() {
    let device = MockDevice::new();
    let fence = Fence::new(raw(&device), false).unwrap();

    assert!(!fence.host_poll().unwrap());
    assert!(!fence.host_wait(Duration::from_millis(1)).unwrap());
    assert!(unsupported(fence.host_set()));

    device.signal_fence(fence.handle());
    assert!(fence.host_poll().unwrap());
    assert!(fence.host_wait(Duration::MAX).unwrap());

    fence.host_reset().unwrap();
    assert!(!fence.host_poll().unwrap());
}

#[test]
fn fence_can_start_signalled() {
    let device = MockDevice::new();
    let fence = Fence::new(raw(&device), true).unwrap();
    assert!(fence.host_poll().unwrap());
}

#[test]
fn event_supports_every_host_operation() {
    let device = MockDevice::new();
    let event = Event::new(raw(&device)).unwrap();

    assert!(!event.host_poll().unwrap());
    event.host_set().unwrap();
    assert!(event.host_poll().unwrap());
    assert!(event.host_wait(Duration::ZERO).unwrap());

    event.host_reset().unwrap();
    assert!(!event.host_poll().unwrap());
}

#[test]
fn event_wait_times_out_without_a_signal() {
    let device = MockDevice::new();
    let event = Event::new(raw(&device)).unwrap();

    let start = Instant::now();
    assert!(!event.host_wait(Duration::from_millis(10)).unwrap());
    assert!(start.elapsed() >= Duration::from_millis(10));
}

#[test]
fn event_wait_observes_a_device_signal() {
    let device = MockDevice::new();
    let event = Event::new(raw(&device)).unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(5));
            device.signal_event(event.handle());
        });
        assert!(event.host_wait(Duration::from_secs(5)).unwrap());
    });
}

#[test]
fn event_wait_accepts_an_unbounded_timeout() {
    let device = MockDevice::new();
    let event = Event::new(raw(&device)).unwrap();

    event.host_set().unwrap();
    assert!(event.host_wait(Duration::MAX).unwrap());

    event.host_reset().unwrap();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(5));
            device.signal_event(event.handle());
        });
        assert!(event.host_wait(Duration::MAX).unwrap());
    });
}

#[test]
fn semaphore_has_no_host_access() {
    let device = MockDevice::new();
    let semaphore = Semaphore::new(raw(&device)).unwrap();

    assert!(unsupported(semaphore.host_poll()));
    assert!(unsupported(semaphore.host_reset()));
    assert!(unsupported(semaphore.host_set()));
    assert!(unsupported(semaphore.host_wait(Duration::ZERO)));
}

#[test]
fn sync_objects_report_their_kind() {
    let device = MockDevice::new();
    let fence = Fence::new(raw(&device), false).unwrap();
    let event = Event::new(raw(&device)).unwrap();
    let semaphore = Semaphore::new(raw(&device)).unwrap();

    let fence_caps = SyncObject::Fence(&fence).caps();
    assert_eq!(fence_caps, SyncCaps::FENCE);
    assert_eq!(fence_caps.granularity, SyncGranularity::CommandBuffer);
    assert_eq!(fence_caps.direction, SyncDirection::GpuToHost);

    let event_caps = SyncObject::Event(&event).caps();
    assert_eq!(event_caps.granularity, SyncGranularity::PipelineStage);
    assert_eq!(event_caps.direction, SyncDirection::Any);

    let semaphore_caps = SyncObject::Semaphore(&semaphore).caps();
    assert_eq!(semaphore_caps, SyncCaps::SEMAPHORE);
    assert_eq!(semaphore_caps.direction, SyncDirection::GpuToGpu);
}

#[test]
fn wrappers_destroy_their_handles() {
    let device = MockDevice::new();
    let fence = Fence::new(raw(&device), false).unwrap();
    let handle = fence.handle();
    let semaphore = Semaphore::new(raw(&device)).unwrap();
    assert_eq!(device.live_fence_count(), 1);
    assert_eq!(device.live_semaphore_count(), 1);

    drop(fence);
    drop(semaphore);
    assert!(device.is_fence_destroyed(handle));
    assert_eq!(device.live_fence_count(), 0);
    assert_eq!(device.live_semaphore_count(), 0);
}

#[test]
fn frame_sync_cycles_through_frames() {
    let device = MockDevice::new();
    let mut frames = FrameSyncManager::new(&raw(&device), 2).unwrap();
    assert_eq!(device.live_fence_count(), 2);
    assert_eq!(device.live_semaphore_count(), 4);

    let first = frames.current().in_flight.handle();
    assert!(device.is_fence_signaled(first));
    frames.current().wait_and_reset().unwrap();
    assert!(!device.is_fence_signaled(first));

    frames.advance();
    assert_eq!(frames.current_frame(), 1);
    assert_ne!(frames.current().in_flight.handle(), first);

    frames.advance();
    assert_eq!(frames.current_frame(), 0);
    assert_eq!(frames.current().in_flight.handle(), first);
}
