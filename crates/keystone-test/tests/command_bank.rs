use ash::vk;
use keystone_gpu::{CommandBank, RawDevice};
use keystone_test::{mock_queues, single_queue_families, BufferState, MockDevice};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn bank(device: &Arc<MockDevice>, pools: usize, can_trim: bool) -> CommandBank {
    let queues = mock_queues(&single_queue_families());
    let raw: Arc<dyn RawDevice> = device.clone();
    CommandBank::new(raw, queues.graphics, pools, can_trim).unwrap()
}

#[test]
fn pools_are_handed_out_round_robin() {
    let device = MockDevice::new();
    let bank = bank(&device, 2, false);

    let picked: Vec<usize> = (0..5).map(|_| bank.acquire().index()).collect();
    assert_eq!(picked, vec![0, 1, 0, 1, 0]);
}

#[test]
fn rotation_is_fair_for_any_pool_count() {
    for pools in 1..=4 {
        for acquires in 0..=13 {
            let device = MockDevice::new();
            let bank = bank(&device, pools, false);

            let mut counts = vec![0usize; pools];
            for i in 0..acquires {
                let index = bank.acquire().index();
                assert_eq!(index, i % pools);
                counts[index] += 1;
            }

            let min = acquires / pools;
            let max = acquires.div_ceil(pools);
            assert!(
                counts.iter().all(|&c| c == min || c == max),
                "{pools} pools, {acquires} acquires: {counts:?}"
            );
        }
    }
}

#[test]
fn zero_parallelism_still_creates_one_pool() {
    let device = MockDevice::new();
    let bank = bank(&device, 0, false);
    assert_eq!(bank.pool_count(), 1);
    assert_eq!(device.live_pool_count(), 1);
}

#[test]
fn allocations_spread_across_pools() {
    let device = MockDevice::new();
    let bank = bank(&device, 2, false);

    let a = bank.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
    let b = bank.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
    let c = bank.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();

    assert_eq!(device.pool_of(a.handle()), Some(a.pool().handle()));
    assert_ne!(a.pool().handle(), b.pool().handle());
    assert_eq!(a.pool().handle(), c.pool().handle());
    assert_eq!(device.pool_family(a.pool().handle()), Some(0));
}

#[test]
fn trim_is_a_no_op_without_support() {
    let device = MockDevice::new();
    let bank = bank(&device, 3, false);
    let pools: Vec<_> = (0..3).map(|_| bank.acquire().handle()).collect();

    bank.trim();
    assert!(pools.iter().all(|&pool| device.trim_count(pool) == 0));
}

#[test]
fn trim_visits_every_pool_once() {
    let device = MockDevice::new();
    let bank = bank(&device, 3, true);
    let pools: Vec<_> = (0..3).map(|_| bank.acquire().handle()).collect();

    bank.trim();
    assert!(pools.iter().all(|&pool| device.trim_count(pool) == 1));
}

#[test]
fn recording_is_serialized_within_a_pool() {
    let device = MockDevice::new();
    let bank = bank(&device, 1, false);
    let mut first = bank.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
    let mut second = bank.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
    let pool = first.pool().handle();

    let (started_tx, started_rx) = mpsc::channel();
    let (first_ref, second_ref) = (&mut first, &mut second);
    thread::scope(|scope| {
        scope.spawn(move || {
            let recording = first_ref
                .begin_recording(vk::CommandBufferUsageFlags::empty())
                .unwrap();
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
            recording.end().unwrap();
        });
        scope.spawn(move || {
            started_rx.recv().unwrap();
            let recording = second_ref
                .begin_recording(vk::CommandBufferUsageFlags::empty())
                .unwrap();
            recording.end().unwrap();
        });
    });

    assert_eq!(device.max_concurrent_recordings(pool), 1);
    assert_eq!(device.buffer_state(first.handle()), Some(BufferState::Executable));
    assert_eq!(device.buffer_state(second.handle()), Some(BufferState::Executable));
}

#[test]
fn buffers_of_different_pools_record_concurrently() {
    let device = MockDevice::new();
    let bank = bank(&device, 2, false);
    let mut a = bank.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
    let mut b = bank.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
    let (raw_a, raw_b) = (a.handle(), b.handle());

    let recording_a = a.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
    let recording_b = b.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
    assert_eq!(device.buffer_state(raw_a), Some(BufferState::Recording));
    assert_eq!(device.buffer_state(raw_b), Some(BufferState::Recording));

    recording_a.end().unwrap();
    recording_b.end().unwrap();
}

#[test]
fn rerecording_resets_the_buffer_first() {
    let device = MockDevice::new();
    let bank = bank(&device, 1, false);
    let mut buffer = bank.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();

    buffer
        .begin_recording(vk::CommandBufferUsageFlags::empty())
        .unwrap()
        .end()
        .unwrap();
    assert!(buffer.is_recorded());
    assert_eq!(device.reset_count(buffer.handle()), 0);

    buffer
        .begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .unwrap()
        .end()
        .unwrap();
    assert_eq!(device.reset_count(buffer.handle()), 1);
    assert_eq!(
        device.begin_flags(buffer.handle()),
        Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    );
}

#[test]
fn abandoned_recording_is_reset_on_next_begin() {
    let device = MockDevice::new();
    let bank = bank(&device, 1, false);
    let mut buffer = bank.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();

    drop(buffer.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap());
    assert_eq!(device.buffer_state(buffer.handle()), Some(BufferState::Recording));

    buffer
        .begin_recording(vk::CommandBufferUsageFlags::empty())
        .unwrap()
        .end()
        .unwrap();
    assert_eq!(device.reset_count(buffer.handle()), 1);
    assert_eq!(device.buffer_state(buffer.handle()), Some(BufferState::Executable));
}

#[test]
fn dropping_a_buffer_frees_it_and_the_last_buffer_releases_the_pool() {
    let device = MockDevice::new();
    let bank = bank(&device, 1, false);
    let buffer = bank.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
    let raw = buffer.handle();

    drop(bank);
    assert_eq!(device.live_pool_count(), 1);

    drop(buffer);
    assert_eq!(device.free_count(raw), 1);
    assert_eq!(device.live_pool_count(), 0);
    assert_eq!(device.destroyed_pool_count(), 1);
}
