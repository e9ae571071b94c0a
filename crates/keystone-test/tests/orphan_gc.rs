use ash::vk;
use keystone_gpu::{
    CommandBuffer, CommandBufferDesc, CommandConfig, Fence, HostSync, OrphanFence, OrphanList,
    RawDevice, RunOptions, Submission, SyncObject,
};
use keystone_test::{config, single_queue_families, Fixture, MockDevice};
use std::sync::Arc;

fn recorded(fixture: &Fixture) -> CommandBuffer {
    let mut buffer = fixture.commands.allocate(&CommandBufferDesc::graphics()).unwrap();
    buffer
        .begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .unwrap()
        .end()
        .unwrap();
    buffer
}

fn fence(device: &Arc<MockDevice>) -> Arc<Fence> {
    let raw: Arc<dyn RawDevice> = device.clone();
    Arc::new(Fence::new(raw, false).unwrap())
}

/// Submit `buffer` signalling `fence`, then hand it to the orphan list.
fn submit_and_orphan(
    fixture: &Fixture,
    buffer: CommandBuffer,
    fence: &Arc<Fence>,
) -> keystone_gpu::OrphanKey {
    fixture
        .commands
        .submit(&Submission {
            command_buffers: &[&buffer],
            signal: &[SyncObject::Fence(fence)],
            ..Submission::default()
        })
        .unwrap();
    fixture
        .commands
        .dispose_when_free(buffer, OrphanFence::Shared(fence.clone()))
}

#[test]
fn orphan_is_freed_only_after_its_fence_signals() {
    let fixture = Fixture::single_queue();
    let device = &fixture.device;
    let buffer = recorded(&fixture);
    let raw = buffer.handle();
    let fence = fence(device);

    let key = submit_and_orphan(&fixture, buffer, &fence);

    assert_eq!(fixture.commands.collect_garbage(), 0);
    assert!(fixture.commands.is_orphaned(key));
    assert_eq!(device.free_count(raw), 0);

    device.signal_fence(fence.handle());
    assert_eq!(fixture.commands.collect_garbage(), 1);
    assert!(!fixture.commands.is_orphaned(key));
    assert_eq!(device.free_count(raw), 1);

    assert_eq!(fixture.commands.collect_garbage(), 0);
    assert_eq!(device.free_count(raw), 1);
    assert!(device.premature_frees().is_empty());
}

#[test]
fn each_orphan_waits_for_its_own_fence() {
    let fixture = Fixture::single_queue();
    let device = &fixture.device;

    let orphans: Vec<_> = (0..20)
        .map(|_| {
            let buffer = recorded(&fixture);
            let raw = buffer.handle();
            let fence = fence(device);
            let key = submit_and_orphan(&fixture, buffer, &fence);
            (raw, fence, key)
        })
        .collect();

    // Complete the work out of submission order.
    for (raw, fence, _) in orphans.iter().rev().step_by(2) {
        device.signal_fence(fence.handle());
        assert_eq!(device.free_count(*raw), 0);
    }
    assert_eq!(fixture.commands.collect_garbage(), 10);

    for (i, (raw, _, key)) in orphans.iter().enumerate() {
        let signalled = (orphans.len() - 1 - i) % 2 == 0;
        assert_eq!(device.free_count(*raw), usize::from(signalled));
        assert_eq!(fixture.commands.is_orphaned(*key), !signalled);
    }

    for (_, fence, _) in &orphans {
        device.signal_fence(fence.handle());
    }
    assert_eq!(fixture.commands.collect_garbage(), 10);
    assert_eq!(fixture.commands.orphan_count(), 0);
    assert!(orphans.iter().all(|(raw, _, _)| device.free_count(*raw) == 1));
    assert!(device.premature_frees().is_empty());
}

#[test]
fn crossing_the_threshold_triggers_a_sweep() {
    let fixture = Fixture::new(
        &single_queue_families(),
        CommandConfig {
            orphan_gc_threshold: 3,
            ..config(2)
        },
    );
    fixture.device.set_signal_on_submit(true);

    let run = || {
        fixture
            .commands
            .run_commands(&CommandBufferDesc::graphics(), |_| Ok(()), RunOptions::default())
            .unwrap();
    };

    for _ in 0..3 {
        run();
    }
    assert_eq!(fixture.commands.orphan_count(), 3);

    // The fourth disposal exceeds the threshold and sweeps everything that completed.
    run();
    assert_eq!(fixture.commands.orphan_count(), 0);

    run();
    assert_eq!(fixture.commands.orphan_count(), 1);
    assert!(fixture.device.premature_frees().is_empty());
}

#[test]
fn owned_fence_is_destroyed_with_its_orphan() {
    let fixture = Fixture::single_queue();
    let device = &fixture.device;

    fixture
        .commands
        .run_commands(&CommandBufferDesc::graphics(), |_| Ok(()), RunOptions::default())
        .unwrap();
    let fence = device.last_submit_fence().unwrap();
    assert_ne!(fence, vk::Fence::null());
    assert!(!device.is_fence_destroyed(fence));

    device.signal_fence(fence);
    assert_eq!(fixture.commands.collect_garbage(), 1);
    assert!(device.is_fence_destroyed(fence));
}

#[test]
fn shared_fence_outlives_its_orphan() {
    let fixture = Fixture::single_queue();
    let device = &fixture.device;
    let fence = fence(device);

    fixture
        .commands
        .run_commands(
            &CommandBufferDesc::graphics(),
            |_| Ok(()),
            RunOptions {
                fence: Some(fence.clone()),
                ..RunOptions::default()
            },
        )
        .unwrap();

    device.signal_fence(fence.handle());
    assert_eq!(fixture.commands.collect_garbage(), 1);
    assert!(!device.is_fence_destroyed(fence.handle()));
    assert!(fence.host_poll().unwrap());
    assert_eq!(Arc::strong_count(&fence), 1);
}

#[test]
fn stale_keys_never_match_a_reused_slot() {
    let fixture = Fixture::single_queue();
    let device = &fixture.device;
    let mut list = OrphanList::new();

    let first_fence = fence(device);
    let first = list.insert(recorded(&fixture), OrphanFence::Shared(first_fence.clone()));
    device.signal_fence(first_fence.handle());
    assert_eq!(list.sweep(), 1);
    assert!(list.is_empty());

    let second = list.insert(recorded(&fixture), OrphanFence::Shared(fence(device)));
    assert_ne!(first, second);
    assert!(!list.contains(first));
    assert!(list.contains(second));
    assert_eq!(list.len(), 1);
}

#[test]
fn dropping_the_command_system_drains_and_frees_everything() {
    let Fixture {
        device, commands, ..
    } = Fixture::single_queue();

    for _ in 0..4 {
        commands
            .run_commands(&CommandBufferDesc::graphics(), |_| Ok(()), RunOptions::default())
            .unwrap();
    }
    assert_eq!(commands.orphan_count(), 4);
    assert_eq!(device.live_buffer_count(), 4);

    drop(commands);
    assert_eq!(device.live_buffer_count(), 0);
    assert_eq!(device.live_fence_count(), 0);
    assert_eq!(device.live_pool_count(), 0);
    assert!(device.premature_frees().is_empty());
    assert!(!device.wait_idle_calls().is_empty());
}
