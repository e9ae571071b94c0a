use ash::vk;
use keystone_gpu::{
    CommandBuffer, CommandBufferDesc, CommandSystem, Event, Fence, GpuError, RawDevice,
    RunOptions, Semaphore, Submission, SyncObject,
};
use keystone_test::{config, queue_family, Fixture, MockDevice};
use std::sync::Arc;
use std::thread;

fn raw(device: &Arc<MockDevice>) -> Arc<dyn RawDevice> {
    device.clone()
}

fn recorded(fixture: &Fixture, desc: &CommandBufferDesc) -> CommandBuffer {
    let mut buffer = fixture.commands.allocate(desc).unwrap();
    buffer
        .begin_recording(vk::CommandBufferUsageFlags::empty())
        .unwrap()
        .end()
        .unwrap();
    buffer
}

fn extent(width: u32, height: u32, depth: u32) -> vk::Extent3D {
    vk::Extent3D {
        width,
        height,
        depth,
    }
}

#[test]
fn banks_are_selected_by_usage() {
    let fixture = Fixture::discrete();
    let commands = &fixture.commands;
    let selected = |usage| commands.select_bank(&CommandBufferDesc::new(usage)).unwrap();

    assert!(Arc::ptr_eq(selected(vk::QueueFlags::GRAPHICS), commands.graphics_bank()));
    assert!(Arc::ptr_eq(selected(vk::QueueFlags::COMPUTE), commands.compute_bank()));
    assert!(Arc::ptr_eq(selected(vk::QueueFlags::TRANSFER), commands.transfer_bank()));
    assert!(Arc::ptr_eq(
        selected(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        commands.graphics_bank()
    ));
    assert!(Arc::ptr_eq(
        selected(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        commands.compute_bank()
    ));

    assert_eq!(commands.graphics_bank().queue().family(), 0);
    assert_eq!(commands.transfer_bank().queue().family(), 1);
    assert_eq!(commands.compute_bank().queue().family(), 2);
}

#[test]
fn coarse_transfer_granularity_falls_back_to_graphics() {
    let mut coarse = queue_family(vk::QueueFlags::TRANSFER, 1);
    coarse.min_image_transfer_granularity = extent(8, 8, 1);
    let families = [
        queue_family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            4,
        ),
        coarse,
    ];
    let fixture = Fixture::new(&families, config(1));
    let commands = &fixture.commands;

    let fine = CommandBufferDesc::transfer().granularity(extent(1, 1, 1));
    assert!(Arc::ptr_eq(commands.select_bank(&fine).unwrap(), commands.graphics_bank()));

    let tiled = CommandBufferDesc::transfer().granularity(extent(16, 16, 1));
    assert!(Arc::ptr_eq(commands.select_bank(&tiled).unwrap(), commands.transfer_bank()));

    let any = CommandBufferDesc::transfer();
    assert!(Arc::ptr_eq(commands.select_bank(&any).unwrap(), commands.transfer_bank()));
}

#[test]
fn unsatisfiable_usage_is_rejected() {
    let families = [
        queue_family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, 1),
        queue_family(vk::QueueFlags::COMPUTE, 1),
        queue_family(vk::QueueFlags::TRANSFER, 1),
    ];
    let fixture = Fixture::new(&families, config(1));

    let desc = CommandBufferDesc::new(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
    assert!(matches!(
        fixture.commands.select_bank(&desc),
        Err(GpuError::NoSuitableCommandBank(_))
    ));
    assert!(matches!(
        fixture.commands.allocate(&desc),
        Err(GpuError::NoSuitableCommandBank(_))
    ));
}

#[test]
fn submit_forwards_buffers_and_semaphores() {
    let fixture = Fixture::discrete();
    let device = &fixture.device;
    let buffer = recorded(&fixture, &CommandBufferDesc::graphics());
    let wait = Semaphore::new(raw(device)).unwrap();
    let signal = Semaphore::new(raw(device)).unwrap();
    let fence = Fence::new(raw(device), false).unwrap();

    fixture
        .commands
        .submit(&Submission {
            command_buffers: &[&buffer],
            wait: &[(
                SyncObject::Semaphore(&wait),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )],
            signal: &[SyncObject::Semaphore(&signal), SyncObject::Fence(&fence)],
        })
        .unwrap();

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 1);
    let record = &submissions[0];
    assert_eq!(record.queue, fixture.queues.graphics.handle());
    assert_eq!(record.command_buffers, vec![buffer.handle()]);
    assert_eq!(record.wait_semaphores, vec![wait.handle()]);
    assert_eq!(
        record.wait_stages,
        vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT]
    );
    assert_eq!(record.signal_semaphores, vec![signal.handle()]);
    assert_eq!(record.fence, fence.handle());

    device.signal_fence(fence.handle());
}

fn invalid(commands: &CommandSystem, submission: &Submission<'_>) -> bool {
    matches!(commands.submit(submission), Err(GpuError::InvalidState(_)))
}

#[test]
fn malformed_submissions_are_rejected() {
    let fixture = Fixture::discrete();
    let device = &fixture.device;
    let commands = &fixture.commands;
    let graphics = recorded(&fixture, &CommandBufferDesc::graphics());
    let transfer = recorded(&fixture, &CommandBufferDesc::transfer());
    let unrecorded = commands.allocate(&CommandBufferDesc::graphics()).unwrap();
    let fence_a = Fence::new(raw(device), false).unwrap();
    let fence_b = Fence::new(raw(device), false).unwrap();
    let event = Event::new(raw(device)).unwrap();

    assert!(invalid(commands, &Submission::default()));
    assert!(invalid(commands, &Submission {
        command_buffers: &[&graphics, &transfer],
        ..Submission::default()
    }));
    assert!(invalid(commands, &Submission {
        command_buffers: &[&graphics, &unrecorded],
        ..Submission::default()
    }));
    assert!(invalid(commands, &Submission {
        command_buffers: &[&graphics],
        wait: &[(SyncObject::Fence(&fence_a), vk::PipelineStageFlags::TOP_OF_PIPE)],
        ..Submission::default()
    }));
    assert!(invalid(commands, &Submission {
        command_buffers: &[&graphics],
        signal: &[SyncObject::Fence(&fence_a), SyncObject::Fence(&fence_b)],
        ..Submission::default()
    }));
    assert!(invalid(commands, &Submission {
        command_buffers: &[&graphics],
        signal: &[SyncObject::Event(&event)],
        ..Submission::default()
    }));

    assert!(device.submissions().is_empty());
}

#[test]
fn run_commands_records_once_and_signals_a_private_fence() {
    let fixture = Fixture::discrete();
    let device = &fixture.device;
    let mut recorded_on = None;

    fixture
        .commands
        .run_commands(
            &CommandBufferDesc::transfer(),
            |recording| {
                recorded_on = Some(recording.handle());
                Ok(())
            },
            RunOptions::default(),
        )
        .unwrap();

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 1);
    let record = &submissions[0];
    assert_eq!(record.queue, fixture.queues.transfer.handle());
    assert_eq!(Some(record.command_buffers[0]), recorded_on);
    assert_ne!(record.fence, vk::Fence::null());
    assert_eq!(
        device.begin_flags(record.command_buffers[0]),
        Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    );
    assert_eq!(fixture.commands.orphan_count(), 1);
}

#[test]
fn run_commands_resets_a_signalled_caller_fence() {
    let fixture = Fixture::single_queue();
    let device = &fixture.device;
    let fence = Arc::new(Fence::new(raw(device), true).unwrap());

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

    assert_eq!(device.last_submit_fence(), Some(fence.handle()));
    assert!(!device.is_fence_signaled(fence.handle()));
}

#[test]
fn run_commands_rejects_fences_in_the_signal_list() {
    let fixture = Fixture::single_queue();
    let device = &fixture.device;
    let fence = Fence::new(raw(device), false).unwrap();

    let result = fixture.commands.run_commands(
        &CommandBufferDesc::graphics(),
        |_| Ok(()),
        RunOptions {
            signal: &[SyncObject::Fence(&fence)],
            ..RunOptions::default()
        },
    );
    assert!(matches!(result, Err(GpuError::InvalidState(_))));
    assert!(device.submissions().is_empty());
}

#[test]
fn run_commands_propagates_recording_errors() {
    let fixture = Fixture::single_queue();
    let device = &fixture.device;

    let result = fixture.commands.run_commands(
        &CommandBufferDesc::graphics(),
        |_| Err(GpuError::Other("recording failed".to_string())),
        RunOptions::default(),
    );
    assert!(matches!(result, Err(GpuError::Other(_))));
    assert!(device.submissions().is_empty());
    assert_eq!(device.live_buffer_count(), 0);
}

#[test]
fn failed_submission_frees_the_buffer_immediately() {
    let fixture = Fixture::single_queue();
    let device = &fixture.device;
    device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);

    let result = fixture.commands.run_commands(
        &CommandBufferDesc::graphics(),
        |_| Ok(()),
        RunOptions::default(),
    );
    assert!(matches!(
        result,
        Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
    ));
    assert_eq!(fixture.commands.orphan_count(), 0);
    assert_eq!(device.live_buffer_count(), 0);
    assert_eq!(device.live_fence_count(), 0);
}

#[test]
fn wait_idle_drains_each_distinct_queue_once() {
    let discrete = Fixture::discrete();
    discrete.commands.wait_idle().unwrap();
    let expected: Vec<_> = discrete.queues.unique().iter().map(|q| q.handle()).collect();
    assert_eq!(expected.len(), 3);
    assert_eq!(discrete.device.wait_idle_calls(), expected);

    let single = Fixture::single_queue();
    single.commands.wait_idle().unwrap();
    assert_eq!(single.device.wait_idle_calls(), vec![single.queues.graphics.handle()]);
}

#[test]
fn wait_idle_completes_outstanding_work() {
    let fixture = Fixture::single_queue();
    for _ in 0..3 {
        fixture
            .commands
            .run_commands(&CommandBufferDesc::graphics(), |_| Ok(()), RunOptions::default())
            .unwrap();
    }
    assert_eq!(fixture.commands.orphan_count(), 3);

    fixture.commands.wait_idle().unwrap();
    assert_eq!(fixture.commands.orphan_count(), 0);
    assert!(fixture.device.premature_frees().is_empty());
}

#[test]
fn concurrent_submitters_all_land() {
    let fixture = Fixture::discrete();
    fixture.device.set_signal_on_submit(true);
    let descs = [
        CommandBufferDesc::graphics(),
        CommandBufferDesc::transfer(),
        CommandBufferDesc::compute(),
        CommandBufferDesc::graphics(),
    ];

    thread::scope(|scope| {
        for desc in &descs {
            let commands = &fixture.commands;
            scope.spawn(move || {
                for _ in 0..25 {
                    commands
                        .run_commands(desc, |_| Ok(()), RunOptions::default())
                        .unwrap();
                }
            });
        }
        scope.spawn(|| {
            for _ in 0..5 {
                fixture.commands.wait_idle().unwrap();
            }
        });
    });

    assert_eq!(fixture.device.submissions().len(), 100);
    fixture.commands.collect_garbage();
    assert_eq!(fixture.commands.orphan_count(), 0);
    assert!(fixture.device.premature_frees().is_empty());
}

#[test]
fn trim_reaches_every_pool_of_every_bank() {
    let fixture = Fixture::discrete();
    let pools: Vec<_> = fixture
        .commands
        .banks()
        .iter()
        .flat_map(|bank| {
            (0..bank.pool_count())
                .map(|_| bank.acquire().handle())
                .collect::<Vec<_>>()
        })
        .collect();
    assert_eq!(pools.len(), 6);

    fixture.commands.trim();
    assert!(pools.iter().all(|&pool| fixture.device.trim_count(pool) == 1));
}
