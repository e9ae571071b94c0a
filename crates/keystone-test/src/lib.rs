//! Test doubles for keystone-gpu.
//!
//! Provides in-memory implementations of the driver seams so command submission, orphan
//! collection, pipeline caching and the swapchain state machine can be tested without a GPU.

pub mod device;
pub mod pipeline;
pub mod present;

pub use device::{BufferState, MockDevice, RecordedCommand, SubmitRecord};
pub use pipeline::{CreatedPipeline, MockPipelineFactory};
pub use present::{CreatedSwapchain, MockPresenter, MockSurface, PresentRecord, PresenterEvent};

use ash::vk;
use ash::vk::Handle;
use keystone_gpu::{CommandConfig, CommandSystem, DeviceQueues, QueuePlan};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// A fresh non-null raw handle, unique across every double.
pub fn next_handle() -> u64 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

/// Queue family properties with a 1x1x1 transfer granularity.
pub fn queue_family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
    vk::QueueFamilyProperties {
        queue_flags: flags,
        queue_count: count,
        timestamp_valid_bits: 64,
        min_image_transfer_granularity: vk::Extent3D {
            width: 1,
            height: 1,
            depth: 1,
        },
    }
}

/// One family with a single queue that does everything.
pub fn single_queue_families() -> Vec<vk::QueueFamilyProperties> {
    vec![queue_family(
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        1,
    )]
}

/// A universal family plus dedicated transfer and compute families.
pub fn discrete_families() -> Vec<vk::QueueFamilyProperties> {
    vec![
        queue_family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            16,
        ),
        queue_family(vk::QueueFlags::TRANSFER, 2),
        queue_family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 8),
    ]
}

/// Lay out queues for `families`, giving every queue a fresh handle.
pub fn mock_queues(families: &[vk::QueueFamilyProperties]) -> DeviceQueues {
    let plan =
        QueuePlan::new(families).expect("families must cover graphics, transfer and compute");
    DeviceQueues::from_plan(&plan, families, |_, _| vk::Queue::from_raw(next_handle()))
}

/// A command system running on a [`MockDevice`].
pub struct Fixture {
    pub device: Arc<MockDevice>,
    pub queues: DeviceQueues,
    pub commands: CommandSystem,
}

impl Fixture {
    pub fn new(families: &[vk::QueueFamilyProperties], config: CommandConfig) -> Self {
        let device = MockDevice::new();
        let queues = mock_queues(families);
        let commands = CommandSystem::new(device.clone(), &queues, &config)
            .expect("mock command system creation cannot fail");
        Self {
            device,
            queues,
            commands,
        }
    }

    /// Single universal queue, two pools per bank.
    pub fn single_queue() -> Self {
        Self::new(&single_queue_families(), config(2))
    }

    /// Separate graphics, transfer and compute queues, two pools per bank.
    pub fn discrete() -> Self {
        Self::new(&discrete_families(), config(2))
    }
}

/// Default config with `parallelism` pools per bank and trimming enabled.
pub fn config(parallelism: usize) -> CommandConfig {
    CommandConfig {
        parallelism,
        can_trim: true,
        ..CommandConfig::default()
    }
}
