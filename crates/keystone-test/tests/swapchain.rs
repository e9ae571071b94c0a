use ash::vk;
use keystone_gpu::{
    Event, Fence, GpuError, RawDevice, Result, Semaphore, Swapchain, SwapchainDesc,
    SwapchainState, SyncObject,
};
use keystone_test::{Fixture, MockPresenter, MockSurface, PresenterEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Harness {
    fixture: Fixture,
    presenter: Arc<MockPresenter>,
    window: Arc<MockSurface>,
}

impl Harness {
    fn new(width: u32, height: u32) -> Self {
        Self::with_fixture(Fixture::single_queue(), width, height)
    }

    fn with_fixture(fixture: Fixture, width: u32, height: u32) -> Self {
        Self {
            fixture,
            presenter: MockPresenter::new(),
            window: MockSurface::new(width, height),
        }
    }

    fn swapchain(&self, desc: SwapchainDesc) -> Result<Swapchain> {
        Swapchain::new(
            self.presenter.clone(),
            self.window.clone(),
            MockPresenter::surface(),
            &self.fixture.commands,
            &self.fixture.queues,
            desc,
        )
    }

    /// Minimized windows report a zero extent and zero surface limits.
    fn minimize(&self) {
        self.window.set_extent(0, 0);
        self.presenter.set_extent_limits((0, 0), (0, 0));
    }

    fn restore(&self, width: u32, height: u32) {
        self.presenter.set_extent_limits((1, 1), (4096, 4096));
        self.window.set_extent(width, height);
    }

    fn raw(&self) -> Arc<dyn RawDevice> {
        self.fixture.device.clone()
    }
}

fn count_rebuilds(swapchain: &mut Swapchain) -> Arc<AtomicUsize> {
    let rebuilds = Arc::new(AtomicUsize::new(0));
    let counter = rebuilds.clone();
    swapchain.on_rebuild(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    rebuilds
}

fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

#[test]
fn builds_for_the_window_size() {
    let harness = Harness::new(800, 600);
    let swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();

    assert_eq!(swapchain.state(), SwapchainState::Ready);
    assert_eq!(swapchain.extent(), extent(800, 600));
    assert_eq!(swapchain.format(), vk::Format::B8G8R8A8_SRGB);
    assert_eq!(swapchain.images().len(), 2);

    let created = harness.presenter.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].old_swapchain, vk::SwapchainKHR::null());
    assert_eq!(created[0].present_mode, vk::PresentModeKHR::FIFO);
    assert_eq!(created[0].color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    assert_eq!(created[0].sharing_mode, vk::SharingMode::EXCLUSIVE);
    assert_eq!(swapchain.handle(), Some(created[0].swapchain));
}

#[test]
fn mailbox_asks_for_a_third_image() {
    let harness = Harness::new(800, 600);
    let swapchain = harness
        .swapchain(SwapchainDesc {
            present_mode: vk::PresentModeKHR::MAILBOX,
            ..SwapchainDesc::default()
        })
        .unwrap();

    assert_eq!(swapchain.info().present_mode, vk::PresentModeKHR::MAILBOX);
    assert_eq!(harness.presenter.created()[0].min_image_count, 3);
    assert_eq!(swapchain.images().len(), 3);
}

#[test]
fn unsupported_present_mode_falls_back_to_fifo() {
    let harness = Harness::new(800, 600);
    harness
        .presenter
        .set_present_modes(vec![vk::PresentModeKHR::FIFO]);
    let swapchain = harness
        .swapchain(SwapchainDesc {
            present_mode: vk::PresentModeKHR::MAILBOX,
            ..SwapchainDesc::default()
        })
        .unwrap();

    assert_eq!(swapchain.info().present_mode, vk::PresentModeKHR::FIFO);
    assert_eq!(harness.presenter.created()[0].min_image_count, 2);
}

#[test]
fn preferred_format_is_honoured() {
    let harness = Harness::new(800, 600);
    harness.presenter.set_formats(vec![
        vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        },
        vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        },
    ]);
    let swapchain = harness
        .swapchain(SwapchainDesc {
            preferred_format: Some(vk::Format::R8G8B8A8_UNORM),
            ..SwapchainDesc::default()
        })
        .unwrap();

    assert_eq!(swapchain.format(), vk::Format::R8G8B8A8_UNORM);
}

#[test]
fn extent_is_clamped_to_the_surface_limits() {
    let harness = Harness::new(8000, 100);
    harness.presenter.set_extent_limits((200, 200), (4096, 4096));
    let swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();

    assert_eq!(swapchain.extent(), extent(4096, 200));
    assert_eq!(harness.presenter.created()[0].extent, extent(4096, 200));
}

#[test]
fn out_of_date_acquire_rebuilds_once_and_retries() {
    let harness = Harness::new(800, 600);
    let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();
    let rebuilds = count_rebuilds(&mut swapchain);

    harness
        .presenter
        .push_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
    harness.presenter.push_acquire(Ok((1, false)));

    assert_eq!(swapchain.begin_frame(None).unwrap(), 1);
    assert_eq!(rebuilds.load(Ordering::SeqCst), 1);
    assert_eq!(harness.presenter.created().len(), 2);
    assert_eq!(harness.presenter.acquire_count(), 2);
    assert_eq!(swapchain.state(), SwapchainState::Acquired);
    assert_eq!(swapchain.current_image(), 1);

    let present_queue = swapchain.present_bank().queue().handle();
    assert_eq!(harness.fixture.device.wait_idle_calls(), vec![present_queue]);
}

#[test]
fn rebuild_retires_the_old_swapchain_after_creating_the_new_one() {
    let harness = Harness::new(800, 600);
    let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();
    let first = swapchain.handle().unwrap();

    harness.window.set_extent(1024, 768);
    assert!(swapchain.recreate_swapchain().unwrap());
    let second = swapchain.handle().unwrap();

    assert_ne!(first, second);
    assert_eq!(swapchain.extent(), extent(1024, 768));
    assert_eq!(
        harness.presenter.events(),
        vec![
            PresenterEvent::Created {
                swapchain: first,
                old: vk::SwapchainKHR::null(),
            },
            PresenterEvent::Created {
                swapchain: second,
                old: first,
            },
            PresenterEvent::Destroyed(first),
        ]
    );
    assert_eq!(harness.presenter.live_swapchain_count(), 1);
}

#[test]
fn failed_image_query_leaves_no_stale_swapchain() {
    let harness = Harness::new(800, 600);
    let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();
    let rebuilds = count_rebuilds(&mut swapchain);

    harness.window.set_extent(1024, 768);
    harness
        .presenter
        .fail_next_image_query(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
    assert!(matches!(
        swapchain.recreate_swapchain(),
        Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
    ));

    assert_eq!(swapchain.handle(), None);
    assert!(swapchain.images().is_empty());
    assert_eq!(swapchain.state(), SwapchainState::Uninitialized);
    assert_eq!(harness.presenter.live_swapchain_count(), 0);
    assert_eq!(rebuilds.load(Ordering::SeqCst), 0);

    // The next frame builds a fresh swapchain.
    swapchain.begin_frame(None).unwrap();
    assert_eq!(swapchain.extent(), extent(1024, 768));
    assert_eq!(rebuilds.load(Ordering::SeqCst), 1);
    assert_eq!(harness.presenter.live_swapchain_count(), 1);
}

#[test]
fn listeners_see_the_rebuilt_swapchain() {
    let harness = Harness::new(800, 600);
    let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    swapchain.on_rebuild(move |info| sink.lock().push((info.extent, info.images.len())));

    harness.window.set_extent(320, 240);
    swapchain.recreate_swapchain().unwrap();

    assert_eq!(*seen.lock(), vec![(extent(320, 240), 2)]);
}

#[test]
fn zero_area_rebuild_changes_nothing() {
    let harness = Harness::new(800, 600);
    let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();
    let rebuilds = count_rebuilds(&mut swapchain);
    let handle = swapchain.handle();
    let events = harness.presenter.events();

    harness.minimize();
    assert!(!swapchain.recreate_swapchain().unwrap());

    assert_eq!(swapchain.handle(), handle);
    assert_eq!(swapchain.extent(), extent(800, 600));
    assert_eq!(harness.presenter.events(), events);
    assert_eq!(rebuilds.load(Ordering::SeqCst), 0);
}

#[test]
fn minimized_window_defers_the_first_build() {
    let harness = Harness::new(0, 0);
    harness.minimize();
    let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();

    assert_eq!(swapchain.state(), SwapchainState::Uninitialized);
    assert_eq!(swapchain.handle(), None);
    assert!(matches!(
        swapchain.begin_frame(None),
        Err(GpuError::NotPresentable)
    ));
    assert!(harness.presenter.created().is_empty());

    harness.restore(640, 480);
    assert_eq!(swapchain.begin_frame(None).unwrap(), 0);
    assert_eq!(harness.presenter.created().len(), 1);
    assert_eq!(swapchain.extent(), extent(640, 480));
}

#[test]
fn out_of_date_while_minimized_is_not_presentable() {
    let harness = Harness::new(800, 600);
    let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();

    harness.minimize();
    harness
        .presenter
        .push_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));

    assert!(matches!(
        swapchain.begin_frame(None),
        Err(GpuError::NotPresentable)
    ));
    assert_eq!(harness.presenter.created().len(), 1);
}

#[test]
fn suboptimal_acquire_is_used_then_rebuilt_after_present() {
    let harness = Harness::new(800, 600);
    let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();
    let rebuilds = count_rebuilds(&mut swapchain);

    harness.presenter.push_acquire(Ok((0, true)));
    assert_eq!(swapchain.begin_frame(None).unwrap(), 0);
    assert!(swapchain.is_suboptimal());
    assert_eq!(rebuilds.load(Ordering::SeqCst), 0);

    swapchain.end_frame(None, &[]).unwrap();
    assert_eq!(rebuilds.load(Ordering::SeqCst), 1);
    assert!(!swapchain.is_suboptimal());
    assert_eq!(swapchain.state(), SwapchainState::Ready);

    let present_queue = swapchain.present_bank().queue().handle();
    assert!(harness
        .fixture
        .device
        .wait_idle_calls()
        .contains(&present_queue));
}

#[test]
fn stale_present_results_trigger_a_rebuild() {
    for result in [Ok(true), Err(vk::Result::ERROR_OUT_OF_DATE_KHR)] {
        let harness = Harness::new(800, 600);
        let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();
        let rebuilds = count_rebuilds(&mut swapchain);

        swapchain.begin_frame(None).unwrap();
        harness.presenter.push_present(result);
        swapchain.end_frame(None, &[]).unwrap();

        assert_eq!(rebuilds.load(Ordering::SeqCst), 1, "{result:?}");
        assert_eq!(harness.presenter.created().len(), 2);
    }
}

#[test]
fn present_waits_on_the_given_semaphores() {
    let harness = Harness::new(800, 600);
    harness.presenter.set_present_fence_support(true);
    let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();
    let rebuilds = count_rebuilds(&mut swapchain);
    let acquired = Semaphore::new(harness.raw()).unwrap();
    let rendered = Semaphore::new(harness.raw()).unwrap();
    let presented = Fence::new(harness.raw(), false).unwrap();

    let index = swapchain
        .begin_frame(Some(SyncObject::Semaphore(&acquired)))
        .unwrap();
    swapchain
        .end_frame(Some(&presented), &[SyncObject::Semaphore(&rendered)])
        .unwrap();

    let presents = harness.presenter.presents();
    assert_eq!(presents.len(), 1);
    assert_eq!(presents[0].image_index, index);
    assert_eq!(Some(presents[0].swapchain), swapchain.handle());
    assert_eq!(presents[0].queue, swapchain.present_bank().queue().handle());
    assert_eq!(presents[0].wait_semaphores, vec![rendered.handle()]);
    assert_eq!(presents[0].fence, presented.handle());
    assert_eq!(rebuilds.load(Ordering::SeqCst), 0);
    assert_eq!(swapchain.state(), SwapchainState::Ready);
}

#[test]
fn present_fence_needs_driver_support() {
    let harness = Harness::new(800, 600);
    let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();
    let presented = Fence::new(harness.raw(), false).unwrap();

    swapchain.begin_frame(None).unwrap();
    assert!(matches!(
        swapchain.end_frame(Some(&presented), &[]),
        Err(GpuError::UnsupportedOperation(_))
    ));
    assert!(harness.presenter.presents().is_empty());

    // The image stays acquired, so presenting without a fence still works.
    assert_eq!(swapchain.state(), SwapchainState::Acquired);
    swapchain.end_frame(None, &[]).unwrap();
    assert_eq!(harness.presenter.presents().len(), 1);
}

#[test]
fn frames_rotate_through_the_images() {
    let harness = Harness::new(800, 600);
    let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();

    let mut indices = Vec::new();
    for _ in 0..4 {
        indices.push(swapchain.begin_frame(None).unwrap());
        swapchain.end_frame(None, &[]).unwrap();
    }
    assert_eq!(indices, vec![0, 1, 0, 1]);
    assert_eq!(harness.presenter.created().len(), 1);
}

#[test]
fn fatal_errors_are_returned() {
    let harness = Harness::new(800, 600);
    let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();

    harness
        .presenter
        .push_acquire(Err(vk::Result::ERROR_DEVICE_LOST));
    assert!(matches!(
        swapchain.begin_frame(None),
        Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
    ));

    swapchain.begin_frame(None).unwrap();
    harness
        .presenter
        .push_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR));
    assert!(matches!(
        swapchain.end_frame(None, &[]),
        Err(GpuError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
    ));
    assert_eq!(swapchain.state(), SwapchainState::Ready);
    assert_eq!(harness.presenter.created().len(), 1);
}

#[test]
fn misuse_is_rejected() {
    let harness = Harness::new(800, 600);
    let mut swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();
    let event = Event::new(harness.raw()).unwrap();
    let fence = Fence::new(harness.raw(), false).unwrap();

    assert!(matches!(
        swapchain.end_frame(None, &[]),
        Err(GpuError::InvalidState(_))
    ));
    assert!(matches!(
        swapchain.begin_frame(Some(SyncObject::Event(&event))),
        Err(GpuError::InvalidState(_))
    ));

    let index = swapchain.begin_frame(None).unwrap();
    assert!(matches!(
        swapchain.end_frame(None, &[SyncObject::Fence(&fence)]),
        Err(GpuError::InvalidState(_))
    ));
    assert!(harness.presenter.presents().is_empty());
    assert_eq!(swapchain.state(), SwapchainState::Acquired);

    // A second acquire before presenting would leak the first image.
    assert!(matches!(
        swapchain.begin_frame(None),
        Err(GpuError::InvalidState(_))
    ));
    assert_eq!(harness.presenter.acquire_count(), 1);
    assert_eq!(swapchain.current_image(), index);
}

#[test]
fn present_queue_prefers_transfer_then_graphics_then_compute() {
    let cases: [(Option<Vec<u32>>, u32); 4] = [
        (None, 1),
        (Some(vec![0, 2]), 0),
        (Some(vec![2]), 2),
        (Some(vec![1, 2]), 1),
    ];

    for (presenting, family) in cases {
        let harness = Harness::with_fixture(Fixture::discrete(), 800, 600);
        if let Some(families) = presenting.clone() {
            harness.presenter.set_presenting_families(families);
        }
        let swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();
        assert_eq!(
            swapchain.present_bank().queue().family(),
            family,
            "{presenting:?}"
        );
        assert_eq!(
            harness.presenter.created()[0].sharing_mode,
            vk::SharingMode::CONCURRENT
        );
    }
}

#[test]
fn surface_without_a_presenting_queue_is_released() {
    let harness = Harness::with_fixture(Fixture::discrete(), 800, 600);
    harness.presenter.set_presenting_families(Vec::new());

    let result = harness.swapchain(SwapchainDesc::default());
    assert!(matches!(result, Err(GpuError::NoSuitableQueue(_))));

    let events = harness.presenter.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], PresenterEvent::SurfaceDestroyed(_)));
}

#[test]
fn drop_destroys_the_swapchain_before_the_surface() {
    let harness = Harness::new(800, 600);
    let swapchain = harness.swapchain(SwapchainDesc::default()).unwrap();
    let handle = swapchain.handle().unwrap();
    let surface = swapchain.surface();

    drop(swapchain);
    let events = harness.presenter.events();
    assert_eq!(
        &events[events.len() - 2..],
        &[
            PresenterEvent::Destroyed(handle),
            PresenterEvent::SurfaceDestroyed(surface),
        ]
    );
    assert_eq!(harness.presenter.live_swapchain_count(), 0);
    assert!(!harness.fixture.device.wait_idle_calls().is_empty());
}
