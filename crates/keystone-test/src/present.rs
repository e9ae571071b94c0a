//! In-memory [`Presenter`] and [`SurfaceProvider`].
//!
//! Acquire and present results can be scripted one call at a time; unscripted calls succeed.

use crate::next_handle;
use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use hashbrown::HashMap;
use keystone_gpu::{GpuError, Presenter, Result, SurfaceProvider};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ffi::CStr;
use std::sync::Arc;

/// Swapchain lifecycle events in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterEvent {
    Created {
        swapchain: vk::SwapchainKHR,
        old: vk::SwapchainKHR,
    },
    Destroyed(vk::SwapchainKHR),
    SurfaceDestroyed(vk::SurfaceKHR),
}

/// Parameters a swapchain was created with.
#[derive(Debug, Clone, Copy)]
pub struct CreatedSwapchain {
    pub swapchain: vk::SwapchainKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub sharing_mode: vk::SharingMode,
    pub old_swapchain: vk::SwapchainKHR,
}

/// One call to `queue_present`.
#[derive(Debug, Clone)]
pub struct PresentRecord {
    pub queue: vk::Queue,
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

struct State {
    capabilities: vk::SurfaceCapabilitiesKHR,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
    presenting_families: Option<Vec<u32>>,
    acquire_script: VecDeque<VkResult<(u32, bool)>>,
    present_script: VecDeque<VkResult<bool>>,
    images: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    next_image: u32,
    created: Vec<CreatedSwapchain>,
    events: Vec<PresenterEvent>,
    acquires: usize,
    presents: Vec<PresentRecord>,
    present_fence: bool,
    fail_images: Option<vk::Result>,
}

/// A [`Presenter`] with a scriptable surface.
pub struct MockPresenter {
    state: Mutex<State>,
}

impl MockPresenter {
    /// A surface accepting 1x1 to 4096x4096, 2 to 8 images, sRGB BGRA8, FIFO and mailbox.
    pub fn new() -> Arc<Self> {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        };

        Arc::new(Self {
            state: Mutex::new(State {
                capabilities,
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                presenting_families: None,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                images: HashMap::new(),
                next_image: 0,
                created: Vec::new(),
                events: Vec::new(),
                acquires: 0,
                presents: Vec::new(),
                present_fence: false,
                fail_images: None,
            }),
        })
    }

    /// A fresh surface handle for [`keystone_gpu::Swapchain::new`].
    pub fn surface() -> vk::SurfaceKHR {
        vk::SurfaceKHR::from_raw(next_handle())
    }

    pub fn set_extent_limits(&self, min: (u32, u32), max: (u32, u32)) {
        let mut state = self.state.lock();
        state.capabilities.min_image_extent = vk::Extent2D {
            width: min.0,
            height: min.1,
        };
        state.capabilities.max_image_extent = vk::Extent2D {
            width: max.0,
            height: max.1,
        };
    }

    pub fn set_image_count_limits(&self, min: u32, max: u32) {
        let mut state = self.state.lock();
        state.capabilities.min_image_count = min;
        state.capabilities.max_image_count = max;
    }

    pub fn set_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state.lock().formats = formats;
    }

    pub fn set_present_modes(&self, modes: Vec<vk::PresentModeKHR>) {
        self.state.lock().present_modes = modes;
    }

    /// Restrict presentation support to `families`. By default every family can present.
    pub fn set_presenting_families(&self, families: Vec<u32>) {
        self.state.lock().presenting_families = Some(families);
    }

    /// Pretend the device was created with `VK_EXT_swapchain_maintenance1`.
    pub fn set_present_fence_support(&self, supported: bool) {
        self.state.lock().present_fence = supported;
    }

    /// Fail the next `swapchain_images` query with `result`.
    pub fn fail_next_image_query(&self, result: vk::Result) {
        self.state.lock().fail_images = Some(result);
    }

    /// Script the result of the next unscripted acquire.
    pub fn push_acquire(&self, result: VkResult<(u32, bool)>) {
        self.state.lock().acquire_script.push_back(result);
    }

    /// Script the result of the next unscripted present.
    pub fn push_present(&self, result: VkResult<bool>) {
        self.state.lock().present_script.push_back(result);
    }

    pub fn created(&self) -> Vec<CreatedSwapchain> {
        self.state.lock().created.clone()
    }

    pub fn events(&self) -> Vec<PresenterEvent> {
        self.state.lock().events.clone()
    }

    pub fn live_swapchain_count(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn acquire_count(&self) -> usize {
        self.state.lock().acquires
    }

    pub fn presents(&self) -> Vec<PresentRecord> {
        self.state.lock().presents.clone()
    }
}

impl Presenter for MockPresenter {
    unsafe fn surface_capabilities(
        &self,
        _surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(self.state.lock().capabilities)
    }

    unsafe fn surface_formats(
        &self,
        _surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.state.lock().formats.clone())
    }

    unsafe fn present_modes(&self, _surface: vk::SurfaceKHR) -> Result<Vec<vk::PresentModeKHR>> {
        Ok(self.state.lock().present_modes.clone())
    }

    unsafe fn surface_support(&self, family: u32, _surface: vk::SurfaceKHR) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .presenting_families
            .as_ref()
            .map_or(true, |families| families.contains(&family)))
    }

    unsafe fn create_swapchain(
        &self,
        info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        let old = info.old_swapchain;
        if old != vk::SwapchainKHR::null() && !state.images.contains_key(&old) {
            return Err(GpuError::SwapchainCreation(
                "old swapchain is not live".to_string(),
            ));
        }

        let swapchain = vk::SwapchainKHR::from_raw(next_handle());
        let images = (0..info.min_image_count)
            .map(|_| vk::Image::from_raw(next_handle()))
            .collect();
        state.images.insert(swapchain, images);
        state.next_image = 0;
        state.created.push(CreatedSwapchain {
            swapchain,
            extent: info.image_extent,
            min_image_count: info.min_image_count,
            format: info.image_format,
            color_space: info.image_color_space,
            present_mode: info.present_mode,
            sharing_mode: info.image_sharing_mode,
            old_swapchain: old,
        });
        state.events.push(PresenterEvent::Created { swapchain, old });
        Ok(swapchain)
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.images.remove(&swapchain);
        state.events.push(PresenterEvent::Destroyed(swapchain));
    }

    unsafe fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_images.take() {
            return Err(GpuError::Vulkan(result));
        }
        state
            .images
            .get(&swapchain)
            .cloned()
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
    }

    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        _semaphore: vk::Semaphore,
        _fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        state.acquires += 1;
        if let Some(result) = state.acquire_script.pop_front() {
            return result;
        }

        let count = state
            .images
            .get(&swapchain)
            .map(|images| images.len())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        let count = u32::try_from(count).unwrap_or(u32::MAX).max(1);
        let index = state.next_image % count;
        state.next_image = state.next_image.wrapping_add(1);
        Ok((index, false))
    }

    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.presents.push(PresentRecord {
            queue,
            swapchain,
            image_index,
            wait_semaphores: wait_semaphores.to_vec(),
            fence,
        });
        state.present_script.pop_front().unwrap_or(Ok(false))
    }

    unsafe fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        self.state
            .lock()
            .events
            .push(PresenterEvent::SurfaceDestroyed(surface));
    }

    fn supports_present_fence(&self) -> bool {
        self.state.lock().present_fence
    }
}

impl std::fmt::Debug for MockPresenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockPresenter")
            .field("live", &state.images.len())
            .field("created", &state.created.len())
            .finish_non_exhaustive()
    }
}

/// A window whose size the test controls.
#[derive(Debug)]
pub struct MockSurface {
    extent: Mutex<(u32, u32)>,
}

impl MockSurface {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            extent: Mutex::new((width, height)),
        })
    }

    /// Resize the window, or minimize it with `(0, 0)`.
    pub fn set_extent(&self, width: u32, height: u32) {
        *self.extent.lock() = (width, height);
    }
}

impl SurfaceProvider for MockSurface {
    unsafe fn create_surface(
        &self,
        _entry: &ash::Entry,
        _instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR> {
        Ok(MockPresenter::surface())
    }

    fn current_extent(&self) -> (u32, u32) {
        *self.extent.lock()
    }

    fn required_instance_extensions(&self) -> Result<Vec<&'static CStr>> {
        Ok(vec![ash::khr::surface::NAME])
    }
}
