//! Swapchain state machine.
//!
//! [`Swapchain`] owns a surface and the native swapchain built on it. [`Swapchain::begin_frame`]
//! acquires an image, rebuilding and retrying while the swapchain is out of date.
//! [`Swapchain::end_frame`] presents it and rebuilds after a stale present. Rebuilds chain the
//! old swapchain into the new one and notify every [`Swapchain::on_rebuild`] listener.

use crate::command::CommandBank;
use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use crate::queue::DeviceQueues;
use crate::submission::CommandSystem;
use crate::surface::SurfaceProvider;
use crate::sync::{Fence, SyncObject};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

/// Surface and swapchain driver calls.
pub trait Presenter: Send + Sync {
    /// # Safety
    /// `surface` must be a live surface of the presenter's instance.
    unsafe fn surface_capabilities(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR>;

    /// # Safety
    /// See [`Self::surface_capabilities`].
    unsafe fn surface_formats(&self, surface: vk::SurfaceKHR) -> Result<Vec<vk::SurfaceFormatKHR>>;

    /// # Safety
    /// See [`Self::surface_capabilities`].
    unsafe fn present_modes(&self, surface: vk::SurfaceKHR) -> Result<Vec<vk::PresentModeKHR>>;

    /// Whether queues of `family` can present to `surface`.
    ///
    /// # Safety
    /// See [`Self::surface_capabilities`].
    unsafe fn surface_support(&self, family: u32, surface: vk::SurfaceKHR) -> Result<bool>;

    /// # Safety
    /// Every handle in `info` must be valid. A non-null `old_swapchain` is retired by the call.
    unsafe fn create_swapchain(
        &self,
        info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR>;

    /// # Safety
    /// No image of `swapchain` may still be in use.
    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// # Safety
    /// `swapchain` must be live.
    unsafe fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;

    /// Acquire the next image. `Ok((index, true))` reports a suboptimal swapchain.
    ///
    /// # Safety
    /// `swapchain` must be live; `semaphore` and `fence` must be null or unsignalled.
    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)>;

    /// Present `image_index`. `Ok(true)` reports a suboptimal swapchain.
    ///
    /// # Safety
    /// The caller must hold exclusive access to `queue` and `image_index` must be acquired.
    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> VkResult<bool>;

    /// # Safety
    /// Every swapchain built on `surface` must already be destroyed.
    unsafe fn destroy_surface(&self, surface: vk::SurfaceKHR);

    /// Whether [`Self::queue_present`] can signal a fence.
    fn supports_present_fence(&self) -> bool;
}

/// [`Presenter`] over the `VK_KHR_surface` and `VK_KHR_swapchain` loaders.
pub struct AshPresenter {
    physical_device: vk::PhysicalDevice,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    present_fence: bool,
}

impl AshPresenter {
    /// `present_fence` must only be set when the device was created with
    /// `VK_EXT_swapchain_maintenance1` and its feature enabled.
    pub fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        present_fence: bool,
    ) -> Self {
        Self {
            physical_device,
            surface_loader: ash::khr::surface::Instance::new(entry, instance),
            swapchain_loader: ash::khr::swapchain::Device::new(instance, device),
            present_fence,
        }
    }
}

impl Presenter for AshPresenter {
    unsafe fn surface_capabilities(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, surface)
        }?)
    }

    unsafe fn surface_formats(&self, surface: vk::SurfaceKHR) -> Result<Vec<vk::SurfaceFormatKHR>> {
        Ok(unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, surface)
        }?)
    }

    unsafe fn present_modes(&self, surface: vk::SurfaceKHR) -> Result<Vec<vk::PresentModeKHR>> {
        Ok(unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, surface)
        }?)
    }

    unsafe fn surface_support(&self, family: u32, surface: vk::SurfaceKHR) -> Result<bool> {
        Ok(unsafe {
            self.surface_loader.get_physical_device_surface_support(
                self.physical_device,
                family,
                surface,
            )
        }?)
    }

    unsafe fn create_swapchain(
        &self,
        info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR> {
        unsafe { self.swapchain_loader.create_swapchain(info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    unsafe fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        Ok(unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }?)
    }

    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, semaphore, fence)
        }
    }

    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> VkResult<bool> {
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let fences = [fence];

        // Present fences need VK_EXT_swapchain_maintenance1.
        let mut fence_info = vk::SwapchainPresentFenceInfoEXT::default().fences(&fences);
        let mut present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        if fence != vk::Fence::null() {
            present_info = present_info.push_next(&mut fence_info);
        }

        unsafe { self.swapchain_loader.queue_present(queue, &present_info) }
    }

    unsafe fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_loader.destroy_surface(surface, None) };
    }

    fn supports_present_fence(&self) -> bool {
        self.present_fence
    }
}

impl std::fmt::Debug for AshPresenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AshPresenter")
            .field("physical_device", &self.physical_device)
            .finish_non_exhaustive()
    }
}

/// What the caller asks of a swapchain.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    /// Falls back to FIFO when the surface does not offer it.
    pub present_mode: vk::PresentModeKHR,
    pub preferred_format: Option<vk::Format>,
    pub image_usage: vk::ImageUsageFlags,
}

impl Default for SwapchainDesc {
    fn default() -> Self {
        Self {
            present_mode: vk::PresentModeKHR::FIFO,
            preferred_format: None,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }
}

/// Properties of the current native swapchain, passed to rebuild listeners.
#[derive(Debug, Clone, Default)]
pub struct SwapchainInfo {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub images: Vec<vk::Image>,
}

/// Where a [`Swapchain`] is in its frame cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    /// No native swapchain exists yet, because the surface has never had a nonzero extent.
    Uninitialized,
    /// Ready to acquire.
    Ready,
    /// An image is acquired and waiting to be presented.
    Acquired,
}

type RebuildListener = Box<dyn FnMut(&SwapchainInfo) + Send>;

/// Rank a surface format: the preferred format wins, then 8-bit RGBA/BGRA, with a bonus for
/// sRGB non-linear color.
fn score_format(format: &vk::SurfaceFormatKHR, preferred: Option<vk::Format>) -> u32 {
    let mut score = 0;
    if format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR {
        score += 1;
    }
    if preferred.is_some_and(|preferred| preferred == format.format) {
        score += 10;
    } else if matches!(
        format.format,
        vk::Format::R8G8B8A8_UNORM
            | vk::Format::B8G8R8A8_UNORM
            | vk::Format::R8G8B8A8_SRGB
            | vk::Format::B8G8R8A8_SRGB
    ) {
        score += 5;
    }
    score
}

/// Select the best surface format. Ties keep the surface's order.
pub fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: Option<vk::Format>,
) -> Option<vk::SurfaceFormatKHR> {
    let mut best: Option<(u32, vk::SurfaceFormatKHR)> = None;
    for format in available {
        let score = score_format(format, preferred);
        if best.map_or(true, |(best_score, _)| score > best_score) {
            best = Some((score, *format));
        }
    }
    best.map(|(_, format)| format)
}

/// Use `requested` if the surface supports it, otherwise FIFO (always supported).
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    requested: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&requested) {
        requested
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Three images for mailbox, two otherwise, within the surface's limits.
///
/// A `max_image_count` of zero means no upper limit.
pub fn select_image_count(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    present_mode: vk::PresentModeKHR,
) -> u32 {
    let requested = if present_mode == vk::PresentModeKHR::MAILBOX {
        3
    } else {
        2
    };
    let count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Clamp the desired size to the surface's extent limits.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: desired_width.max(min.width).min(max.width),
        height: desired_height.max(min.height).min(max.height),
    }
}

/// Pick the first bank, in transfer, graphics, compute order, whose queue family can present
/// to `surface`.
pub fn select_present_bank(
    presenter: &dyn Presenter,
    surface: vk::SurfaceKHR,
    commands: &CommandSystem,
) -> Result<Arc<CommandBank>> {
    for bank in [
        commands.transfer_bank(),
        commands.graphics_bank(),
        commands.compute_bank(),
    ] {
        // SAFETY: the caller passes a live surface.
        if unsafe { presenter.surface_support(bank.queue().family(), surface) }? {
            tracing::debug!(family = bank.queue().family(), "Selected presentation queue");
            return Ok(bank.clone());
        }
    }
    Err(GpuError::NoSuitableQueue(
        "no queue family can present to the surface".to_string(),
    ))
}

/// A surface and its swapchain.
pub struct Swapchain {
    presenter: Arc<dyn Presenter>,
    provider: Arc<dyn SurfaceProvider>,
    device: Arc<dyn RawDevice>,
    surface: vk::SurfaceKHR,
    present_bank: Arc<CommandBank>,
    desc: SwapchainDesc,
    sharing_mode: vk::SharingMode,
    queue_families: Vec<u32>,
    handle: Option<vk::SwapchainKHR>,
    info: SwapchainInfo,
    current_image: u32,
    suboptimal: bool,
    state: SwapchainState,
    listeners: Vec<RebuildListener>,
}

impl Swapchain {
    /// Take ownership of `surface` and build the first swapchain on it.
    ///
    /// If the surface has a zero extent the swapchain starts [`SwapchainState::Uninitialized`]
    /// and is built by the first [`Self::begin_frame`] that finds a usable extent.
    pub fn new(
        presenter: Arc<dyn Presenter>,
        provider: Arc<dyn SurfaceProvider>,
        surface: vk::SurfaceKHR,
        commands: &CommandSystem,
        queues: &DeviceQueues,
        desc: SwapchainDesc,
    ) -> Result<Self> {
        let present_bank = match select_present_bank(&*presenter, surface, commands) {
            Ok(bank) => bank,
            Err(e) => {
                // SAFETY: no swapchain was built on the surface.
                unsafe { presenter.destroy_surface(surface) };
                return Err(e);
            }
        };

        let mut swapchain = Self {
            presenter,
            provider,
            device: commands.device().clone(),
            surface,
            present_bank,
            desc,
            sharing_mode: queues.sharing_mode,
            queue_families: queues.families.clone(),
            handle: None,
            info: SwapchainInfo::default(),
            current_image: 0,
            suboptimal: false,
            state: SwapchainState::Uninitialized,
            listeners: Vec::new(),
        };
        swapchain.recreate_swapchain()?;
        Ok(swapchain)
    }

    /// Rebuild the native swapchain for the surface's current extent.
    ///
    /// No image of the current swapchain may still be in use; callers drain the presentation
    /// queue first, as [`Self::begin_frame`] and [`Self::end_frame`] do.
    ///
    /// Returns `false`, leaving the current swapchain untouched and notifying nobody, when the
    /// clamped extent has zero area.
    pub fn recreate_swapchain(&mut self) -> Result<bool> {
        let (width, height) = self.provider.current_extent();

        // SAFETY: the surface is owned by `self` and stays live until drop.
        let capabilities = unsafe { self.presenter.surface_capabilities(self.surface) }?;
        let extent = calculate_extent(&capabilities, width, height);
        if extent.width == 0 || extent.height == 0 {
            tracing::debug!(width, height, "Surface has zero area, skipping swapchain rebuild");
            return Ok(false);
        }

        // SAFETY: see above.
        let formats = unsafe { self.presenter.surface_formats(self.surface) }?;
        let surface_format = select_surface_format(&formats, self.desc.preferred_format)
            .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".to_string()))?;
        // SAFETY: see above.
        let modes = unsafe { self.presenter.present_modes(self.surface) }?;
        let present_mode = select_present_mode(&modes, self.desc.present_mode);
        let image_count = select_image_count(&capabilities, present_mode);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(self.desc.image_usage)
            .image_sharing_mode(self.sharing_mode)
            .queue_family_indices(&self.queue_families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.handle.unwrap_or_default());

        // SAFETY: the create info only references live handles; the old swapchain is retired by
        // the call and destroyed right after.
        let swapchain = unsafe { self.presenter.create_swapchain(&create_info) }?;
        if let Some(old) = self.handle.take() {
            // SAFETY: `old` was retired by the creation above.
            unsafe { self.presenter.destroy_swapchain(old) };
        }

        // SAFETY: the swapchain was just created.
        let images = match unsafe { self.presenter.swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                // Nothing describes the retired swapchain any more; the next frame rebuilds.
                // SAFETY: no image of the new swapchain was handed out.
                unsafe { self.presenter.destroy_swapchain(swapchain) };
                self.info = SwapchainInfo::default();
                self.state = SwapchainState::Uninitialized;
                return Err(e);
            }
        };
        self.handle = Some(swapchain);

        self.info = SwapchainInfo {
            extent,
            format: surface_format.format,
            color_space: surface_format.color_space,
            present_mode,
            images,
        };
        self.suboptimal = false;
        self.state = SwapchainState::Ready;

        tracing::debug!(
            width = extent.width,
            height = extent.height,
            images = self.info.images.len(),
            format = ?surface_format.format,
            ?present_mode,
            "Rebuilt swapchain"
        );

        for listener in &mut self.listeners {
            listener(&self.info);
        }
        Ok(true)
    }

    /// Acquire the next image and return its index.
    ///
    /// The previous image must have been presented with [`Self::end_frame`]. `signal` is a
    /// semaphore or fence signalled once the image is ready. An out-of-date swapchain is rebuilt
    /// and the acquire retried; a suboptimal one is used for this frame and rebuilt after it is
    /// presented. Fails with [`GpuError::NotPresentable`] when the surface has
    /// no area to rebuild into.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(&mut self, signal: Option<SyncObject<'_>>) -> Result<u32> {
        if self.state == SwapchainState::Acquired {
            return Err(GpuError::InvalidState(
                "begin_frame called while an image is still acquired".to_string(),
            ));
        }

        let (semaphore, fence) = match signal {
            None => (vk::Semaphore::null(), vk::Fence::null()),
            Some(SyncObject::Semaphore(semaphore)) => (semaphore.handle(), vk::Fence::null()),
            Some(SyncObject::Fence(fence)) => (vk::Semaphore::null(), fence.handle()),
            Some(SyncObject::Event(_)) => {
                return Err(GpuError::InvalidState(
                    "an event cannot signal image acquisition".to_string(),
                ))
            }
        };

        loop {
            let Some(handle) = self.handle else {
                if self.recreate_swapchain()? {
                    continue;
                }
                return Err(GpuError::NotPresentable);
            };

            // SAFETY: the swapchain is live and the sync objects are owned by the caller.
            let acquired = unsafe {
                self.presenter
                    .acquire_next_image(handle, u64::MAX, semaphore, fence)
            };

            match acquired {
                Ok((index, suboptimal)) => {
                    if suboptimal {
                        tracing::warn!("Acquired image from a suboptimal swapchain");
                        self.suboptimal = true;
                    }
                    self.current_image = index;
                    self.state = SwapchainState::Acquired;
                    return Ok(index);
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    tracing::warn!("Swapchain out of date during acquire, rebuilding");
                    self.present_bank.wait_idle(&*self.device)?;
                    if !self.recreate_swapchain()? {
                        return Err(GpuError::NotPresentable);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Present the acquired image once every semaphore in `wait` has signalled.
    ///
    /// `signal` is signalled when presentation finishes and needs
    /// `VK_EXT_swapchain_maintenance1`. A suboptimal or out-of-date result drains the
    /// presentation queue and rebuilds the swapchain; any other failure is returned.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn end_frame(&mut self, signal: Option<&Fence>, wait: &[SyncObject<'_>]) -> Result<()> {
        let Some(handle) = self.handle.filter(|_| self.state == SwapchainState::Acquired) else {
            return Err(GpuError::InvalidState(
                "end_frame called without an acquired image".to_string(),
            ));
        };

        let semaphores = wait
            .iter()
            .map(|object| match object {
                SyncObject::Semaphore(semaphore) => Ok(semaphore.handle()),
                _ => Err(GpuError::InvalidState(
                    "presentation can only wait on semaphores".to_string(),
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        if signal.is_some() && !self.presenter.supports_present_fence() {
            return Err(GpuError::UnsupportedOperation(
                "present fences need VK_EXT_swapchain_maintenance1",
            ));
        }
        let fence = signal.map_or(vk::Fence::null(), Fence::handle);

        let presenter = &*self.presenter;
        let image_index = self.current_image;
        let presented = self.present_bank.present(|queue| {
            // SAFETY: the queue lock is held and the image was acquired by `begin_frame`.
            unsafe { presenter.queue_present(queue, handle, image_index, &semaphores, fence) }
        });
        self.state = SwapchainState::Ready;

        let stale = match presented {
            Ok(suboptimal) => suboptimal || self.suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(e) => return Err(e.into()),
        };

        if stale {
            tracing::warn!("Swapchain stale after present, rebuilding");
            self.present_bank.wait_idle(&*self.device)?;
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    /// Register a callback run after every rebuild.
    pub fn on_rebuild(&mut self, listener: impl FnMut(&SwapchainInfo) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// The native swapchain, if one has been built.
    pub fn handle(&self) -> Option<vk::SwapchainKHR> {
        self.handle
    }

    pub fn info(&self) -> &SwapchainInfo {
        &self.info
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.info.extent
    }

    pub fn format(&self) -> vk::Format {
        self.info.format
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.info.images
    }

    /// Index of the most recently acquired image.
    pub fn current_image(&self) -> u32 {
        self.current_image
    }

    /// Whether an acquire reported the swapchain suboptimal since the last rebuild.
    pub fn is_suboptimal(&self) -> bool {
        self.suboptimal
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    /// The bank whose queue presents.
    pub fn present_bank(&self) -> &Arc<CommandBank> {
        &self.present_bank
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if let Err(e) = self.present_bank.wait_idle(&*self.device) {
            tracing::error!("Failed to drain presentation queue: {e}");
        }
        // SAFETY: the presentation queue is idle and the handles are owned by `self`.
        unsafe {
            if let Some(handle) = self.handle.take() {
                self.presenter.destroy_swapchain(handle);
            }
            self.presenter.destroy_surface(self.surface);
        }
    }
}

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("extent", &self.info.extent)
            .field("format", &self.info.format)
            .field("state", &self.state)
            .field("suboptimal", &self.suboptimal)
            .finish_non_exhaustive()
    }
}
