//! Presentation surfaces.
//!
//! A [`SurfaceProvider`] is whatever owns the window: it creates the `VkSurfaceKHR`, reports the
//! size the swapchain should have, and names the instance extensions surface creation needs.

use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;

/// Source of a presentation surface and its current size.
pub trait SurfaceProvider: Send + Sync {
    /// Create a surface on `instance`.
    ///
    /// # Safety
    /// `instance` must have been created with [`Self::required_instance_extensions`] enabled and
    /// must outlive the surface.
    unsafe fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR>;

    /// The size the swapchain images should have right now, in pixels.
    fn current_extent(&self) -> (u32, u32);

    /// Instance extensions surface creation depends on.
    fn required_instance_extensions(&self) -> Result<Vec<&'static CStr>>;
}

/// A [`SurfaceProvider`] for any window exposing raw window handles.
pub struct WindowSurface<W> {
    window: Arc<W>,
    extent: fn(&W) -> (u32, u32),
}

impl<W> WindowSurface<W>
where
    W: HasDisplayHandle + HasWindowHandle + Send + Sync,
{
    /// Wrap `window`. `extent` reports its inner size in physical pixels.
    pub fn new(window: Arc<W>, extent: fn(&W) -> (u32, u32)) -> Self {
        Self { window, extent }
    }

    pub fn window(&self) -> &Arc<W> {
        &self.window
    }
}

impl<W> SurfaceProvider for WindowSurface<W>
where
    W: HasDisplayHandle + HasWindowHandle + Send + Sync,
{
    unsafe fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR> {
        let display = self
            .window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = self
            .window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        // SAFETY: the caller guarantees the instance is valid; the handles come from a live window.
        unsafe {
            ash_window::create_surface(
                entry,
                instance,
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))
    }

    fn current_extent(&self) -> (u32, u32) {
        (self.extent)(&self.window)
    }

    fn required_instance_extensions(&self) -> Result<Vec<&'static CStr>> {
        let display = self
            .window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let names = ash_window::enumerate_required_extensions(display.as_raw())?;

        Ok(names
            .iter()
            // SAFETY: ash-window returns pointers to static, nul-terminated extension names.
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect())
    }
}

impl<W> std::fmt::Debug for WindowSurface<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowSurface").finish_non_exhaustive()
    }
}
