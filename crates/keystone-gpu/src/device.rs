//! The native device seam.
//!
//! Everything above this module only sequences and guards driver calls. The calls themselves go
//! through [`RawDevice`], which is implemented for [`ash::Device`] and can be implemented by
//! in-memory doubles for testing without a GPU.

use crate::error::Result;
use ash::vk;

/// One batch of work handed to `vkQueueSubmit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitBatch<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Device-level driver entry points used by the command, sync and pipeline layers.
///
/// # Safety
/// Every method forwards to the driver. Handles passed in must have been created from the same
/// device and must not be destroyed concurrently with the call.
#[allow(clippy::missing_safety_doc)]
pub trait RawDevice: Send + Sync {
    unsafe fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool>;
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);
    unsafe fn trim_command_pool(&self, pool: vk::CommandPool);

    unsafe fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer>;
    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    unsafe fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()>;
    unsafe fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()>;
    unsafe fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()>;

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> Result<()>;
    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()>;

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool>;
    /// Returns `false` if the timeout elapsed before the fence signalled.
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool>;
    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    unsafe fn destroy_fence(&self, fence: vk::Fence);

    unsafe fn create_event(&self) -> Result<vk::Event>;
    unsafe fn event_status(&self, event: vk::Event) -> Result<bool>;
    unsafe fn set_event(&self, event: vk::Event) -> Result<()>;
    unsafe fn reset_event(&self, event: vk::Event) -> Result<()>;
    unsafe fn destroy_event(&self, event: vk::Event);

    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore>;
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    unsafe fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    unsafe fn cmd_set_viewports(&self, buffer: vk::CommandBuffer, viewports: &[vk::Viewport]);
    unsafe fn cmd_set_scissors(&self, buffer: vk::CommandBuffer, scissors: &[vk::Rect2D]);
    unsafe fn cmd_set_line_width(&self, buffer: vk::CommandBuffer, width: f32);
    unsafe fn cmd_set_depth_bias(
        &self,
        buffer: vk::CommandBuffer,
        constant_factor: f32,
        clamp: f32,
        slope_factor: f32,
    );
    unsafe fn cmd_set_blend_constants(&self, buffer: vk::CommandBuffer, constants: &[f32; 4]);
    unsafe fn cmd_set_depth_bounds(&self, buffer: vk::CommandBuffer, min: f32, max: f32);
    unsafe fn cmd_set_stencil_compare_mask(
        &self,
        buffer: vk::CommandBuffer,
        faces: vk::StencilFaceFlags,
        mask: u32,
    );
    unsafe fn cmd_set_stencil_write_mask(
        &self,
        buffer: vk::CommandBuffer,
        faces: vk::StencilFaceFlags,
        mask: u32,
    );
    unsafe fn cmd_set_stencil_reference(
        &self,
        buffer: vk::CommandBuffer,
        faces: vk::StencilFaceFlags,
        reference: u32,
    );
}

impl RawDevice for ash::Device {
    unsafe fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        Ok(unsafe { ash::Device::create_command_pool(self, &create_info, None) }?)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { ash::Device::destroy_command_pool(self, pool, None) };
    }

    unsafe fn trim_command_pool(&self, pool: vk::CommandPool) {
        unsafe { ash::Device::trim_command_pool(self, pool, vk::CommandPoolTrimFlags::empty()) };
    }

    unsafe fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = unsafe { self.allocate_command_buffers(&alloc_info) }?;
        Ok(buffers[0])
    }

    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { ash::Device::free_command_buffers(self, pool, buffers) };
    }

    unsafe fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()> {
        unsafe {
            ash::Device::reset_command_buffer(self, buffer, vk::CommandBufferResetFlags::empty())
        }?;
        Ok(())
    }

    unsafe fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { ash::Device::begin_command_buffer(self, buffer, &begin_info) }?;
        Ok(())
    }

    unsafe fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { ash::Device::end_command_buffer(self, buffer) }?;
        Ok(())
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(batch.command_buffers)
            .wait_semaphores(batch.wait_semaphores)
            .wait_dst_stage_mask(batch.wait_stages)
            .signal_semaphores(batch.signal_semaphores);

        unsafe { ash::Device::queue_submit(self, queue, &[submit_info], fence) }?;
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        unsafe { ash::Device::queue_wait_idle(self, queue) }?;
        Ok(())
    }

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { ash::Device::create_fence(self, &create_info, None) }?)
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.get_fence_status(fence) }?)
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool> {
        match unsafe { self.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.reset_fences(&[fence]) }?;
        Ok(())
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { ash::Device::destroy_fence(self, fence, None) };
    }

    unsafe fn create_event(&self) -> Result<vk::Event> {
        let create_info = vk::EventCreateInfo::default();
        Ok(unsafe { ash::Device::create_event(self, &create_info, None) }?)
    }

    unsafe fn event_status(&self, event: vk::Event) -> Result<bool> {
        Ok(unsafe { self.get_event_status(event) }?)
    }

    unsafe fn set_event(&self, event: vk::Event) -> Result<()> {
        unsafe { ash::Device::set_event(self, event) }?;
        Ok(())
    }

    unsafe fn reset_event(&self, event: vk::Event) -> Result<()> {
        unsafe { ash::Device::reset_event(self, event) }?;
        Ok(())
    }

    unsafe fn destroy_event(&self, event: vk::Event) {
        unsafe { ash::Device::destroy_event(self, event, None) };
    }

    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { ash::Device::create_semaphore(self, &create_info, None) }?)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { ash::Device::destroy_semaphore(self, semaphore, None) };
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { ash::Device::cmd_bind_pipeline(self, buffer, bind_point, pipeline) };
    }

    unsafe fn cmd_set_viewports(&self, buffer: vk::CommandBuffer, viewports: &[vk::Viewport]) {
        unsafe { self.cmd_set_viewport(buffer, 0, viewports) };
    }

    unsafe fn cmd_set_scissors(&self, buffer: vk::CommandBuffer, scissors: &[vk::Rect2D]) {
        unsafe { self.cmd_set_scissor(buffer, 0, scissors) };
    }

    unsafe fn cmd_set_line_width(&self, buffer: vk::CommandBuffer, width: f32) {
        unsafe { ash::Device::cmd_set_line_width(self, buffer, width) };
    }

    unsafe fn cmd_set_depth_bias(
        &self,
        buffer: vk::CommandBuffer,
        constant_factor: f32,
        clamp: f32,
        slope_factor: f32,
    ) {
        unsafe {
            ash::Device::cmd_set_depth_bias(self, buffer, constant_factor, clamp, slope_factor);
        }
    }

    unsafe fn cmd_set_blend_constants(&self, buffer: vk::CommandBuffer, constants: &[f32; 4]) {
        unsafe { ash::Device::cmd_set_blend_constants(self, buffer, constants) };
    }

    unsafe fn cmd_set_depth_bounds(&self, buffer: vk::CommandBuffer, min: f32, max: f32) {
        unsafe { ash::Device::cmd_set_depth_bounds(self, buffer, min, max) };
    }

    unsafe fn cmd_set_stencil_compare_mask(
        &self,
        buffer: vk::CommandBuffer,
        faces: vk::StencilFaceFlags,
        mask: u32,
    ) {
        unsafe { ash::Device::cmd_set_stencil_compare_mask(self, buffer, faces, mask) };
    }

    unsafe fn cmd_set_stencil_write_mask(
        &self,
        buffer: vk::CommandBuffer,
        faces: vk::StencilFaceFlags,
        mask: u32,
    ) {
        unsafe { ash::Device::cmd_set_stencil_write_mask(self, buffer, faces, mask) };
    }

    unsafe fn cmd_set_stencil_reference(
        &self,
        buffer: vk::CommandBuffer,
        faces: vk::StencilFaceFlags,
        reference: u32,
    ) {
        unsafe { ash::Device::cmd_set_stencil_reference(self, buffer, faces, reference) };
    }
}
