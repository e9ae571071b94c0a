//! In-memory [`RawDevice`].
//!
//! Tracks the lifecycle of every pool, buffer and sync object it hands out. Submitted work stays
//! pending until its fence is signalled with [`MockDevice::signal_fence`] or its queue is
//! drained, and freeing a buffer that is still pending is recorded as a violation.

use crate::next_handle;
use ash::vk;
use ash::vk::Handle;
use hashbrown::{HashMap, HashSet};
use keystone_gpu::{GpuError, RawDevice, Result, SubmitBatch};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A state-setting or bind command recorded into a buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BindPipeline(vk::Pipeline),
    SetViewports(Vec<(f32, f32)>),
    SetScissors(Vec<(u32, u32)>),
    SetLineWidth(f32),
    SetDepthBias(f32, f32, f32),
    SetBlendConstants([f32; 4]),
    SetDepthBounds(f32, f32),
    SetStencilCompareMask(vk::StencilFaceFlags, u32),
    SetStencilWriteMask(vk::StencilFaceFlags, u32),
    SetStencilReference(vk::StencilFaceFlags, u32),
}

/// Lifecycle state of a mock command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Initial,
    Recording,
    Executable,
}

/// One call to `queue_submit`.
#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

struct PoolRecord {
    family: u32,
    recording: usize,
    max_recording: usize,
    trims: usize,
}

struct BufferRecord {
    pool: vk::CommandPool,
    state: BufferState,
    begin_flags: vk::CommandBufferUsageFlags,
    resets: usize,
    commands: Vec<RecordedCommand>,
}

struct Pending {
    fence: vk::Fence,
    buffers: Vec<vk::CommandBuffer>,
}

#[derive(Default)]
struct State {
    pools: HashMap<vk::CommandPool, PoolRecord>,
    destroyed_pools: Vec<vk::CommandPool>,
    buffers: HashMap<vk::CommandBuffer, BufferRecord>,
    frees: HashMap<vk::CommandBuffer, usize>,
    premature_frees: Vec<vk::CommandBuffer>,
    fences: HashMap<vk::Fence, bool>,
    destroyed_fences: HashSet<vk::Fence>,
    events: HashMap<vk::Event, bool>,
    semaphores: HashSet<vk::Semaphore>,
    submissions: Vec<SubmitRecord>,
    pending: HashMap<vk::Queue, Vec<Pending>>,
    wait_idles: Vec<vk::Queue>,
    fail_next_submit: Option<vk::Result>,
}

impl State {
    fn signal(&mut self, fence: vk::Fence) {
        if let Some(signaled) = self.fences.get_mut(&fence) {
            *signaled = true;
        }
        for pending in self.pending.values_mut() {
            pending.retain(|p| p.fence != fence);
        }
    }

    fn in_flight(&self, buffer: vk::CommandBuffer) -> bool {
        self.pending
            .values()
            .flatten()
            .any(|p| p.buffers.contains(&buffer))
    }

    fn buffer(&mut self, buffer: vk::CommandBuffer) -> Result<&mut BufferRecord> {
        self.buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::InvalidState(format!("unknown command buffer {buffer:?}")))
    }

    fn stop_recording(&mut self, pool: vk::CommandPool) {
        if let Some(pool) = self.pools.get_mut(&pool) {
            pool.recording = pool.recording.saturating_sub(1);
        }
    }
}

/// A [`RawDevice`] that keeps every object in memory.
#[derive(Default)]
pub struct MockDevice {
    state: Mutex<State>,
    signal_on_submit: AtomicBool,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Signal submission fences immediately instead of leaving the work pending.
    pub fn set_signal_on_submit(&self, enabled: bool) {
        self.signal_on_submit.store(enabled, Ordering::SeqCst);
    }

    /// Make the next `queue_submit` fail with `result`.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().fail_next_submit = Some(result);
    }

    /// Complete the work guarded by `fence` and signal it.
    pub fn signal_fence(&self, fence: vk::Fence) {
        self.state.lock().signal(fence);
    }

    /// Signal an event from the "GPU" side.
    pub fn signal_event(&self, event: vk::Event) {
        if let Some(signaled) = self.state.lock().events.get_mut(&event) {
            *signaled = true;
        }
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    pub fn is_fence_destroyed(&self, fence: vk::Fence) -> bool {
        self.state.lock().destroyed_fences.contains(&fence)
    }

    pub fn live_fence_count(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphore_count(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state.lock().submissions.clone()
    }

    /// The fence of the most recent submission.
    pub fn last_submit_fence(&self) -> Option<vk::Fence> {
        self.state.lock().submissions.last().map(|s| s.fence)
    }

    /// How many times `buffer` has been freed.
    pub fn free_count(&self, buffer: vk::CommandBuffer) -> usize {
        self.state.lock().frees.get(&buffer).copied().unwrap_or(0)
    }

    /// Buffers freed while their submission was still pending.
    pub fn premature_frees(&self) -> Vec<vk::CommandBuffer> {
        self.state.lock().premature_frees.clone()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn buffer_state(&self, buffer: vk::CommandBuffer) -> Option<BufferState> {
        self.state.lock().buffers.get(&buffer).map(|b| b.state)
    }

    pub fn begin_flags(&self, buffer: vk::CommandBuffer) -> Option<vk::CommandBufferUsageFlags> {
        self.state.lock().buffers.get(&buffer).map(|b| b.begin_flags)
    }

    pub fn reset_count(&self, buffer: vk::CommandBuffer) -> usize {
        self.state.lock().buffers.get(&buffer).map_or(0, |b| b.resets)
    }

    /// Commands recorded since the buffer was last reset.
    pub fn commands(&self, buffer: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .map(|b| b.commands.clone())
            .unwrap_or_default()
    }

    pub fn pool_of(&self, buffer: vk::CommandBuffer) -> Option<vk::CommandPool> {
        self.state.lock().buffers.get(&buffer).map(|b| b.pool)
    }

    pub fn pool_family(&self, pool: vk::CommandPool) -> Option<u32> {
        self.state.lock().pools.get(&pool).map(|p| p.family)
    }

    /// Highest number of buffers of `pool` that were recording at the same time.
    pub fn max_concurrent_recordings(&self, pool: vk::CommandPool) -> usize {
        self.state.lock().pools.get(&pool).map_or(0, |p| p.max_recording)
    }

    pub fn trim_count(&self, pool: vk::CommandPool) -> usize {
        self.state.lock().pools.get(&pool).map_or(0, |p| p.trims)
    }

    pub fn live_pool_count(&self) -> usize {
        self.state.lock().pools.len()
    }

    pub fn destroyed_pool_count(&self) -> usize {
        self.state.lock().destroyed_pools.len()
    }

    /// Queues passed to `queue_wait_idle`, in call order.
    pub fn wait_idle_calls(&self) -> Vec<vk::Queue> {
        self.state.lock().wait_idles.clone()
    }

    fn record(&self, buffer: vk::CommandBuffer, command: RecordedCommand) {
        if let Some(record) = self.state.lock().buffers.get_mut(&buffer) {
            assert_eq!(
                record.state,
                BufferState::Recording,
                "command recorded outside of a recording"
            );
            record.commands.push(command);
        }
    }
}

impl RawDevice for MockDevice {
    unsafe fn create_command_pool(
        &self,
        queue_family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        let pool = vk::CommandPool::from_raw(next_handle());
        self.state.lock().pools.insert(
            pool,
            PoolRecord {
                family: queue_family,
                recording: 0,
                max_recording: 0,
                trims: 0,
            },
        );
        Ok(pool)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.pools.remove(&pool);
        state.destroyed_pools.push(pool);
    }

    unsafe fn trim_command_pool(&self, pool: vk::CommandPool) {
        if let Some(pool) = self.state.lock().pools.get_mut(&pool) {
            pool.trims += 1;
        }
    }

    unsafe fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(&pool) {
            return Err(GpuError::InvalidState(format!("unknown command pool {pool:?}")));
        }
        let buffer = vk::CommandBuffer::from_raw(next_handle());
        state.buffers.insert(
            buffer,
            BufferRecord {
                pool,
                state: BufferState::Initial,
                begin_flags: vk::CommandBufferUsageFlags::empty(),
                resets: 0,
                commands: Vec::new(),
            },
        );
        Ok(buffer)
    }

    unsafe fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for &buffer in buffers {
            if state.in_flight(buffer) {
                state.premature_frees.push(buffer);
            }
            if let Some(record) = state.buffers.remove(&buffer) {
                if record.state == BufferState::Recording {
                    state.stop_recording(record.pool);
                }
            }
            *state.frees.entry(buffer).or_default() += 1;
        }
    }

    unsafe fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let record = state.buffer(buffer)?;
        let was_recording = record.state == BufferState::Recording;
        let pool = record.pool;
        record.state = BufferState::Initial;
        record.resets += 1;
        record.commands.clear();
        if was_recording {
            state.stop_recording(pool);
        }
        Ok(())
    }

    unsafe fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let record = state.buffer(buffer)?;
        if record.state != BufferState::Initial {
            return Err(GpuError::InvalidState(format!(
                "begin on a buffer in state {:?}",
                record.state
            )));
        }
        record.state = BufferState::Recording;
        record.begin_flags = flags;
        let pool = record.pool;

        if let Some(pool) = state.pools.get_mut(&pool) {
            pool.recording += 1;
            pool.max_recording = pool.max_recording.max(pool.recording);
        }
        Ok(())
    }

    unsafe fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let record = state.buffer(buffer)?;
        if record.state != BufferState::Recording {
            return Err(GpuError::InvalidState("end without begin".to_string()));
        }
        record.state = BufferState::Executable;
        let pool = record.pool;
        state.stop_recording(pool);
        Ok(())
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_next_submit.take() {
            return Err(result.into());
        }
        for buffer in batch.command_buffers {
            let record = state.buffer(*buffer)?;
            if record.state != BufferState::Executable {
                return Err(GpuError::InvalidState(format!(
                    "submitted buffer in state {:?}",
                    record.state
                )));
            }
        }
        if fence != vk::Fence::null() && state.fences.get(&fence).copied().unwrap_or(true) {
            return Err(GpuError::InvalidState(
                "submission fence must exist and be unsignalled".to_string(),
            ));
        }

        state.submissions.push(SubmitRecord {
            queue,
            command_buffers: batch.command_buffers.to_vec(),
            wait_semaphores: batch.wait_semaphores.to_vec(),
            wait_stages: batch.wait_stages.to_vec(),
            signal_semaphores: batch.signal_semaphores.to_vec(),
            fence,
        });

        if self.signal_on_submit.load(Ordering::SeqCst) {
            state.signal(fence);
        } else {
            state.pending.entry(queue).or_default().push(Pending {
                fence,
                buffers: batch.command_buffers.to_vec(),
            });
        }
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        let mut state = self.state.lock();
        state.wait_idles.push(queue);
        let drained = state.pending.remove(&queue).unwrap_or_default();
        for pending in drained {
            if let Some(signaled) = state.fences.get_mut(&pending.fence) {
                *signaled = true;
            }
        }
        Ok(())
    }

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let fence = vk::Fence::from_raw(next_handle());
        self.state.lock().fences.insert(fence, signaled);
        Ok(fence)
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        self.state
            .lock()
            .fences
            .get(&fence)
            .copied()
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<bool> {
        // Nothing else can signal while the caller blocks, so the wait resolves immediately.
        unsafe { self.fence_status(fence) }
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        match self.state.lock().fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)),
        }
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence);
        state.destroyed_fences.insert(fence);
    }

    unsafe fn create_event(&self) -> Result<vk::Event> {
        let event = vk::Event::from_raw(next_handle());
        self.state.lock().events.insert(event, false);
        Ok(event)
    }

    unsafe fn event_status(&self, event: vk::Event) -> Result<bool> {
        self.state
            .lock()
            .events
            .get(&event)
            .copied()
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
    }

    unsafe fn set_event(&self, event: vk::Event) -> Result<()> {
        self.signal_event(event);
        Ok(())
    }

    unsafe fn reset_event(&self, event: vk::Event) -> Result<()> {
        if let Some(signaled) = self.state.lock().events.get_mut(&event) {
            *signaled = false;
        }
        Ok(())
    }

    unsafe fn destroy_event(&self, event: vk::Event) {
        self.state.lock().events.remove(&event);
    }

    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore = vk::Semaphore::from_raw(next_handle());
        self.state.lock().semaphores.insert(semaphore);
        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(buffer, RecordedCommand::BindPipeline(pipeline));
    }

    unsafe fn cmd_set_viewports(&self, buffer: vk::CommandBuffer, viewports: &[vk::Viewport]) {
        let sizes = viewports.iter().map(|v| (v.width, v.height)).collect();
        self.record(buffer, RecordedCommand::SetViewports(sizes));
    }

    unsafe fn cmd_set_scissors(&self, buffer: vk::CommandBuffer, scissors: &[vk::Rect2D]) {
        let sizes = scissors
            .iter()
            .map(|s| (s.extent.width, s.extent.height))
            .collect();
        self.record(buffer, RecordedCommand::SetScissors(sizes));
    }

    unsafe fn cmd_set_line_width(&self, buffer: vk::CommandBuffer, width: f32) {
        self.record(buffer, RecordedCommand::SetLineWidth(width));
    }

    unsafe fn cmd_set_depth_bias(
        &self,
        buffer: vk::CommandBuffer,
        constant_factor: f32,
        clamp: f32,
        slope_factor: f32,
    ) {
        self.record(
            buffer,
            RecordedCommand::SetDepthBias(constant_factor, clamp, slope_factor),
        );
    }

    unsafe fn cmd_set_blend_constants(&self, buffer: vk::CommandBuffer, constants: &[f32; 4]) {
        self.record(buffer, RecordedCommand::SetBlendConstants(*constants));
    }

    unsafe fn cmd_set_depth_bounds(&self, buffer: vk::CommandBuffer, min: f32, max: f32) {
        self.record(buffer, RecordedCommand::SetDepthBounds(min, max));
    }

    unsafe fn cmd_set_stencil_compare_mask(
        &self,
        buffer: vk::CommandBuffer,
        faces: vk::StencilFaceFlags,
        mask: u32,
    ) {
        self.record(buffer, RecordedCommand::SetStencilCompareMask(faces, mask));
    }

    unsafe fn cmd_set_stencil_write_mask(
        &self,
        buffer: vk::CommandBuffer,
        faces: vk::StencilFaceFlags,
        mask: u32,
    ) {
        self.record(buffer, RecordedCommand::SetStencilWriteMask(faces, mask));
    }

    unsafe fn cmd_set_stencil_reference(
        &self,
        buffer: vk::CommandBuffer,
        faces: vk::StencilFaceFlags,
        reference: u32,
    ) {
        self.record(buffer, RecordedCommand::SetStencilReference(faces, reference));
    }
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockDevice")
            .field("pools", &state.pools.len())
            .field("buffers", &state.buffers.len())
            .field("fences", &state.fences.len())
            .field("submissions", &state.submissions.len())
            .finish_non_exhaustive()
    }
}
