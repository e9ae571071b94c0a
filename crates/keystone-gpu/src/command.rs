//! Command pools, banks and command buffers.
//!
//! A [`CommandBank`] owns several [`CommandPool`]s for one queue and hands them out round-robin.
//! Each pool has its own lock that covers allocation, freeing, trimming and recording, so buffers
//! from different pools record in parallel. Queue operations go through the [`Queue`] lock instead.

use crate::device::{RawDevice, SubmitBatch};
use crate::error::Result;
use crate::pipeline::DynamicInfo;
use crate::pipeline_set::PipelineSet;
use crate::queue::Queue;
use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A native command pool guarded by its own lock.
pub struct CommandPool {
    device: Arc<dyn RawDevice>,
    pool: vk::CommandPool,
    queue: Arc<Queue>,
    index: usize,
    lock: Mutex<()>,
}

impl CommandPool {
    /// Create a pool whose buffers can be reset individually.
    pub fn new(device: Arc<dyn RawDevice>, queue: Arc<Queue>, index: usize) -> Result<Arc<Self>> {
        // SAFETY: the pool is destroyed on drop, after every buffer holding an `Arc` to it.
        let pool = unsafe {
            device.create_command_pool(
                queue.family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        }?;

        Ok(Arc::new(Self {
            device,
            pool,
            queue,
            index,
            lock: Mutex::new(()),
        }))
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Position of this pool within its bank.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Allocate one command buffer.
    pub fn allocate(self: &Arc<Self>, level: vk::CommandBufferLevel) -> Result<CommandBuffer> {
        let raw = {
            let _guard = self.lock.lock();
            // SAFETY: the pool lock gives exclusive access to the pool.
            unsafe { self.device.allocate_command_buffer(self.pool, level) }?
        };

        Ok(CommandBuffer {
            pool: self.clone(),
            raw,
            level,
            recorded: false,
        })
    }

    /// Return unused pool memory to the system.
    pub fn trim(&self) {
        let _guard = self.lock.lock();
        // SAFETY: see `allocate`.
        unsafe { self.device.trim_command_pool(self.pool) };
    }

    fn free(&self, raw: vk::CommandBuffer) {
        let _guard = self.lock.lock();
        // SAFETY: see `allocate`. The buffer was allocated from this pool.
        unsafe { self.device.free_command_buffers(self.pool, &[raw]) };
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // SAFETY: every buffer keeps its pool alive, so none remain.
        unsafe { self.device.destroy_command_pool(self.pool) };
    }
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.pool)
            .field("index", &self.index)
            .field("family", &self.queue.family())
            .finish()
    }
}

/// The command pools of one queue.
pub struct CommandBank {
    queue: Arc<Queue>,
    pools: Vec<Arc<CommandPool>>,
    next: AtomicUsize,
    can_trim: bool,
}

impl CommandBank {
    /// Create a bank with `parallelism` pools on `queue`.
    pub fn new(
        device: Arc<dyn RawDevice>,
        queue: Arc<Queue>,
        parallelism: usize,
        can_trim: bool,
    ) -> Result<Self> {
        let pools = (0..parallelism.max(1))
            .map(|index| CommandPool::new(device.clone(), queue.clone(), index))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            family = queue.family(),
            pools = pools.len(),
            "Created command bank"
        );

        Ok(Self {
            queue,
            pools,
            next: AtomicUsize::new(0),
            can_trim,
        })
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Pick the next pool in round-robin order. Never blocks.
    pub fn acquire(&self) -> &Arc<CommandPool> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        &self.pools[n % self.pools.len()]
    }

    /// Allocate a command buffer from the next pool.
    pub fn allocate(&self, level: vk::CommandBufferLevel) -> Result<CommandBuffer> {
        self.acquire().allocate(level)
    }

    /// Trim every pool in turn. A no-op when the device cannot trim pools.
    pub fn trim(&self) {
        if !self.can_trim {
            return;
        }
        for pool in &self.pools {
            pool.trim();
        }
    }

    /// Submit work to this bank's queue.
    pub fn submit(
        &self,
        device: &dyn RawDevice,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        self.queue.submit(device, batch, fence)
    }

    /// Present through this bank's queue.
    ///
    /// `present` receives the raw queue while the queue lock is held.
    pub fn present<R>(&self, present: impl FnOnce(vk::Queue) -> R) -> R {
        self.queue.with_exclusive(present)
    }

    /// Block until this bank's queue is idle.
    pub fn wait_idle(&self, device: &dyn RawDevice) -> Result<()> {
        self.queue.wait_idle(device)
    }
}

impl std::fmt::Debug for CommandBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBank")
            .field("queue", &self.queue.handle())
            .field("pools", &self.pools.len())
            .finish()
    }
}

/// One native command buffer. Dropping it frees the handle back to its pool immediately; use
/// [`crate::CommandSystem::dispose_when_free`] when the GPU may still be using it.
pub struct CommandBuffer {
    pool: Arc<CommandPool>,
    raw: vk::CommandBuffer,
    level: vk::CommandBufferLevel,
    recorded: bool,
}

impl CommandBuffer {
    /// Get the raw command buffer handle.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    /// Whether recording has been completed at least once.
    pub fn is_recorded(&self) -> bool {
        self.recorded
    }

    pub fn pool(&self) -> &Arc<CommandPool> {
        &self.pool
    }

    /// The queue this buffer must be submitted on.
    pub fn queue(&self) -> &Arc<Queue> {
        &self.pool.queue
    }

    /// Start recording.
    ///
    /// Blocks until no other buffer of the same pool is recording. The pool stays locked until
    /// the returned [`Recording`] is ended or dropped. A previously recorded buffer is reset first.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_recording(&mut self, flags: vk::CommandBufferUsageFlags) -> Result<Recording<'_>> {
        let guard = self.pool.lock.lock();
        let device = &*self.pool.device;

        if self.recorded {
            // SAFETY: the pool lock is held and the pool allows per-buffer resets.
            unsafe { device.reset_command_buffer(self.raw) }?;
            self.recorded = false;
        }
        // SAFETY: see above.
        unsafe { device.begin_command_buffer(self.raw, flags) }?;

        Ok(Recording {
            device,
            raw: self.raw,
            recorded: &mut self.recorded,
            _guard: guard,
            ended: false,
        })
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.pool.free(self.raw);
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("raw", &self.raw)
            .field("pool", &self.pool.index)
            .field("recorded", &self.recorded)
            .finish()
    }
}

/// An open recording on a [`CommandBuffer`], holding its pool's lock.
pub struct Recording<'a> {
    device: &'a dyn RawDevice,
    raw: vk::CommandBuffer,
    recorded: &'a mut bool,
    _guard: MutexGuard<'a, ()>,
    ended: bool,
}

impl Recording<'_> {
    /// Get the raw command buffer handle for emitting commands.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.raw
    }

    /// Bind a graphics pipeline.
    pub fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        // SAFETY: the buffer is in the recording state and the pool is locked.
        unsafe {
            self.device
                .cmd_bind_pipeline(self.raw, vk::PipelineBindPoint::GRAPHICS, pipeline)
        };
    }

    /// Bind the variant of `set` matching `state` and set the natively dynamic state from it.
    pub fn bind_pipeline_with_state(
        &mut self,
        set: &PipelineSet,
        state: &DynamicInfo,
    ) -> Result<vk::Pipeline> {
        let pipeline = set.pipeline(state)?;
        self.bind_pipeline(pipeline);
        for dynamic in set.native_dynamic_states() {
            // SAFETY: see `bind_pipeline`.
            unsafe { dynamic.record(self.device, self.raw, state) };
        }
        Ok(pipeline)
    }

    /// Finish recording and release the pool.
    pub fn end(mut self) -> Result<()> {
        self.ended = true;
        *self.recorded = true;
        // SAFETY: see `bind_pipeline`.
        unsafe { self.device.end_command_buffer(self.raw) }
    }
}

impl Drop for Recording<'_> {
    fn drop(&mut self) {
        if !self.ended {
            tracing::warn!(buffer = ?self.raw, "Recording dropped without being ended");
            // The buffer is left in the recording state; force a reset on the next begin.
            *self.recorded = true;
        }
    }
}
