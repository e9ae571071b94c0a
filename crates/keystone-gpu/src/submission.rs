//! Command buffer allocation, submission and deferred disposal across the device queues.

use crate::command::{CommandBank, CommandBuffer, Recording};
use crate::device::{RawDevice, SubmitBatch};
use crate::error::{GpuError, Result};
use crate::orphan::{OrphanFence, OrphanKey, OrphanList};
use crate::queue::{supports_granularity, DeviceQueues, Queue};
use crate::sync::{Fence, HostSync, SyncObject};
use ash::vk;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Default number of orphans tolerated before an opportunistic sweep.
pub const DEFAULT_ORPHAN_GC_THRESHOLD: usize = 100;

/// Tuning for a [`CommandSystem`].
#[derive(Debug, Clone, Copy)]
pub struct CommandConfig {
    /// Command pools per bank.
    pub parallelism: usize,
    /// Orphan count above which submissions and disposals trigger a sweep.
    pub orphan_gc_threshold: usize,
    /// Whether the device supports `vkTrimCommandPool`.
    pub can_trim: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            orphan_gc_threshold: DEFAULT_ORPHAN_GC_THRESHOLD,
            can_trim: false,
        }
    }
}

/// What a command buffer will be used for.
#[derive(Debug, Clone, Copy)]
pub struct CommandBufferDesc {
    pub level: vk::CommandBufferLevel,
    /// Kinds of commands the buffer will contain (graphics, compute, transfer).
    pub usage: vk::QueueFlags,
    /// Image transfer granularity the buffer needs. A zero axis means any.
    pub required_granularity: vk::Extent3D,
}

impl CommandBufferDesc {
    pub fn new(usage: vk::QueueFlags) -> Self {
        Self {
            level: vk::CommandBufferLevel::PRIMARY,
            usage,
            required_granularity: vk::Extent3D::default(),
        }
    }

    pub fn graphics() -> Self {
        Self::new(vk::QueueFlags::GRAPHICS)
    }

    pub fn compute() -> Self {
        Self::new(vk::QueueFlags::COMPUTE)
    }

    pub fn transfer() -> Self {
        Self::new(vk::QueueFlags::TRANSFER)
    }

    pub fn level(mut self, level: vk::CommandBufferLevel) -> Self {
        self.level = level;
        self
    }

    pub fn granularity(mut self, granularity: vk::Extent3D) -> Self {
        self.required_granularity = granularity;
        self
    }
}

/// One queue submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct Submission<'a> {
    /// Buffers to execute. All must come from the same queue.
    pub command_buffers: &'a [&'a CommandBuffer],
    /// Semaphores to wait on, each at the given stage.
    pub wait: &'a [(SyncObject<'a>, vk::PipelineStageFlags)],
    /// Semaphores to signal, plus at most one fence.
    pub signal: &'a [SyncObject<'a>],
}

/// Synchronization for [`CommandSystem::run_commands`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions<'a> {
    pub wait: &'a [(SyncObject<'a>, vk::PipelineStageFlags)],
    /// Semaphores to signal.
    pub signal: &'a [SyncObject<'a>],
    /// Fence to signal. A private fence is created when `None`.
    pub fence: Option<Arc<Fence>>,
}

/// The command banks of a device, with submission and orphan bookkeeping.
pub struct CommandSystem {
    device: Arc<dyn RawDevice>,
    graphics: Arc<CommandBank>,
    transfer: Arc<CommandBank>,
    compute: Arc<CommandBank>,
    orphans: Mutex<OrphanList>,
    gc_threshold: usize,
    // Read-locked by submitters, write-locked by queue drains.
    drain: RwLock<()>,
}

impl CommandSystem {
    /// Create one bank per queue role.
    pub fn new(
        device: Arc<dyn RawDevice>,
        queues: &DeviceQueues,
        config: &CommandConfig,
    ) -> Result<Self> {
        let bank = |queue: &Arc<Queue>| {
            CommandBank::new(
                device.clone(),
                queue.clone(),
                config.parallelism,
                config.can_trim,
            )
            .map(Arc::new)
        };

        let graphics = bank(&queues.graphics)?;
        let transfer = bank(&queues.transfer)?;
        let compute = bank(&queues.compute)?;

        Ok(Self {
            device,
            graphics,
            transfer,
            compute,
            orphans: Mutex::new(OrphanList::new()),
            gc_threshold: config.orphan_gc_threshold,
            drain: RwLock::new(()),
        })
    }

    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    pub fn graphics_bank(&self) -> &Arc<CommandBank> {
        &self.graphics
    }

    pub fn transfer_bank(&self) -> &Arc<CommandBank> {
        &self.transfer
    }

    pub fn compute_bank(&self) -> &Arc<CommandBank> {
        &self.compute
    }

    /// All banks in graphics, transfer, compute order.
    pub fn banks(&self) -> [&Arc<CommandBank>; 3] {
        [&self.graphics, &self.transfer, &self.compute]
    }

    /// Choose the bank able to record everything `desc` asks for.
    pub fn select_bank(&self, desc: &CommandBufferDesc) -> Result<&Arc<CommandBank>> {
        let graphics = desc.usage.contains(vk::QueueFlags::GRAPHICS);
        let compute = desc.usage.contains(vk::QueueFlags::COMPUTE);
        let transfer = desc.usage.contains(vk::QueueFlags::TRANSFER);

        let granular = |bank: &Arc<CommandBank>| {
            supports_granularity(
                bank.queue().info().min_image_transfer_granularity,
                desc.required_granularity,
            )
        };
        let has = |bank: &Arc<CommandBank>, flag| bank.queue().flags().contains(flag);

        let mut selected: Option<&Arc<CommandBank>> = None;

        if graphics {
            let bank = &self.graphics;
            if !(compute && !has(bank, vk::QueueFlags::COMPUTE)) && granular(bank) {
                selected = Some(bank);
            }
        }

        if compute && selected.is_none() {
            let bank = &self.compute;
            if !(graphics && !has(bank, vk::QueueFlags::GRAPHICS)) && granular(bank) {
                selected = Some(bank);
            }
        }

        if transfer && selected.is_none() {
            let bank = &self.transfer;
            let capable = !(graphics && !has(bank, vk::QueueFlags::GRAPHICS))
                && !(compute && !has(bank, vk::QueueFlags::COMPUTE));
            if capable {
                // A transfer queue with coarse granularity falls back to the graphics queue.
                let candidate = if granular(bank) { bank } else { &self.graphics };
                if granular(candidate) {
                    selected = Some(candidate);
                }
            }
        }

        let bank = selected.ok_or_else(|| {
            GpuError::NoSuitableCommandBank(format!(
                "usage {:?}, granularity {}x{}x{}",
                desc.usage,
                desc.required_granularity.width,
                desc.required_granularity.height,
                desc.required_granularity.depth
            ))
        })?;

        tracing::trace!(
            usage = ?desc.usage,
            family = bank.queue().family(),
            "Selected command bank"
        );
        Ok(bank)
    }

    /// Allocate a command buffer from the bank matching `desc`.
    pub fn allocate(&self, desc: &CommandBufferDesc) -> Result<CommandBuffer> {
        self.select_bank(desc)?.allocate(desc.level)
    }

    fn bank_for_queue(&self, queue: &Arc<Queue>) -> Option<&Arc<CommandBank>> {
        self.banks()
            .into_iter()
            .find(|bank| bank.queue().id() == queue.id())
    }

    /// Submit recorded command buffers.
    ///
    /// Submissions run concurrently with each other but never during [`Self::wait_idle`].
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&self, submission: &Submission<'_>) -> Result<()> {
        {
            let _shared = self.drain.read();

            let (first, rest) = submission
                .command_buffers
                .split_first()
                .ok_or_else(|| GpuError::InvalidState("empty submission".to_string()))?;
            if rest.iter().any(|buffer| buffer.queue().id() != first.queue().id()) {
                return Err(GpuError::InvalidState(
                    "cannot submit to multiple queues at once".to_string(),
                ));
            }
            if let Some(buffer) = submission.command_buffers.iter().find(|b| !b.is_recorded()) {
                return Err(GpuError::InvalidState(format!(
                    "command buffer {:?} was never recorded",
                    buffer.handle()
                )));
            }

            let bank = self.bank_for_queue(first.queue()).ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "unknown command queue {:#x}",
                    first.queue().id()
                ))
            })?;

            let command_buffers: Vec<vk::CommandBuffer> = submission
                .command_buffers
                .iter()
                .map(|buffer| buffer.handle())
                .collect();

            let mut wait_semaphores = Vec::with_capacity(submission.wait.len());
            let mut wait_stages = Vec::with_capacity(submission.wait.len());
            for (sync, stage) in submission.wait {
                match sync {
                    SyncObject::Semaphore(semaphore) => {
                        wait_semaphores.push(semaphore.handle());
                        wait_stages.push(*stage);
                    }
                    _ => {
                        return Err(GpuError::InvalidState(
                            "submissions can only wait on semaphores".to_string(),
                        ))
                    }
                }
            }

            let mut signal_semaphores = Vec::with_capacity(submission.signal.len());
            let mut fence = vk::Fence::null();
            for sync in submission.signal {
                match sync {
                    SyncObject::Semaphore(semaphore) => signal_semaphores.push(semaphore.handle()),
                    SyncObject::Fence(f) if fence == vk::Fence::null() => fence = f.handle(),
                    SyncObject::Fence(_) => {
                        return Err(GpuError::InvalidState(
                            "can only signal a single fence per submission".to_string(),
                        ))
                    }
                    SyncObject::Event(_) => {
                        return Err(GpuError::InvalidState(
                            "events are signaled by commands, not submissions".to_string(),
                        ))
                    }
                }
            }

            let batch = SubmitBatch {
                command_buffers: &command_buffers,
                wait_semaphores: &wait_semaphores,
                wait_stages: &wait_stages,
                signal_semaphores: &signal_semaphores,
            };
            bank.submit(&*self.device, &batch, fence)?;
        }

        self.try_collect_garbage();
        Ok(())
    }

    /// Allocate, record and submit a one-shot command buffer, disposing of it once it completes.
    pub fn run_commands<F>(
        &self,
        desc: &CommandBufferDesc,
        record: F,
        options: RunOptions<'_>,
    ) -> Result<()>
    where
        F: FnOnce(&mut Recording<'_>) -> Result<()>,
    {
        if options
            .signal
            .iter()
            .any(|sync| matches!(sync, SyncObject::Fence(_)))
        {
            return Err(GpuError::InvalidState(
                "pass the fence to signal through RunOptions::fence".to_string(),
            ));
        }

        let mut buffer = self.allocate(desc)?;
        {
            let mut recording =
                buffer.begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            record(&mut recording)?;
            recording.end()?;
        }

        let fence = match options.fence {
            Some(fence) => OrphanFence::Shared(fence),
            None => OrphanFence::Owned(Fence::new(self.device.clone(), false)?),
        };
        fence.fence().host_reset()?;

        let mut signal = options.signal.to_vec();
        signal.push(SyncObject::Fence(fence.fence()));

        self.submit(&Submission {
            command_buffers: &[&buffer],
            wait: options.wait,
            signal: &signal,
        })?;

        self.dispose_when_free(buffer, fence);
        Ok(())
    }

    /// Hand `buffer` to the orphan list; it is freed once `fence` signals.
    pub fn dispose_when_free(&self, buffer: CommandBuffer, fence: OrphanFence) -> OrphanKey {
        let mut orphans = self.orphans.lock();
        let key = orphans.insert(buffer, fence);
        if orphans.len() > self.gc_threshold {
            orphans.sweep();
        }
        key
    }

    /// Sweep the orphan list now. Returns the number of buffers freed.
    pub fn collect_garbage(&self) -> usize {
        self.orphans.lock().sweep()
    }

    fn try_collect_garbage(&self) {
        let mut orphans = self.orphans.lock();
        if orphans.len() > self.gc_threshold {
            orphans.sweep();
        }
    }

    /// Number of buffers awaiting disposal.
    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Whether the orphan behind `key` is still pending.
    pub fn is_orphaned(&self, key: OrphanKey) -> bool {
        self.orphans.lock().contains(key)
    }

    /// Drain every queue, then sweep all orphans.
    ///
    /// Excludes concurrent submissions for the duration of the drain.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        let _exclusive = self.drain.write();

        let mut drained: Vec<&Arc<Queue>> = Vec::with_capacity(3);
        for bank in self.banks() {
            let queue = bank.queue();
            if drained.iter().any(|q| Arc::ptr_eq(q, queue)) {
                continue;
            }
            queue.wait_idle(&*self.device)?;
            drained.push(queue);
        }

        self.orphans.lock().sweep();
        Ok(())
    }

    /// Release unused command pool memory on every bank.
    pub fn trim(&self) {
        for bank in self.banks() {
            bank.trim();
        }
    }
}

impl Drop for CommandSystem {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            tracing::error!("Failed to drain queues before destroying command banks: {e}");
        }
        let released = self.orphans.get_mut().release_all();
        if released > 0 {
            tracing::debug!(released, "Released orphaned command buffers");
        }
    }
}

impl std::fmt::Debug for CommandSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSystem")
            .field("graphics", &self.graphics)
            .field("transfer", &self.transfer)
            .field("compute", &self.compute)
            .field("gc_threshold", &self.gc_threshold)
            .finish_non_exhaustive()
    }
}
