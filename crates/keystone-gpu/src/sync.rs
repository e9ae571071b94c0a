//! Synchronization primitives.
//!
//! Fences, events and semaphores share one host-side contract ([`HostSync`]). Each object
//! carries a fixed [`SyncCaps`] descriptor, and operations it does not permit fail with
//! [`GpuError::UnsupportedOperation`] instead of silently doing nothing.

use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use ash::vk;
use bitflags::bitflags;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where in the command stream a sync object takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncGranularity {
    /// Before submission or after completion of a whole command buffer.
    CommandBuffer,
    /// Between individual commands.
    Command,
    /// At a specific pipeline stage of a command.
    PipelineStage,
}

/// Which side produces and which side consumes the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncDirection {
    GpuToHost,
    GpuToGpu,
    Any,
}

bitflags! {
    /// Operations a sync object supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFeatures: u32 {
        const HOST_POLLING = 0x0001;
        const HOST_WAITING = 0x0002;
        const GPU_WAITING = 0x0004;
        const HOST_SIGNALING = 0x0008;
        const GPU_SIGNALING = 0x0010;
        const GPU_WORK_SIGNALING = 0x0020;
        const GPU_WORK_WAITING = 0x0040;
        const GPU_MULTI_QUEUE = 0x0080;
    }
}

/// Fixed capability descriptor of a sync object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncCaps {
    pub granularity: SyncGranularity,
    pub direction: SyncDirection,
    pub features: SyncFeatures,
}

impl SyncCaps {
    pub const FENCE: Self = Self {
        granularity: SyncGranularity::CommandBuffer,
        direction: SyncDirection::GpuToHost,
        features: SyncFeatures::GPU_WORK_SIGNALING
            .union(SyncFeatures::HOST_POLLING)
            .union(SyncFeatures::HOST_WAITING),
    };

    pub const EVENT: Self = Self {
        granularity: SyncGranularity::PipelineStage,
        direction: SyncDirection::Any,
        features: SyncFeatures::GPU_SIGNALING
            .union(SyncFeatures::GPU_WAITING)
            .union(SyncFeatures::HOST_POLLING)
            .union(SyncFeatures::HOST_SIGNALING)
            .union(SyncFeatures::HOST_WAITING),
    };

    pub const SEMAPHORE: Self = Self {
        granularity: SyncGranularity::CommandBuffer,
        direction: SyncDirection::GpuToGpu,
        features: SyncFeatures::GPU_WORK_SIGNALING
            .union(SyncFeatures::GPU_WORK_WAITING)
            .union(SyncFeatures::GPU_MULTI_QUEUE),
    };

    fn require(&self, feature: SyncFeatures, what: &'static str) -> Result<()> {
        if self.features.contains(feature) {
            Ok(())
        } else {
            Err(GpuError::UnsupportedOperation(what))
        }
    }
}

/// Host-side operations on a sync object.
pub trait HostSync {
    fn caps(&self) -> SyncCaps;

    /// Non-blocking check whether the object is signalled.
    fn host_poll(&self) -> Result<bool>;

    /// Return the object to the unsignalled state.
    fn host_reset(&self) -> Result<()>;

    /// Signal the object from the host.
    fn host_set(&self) -> Result<()>;

    /// Block until the object is signalled or `timeout` elapses.
    ///
    /// Returns `true` if the object signalled, `false` on timeout.
    fn host_wait(&self, timeout: Duration) -> Result<bool>;
}

fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

/// A fence: signalled by the GPU when submitted work completes, observed by the host.
pub struct Fence {
    device: Arc<dyn RawDevice>,
    fence: vk::Fence,
}

impl Fence {
    /// Create a fence.
    pub fn new(device: Arc<dyn RawDevice>, signaled: bool) -> Result<Self> {
        // SAFETY: the fence is owned by the returned wrapper and destroyed on drop.
        let fence = unsafe { device.create_fence(signaled) }?;
        Ok(Self { device, fence })
    }

    /// Get the raw fence handle.
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl HostSync for Fence {
    fn caps(&self) -> SyncCaps {
        SyncCaps::FENCE
    }

    fn host_poll(&self) -> Result<bool> {
        self.caps().require(SyncFeatures::HOST_POLLING, "fence polling")?;
        // SAFETY: the fence is alive for as long as `self`.
        unsafe { self.device.fence_status(self.fence) }
    }

    // Resetting a fence is a host operation Vulkan allows even though the host cannot signal it.
    fn host_reset(&self) -> Result<()> {
        // SAFETY: see `host_poll`.
        unsafe { self.device.reset_fence(self.fence) }
    }

    fn host_set(&self) -> Result<()> {
        Err(GpuError::UnsupportedOperation(
            "cannot signal a fence from the host",
        ))
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn host_wait(&self, timeout: Duration) -> Result<bool> {
        self.caps().require(SyncFeatures::HOST_WAITING, "fence waiting")?;
        // SAFETY: see `host_poll`.
        unsafe { self.device.wait_for_fence(self.fence, timeout_ns(timeout)) }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        // SAFETY: owners only drop fences that no pending submission references.
        unsafe { self.device.destroy_fence(self.fence) };
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Fence").field(&self.fence).finish()
    }
}

/// An event: fine-grained, signalled and observed by either side.
pub struct Event {
    device: Arc<dyn RawDevice>,
    event: vk::Event,
}

impl Event {
    /// Create an event in the unsignalled state.
    pub fn new(device: Arc<dyn RawDevice>) -> Result<Self> {
        // SAFETY: the event is owned by the returned wrapper and destroyed on drop.
        let event = unsafe { device.create_event() }?;
        Ok(Self { device, event })
    }

    /// Get the raw event handle.
    pub fn handle(&self) -> vk::Event {
        self.event
    }
}

impl HostSync for Event {
    fn caps(&self) -> SyncCaps {
        SyncCaps::EVENT
    }

    fn host_poll(&self) -> Result<bool> {
        self.caps().require(SyncFeatures::HOST_POLLING, "event polling")?;
        // SAFETY: the event is alive for as long as `self`.
        unsafe { self.device.event_status(self.event) }
    }

    fn host_reset(&self) -> Result<()> {
        self.caps().require(SyncFeatures::HOST_SIGNALING, "event reset")?;
        // SAFETY: see `host_poll`.
        unsafe { self.device.reset_event(self.event) }
    }

    fn host_set(&self) -> Result<()> {
        self.caps().require(SyncFeatures::HOST_SIGNALING, "event signal")?;
        // SAFETY: see `host_poll`.
        unsafe { self.device.set_event(self.event) }
    }

    /// Events have no native host wait, so this spins on the status until the deadline.
    fn host_wait(&self, timeout: Duration) -> Result<bool> {
        self.caps().require(SyncFeatures::HOST_WAITING, "event waiting")?;
        if self.host_poll()? {
            return Ok(true);
        }
        // `None` waits without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut spins = 0u32;
        loop {
            if self.host_poll()? {
                return Ok(true);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(false);
            }
            if spins < 64 {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // SAFETY: owners only drop events that no pending submission references.
        unsafe { self.device.destroy_event(self.event) };
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Event").field(&self.event).finish()
    }
}

/// A binary semaphore: GPU-to-GPU only, no host access at all.
pub struct Semaphore {
    device: Arc<dyn RawDevice>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a semaphore.
    pub fn new(device: Arc<dyn RawDevice>) -> Result<Self> {
        // SAFETY: the semaphore is owned by the returned wrapper and destroyed on drop.
        let semaphore = unsafe { device.create_semaphore() }?;
        Ok(Self { device, semaphore })
    }

    /// Get the raw semaphore handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl HostSync for Semaphore {
    fn caps(&self) -> SyncCaps {
        SyncCaps::SEMAPHORE
    }

    fn host_poll(&self) -> Result<bool> {
        Err(GpuError::UnsupportedOperation(
            "cannot poll a semaphore from the host",
        ))
    }

    fn host_reset(&self) -> Result<()> {
        Err(GpuError::UnsupportedOperation(
            "cannot modify a semaphore from the host",
        ))
    }

    fn host_set(&self) -> Result<()> {
        Err(GpuError::UnsupportedOperation(
            "cannot modify a semaphore from the host",
        ))
    }

    fn host_wait(&self, _timeout: Duration) -> Result<bool> {
        Err(GpuError::UnsupportedOperation(
            "cannot wait on a semaphore from the host",
        ))
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: owners only drop semaphores that no pending submission references.
        unsafe { self.device.destroy_semaphore(self.semaphore) };
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Semaphore").field(&self.semaphore).finish()
    }
}

/// A borrowed sync object of any kind, for APIs that accept more than one kind.
#[derive(Debug, Clone, Copy)]
pub enum SyncObject<'a> {
    Fence(&'a Fence),
    Event(&'a Event),
    Semaphore(&'a Semaphore),
}

impl SyncObject<'_> {
    pub fn caps(&self) -> SyncCaps {
        match self {
            Self::Fence(fence) => fence.caps(),
            Self::Event(event) => event.caps(),
            Self::Semaphore(semaphore) => semaphore.caps(),
        }
    }
}

/// Synchronization resources for one frame in flight.
pub struct FrameSync {
    /// Semaphore signaled when image is available
    pub image_available: Semaphore,
    /// Semaphore signaled when rendering is complete
    pub render_finished: Semaphore,
    /// Fence to wait for frame completion
    pub in_flight: Arc<Fence>,
}

impl FrameSync {
    /// Create frame synchronization resources.
    pub fn new(device: &Arc<dyn RawDevice>) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(device.clone())?,
            render_finished: Semaphore::new(device.clone())?,
            in_flight: Arc::new(Fence::new(device.clone(), true)?),
        })
    }

    /// Wait for this frame to be available, then reset its fence for reuse.
    pub fn wait_and_reset(&self) -> Result<()> {
        self.in_flight.host_wait(Duration::MAX)?;
        self.in_flight.host_reset()
    }
}

/// Manages synchronization for multiple frames in flight.
pub struct FrameSyncManager {
    frame_syncs: Vec<FrameSync>,
    current_frame: usize,
}

impl FrameSyncManager {
    /// Create a sync manager for the given number of frames in flight.
    pub fn new(device: &Arc<dyn RawDevice>, frames_in_flight: usize) -> Result<Self> {
        let frame_syncs = (0..frames_in_flight.max(1))
            .map(|_| FrameSync::new(device))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            frame_syncs,
            current_frame: 0,
        })
    }

    /// Get the current frame's sync resources.
    pub fn current(&self) -> &FrameSync {
        &self.frame_syncs[self.current_frame]
    }

    /// Advance to the next frame.
    pub fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % self.frame_syncs.len();
    }

    /// Get the current frame index.
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_descriptors() {
        assert!(SyncCaps::FENCE.features.contains(SyncFeatures::HOST_POLLING));
        assert!(!SyncCaps::FENCE.features.contains(SyncFeatures::HOST_SIGNALING));
        assert_eq!(SyncCaps::EVENT.granularity, SyncGranularity::PipelineStage);
        assert_eq!(SyncCaps::SEMAPHORE.direction, SyncDirection::GpuToGpu);
        assert!(SyncCaps::SEMAPHORE
            .features
            .intersection(SyncFeatures::HOST_POLLING | SyncFeatures::HOST_WAITING)
            .is_empty());
    }

    #[test]
    fn timeout_saturates() {
        assert_eq!(timeout_ns(Duration::MAX), u64::MAX);
        assert_eq!(timeout_ns(Duration::from_millis(2)), 2_000_000);
    }
}
