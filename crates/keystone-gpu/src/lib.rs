//! Vulkan command submission and GPU resource lifecycle.
//!
//! This crate provides:
//! - Queue family selection and per-queue submission locking
//! - Command banks of round-robin command pools
//! - Deferred disposal of in-flight command buffers
//! - Fence, event and semaphore wrappers with capability checks
//! - Pipeline variant caching over dynamic state
//! - Memory allocation via gpu-allocator
//! - A swapchain that rebuilds itself when the surface changes

pub mod capabilities;
pub mod command;
pub mod context;
pub mod device;
pub mod error;
pub mod instance;
pub mod memory;
pub mod orphan;
pub mod pipeline;
pub mod pipeline_set;
pub mod queue;
pub mod submission;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{CommandBank, CommandBuffer, CommandPool, Recording};
pub use context::{GpuContext, GpuContextBuilder};
pub use device::{RawDevice, SubmitBatch};
pub use error::{GpuError, Result};
pub use memory::{BufferDesc, GpuAllocator, ImageDesc, MapFlags, MemoryBinding, MemoryReport};
pub use orphan::{OrphanFence, OrphanKey, OrphanList};
pub use pipeline::{
    AshPipelineFactory, DynamicInfo, DynamicState, PipelineCreateInfo, PipelineFactory,
};
pub use pipeline_set::{CacheStrategy, PipelineSet, HASHING_THRESHOLD};
pub use queue::{DeviceQueues, Queue, QueueInfo, QueuePlan};
pub use submission::{CommandBufferDesc, CommandConfig, CommandSystem, RunOptions, Submission};
pub use surface::{SurfaceProvider, WindowSurface};
pub use swapchain::{
    AshPresenter, Presenter, Swapchain, SwapchainDesc, SwapchainInfo, SwapchainState,
};
pub use sync::{
    Event, Fence, FrameSync, FrameSyncManager, HostSync, Semaphore, SyncCaps, SyncObject,
};
