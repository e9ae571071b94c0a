//! GPU context management.
//!
//! [`GpuContext`] owns the instance, the device and everything that must be torn down before the
//! device: the command system and the memory allocator. Build one with [`GpuContextBuilder`].

use crate::capabilities::{api_at_least, GpuCapabilities};
use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use crate::pipeline::{AshPipelineFactory, PipelineFactory};
use crate::queue::{DeviceQueues, QueuePlan};
use crate::submission::{CommandConfig, CommandSystem, DEFAULT_ORPHAN_GC_THRESHOLD};
use crate::surface::SurfaceProvider;
use crate::swapchain::{AshPresenter, Presenter, Swapchain, SwapchainDesc};
use ash::vk;
use std::ffi::{c_char, CStr};
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
///
/// Swapchains, pipeline sets and command buffers created from the context must be dropped
/// before it.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    capabilities: GpuCapabilities,
    queues: DeviceQueues,
    commands: ManuallyDrop<CommandSystem>,
    allocator: ManuallyDrop<GpuAllocator>,
    present_fence: bool,
}

impl GpuContext {
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// The device behind the [`RawDevice`] seam, as sync objects and command pools take it.
    pub fn raw_device(&self) -> Arc<dyn RawDevice> {
        self.device.clone()
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    pub fn queues(&self) -> &DeviceQueues {
        &self.queues
    }

    /// Command banks, submission and orphan collection.
    pub fn commands(&self) -> &CommandSystem {
        &self.commands
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &GpuAllocator {
        &self.allocator
    }

    /// A pipeline factory for building [`crate::PipelineSet`]s on this device.
    pub fn pipeline_factory(&self) -> Arc<AshPipelineFactory> {
        Arc::new(AshPipelineFactory::new((*self.device).clone()))
    }

    /// Same as [`Self::pipeline_factory`], behind the trait object pipeline sets store.
    pub fn dyn_pipeline_factory(&self) -> Arc<dyn PipelineFactory> {
        self.pipeline_factory()
    }

    /// Create a surface through `provider` and a swapchain on it.
    ///
    /// The instance must have been built with `provider`'s required extensions.
    pub fn create_swapchain(
        &self,
        provider: Arc<dyn SurfaceProvider>,
        desc: SwapchainDesc,
    ) -> Result<Swapchain> {
        // SAFETY: the instance outlives every swapchain created from the context.
        let surface = unsafe { provider.create_surface(&self.entry, &self.instance) }?;
        let presenter: Arc<dyn Presenter> = Arc::new(AshPresenter::new(
            &self.entry,
            &self.instance,
            &self.device,
            self.physical_device,
            self.present_fence,
        ));

        Swapchain::new(
            presenter,
            provider,
            surface,
            &self.commands,
            &self.queues,
            desc,
        )
    }

    /// Drain every queue and collect finished orphans.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        self.commands.wait_idle()
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        // SAFETY: fields are dropped exactly once, in dependency order, and never used again.
        unsafe {
            // Drains the queues and frees orphaned buffers.
            ManuallyDrop::drop(&mut self.commands);

            // Shutdown allocator BEFORE destroying device
            self.allocator.shutdown();
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("device", &self.capabilities.device_name)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    command_pool_parallelism: Option<usize>,
    orphan_gc_threshold: usize,
    instance_extensions: Vec<&'static CStr>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Keystone".to_string(),
            enable_validation: cfg!(debug_assertions),
            command_pool_parallelism: None,
            orphan_gc_threshold: DEFAULT_ORPHAN_GC_THRESHOLD,
            instance_extensions: Vec::new(),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Command pools per bank. Defaults to the available hardware parallelism.
    pub fn command_pool_parallelism(mut self, pools: usize) -> Self {
        self.command_pool_parallelism = Some(pools);
        self
    }

    /// Orphan count that triggers an opportunistic sweep.
    pub fn orphan_gc_threshold(mut self, threshold: usize) -> Self {
        self.orphan_gc_threshold = threshold;
        self
    }

    /// Enable extra instance extensions, usually a surface provider's required extensions.
    pub fn instance_extensions(
        mut self,
        extensions: impl IntoIterator<Item = &'static CStr>,
    ) -> Self {
        self.instance_extensions.extend(extensions);
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        // SAFETY: loading the library has no preconditions beyond a sane Vulkan install.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        // SAFETY: the entry was just loaded.
        let instance = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                self.enable_validation,
                &self.instance_extensions,
            )
        }?;

        // SAFETY: the instance is valid and destroyed on every error path below.
        match unsafe { self.finish(&instance) } {
            Ok(parts) => Ok(parts.into_context(entry, instance)),
            Err(e) => {
                // SAFETY: nothing created from the instance survives the failed build.
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    unsafe fn finish(&self, instance: &ash::Instance) -> Result<DeviceParts> {
        // SAFETY: the caller passes a valid instance.
        let (physical_device, capabilities) = unsafe { select_physical_device(instance) }?;

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let plan = QueuePlan::new(&capabilities.queue_families)?;
        tracing::debug!(
            graphics = plan.graphics.family,
            transfer = plan.transfer.family,
            compute = plan.compute.family,
            "Planned device queues"
        );

        // The device extension depends on VK_EXT_surface_maintenance1 at the instance level.
        let present_fence = capabilities.supports_present_fence
            && self
                .instance_extensions
                .contains(&ash::ext::surface_maintenance1::NAME);

        // SAFETY: the physical device belongs to `instance`.
        let device = unsafe {
            create_device(instance, physical_device, &capabilities, &plan, present_fence)
        }?;
        let device = Arc::new(device);

        let queues = DeviceQueues::from_plan(&plan, &capabilities.queue_families, |family, index| {
            // SAFETY: every (family, index) in the plan was requested at device creation.
            unsafe { device.get_device_queue(family, index) }
        });

        // SAFETY: the device was just created from `physical_device` on `instance`.
        let allocator = match unsafe {
            GpuAllocator::new(
                instance,
                (*device).clone(),
                physical_device,
                queues.sharing_mode,
                queues.families.clone(),
            )
        } {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: nothing has been created from the device yet.
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let mut config = CommandConfig {
            orphan_gc_threshold: self.orphan_gc_threshold,
            can_trim: capabilities.supports_command_pool_trim,
            ..CommandConfig::default()
        };
        if let Some(parallelism) = self.command_pool_parallelism {
            config.parallelism = parallelism;
        }

        let raw: Arc<dyn RawDevice> = device.clone();
        let commands = match CommandSystem::new(raw, &queues, &config) {
            Ok(commands) => commands,
            Err(e) => {
                drop(allocator);
                // SAFETY: the allocator released its memory; any pools created were destroyed
                // when the partially built banks dropped.
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        Ok(DeviceParts {
            physical_device,
            device,
            capabilities,
            queues,
            commands,
            allocator,
            present_fence,
        })
    }
}

struct DeviceParts {
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    capabilities: GpuCapabilities,
    queues: DeviceQueues,
    commands: CommandSystem,
    allocator: GpuAllocator,
    present_fence: bool,
}

impl DeviceParts {
    fn into_context(self, entry: ash::Entry, instance: ash::Instance) -> GpuContext {
        GpuContext {
            entry,
            instance,
            physical_device: self.physical_device,
            device: self.device,
            capabilities: self.capabilities,
            queues: self.queues,
            commands: ManuallyDrop::new(self.commands),
            allocator: ManuallyDrop::new(self.allocator),
            present_fence: self.present_fence,
        }
    }
}

/// Device extensions to enable.
fn device_extensions(capabilities: &GpuCapabilities, present_fence: bool) -> Vec<&'static CStr> {
    let mut extensions = vec![ash::khr::swapchain::NAME];
    if !api_at_least(capabilities.api_version, 1, 1) && capabilities.supports_command_pool_trim {
        extensions.push(ash::khr::maintenance1::NAME);
    }
    if present_fence {
        extensions.push(ash::ext::swapchain_maintenance1::NAME);
    }
    extensions
}

/// Create the logical device with the queues `plan` requests.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    capabilities: &GpuCapabilities,
    plan: &QueuePlan,
    present_fence: bool,
) -> Result<ash::Device> {
    let priorities: Vec<Vec<f32>> = plan
        .requests
        .iter()
        .map(|&(_, count)| vec![1.0; count as usize])
        .collect();
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = plan
        .requests
        .iter()
        .zip(&priorities)
        .map(|(&(family, _), priorities)| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(priorities)
        })
        .collect();

    let extensions = device_extensions(capabilities, present_fence);
    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    // Pipelines are built for dynamic rendering.
    let mut vulkan_1_3_features =
        vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);
    let mut maintenance1_features =
        vk::PhysicalDeviceSwapchainMaintenance1FeaturesEXT::default().swapchain_maintenance1(true);
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_3_features);
    if present_fence {
        features2 = features2.push_next(&mut maintenance1_features);
    }

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    // SAFETY: the caller guarantees both handles are valid; the create info outlives the call.
    unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .map_err(GpuError::from)
}
