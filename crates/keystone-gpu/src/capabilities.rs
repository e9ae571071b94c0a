//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Whether `api_version` is at least `major.minor`.
pub fn api_at_least(api_version: u32, major: u32, minor: u32) -> bool {
    let have = (
        vk::api_version_major(api_version),
        vk::api_version_minor(api_version),
    );
    have >= (major, minor)
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Dynamic rendering support (VK 1.3 core)
    pub supports_dynamic_rendering: bool,
    /// `vkTrimCommandPool` support (VK 1.1 core or `VK_KHR_maintenance1`)
    pub supports_command_pool_trim: bool,
    /// Swapchain support, required for presentation
    pub supports_swapchain: bool,
    /// Present fences (`VK_EXT_swapchain_maintenance1`)
    pub supports_present_fence: bool,

    // Memory info
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum memory allocation count
    pub max_memory_allocation_count: u32,
    /// Alignment of host flush/invalidate ranges on non-coherent memory
    pub non_coherent_atom_size: u64,

    pub queue_families: Vec<vk::QueueFamilyProperties>,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        // SAFETY: the caller guarantees both handles are valid.
        let (properties, memory_properties, queue_families, extensions) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_memory_properties(physical_device),
                instance.get_physical_device_queue_family_properties(physical_device),
                instance
                    .enumerate_device_extension_properties(physical_device)
                    .unwrap_or_default(),
            )
        };

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .filter_map(|name| name.to_str().ok().map(String::from))
            .collect();

        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self::from_parts(
            &properties,
            device_name,
            device_local_memory_mb,
            queue_families,
            available_extensions,
        )
    }

    /// Derive the feature flags from already queried device data.
    pub fn from_parts(
        properties: &vk::PhysicalDeviceProperties,
        device_name: String,
        device_local_memory_mb: u64,
        queue_families: Vec<vk::QueueFamilyProperties>,
        available_extensions: HashSet<String>,
    ) -> Self {
        let api_version = properties.api_version;
        let has = |name: &CStr| {
            name.to_str()
                .is_ok_and(|name| available_extensions.contains(name))
        };

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version,
            driver_version: properties.driver_version,

            supports_dynamic_rendering: api_at_least(api_version, 1, 3),
            supports_command_pool_trim: api_at_least(api_version, 1, 1)
                || has(ash::khr::maintenance1::NAME),
            supports_swapchain: has(ash::khr::swapchain::NAME),
            supports_present_fence: has(ash::ext::swapchain_maintenance1::NAME),

            device_local_memory_mb,
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,

            queue_families,
            available_extensions,
        }
    }

    /// Check if the GPU can run the command system and present.
    pub fn meets_requirements(&self) -> bool {
        self.supports_dynamic_rendering && self.supports_swapchain
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(api_version: u32, extensions: &[&str]) -> GpuCapabilities {
        let properties = vk::PhysicalDeviceProperties {
            api_version,
            vendor_id: 0x1002,
            ..Default::default()
        };
        GpuCapabilities::from_parts(
            &properties,
            "test".to_string(),
            0,
            Vec::new(),
            extensions.iter().map(|e| (*e).to_string()).collect(),
        )
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn api_version_comparison() {
        assert!(api_at_least(vk::API_VERSION_1_3, 1, 1));
        assert!(!api_at_least(vk::API_VERSION_1_0, 1, 1));
        assert!(api_at_least(vk::make_api_version(0, 2, 0, 0), 1, 3));
    }

    #[test]
    fn pool_trim_needs_1_1_or_maintenance1() {
        assert!(!caps(vk::API_VERSION_1_0, &[]).supports_command_pool_trim);
        assert!(caps(vk::API_VERSION_1_0, &["VK_KHR_maintenance1"]).supports_command_pool_trim);
        assert!(caps(vk::API_VERSION_1_1, &[]).supports_command_pool_trim);
    }

    #[test]
    fn requirements_need_swapchain() {
        assert!(!caps(vk::API_VERSION_1_3, &[]).meets_requirements());
        assert!(caps(vk::API_VERSION_1_3, &["VK_KHR_swapchain"]).meets_requirements());
        assert!(!caps(vk::API_VERSION_1_2, &["VK_KHR_swapchain"]).meets_requirements());
    }
}
