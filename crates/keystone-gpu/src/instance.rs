//! Vulkan instance creation and physical device selection.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{c_char, CStr, CString};

/// Validation layers to enable when requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan 1.3 instance with `extensions` enabled.
///
/// Duplicate extension names are enabled once.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    extensions: &[&CStr],
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Keystone")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut names: Vec<&CStr> = Vec::with_capacity(extensions.len() + 1);
    for &ext in extensions {
        if !names.contains(&ext) {
            names.push(ext);
        }
    }
    #[cfg(target_os = "macos")]
    if !names.contains(&ash::khr::portability_enumeration::NAME) {
        names.push(ash::khr::portability_enumeration::NAME);
    }
    let extension_names: Vec<*const c_char> = names.iter().map(|ext| ext.as_ptr()).collect();

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // SAFETY: the caller guarantees the entry is valid.
    let available_layers = unsafe { entry.enumerate_instance_layer_properties() }?;
    let layers: Vec<&CStr> = layers
        .into_iter()
        .filter(|layer| {
            let found = available_layers
                .iter()
                .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == *layer));
            if !found {
                tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
            }
            found
        })
        .collect();
    let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    // SAFETY: every pointer in the create info outlives the call.
    let instance = unsafe { entry.create_instance(&create_info, None) }?;

    Ok(instance)
}

/// Select the best physical device meeting [`GpuCapabilities::meets_requirements`].
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, GpuCapabilities)> {
    // SAFETY: the caller guarantees the instance is valid.
    let devices = unsafe { instance.enumerate_physical_devices() }?;

    let mut best: Option<(i64, vk::PhysicalDevice, GpuCapabilities)> = None;
    for device in devices {
        // SAFETY: the device was enumerated from the instance.
        let (capabilities, device_type) = unsafe {
            (
                GpuCapabilities::query(instance, device),
                instance.get_physical_device_properties(device).device_type,
            )
        };

        if !capabilities.meets_requirements() {
            tracing::debug!("Skipping {}: requirements not met", capabilities.summary());
            continue;
        }

        let score = score_physical_device(device_type, &capabilities);
        if best.as_ref().map_or(true, |(best_score, ..)| score > *best_score) {
            best = Some((score, device, capabilities));
        }
    }

    best.map(|(_, device, capabilities)| (device, capabilities))
        .ok_or(GpuError::NoSuitableDevice)
}

/// Score a physical device for selection.
pub fn score_physical_device(
    device_type: vk::PhysicalDeviceType,
    capabilities: &GpuCapabilities,
) -> i64 {
    let mut score = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    // +1 per GB
    score += i64::try_from(capabilities.device_local_memory_mb / 1024).unwrap_or(i64::MAX / 2);

    // Prefer dedicated transfer and compute families.
    let families = &capabilities.queue_families;
    let dedicated = |flag: vk::QueueFlags| {
        families.iter().any(|f| {
            f.queue_flags.contains(flag) && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
    };
    if dedicated(vk::QueueFlags::TRANSFER) {
        score += 10;
    }
    if dedicated(vk::QueueFlags::COMPUTE) {
        score += 10;
    }

    score
}
