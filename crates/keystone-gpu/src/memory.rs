//! GPU memory management.

use crate::error::{GpuError, Result};
use ash::vk;
use bitflags::bitflags;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

bitflags! {
    /// Host access requested for (or supported by) a memory binding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const COHERENT = 0x4;
        const PERSISTENT = 0x8;
    }
}

impl MapFlags {
    /// Memory location that satisfies these access flags.
    pub fn location(self) -> MemoryLocation {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (false, false) => MemoryLocation::GpuOnly,
            (true, false) => MemoryLocation::GpuToCpu,
            (_, true) => MemoryLocation::CpuToGpu,
        }
    }

    fn supported_by(properties: vk::MemoryPropertyFlags) -> Self {
        // Mapping persists for the life of the allocation.
        let mut flags = Self::PERSISTENT;
        if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            flags |= Self::READ_WRITE;
        }
        if properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
            flags |= Self::COHERENT;
        }
        flags
    }
}

/// Expand `[start, start + len)` to `atom` alignment without passing `limit`.
///
/// Returns `(offset, size)`, or `None` when no byte of the range lies below `limit`.
pub fn aligned_range(start: u64, len: u64, limit: u64, atom: u64) -> Option<(u64, u64)> {
    let atom = atom.max(1);
    let end = start.saturating_add(len).min(limit);
    if start >= end {
        return None;
    }
    let begin = start - start % atom;
    let end = end.div_ceil(atom).saturating_mul(atom).min(limit);
    Some((begin, end - begin))
}

/// Round host-visible requirements out to whole `atom`s so aligned ranges stay inside the
/// allocation.
fn atom_padded(requirements: vk::MemoryRequirements, atom: u64) -> vk::MemoryRequirements {
    let atom = atom.max(1);
    vk::MemoryRequirements {
        size: requirements.size.div_ceil(atom).saturating_mul(atom),
        alignment: requirements.alignment.max(atom),
        ..requirements
    }
}

/// Parameters for [`GpuAllocator::allocate_buffer`].
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub map: MapFlags,
}

/// Parameters for [`GpuAllocator::allocate_image`].
///
/// Sharing mode and queue families are filled in by the allocator.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub create_info: vk::ImageCreateInfo<'a>,
    pub map: MapFlags,
}

/// What a binding's memory is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundResource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// Summary of allocator usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReport {
    pub allocated_bytes: u64,
    pub reserved_bytes: u64,
    pub blocks: usize,
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Mutex<Option<Allocator>>,
    device: ash::Device,
    sharing_mode: vk::SharingMode,
    queue_families: Vec<u32>,
    non_coherent_atom_size: u64,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        sharing_mode: vk::SharingMode,
        queue_families: Vec<u32>,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        // SAFETY: the caller guarantees the physical device is valid.
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        Ok(Self {
            allocator: Mutex::new(Some(allocator)),
            device,
            sharing_mode,
            queue_families,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
        })
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
        allocation_scheme: AllocationScheme,
    ) -> Result<Allocation> {
        let requirements = match location {
            MemoryLocation::GpuOnly => requirements,
            _ => atom_padded(requirements, self.non_coherent_atom_size),
        };

        self.allocator
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    fn binding(&self, allocation: Allocation, resource: BoundResource) -> MemoryBinding {
        MemoryBinding {
            device: self.device.clone(),
            supported: MapFlags::supported_by(allocation.memory_properties()),
            atom: self.non_coherent_atom_size,
            allocation: Some(allocation),
            resource,
        }
    }

    /// Create a buffer and bind freshly allocated memory to it.
    pub fn allocate_buffer(&self, desc: &BufferDesc<'_>) -> Result<MemoryBinding> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(self.sharing_mode)
            .queue_family_indices(&self.queue_families);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(
            desc.name,
            requirements,
            desc.map.location(),
            true,
            AllocationScheme::GpuAllocatorManaged,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let binding = self.binding(allocation, BoundResource::Buffer(buffer));
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, binding.memory(), binding.offset())
        } {
            self.free(binding)?;
            return Err(e.into());
        }

        Ok(binding)
    }

    /// Create an image and bind freshly allocated memory to it.
    ///
    /// Transient attachments get a dedicated allocation.
    pub fn allocate_image(&self, desc: &ImageDesc<'_>) -> Result<MemoryBinding> {
        let create_info = desc
            .create_info
            .sharing_mode(self.sharing_mode)
            .queue_family_indices(&self.queue_families);

        let image = unsafe { self.device.create_image(&create_info, None) }?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let scheme = if create_info
            .usage
            .contains(vk::ImageUsageFlags::TRANSIENT_ATTACHMENT)
        {
            AllocationScheme::DedicatedImage(image)
        } else {
            AllocationScheme::GpuAllocatorManaged
        };

        let allocation = match self.allocate(
            desc.name,
            requirements,
            desc.map.location(),
            create_info.tiling == vk::ImageTiling::LINEAR,
            scheme,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let binding = self.binding(allocation, BoundResource::Image(image));
        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, binding.memory(), binding.offset())
        } {
            self.free(binding)?;
            return Err(e.into());
        }

        Ok(binding)
    }

    /// Destroy the bound resource and return its memory.
    pub fn free(&self, mut binding: MemoryBinding) -> Result<()> {
        if let Some(allocation) = binding.allocation.take() {
            self.allocator
                .lock()
                .as_mut()
                .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        match binding.resource {
            BoundResource::Buffer(buffer) => unsafe { self.device.destroy_buffer(buffer, None) },
            BoundResource::Image(image) => unsafe { self.device.destroy_image(image, None) },
        }

        Ok(())
    }

    /// Current allocator usage.
    pub fn report(&self) -> Result<MemoryReport> {
        let guard = self.allocator.lock();
        let allocator = guard
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?;
        let report = allocator.generate_report();

        Ok(MemoryReport {
            allocated_bytes: report.total_allocated_bytes,
            reserved_bytes: report.total_reserved_bytes,
            blocks: report.blocks.len(),
        })
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&self) {
        if let Some(allocator) = self.allocator.lock().take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Device memory bound to one buffer or image.
///
/// Must be returned through [`GpuAllocator::free`].
pub struct MemoryBinding {
    device: ash::Device,
    allocation: Option<Allocation>,
    resource: BoundResource,
    supported: MapFlags,
    atom: u64,
}

impl MemoryBinding {
    pub fn resource(&self) -> BoundResource {
        self.resource
    }

    pub fn buffer(&self) -> Option<vk::Buffer> {
        match self.resource {
            BoundResource::Buffer(buffer) => Some(buffer),
            BoundResource::Image(_) => None,
        }
    }

    pub fn image(&self) -> Option<vk::Image> {
        match self.resource {
            BoundResource::Image(image) => Some(image),
            BoundResource::Buffer(_) => None,
        }
    }

    /// Host access the underlying memory type allows.
    pub fn supported_map_flags(&self) -> MapFlags {
        self.supported
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.allocation
            .as_ref()
            .map_or_else(vk::DeviceMemory::null, |a| unsafe { a.memory() })
    }

    pub fn offset(&self) -> u64 {
        self.allocation.as_ref().map_or(0, Allocation::offset)
    }

    pub fn size(&self) -> u64 {
        self.allocation.as_ref().map_or(0, Allocation::size)
    }

    /// Host pointer to the start of the binding, for host-visible memory.
    pub fn map(&self) -> Result<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
            .ok_or_else(|| GpuError::InvalidState("Memory is not host visible".to_string()))
    }

    /// Write plain data at `offset` bytes into the binding.
    pub fn write<T: bytemuck::Pod>(&mut self, offset: u64, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let slice = self
            .allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(|| GpuError::InvalidState("Memory is not host visible".to_string()))?;

        let start = usize::try_from(offset)
            .map_err(|_| GpuError::InvalidState("Offset overflow".to_string()))?;
        let end = start
            .checked_add(bytes.len())
            .filter(|end| *end <= slice.len())
            .ok_or_else(|| GpuError::InvalidState("Data range too large for binding".to_string()))?;

        slice[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Read plain data from `offset` bytes into the binding.
    pub fn read<T: bytemuck::Pod>(&self, offset: u64, out: &mut [T]) -> Result<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        let slice = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or_else(|| GpuError::InvalidState("Memory is not host visible".to_string()))?;

        let start = usize::try_from(offset)
            .map_err(|_| GpuError::InvalidState("Offset overflow".to_string()))?;
        let end = start
            .checked_add(bytes.len())
            .filter(|end| *end <= slice.len())
            .ok_or_else(|| GpuError::InvalidState("Data range too large for binding".to_string()))?;

        bytes.copy_from_slice(&slice[start..end]);
        Ok(())
    }

    fn mapped_range(&self, offset: u64, len: u64) -> Option<vk::MappedMemoryRange<'static>> {
        if self.supported.contains(MapFlags::COHERENT) {
            return None;
        }
        let allocation = self.allocation.as_ref()?;
        let base = allocation.offset();
        let (offset, size) = aligned_range(
            base.saturating_add(offset),
            len,
            base + allocation.size(),
            self.atom,
        )?;

        Some(
            vk::MappedMemoryRange::default()
                .memory(unsafe { allocation.memory() })
                .offset(offset)
                .size(size),
        )
    }

    /// Make host writes in `offset..offset + len` visible to the device.
    ///
    /// No-op on coherent memory or when the range misses the allocation.
    pub fn flush(&self, offset: u64, len: u64) -> Result<()> {
        if let Some(range) = self.mapped_range(offset, len) {
            unsafe { self.device.flush_mapped_memory_ranges(&[range]) }?;
        }
        Ok(())
    }

    /// Make device writes in `offset..offset + len` visible to the host.
    ///
    /// No-op on coherent memory or when the range misses the allocation.
    pub fn invalidate(&self, offset: u64, len: u64) -> Result<()> {
        if let Some(range) = self.mapped_range(offset, len) {
            unsafe { self.device.invalidate_mapped_memory_ranges(&[range]) }?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBinding")
            .field("resource", &self.resource)
            .field("size", &self.size())
            .field("supported", &self.supported)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_flags_select_location() {
        assert_eq!(MapFlags::empty().location(), MemoryLocation::GpuOnly);
        assert_eq!(MapFlags::READ.location(), MemoryLocation::GpuToCpu);
        assert_eq!(MapFlags::WRITE.location(), MemoryLocation::CpuToGpu);
        assert_eq!(MapFlags::READ_WRITE.location(), MemoryLocation::CpuToGpu);
        assert_eq!(
            (MapFlags::COHERENT | MapFlags::PERSISTENT).location(),
            MemoryLocation::GpuOnly
        );
    }

    #[test]
    fn supported_flags_follow_memory_properties() {
        let device_local = MapFlags::supported_by(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert!(!device_local.intersects(MapFlags::READ_WRITE));

        let host = MapFlags::supported_by(
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        assert!(host.contains(MapFlags::READ_WRITE | MapFlags::COHERENT));
    }

    #[test]
    fn ranges_expand_to_atoms() {
        assert_eq!(aligned_range(70, 10, 1024, 64), Some((64, 64)));
        assert_eq!(aligned_range(0, 64, 1024, 64), Some((0, 64)));
        assert_eq!(aligned_range(64, 1, 1024, 1), Some((64, 1)));
    }

    #[test]
    fn ranges_clamp_to_allocation() {
        // Ends at the allocation, never at the next atom boundary past it.
        assert_eq!(aligned_range(90, 500, 100, 64), Some((64, 36)));
        assert_eq!(aligned_range(192, 100, 200, 64), Some((192, 8)));
        assert_eq!(aligned_range(0, u64::MAX, 256, 64), Some((0, 256)));
    }

    #[test]
    fn empty_ranges_are_skipped() {
        assert_eq!(aligned_range(50, 0, 100, 64), None);
        assert_eq!(aligned_range(100, 10, 100, 64), None);
        assert_eq!(aligned_range(200, 4, 100, 64), None);
        assert_eq!(aligned_range(u64::MAX, u64::MAX, 256, 64), None);
    }

    #[test]
    fn host_visible_requirements_pad_to_atoms() {
        let requirements = vk::MemoryRequirements {
            size: 100,
            alignment: 16,
            memory_type_bits: 0b101,
        };
        let padded = atom_padded(requirements, 64);
        assert_eq!(padded.size, 128);
        assert_eq!(padded.alignment, 64);
        assert_eq!(padded.memory_type_bits, 0b101);

        let coarse = vk::MemoryRequirements {
            size: 256,
            alignment: 256,
            memory_type_bits: 1,
        };
        assert_eq!(atom_padded(coarse, 64).size, 256);
        assert_eq!(atom_padded(coarse, 64).alignment, 256);
    }
}
