use ash::vk;
use vk_mem::Alloc;

use crate::{
    device::{BufferInfo, BufferLike, MemoryLocation},
    Error, Result,
};

/// A buffer and its VMA allocation.
pub struct Buffer {
    raw: vk::Buffer,
    allocation: vk_mem::Allocation,
    size: vk::DeviceSize,
    device_address: vk::DeviceAddress,
    /// Null unless the allocation is persistently mapped.
    ptr: *mut u8,
}

impl BufferLike for Buffer {
    fn size(&self) -> vk::DeviceSize {
        self.size
    }
    fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }
}

impl Buffer {
    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub(super) fn new(
        device: &ash::Device,
        allocator: &vk_mem::Allocator,
        info: &BufferInfo,
    ) -> Result<Self> {
        let allocation_info = match info.location {
            MemoryLocation::GpuOnly => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                flags: vk_mem::AllocationCreateFlags::empty(),
                ..Default::default()
            },
            // On integrated GPUs and GPUs with SAM this lands in DEVICE_LOCAL memory.
            MemoryLocation::CpuToGpu => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                flags: vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            },
        };
        unsafe {
            let (raw, allocation) = allocator.create_buffer_with_alignment(
                &vk::BufferCreateInfo {
                    size: info.size,
                    usage: info.usage,
                    sharing_mode: vk::SharingMode::EXCLUSIVE,
                    ..Default::default()
                },
                &allocation_info,
                info.alignment,
            )?;
            let ptr = allocator.get_allocation_info(&allocation).mapped_data as *mut u8;
            let device_address = if info
                .usage
                .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            {
                device.get_buffer_device_address(&vk::BufferDeviceAddressInfo {
                    buffer: raw,
                    ..Default::default()
                })
            } else {
                0
            };
            Ok(Self {
                raw,
                allocation,
                size: info.size,
                device_address,
                ptr,
            })
        }
    }

    pub(super) fn write(&mut self, allocator: &vk_mem::Allocator, data: &[u8]) -> Result<()> {
        if self.ptr.is_null() {
            return Err(Error::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        assert!(
            data.len() as vk::DeviceSize <= self.size,
            "Writing {} bytes into a buffer of {} bytes",
            data.len(),
            self.size
        );
        if data.is_empty() {
            return Ok(());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr, data.len());
        }
        // No-op on HOST_COHERENT memory.
        allocator.flush_allocation(&self.allocation, 0, data.len() as vk::DeviceSize)?;
        Ok(())
    }

    pub(super) fn destroy(mut self, allocator: &vk_mem::Allocator) {
        unsafe {
            allocator.destroy_buffer(self.raw, &mut self.allocation);
        }
    }
}
