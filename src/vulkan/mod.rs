//! [`AccelDevice`] on top of `ash` and `vk-mem`.
//!
//! The device must have been created with `VK_KHR_acceleration_structure`,
//! `bufferDeviceAddress` and `synchronization2` enabled.
mod accel_struct;
mod buffer;
mod command;
mod query_pool;

use std::{
    ffi::CString,
    sync::{Mutex, MutexGuard, PoisonError},
};

use ash::{ext, khr, vk};

use crate::{
    access::Access,
    device::{AccelDevice, BufferInfo, BuildCommand, BuildSizes},
    geometry::BuildDescription,
    Result,
};

pub use accel_struct::AccelStruct;
pub use buffer::Buffer;
pub use command::{CommandBuffer, Submission};
pub use query_pool::QueryPool;

pub struct VulkanDevice {
    device: ash::Device,
    allocator: vk_mem::Allocator,
    accel_struct_loader: khr::acceleration_structure::Device,
    debug_utils: Option<ext::debug_utils::Device>,
    queue: Mutex<vk::Queue>,
    command_pool: Mutex<vk::CommandPool>,
    scratch_offset_alignment: vk::DeviceSize,
}

impl VulkanDevice {
    /// Structure builds and compaction are submitted to `queue`, which must belong to
    /// `queue_family_index` and support compute.
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        queue: vk::Queue,
    ) -> Result<Self> {
        let mut allocator_info =
            vk_mem::AllocatorCreateInfo::new(instance, &device, physical_device);
        allocator_info.flags = vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
        allocator_info.vulkan_api_version = vk::make_api_version(0, 1, 3, 0);
        let allocator = unsafe { vk_mem::Allocator::new(allocator_info)? };

        let mut accel_struct_properties =
            vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties =
            vk::PhysicalDeviceProperties2::default().push_next(&mut accel_struct_properties);
        unsafe {
            instance.get_physical_device_properties2(physical_device, &mut properties);
        }
        let scratch_offset_alignment =
            accel_struct_properties.min_acceleration_structure_scratch_offset_alignment as u64;

        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo {
                    flags: vk::CommandPoolCreateFlags::TRANSIENT,
                    queue_family_index,
                    ..Default::default()
                },
                None,
            )?
        };
        Ok(Self {
            accel_struct_loader: khr::acceleration_structure::Device::new(instance, &device),
            debug_utils: None,
            allocator,
            device,
            queue: Mutex::new(queue),
            command_pool: Mutex::new(command_pool),
            scratch_offset_alignment,
        })
    }

    /// Name every created buffer and structure through `VK_EXT_debug_utils`.
    /// The instance must have the extension enabled.
    pub fn with_debug_utils(mut self, instance: &ash::Instance) -> Self {
        self.debug_utils = Some(ext::debug_utils::Device::new(instance, &self.device));
        self
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn allocator(&self) -> &vk_mem::Allocator {
        &self.allocator
    }

    fn command_pool(&self) -> MutexGuard<'_, vk::CommandPool> {
        self.command_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_name<T: vk::Handle>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let result = unsafe {
            debug_utils.set_debug_utils_object_name(
                &vk::DebugUtilsObjectNameInfoEXT::default()
                    .object_handle(handle)
                    .object_name(&name),
            )
        };
        if let Err(err) = result {
            tracing::warn!(?err, "Failed to set debug name");
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(*self.command_pool(), None);
        }
    }
}

impl AccelDevice for VulkanDevice {
    type Buffer = Buffer;
    type AccelStruct = AccelStruct;
    type QueryPool = QueryPool;
    type CommandBuffer = CommandBuffer;
    type Submission = Submission;

    fn create_buffer(&self, info: &BufferInfo) -> Result<Buffer> {
        let buffer = Buffer::new(&self.device, &self.allocator, info)?;
        self.set_name(buffer.raw(), info.name);
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: &mut Buffer, data: &[u8]) -> Result<()> {
        buffer.write(&self.allocator, data)
    }

    fn destroy_buffer(&self, buffer: Buffer) {
        buffer.destroy(&self.allocator);
    }

    fn scratch_offset_alignment(&self) -> vk::DeviceSize {
        self.scratch_offset_alignment
    }

    fn build_sizes(&self, description: &BuildDescription) -> Result<BuildSizes> {
        let geometries = accel_struct::geometries(description);
        let info = accel_struct::build_info(description, &geometries);
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.accel_struct_loader
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &info,
                    &description.max_primitive_counts(),
                    &mut sizes,
                );
        }
        Ok(BuildSizes {
            acceleration_structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
        })
    }

    fn create_accel_struct(
        &self,
        buffer: &Buffer,
        ty: vk::AccelerationStructureTypeKHR,
    ) -> Result<AccelStruct> {
        AccelStruct::new(&self.accel_struct_loader, buffer, ty)
    }

    fn destroy_accel_struct(&self, accel_struct: AccelStruct) {
        accel_struct.destroy(&self.accel_struct_loader);
    }

    fn create_query_pool(&self, count: u32) -> Result<QueryPool> {
        QueryPool::new(&self.device, count)
    }

    fn query_results(&self, pool: &QueryPool, results: &mut [u64]) -> Result<bool> {
        pool.get_results_u64(&self.device, results)
    }

    fn destroy_query_pool(&self, pool: QueryPool) {
        pool.destroy(&self.device);
    }

    fn begin_commands(&self) -> Result<CommandBuffer> {
        let pool = self.command_pool();
        Ok(CommandBuffer::begin(&self.device, *pool)?)
    }

    fn discard_commands(&self, commands: CommandBuffer) {
        if let Some(command_buffer) = commands.owned() {
            unsafe {
                self.device
                    .free_command_buffers(*self.command_pool(), &[command_buffer]);
            }
        }
    }

    fn submit(&self, commands: CommandBuffer) -> Result<Submission> {
        let command_buffer = commands.owned();
        let release = |fence: Option<vk::Fence>| unsafe {
            if let Some(fence) = fence {
                self.device.destroy_fence(fence, None);
            }
            if let Some(command_buffer) = command_buffer {
                self.device
                    .free_command_buffers(*self.command_pool(), &[command_buffer]);
            }
        };
        unsafe {
            if let Err(err) = self.device.end_command_buffer(commands.raw()) {
                release(None);
                return Err(err.into());
            }
            let fence = match self
                .device
                .create_fence(&vk::FenceCreateInfo::default(), None)
            {
                Ok(fence) => fence,
                Err(err) => {
                    release(None);
                    return Err(err.into());
                }
            };
            let command_buffers = [commands.raw()];
            let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let result = self.device.queue_submit(
                *queue,
                &[vk::SubmitInfo::default().command_buffers(&command_buffers)],
                fence,
            );
            drop(queue);
            if let Err(err) = result {
                release(Some(fence));
                return Err(err.into());
            }
            Ok(Submission {
                fence,
                command_buffer,
            })
        }
    }

    fn is_complete(&self, submission: &Submission) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(submission.fence)? })
    }

    fn wait(&self, submission: Submission) -> Result<()> {
        unsafe {
            let result = self
                .device
                .wait_for_fences(&[submission.fence], true, u64::MAX);
            self.device.destroy_fence(submission.fence, None);
            if let Some(command_buffer) = submission.command_buffer {
                self.device
                    .free_command_buffers(*self.command_pool(), &[command_buffer]);
            }
            result?;
        }
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        commands: &mut CommandBuffer,
        src: &Buffer,
        dst: &Buffer,
        size: vk::DeviceSize,
    ) {
        unsafe {
            self.device.cmd_copy_buffer(
                commands.raw(),
                src.raw(),
                dst.raw(),
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                }],
            );
        }
    }

    fn cmd_barrier(&self, commands: &mut CommandBuffer, src: Access, dst: Access) {
        let barrier = if src.is_readonly() {
            // Write-after-read only needs an execution dependency.
            vk::MemoryBarrier2 {
                src_stage_mask: src.stage,
                dst_stage_mask: dst.stage,
                ..Default::default()
            }
        } else {
            vk::MemoryBarrier2 {
                src_stage_mask: src.stage,
                src_access_mask: src.access,
                dst_stage_mask: dst.stage,
                dst_access_mask: dst.access,
                ..Default::default()
            }
        };
        unsafe {
            self.device.cmd_pipeline_barrier2(
                commands.raw(),
                &vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier)),
            );
        }
    }

    fn cmd_build_accel_structs(&self, commands: &mut CommandBuffer, builds: &[BuildCommand<'_, Self>]) {
        let geometries = builds
            .iter()
            .map(|build| accel_struct::geometries(build.description))
            .collect::<Vec<_>>();
        let ranges = builds
            .iter()
            .map(|build| accel_struct::build_ranges(build.description))
            .collect::<Vec<_>>();
        let infos = builds
            .iter()
            .zip(geometries.iter())
            .map(|(build, geometries)| {
                accel_struct::build_info(build.description, geometries)
                    .dst_acceleration_structure(build.dst.raw())
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: build.scratch_address,
                    })
            })
            .collect::<Vec<_>>();
        let ranges = ranges.iter().map(|r| r.as_slice()).collect::<Vec<_>>();
        unsafe {
            self.accel_struct_loader
                .cmd_build_acceleration_structures(commands.raw(), &infos, &ranges);
        }
    }

    fn cmd_reset_query_pool(&self, commands: &mut CommandBuffer, pool: &QueryPool) {
        unsafe {
            self.device
                .cmd_reset_query_pool(commands.raw(), pool.raw(), 0, pool.count());
        }
    }

    fn cmd_write_compacted_sizes(
        &self,
        commands: &mut CommandBuffer,
        accel_structs: &[&AccelStruct],
        pool: &QueryPool,
    ) {
        debug_assert!(accel_structs.len() as u32 <= pool.count());
        let raw = accel_structs.iter().map(|a| a.raw()).collect::<Vec<_>>();
        unsafe {
            self.accel_struct_loader
                .cmd_write_acceleration_structures_properties(
                    commands.raw(),
                    &raw,
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    pool.raw(),
                    0,
                );
        }
    }

    fn cmd_copy_compact(&self, commands: &mut CommandBuffer, src: &AccelStruct, dst: &AccelStruct) {
        unsafe {
            self.accel_struct_loader.cmd_copy_acceleration_structure(
                commands.raw(),
                &vk::CopyAccelerationStructureInfoKHR {
                    src: src.raw(),
                    dst: dst.raw(),
                    mode: vk::CopyAccelerationStructureModeKHR::COMPACT,
                    ..Default::default()
                },
            );
        }
    }

    fn set_accel_struct_name(&self, accel_struct: &AccelStruct, name: &str) {
        self.set_name(accel_struct.raw(), name);
    }
}
