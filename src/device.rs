use ash::vk;

use crate::{access::Access, geometry::BuildDescription, Result};

/// Where a buffer's memory should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// DEVICE_LOCAL memory, never touched by the host.
    GpuOnly,
    /// HOST_VISIBLE memory mapped for sequential writes, preferably DEVICE_LOCAL as well.
    CpuToGpu,
}

#[derive(Debug, Clone)]
pub struct BufferInfo<'a> {
    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub name: &'a str,
}

impl<'a> BufferInfo<'a> {
    pub fn storage(size: vk::DeviceSize, name: &'a str) -> Self {
        Self {
            size,
            alignment: 1,
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::GpuOnly,
            name,
        }
    }
    pub fn scratch(size: vk::DeviceSize, alignment: vk::DeviceSize, name: &'a str) -> Self {
        Self {
            size,
            alignment,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::GpuOnly,
            name,
        }
    }
    /// Host-written input to a structure build (instances, transforms).
    pub fn build_input(size: vk::DeviceSize, name: &'a str) -> Self {
        Self {
            size,
            alignment: 16,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            location: MemoryLocation::CpuToGpu,
            name,
        }
    }
    pub fn staging(size: vk::DeviceSize, name: &'a str) -> Self {
        Self {
            size,
            alignment: 1,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
            name,
        }
    }
}

pub trait BufferLike {
    fn size(&self) -> vk::DeviceSize;
    fn device_address(&self) -> vk::DeviceAddress;
}

pub trait AccelStructLike {
    fn size(&self) -> vk::DeviceSize;
    fn device_address(&self) -> vk::DeviceAddress;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub acceleration_structure_size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
}

/// One structure build within a batch.
pub struct BuildCommand<'a, D: AccelDevice + ?Sized> {
    pub description: &'a BuildDescription,
    pub dst: &'a D::AccelStruct,
    pub scratch_address: vk::DeviceAddress,
}

/// The GPU as seen by the acceleration structure subsystem: a buffer allocator,
/// acceleration structure and query pool creation, command recording and submission.
///
/// Resources are released explicitly through the `destroy_*` functions so that they
/// can be parked in a [`DeletionQueue`](crate::dispose::DeletionQueue) until the GPU
/// is done with them.
pub trait AccelDevice {
    type Buffer: BufferLike + 'static;
    type AccelStruct: AccelStructLike + 'static;
    type QueryPool;
    type CommandBuffer;
    /// Work submitted to the GPU that can be polled or waited upon.
    type Submission;

    fn create_buffer(&self, info: &BufferInfo) -> Result<Self::Buffer>;
    /// Write `data` at the start of a host visible buffer, flushing non-coherent memory.
    fn write_buffer(&self, buffer: &mut Self::Buffer, data: &[u8]) -> Result<()>;
    fn destroy_buffer(&self, buffer: Self::Buffer);

    fn scratch_offset_alignment(&self) -> vk::DeviceSize;
    fn build_sizes(&self, description: &BuildDescription) -> Result<BuildSizes>;
    /// Create a structure occupying the whole of `buffer`.
    fn create_accel_struct(
        &self,
        buffer: &Self::Buffer,
        ty: vk::AccelerationStructureTypeKHR,
    ) -> Result<Self::AccelStruct>;
    fn destroy_accel_struct(&self, accel_struct: Self::AccelStruct);

    /// Create a pool of `count` compacted size queries.
    fn create_query_pool(&self, count: u32) -> Result<Self::QueryPool>;
    /// Returns `false` if the results are not yet available.
    fn query_results(&self, pool: &Self::QueryPool, results: &mut [u64]) -> Result<bool>;
    fn destroy_query_pool(&self, pool: Self::QueryPool);

    fn begin_commands(&self) -> Result<Self::CommandBuffer>;
    /// Release a command buffer that will never be submitted.
    fn discard_commands(&self, commands: Self::CommandBuffer);
    fn submit(&self, commands: Self::CommandBuffer) -> Result<Self::Submission>;
    fn is_complete(&self, submission: &Self::Submission) -> Result<bool>;
    /// Block until the submission finished executing, then release it.
    fn wait(&self, submission: Self::Submission) -> Result<()>;

    fn cmd_copy_buffer(
        &self,
        commands: &mut Self::CommandBuffer,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        size: vk::DeviceSize,
    );
    fn cmd_barrier(&self, commands: &mut Self::CommandBuffer, src: Access, dst: Access);
    fn cmd_build_accel_structs(
        &self,
        commands: &mut Self::CommandBuffer,
        builds: &[BuildCommand<'_, Self>],
    );
    fn cmd_reset_query_pool(&self, commands: &mut Self::CommandBuffer, pool: &Self::QueryPool);
    fn cmd_write_compacted_sizes(
        &self,
        commands: &mut Self::CommandBuffer,
        accel_structs: &[&Self::AccelStruct],
        pool: &Self::QueryPool,
    );
    fn cmd_copy_compact(
        &self,
        commands: &mut Self::CommandBuffer,
        src: &Self::AccelStruct,
        dst: &Self::AccelStruct,
    );

    #[allow(unused_variables)]
    fn set_accel_struct_name(&self, accel_struct: &Self::AccelStruct, name: &str) {}
}
