use ash::vk;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl Access {
    pub const HOST_WRITE: Self = Self {
        stage: vk::PipelineStageFlags2::HOST,
        access: vk::AccessFlags2::HOST_WRITE,
    };
    pub const COPY_WRITE: Self = Self {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    /// Reads of build inputs (vertices, transforms, instances) and source structures.
    pub const ACCEL_STRUCT_BUILD_READ: Self = Self {
        stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        access: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
    };
    pub const ACCEL_STRUCT_BUILD_WRITE: Self = Self {
        stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        access: vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
    };

    pub fn is_readonly(&self) -> bool {
        if self.access == vk::AccessFlags2::empty() {
            return false;
        }
        self.access & !ALL_READ_BITS == vk::AccessFlags2::NONE
    }
}

const ALL_READ_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::HOST_READ.as_raw()
        | vk::AccessFlags2::TRANSFER_READ.as_raw()
        | vk::AccessFlags2::SHADER_READ.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_READ.as_raw()
        | vk::AccessFlags2::MEMORY_READ.as_raw()
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw(),
);
