use ash::vk;
use bevy::math::Mat4;
use bytemuck::{Pod, Zeroable};

use crate::scene::{to_row_major_3x4, GeometrySource, SceneObject};

/// Layout-compatible with `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    pub transform: [f32; 12],
    pub custom_index_and_mask: u32,
    pub sbt_offset_and_flags: u32,
    pub blas_address: u64,
}

const _: () = assert!(
    std::mem::size_of::<InstanceRecord>()
        == std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
);

impl InstanceRecord {
    pub const SIZE: vk::DeviceSize = std::mem::size_of::<InstanceRecord>() as vk::DeviceSize;

    pub fn new(
        transform: Mat4,
        blas_address: vk::DeviceAddress,
        custom_index: u32,
        mask: u8,
        flags: vk::GeometryInstanceFlagsKHR,
    ) -> Self {
        assert_eq!(
            custom_index & !0xffffff,
            0,
            "Custom index must be in the range 0 ..= 2^24"
        );
        Self {
            transform: to_row_major_3x4(transform),
            custom_index_and_mask: custom_index | ((mask as u32) << 24),
            sbt_offset_and_flags: (flags.as_raw() & 0xff) << 24,
            blas_address,
        }
    }

    pub fn with_sbt_offset(mut self, offset: u32) -> Self {
        assert_eq!(
            offset & !0xffffff,
            0,
            "SBT offset must be in the range 0 ..= 2^24"
        );
        self.sbt_offset_and_flags = (self.sbt_offset_and_flags & 0xff00_0000) | offset;
        self
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0xffffff
    }
    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }
    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & 0xffffff
    }
    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.sbt_offset_and_flags >> 24)
    }
}

/// One instance per scene object, referencing the bottom-level structure sharing its index.
/// The custom index of each instance is the object index. `objects` may be a prefix of
/// the objects the structures were built for.
pub fn build_instances<G: GeometrySource>(
    source: &G,
    objects: &[SceneObject],
    blas_addresses: &[vk::DeviceAddress],
    mask: u8,
) -> Vec<InstanceRecord> {
    debug_assert!(
        objects.len() <= blas_addresses.len(),
        "Every scene object must have a bottom-level structure"
    );
    objects
        .iter()
        .zip(blas_addresses)
        .enumerate()
        .map(|(index, (object, &address))| {
            InstanceRecord::new(
                object.world_matrix(),
                address,
                index as u32,
                mask,
                source.model(object.model).instance_flags(),
            )
        })
        .collect()
}
