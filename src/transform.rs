//! Packing of per-mesh transforms consumed by bottom-level builds.
use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::{
    access::Access,
    device::{AccelDevice, BufferInfo, BufferLike, MemoryLocation},
    scene::{to_row_major_3x4, GeometrySource, SceneObject},
    Error, Result,
};

/// Layout-compatible with `VkTransformMatrixKHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TransformRecord {
    pub matrix: [f32; 12],
}

const _: () =
    assert!(std::mem::size_of::<TransformRecord>() == std::mem::size_of::<vk::TransformMatrixKHR>());

impl TransformRecord {
    pub const SIZE: vk::DeviceSize = std::mem::size_of::<TransformRecord>() as vk::DeviceSize;
}

impl From<bevy::math::Mat4> for TransformRecord {
    fn from(transform: bevy::math::Mat4) -> Self {
        Self {
            matrix: to_row_major_3x4(transform),
        }
    }
}

/// Flatten the transforms of every mesh of every object, in object then mesh order.
pub fn pack_transforms<G: GeometrySource>(
    source: &G,
    objects: &[SceneObject],
) -> Result<Vec<TransformRecord>> {
    let mut records = Vec::new();
    for (index, object) in objects.iter().enumerate() {
        let model = source.model(object.model);
        if model.meshes.is_empty() {
            return Err(Error::EmptyObject { object: index });
        }
        records.extend(
            model
                .meshes
                .iter()
                .map(|mesh| TransformRecord::from(model.transform * mesh.transform)),
        );
    }
    Ok(records)
}

/// Mesh transforms resident in device memory, uploaded through a staging buffer.
pub struct TransformBuffer<D: AccelDevice> {
    staging: D::Buffer,
    buffer: D::Buffer,
    len: usize,
}

impl<D: AccelDevice> TransformBuffer<D> {
    /// Records the upload of `records` into `commands`. The transforms may be read by
    /// structure builds recorded afterwards.
    pub fn upload(
        device: &D,
        commands: &mut D::CommandBuffer,
        records: &[TransformRecord],
    ) -> Result<Self> {
        let size = TransformRecord::SIZE * records.len().max(1) as vk::DeviceSize;
        let mut staging = device.create_buffer(&BufferInfo::staging(size, "BLAS transform staging"))?;
        device.write_buffer(&mut staging, bytemuck::cast_slice(records))?;
        let buffer = match device.create_buffer(&BufferInfo {
            size,
            alignment: 16,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuOnly,
            name: "BLAS transforms",
        }) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.destroy_buffer(staging);
                return Err(err);
            }
        };
        device.cmd_copy_buffer(commands, &staging, &buffer, size);
        device.cmd_barrier(commands, Access::COPY_WRITE, Access::ACCEL_STRUCT_BUILD_READ);
        Ok(Self {
            staging,
            buffer,
            len: records.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Device address of the `index`th packed transform.
    pub fn address(&self, index: usize) -> vk::DeviceAddress {
        debug_assert!(index < self.len);
        self.buffer.device_address() + index as vk::DeviceAddress * TransformRecord::SIZE
    }

    pub fn destroy(self, device: &D) {
        device.destroy_buffer(self.staging);
        device.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use bevy::math::{Mat4, Vec3};

    use super::*;
    use crate::{
        mock::{MockCommand, MockDevice, TestScene},
        scene::{GeometryRange, MeshGeometry},
    };

    #[test]
    fn packs_model_then_mesh_transform() {
        let mut scene = TestScene::new();
        let range = GeometryRange {
            offset: 0,
            count: 3,
        };
        let mesh =
            MeshGeometry::new(range, range).with_transform(Mat4::from_translation(Vec3::X));
        let model = scene.add_model_with_transform(
            Mat4::from_scale(Vec3::splat(2.0)),
            vec![mesh.clone(), mesh],
        );
        let objects = vec![SceneObject::new(model), SceneObject::new(model)];
        let records = pack_transforms(&scene, &objects).unwrap();
        assert_eq!(records.len(), 4);
        // scale(2) * translate(1, 0, 0): translation is scaled
        assert_eq!(records[0].matrix[3], 2.0);
        assert_eq!(records[0].matrix[0], 2.0);
        assert!(records.iter().all(|r| *r == records[0]));
    }

    #[test]
    fn object_without_meshes_is_rejected() {
        let mut scene = TestScene::new();
        let empty = scene.add_model(Vec::new());
        let objects = vec![SceneObject::new(empty)];
        assert!(matches!(
            pack_transforms(&scene, &objects),
            Err(Error::EmptyObject { object: 0 })
        ));
    }

    #[test]
    fn upload_goes_through_staging() {
        let device = MockDevice::new();
        let mut commands = device.begin_commands().unwrap();
        let records = vec![TransformRecord::from(Mat4::IDENTITY); 3];
        let buffer = TransformBuffer::upload(&device, &mut commands, &records).unwrap();
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.address(1) - buffer.address(0), 48);
        assert!(matches!(
            commands.commands.as_slice(),
            [MockCommand::CopyBuffer { size: 144, .. }, MockCommand::Barrier { .. }]
        ));
        assert_eq!(device.contents(buffer.staging.id).len(), 144);
        buffer.destroy(&device);
        assert_eq!(device.live_buffers(), 0);
    }
}
