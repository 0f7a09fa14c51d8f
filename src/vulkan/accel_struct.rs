use ash::{khr, vk};
use smallvec::SmallVec;

use crate::{
    device::{AccelStructLike, BufferLike},
    geometry::{BuildDescription, BuildGeometry},
    Result,
};

use super::Buffer;

pub struct AccelStruct {
    raw: vk::AccelerationStructureKHR,
    size: vk::DeviceSize,
    device_address: vk::DeviceAddress,
}

impl AccelStructLike for AccelStruct {
    fn size(&self) -> vk::DeviceSize {
        self.size
    }
    fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }
}

impl AccelStruct {
    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.raw
    }

    pub(super) fn new(
        loader: &khr::acceleration_structure::Device,
        buffer: &Buffer,
        ty: vk::AccelerationStructureTypeKHR,
    ) -> Result<Self> {
        unsafe {
            let raw = loader.create_acceleration_structure(
                &vk::AccelerationStructureCreateInfoKHR {
                    ty,
                    size: buffer.size(),
                    buffer: buffer.raw(),
                    ..Default::default()
                },
                None,
            )?;
            let device_address = loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR {
                    acceleration_structure: raw,
                    ..Default::default()
                },
            );
            Ok(Self {
                raw,
                size: buffer.size(),
                device_address,
            })
        }
    }

    pub(super) fn destroy(self, loader: &khr::acceleration_structure::Device) {
        unsafe {
            loader.destroy_acceleration_structure(self.raw, None);
        }
    }
}

pub(super) type Geometries = SmallVec<[vk::AccelerationStructureGeometryKHR<'static>; 4]>;
pub(super) type BuildRanges = SmallVec<[vk::AccelerationStructureBuildRangeInfoKHR; 4]>;

/// Every input is referenced by device address, so nothing is borrowed.
fn geometry(geometry: &BuildGeometry) -> vk::AccelerationStructureGeometryKHR<'static> {
    match *geometry {
        BuildGeometry::Triangles {
            vertex_format,
            vertex_data,
            vertex_stride,
            max_vertex,
            index_type,
            index_data,
            transform_data,
            flags,
            ..
        } => vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::TRIANGLES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR {
                    vertex_format,
                    vertex_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: vertex_data,
                    },
                    vertex_stride,
                    max_vertex,
                    index_type,
                    index_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: index_data,
                    },
                    transform_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: transform_data,
                    },
                    ..Default::default()
                },
            },
            flags,
            ..Default::default()
        },
        BuildGeometry::Instances { data, flags, .. } => vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::INSTANCES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR {
                    array_of_pointers: vk::FALSE,
                    data: vk::DeviceOrHostAddressConstKHR {
                        device_address: data,
                    },
                    ..Default::default()
                },
            },
            flags,
            ..Default::default()
        },
    }
}

pub(super) fn geometries(description: &BuildDescription) -> Geometries {
    description.geometries.iter().map(geometry).collect()
}

pub(super) fn build_ranges(description: &BuildDescription) -> BuildRanges {
    description
        .geometries
        .iter()
        .map(|geometry| vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: geometry.primitive_count(),
            ..Default::default()
        })
        .collect()
}

/// Build info without destination or scratch, as needed for size queries.
pub(super) fn build_info<'a>(
    description: &BuildDescription,
    geometries: &'a [vk::AccelerationStructureGeometryKHR<'static>],
) -> vk::AccelerationStructureBuildGeometryInfoKHR<'a> {
    vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(description.ty)
        .flags(description.flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometries)
}
