use ash::vk;
use smallvec::SmallVec;

/// A single geometry entry of a structure build, with all inputs referenced by device address.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildGeometry {
    Triangles {
        vertex_format: vk::Format,
        vertex_data: vk::DeviceAddress,
        vertex_stride: vk::DeviceSize,
        /// Highest vertex index that may be referenced.
        max_vertex: u32,
        index_type: vk::IndexType,
        index_data: vk::DeviceAddress,
        /// Address of a row-major 3x4 transform applied to the vertices, or 0.
        transform_data: vk::DeviceAddress,
        flags: vk::GeometryFlagsKHR,
        /// Number of triangles to be built, where each triangle is treated as 3 indices
        primitive_count: u32,
    },
    Instances {
        data: vk::DeviceAddress,
        flags: vk::GeometryFlagsKHR,
        /// Number of instance records read from `data`
        primitive_count: u32,
    },
}

impl BuildGeometry {
    pub fn ty(&self) -> vk::GeometryTypeKHR {
        match self {
            BuildGeometry::Triangles { .. } => vk::GeometryTypeKHR::TRIANGLES,
            BuildGeometry::Instances { .. } => vk::GeometryTypeKHR::INSTANCES,
        }
    }
    pub fn primitive_count(&self) -> u32 {
        match self {
            BuildGeometry::Triangles {
                primitive_count, ..
            }
            | BuildGeometry::Instances {
                primitive_count, ..
            } => *primitive_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildDescription {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub geometries: SmallVec<[BuildGeometry; 4]>,
}

impl BuildDescription {
    pub fn bottom_level(flags: vk::BuildAccelerationStructureFlagsKHR) -> Self {
        Self {
            ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            flags,
            geometries: SmallVec::new(),
        }
    }

    /// A top-level build over `instance_count` records at `instances`.
    pub fn top_level(
        flags: vk::BuildAccelerationStructureFlagsKHR,
        instances: vk::DeviceAddress,
        instance_count: u32,
    ) -> Self {
        let mut geometries = SmallVec::new();
        geometries.push(BuildGeometry::Instances {
            data: instances,
            flags: vk::GeometryFlagsKHR::empty(),
            primitive_count: instance_count,
        });
        Self {
            ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            flags,
            geometries,
        }
    }

    pub fn max_primitive_counts(&self) -> SmallVec<[u32; 4]> {
        self.geometries
            .iter()
            .map(BuildGeometry::primitive_count)
            .collect()
    }

    pub fn primitive_count(&self) -> u64 {
        self.geometries
            .iter()
            .map(|g| g.primitive_count() as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_has_single_instances_geometry() {
        let desc = BuildDescription::top_level(
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            0x1000,
            0,
        );
        assert_eq!(desc.geometries.len(), 1);
        assert_eq!(desc.geometries[0].ty(), vk::GeometryTypeKHR::INSTANCES);
        assert_eq!(desc.primitive_count(), 0);
        assert_eq!(desc.max_primitive_counts().as_slice(), &[0]);
    }
}
