//! The geometry source consumed by the builders: models, their meshes, and the
//! scene objects instancing them.
use ash::vk;
use bevy::math::{Mat4, Vec3};

/// A range of elements inside one of the shared geometry buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeometryRange {
    pub offset: u32,
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct MeshGeometry {
    pub positions: GeometryRange,
    pub indices: GeometryRange,
    /// Transform of the mesh relative to its model.
    pub transform: Mat4,
    pub alpha_masked: bool,
    pub double_sided: bool,
}

impl MeshGeometry {
    pub fn new(positions: GeometryRange, indices: GeometryRange) -> Self {
        Self {
            positions,
            indices,
            transform: Mat4::IDENTITY,
            alpha_masked: false,
            double_sided: false,
        }
    }
    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }
    pub fn with_alpha_mask(mut self, alpha_masked: bool) -> Self {
        self.alpha_masked = alpha_masked;
        self
    }
    pub fn with_double_sided(mut self, double_sided: bool) -> Self {
        self.double_sided = double_sided;
        self
    }
    pub fn triangle_count(&self) -> u32 {
        self.indices.count / 3
    }
    /// Meshes without alpha masking skip any-hit shaders.
    pub fn geometry_flags(&self) -> vk::GeometryFlagsKHR {
        if self.alpha_masked {
            vk::GeometryFlagsKHR::empty()
        } else {
            vk::GeometryFlagsKHR::OPAQUE
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub usize);

#[derive(Debug, Clone)]
pub struct Model {
    /// Root transform of the model, applied before each mesh transform.
    pub transform: Mat4,
    pub meshes: Vec<MeshGeometry>,
}

impl Model {
    pub fn new(meshes: Vec<MeshGeometry>) -> Self {
        Self {
            transform: Mat4::IDENTITY,
            meshes,
        }
    }

    pub fn instance_flags(&self) -> vk::GeometryInstanceFlagsKHR {
        let mut flags = vk::GeometryInstanceFlagsKHR::empty();
        if !self.meshes.is_empty() {
            if self.meshes.iter().all(|m| m.alpha_masked) {
                flags |= vk::GeometryInstanceFlagsKHR::FORCE_NO_OPAQUE;
            } else if self.meshes.iter().all(|m| !m.alpha_masked) {
                flags |= vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE;
            }
        }
        if self.meshes.iter().any(|m| m.double_sided) {
            flags |= vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionStream {
    pub device_address: vk::DeviceAddress,
    pub stride: vk::DeviceSize,
    pub format: vk::Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStream {
    pub device_address: vk::DeviceAddress,
    pub index_type: vk::IndexType,
}

impl IndexStream {
    pub fn index_size(&self) -> vk::DeviceSize {
        match self.index_type {
            vk::IndexType::UINT16 => 2,
            _ => 4,
        }
    }
}

/// Mesh data resident on the GPU, shared by every model of a scene.
pub trait GeometrySource {
    fn positions(&self) -> PositionStream;
    fn indices(&self) -> IndexStream;
    fn model(&self, id: ModelId) -> &Model;
}

/// An object placed in the scene. Its index in the scene object list is the index of
/// its bottom-level structure and must stay stable for the lifetime of the scene.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneObject {
    pub model: ModelId,
    pub position: Vec3,
    /// Euler angles in radians, applied X then Y then Z.
    pub rotation: Vec3,
    pub scale: Vec3,
}

impl SceneObject {
    pub fn new(model: ModelId) -> Self {
        Self {
            model,
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }
    pub fn with_rotation(mut self, rotation: Vec3) -> Self {
        self.rotation = rotation;
        self
    }
    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn world_matrix(&self) -> Mat4 {
        Mat4::from_translation(self.position)
            * Mat4::from_rotation_x(self.rotation.x)
            * Mat4::from_rotation_y(self.rotation.y)
            * Mat4::from_rotation_z(self.rotation.z)
            * Mat4::from_scale(self.scale)
    }
}

/// Row-major 3x4 matrix, the layout of `VkTransformMatrixKHR`.
pub fn to_row_major_3x4(transform: Mat4) -> [f32; 12] {
    let mut matrix = [0.0; 12];
    matrix.copy_from_slice(&transform.transpose().to_cols_array()[0..12]);
    matrix
}
