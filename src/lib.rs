//! Lifecycle management of hardware ray tracing acceleration structures.
//!
//! Bottom-level structures are built and compacted once per scene load by
//! [`BottomLevelBuild`]. Every frame, [`TopLevelRing`] rebuilds the top-level structure
//! of one frame-in-flight slot without waiting on the GPU, deferring the release of
//! replaced buffers until the slot comes around again. [`SceneAccel`] ties both together.
pub mod access;
pub mod blas;
pub mod config;
pub mod device;
pub mod dispose;
mod error;
pub mod geometry;
pub mod instance;
pub mod scene;
pub mod scene_accel;
pub mod tlas;
pub mod transform;
pub mod vulkan;

#[cfg(test)]
mod mock;

pub use ash;
pub use error::{Error, Result};

pub use access::Access;
pub use blas::{build_bottom_level, BlasStage, BottomLevelBuild, BottomLevelSet};
pub use config::{AccelConfig, GrowthPolicy};
pub use device::{AccelDevice, AccelStructLike, BufferInfo, BufferLike, MemoryLocation};
pub use dispose::DeletionQueue;
pub use instance::InstanceRecord;
pub use scene::{GeometrySource, MeshGeometry, Model, ModelId, SceneObject};
pub use scene_accel::SceneAccel;
pub use tlas::TopLevelRing;
pub use vulkan::VulkanDevice;
