use ash::vk;

use crate::blas::BlasStage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("vulkan error: {0:?}")]
    Vulkan(#[from] vk::Result),
    #[error("scene object {object} has no meshes")]
    EmptyObject { object: usize },
    #[error("bottom-level structures are not ready (stage {stage:?})")]
    NotReady { stage: BlasStage },
    #[error("bottom-level build is in stage {found:?}, expected {expected:?}")]
    InvalidStage { expected: BlasStage, found: BlasStage },
    #[error("frame slot {slot} is out of range for {frames_in_flight} frames in flight")]
    InvalidFrameSlot { slot: usize, frames_in_flight: usize },
    #[error("compacted size query results unavailable after submission completed")]
    QueryUnavailable,
}

pub type Result<T> = std::result::Result<T, Error>;
