use ash::vk;

use crate::{
    blas::{build_bottom_level, BottomLevelSet},
    config::AccelConfig,
    device::AccelDevice,
    scene::{GeometrySource, SceneObject},
    tlas::TopLevelRing,
    Result,
};

/// Acceleration structures of a loaded scene: the compacted bottom-level structures,
/// built once, and the top-level structure of every frame in flight.
pub struct SceneAccel<D: AccelDevice> {
    bottom_level: BottomLevelSet<D>,
    ring: TopLevelRing<D>,
    frames_in_flight: usize,
}

impl<D: AccelDevice + 'static> SceneAccel<D> {
    /// Build and compact the bottom-level structures of `objects`.
    /// Blocks until the GPU finished compacting.
    pub fn load<G: GeometrySource>(
        device: &D,
        source: &G,
        objects: &[SceneObject],
        config: AccelConfig,
    ) -> Result<Self> {
        let bottom_level = build_bottom_level(device, source, objects, &config)?;
        Ok(Self {
            bottom_level,
            frames_in_flight: config.frames_in_flight,
            ring: TopLevelRing::new(config),
        })
    }

    /// Record this frame's top-level rebuild into `commands`. `objects` must be a prefix
    /// of the objects the scene was loaded with, in the same order; only their placement
    /// may have changed.
    pub fn update<G: GeometrySource>(
        &mut self,
        device: &D,
        commands: &mut D::CommandBuffer,
        frame: u64,
        source: &G,
        objects: &[SceneObject],
    ) -> Result<vk::DeviceAddress> {
        debug_assert!(
            objects.len() <= self.bottom_level.len(),
            "Scene objects added after load"
        );
        let slot = self.slot_index(frame);
        self.ring
            .build(device, commands, slot, frame, source, objects, &self.bottom_level)
    }

    pub fn slot_index(&self, frame: u64) -> usize {
        (frame % self.frames_in_flight.max(1) as u64) as usize
    }

    /// Address of the top-level structure recorded for `frame`, valid until the same
    /// slot is recorded again.
    pub fn tlas_address(&self, frame: u64) -> Option<vk::DeviceAddress> {
        self.ring.device_address(self.slot_index(frame))
    }

    pub fn bottom_level(&self) -> &BottomLevelSet<D> {
        &self.bottom_level
    }

    pub fn top_level(&self) -> &TopLevelRing<D> {
        &self.ring
    }

    /// Only valid once the device is idle.
    pub fn destroy(self, device: &D) {
        self.ring.destroy(device);
        self.bottom_level.destroy(device);
        tracing::debug!("Scene acceleration structures destroyed");
    }
}
