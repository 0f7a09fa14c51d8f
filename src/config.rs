use ash::vk;

/// How frame slot buffers grow when they are too small for the current scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrowthPolicy {
    /// Allocate exactly what the current frame needs.
    Exact,
    /// Round up to the next power of two, never below `min_instance_capacity` instances.
    #[default]
    PowerOfTwo,
}

#[derive(Debug, Clone)]
pub struct AccelConfig {
    /// Number of frame slots. The surrounding engine must never have more frames in flight.
    pub frames_in_flight: usize,
    pub growth: GrowthPolicy,
    pub min_instance_capacity: usize,
    pub blas_flags: vk::BuildAccelerationStructureFlagsKHR,
    pub tlas_flags: vk::BuildAccelerationStructureFlagsKHR,
    pub instance_mask: u8,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            growth: GrowthPolicy::PowerOfTwo,
            min_instance_capacity: 8,
            blas_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION,
            tlas_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            instance_mask: 0xFF,
        }
    }
}

impl AccelConfig {
    pub fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        assert!(frames_in_flight > 0, "At least one frame must be in flight");
        self.frames_in_flight = frames_in_flight;
        self
    }
    pub fn with_growth(mut self, growth: GrowthPolicy) -> Self {
        self.growth = growth;
        self
    }
    pub fn with_min_instance_capacity(mut self, min_instance_capacity: usize) -> Self {
        self.min_instance_capacity = min_instance_capacity;
        self
    }
    pub fn with_instance_mask(mut self, mask: u8) -> Self {
        self.instance_mask = mask;
        self
    }

    /// Number of instances a slot buffer should hold when `required` instances are needed.
    pub fn instance_capacity(&self, required: usize) -> usize {
        match self.growth {
            GrowthPolicy::Exact => required.max(1),
            GrowthPolicy::PowerOfTwo => required
                .next_power_of_two()
                .max(self.min_instance_capacity.max(1)),
        }
    }

    /// Byte size to allocate for a structure or scratch buffer needing `required` bytes.
    pub fn byte_capacity(&self, required: vk::DeviceSize) -> vk::DeviceSize {
        match self.growth {
            GrowthPolicy::Exact => required.max(1),
            GrowthPolicy::PowerOfTwo => required.max(1).next_power_of_two(),
        }
    }
}
