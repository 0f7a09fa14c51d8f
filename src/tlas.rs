//! Per-frame top-level structure rebuilds on a ring of frame slots.
//!
//! Each slot owns its own instance, structure and scratch buffers. Buffers only ever
//! grow; a replaced buffer is parked in the slot's [`DeletionQueue`] and released when
//! the slot is recorded again, by which time the frame that used it has retired.
use ash::vk;

use crate::{
    access::Access,
    blas::BottomLevelSet,
    config::AccelConfig,
    device::{AccelDevice, AccelStructLike, BufferInfo, BufferLike, BuildCommand},
    dispose::DeletionQueue,
    geometry::BuildDescription,
    instance::{build_instances, InstanceRecord},
    scene::{GeometrySource, SceneObject},
    Error, Result,
};

struct TopLevel<D: AccelDevice> {
    accel_struct: D::AccelStruct,
    buffer: D::Buffer,
}

impl<D: AccelDevice> TopLevel<D> {
    fn new(device: &D, slot: usize, size: vk::DeviceSize) -> Result<Self> {
        let buffer =
            device.create_buffer(&BufferInfo::storage(size, &format!("TLASBuffer/{}", slot)))?;
        let accel_struct =
            match device.create_accel_struct(&buffer, vk::AccelerationStructureTypeKHR::TOP_LEVEL) {
                Ok(accel_struct) => accel_struct,
                Err(err) => {
                    device.destroy_buffer(buffer);
                    return Err(err);
                }
            };
        device.set_accel_struct_name(&accel_struct, &format!("TLAS/{}", slot));
        Ok(Self {
            accel_struct,
            buffer,
        })
    }
}

/// Resources owned by one frame in flight.
pub struct FrameSlot<D: AccelDevice> {
    instances: Option<D::Buffer>,
    instance_capacity: usize,
    structure: Option<TopLevel<D>>,
    scratch: Option<D::Buffer>,
    retired: DeletionQueue<D>,
    address: Option<vk::DeviceAddress>,
    last_frame: Option<u64>,
}

impl<D: AccelDevice> Default for FrameSlot<D> {
    fn default() -> Self {
        Self {
            instances: None,
            instance_capacity: 0,
            structure: None,
            scratch: None,
            retired: DeletionQueue::default(),
            address: None,
            last_frame: None,
        }
    }
}

impl<D: AccelDevice + 'static> FrameSlot<D> {
    /// Address of the structure built the last time this slot was recorded.
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.address
    }
    pub fn last_frame(&self) -> Option<u64> {
        self.last_frame
    }
    /// Number of instance records the instance buffer can hold.
    pub fn instance_capacity(&self) -> usize {
        self.instance_capacity
    }
    pub fn instance_buffer(&self) -> Option<&D::Buffer> {
        self.instances.as_ref()
    }
    pub fn accel_struct(&self) -> Option<&D::AccelStruct> {
        self.structure.as_ref().map(|s| &s.accel_struct)
    }
    pub fn structure_buffer(&self) -> Option<&D::Buffer> {
        self.structure.as_ref().map(|s| &s.buffer)
    }
    pub fn scratch_buffer(&self) -> Option<&D::Buffer> {
        self.scratch.as_ref()
    }
    /// Number of superseded resources waiting for this slot to come around again.
    pub fn pending_releases(&self) -> usize {
        self.retired.len()
    }

    fn destroy(mut self, device: &D) {
        self.retired.drain(device);
        if let Some(structure) = self.structure.take() {
            device.destroy_accel_struct(structure.accel_struct);
            device.destroy_buffer(structure.buffer);
        }
        if let Some(instances) = self.instances.take() {
            device.destroy_buffer(instances);
        }
        if let Some(scratch) = self.scratch.take() {
            device.destroy_buffer(scratch);
        }
    }
}

/// The top-level structure of every frame in flight.
pub struct TopLevelRing<D: AccelDevice> {
    slots: Vec<FrameSlot<D>>,
    config: AccelConfig,
}

impl<D: AccelDevice + 'static> TopLevelRing<D> {
    /// One empty slot per frame in flight. Nothing is allocated until a slot is built.
    pub fn new(config: AccelConfig) -> Self {
        let slots = (0..config.frames_in_flight)
            .map(|_| FrameSlot::default())
            .collect();
        Self { slots, config }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, slot: usize) -> Option<&FrameSlot<D>> {
        self.slots.get(slot)
    }

    pub fn device_address(&self, slot: usize) -> Option<vk::DeviceAddress> {
        self.slots.get(slot).and_then(FrameSlot::device_address)
    }

    /// Record a full rebuild of `slot`'s top-level structure for frame `frame` into
    /// `commands`, one instance per scene object. `blas` is indexed like `objects`, which
    /// may be a prefix of the objects it was built for.
    ///
    /// Does not wait on the GPU. The caller submits `commands` with the rest of the frame
    /// and must not record `slot` again before that frame has retired.
    #[allow(clippy::too_many_arguments)]
    pub fn build<G: GeometrySource>(
        &mut self,
        device: &D,
        commands: &mut D::CommandBuffer,
        slot: usize,
        frame: u64,
        source: &G,
        objects: &[SceneObject],
        blas: &BottomLevelSet<D>,
    ) -> Result<vk::DeviceAddress> {
        let frames_in_flight = self.slots.len();
        let config = &self.config;
        let state = self.slots.get_mut(slot).ok_or(Error::InvalidFrameSlot {
            slot,
            frames_in_flight,
        })?;

        let flushed = state
            .retired
            .flush(device, frame, frames_in_flight as u64);
        if flushed > 0 {
            tracing::trace!(slot, count = flushed, "Flushed deferred releases");
        }

        let instances = build_instances(source, objects, blas.addresses(), config.instance_mask);
        let instance_buffer = match &mut state.instances {
            Some(buffer) if state.instance_capacity >= instances.len() => buffer,
            current => {
                let capacity = config.instance_capacity(instances.len());
                let buffer = device.create_buffer(&BufferInfo::build_input(
                    capacity as vk::DeviceSize * InstanceRecord::SIZE,
                    &format!("TLASInstanceBuffer/{}", slot),
                ))?;
                tracing::info!(
                    slot,
                    kind = "instances",
                    from = state.instance_capacity,
                    to = capacity,
                    "Growing frame slot buffer"
                );
                if let Some(old) = current.take() {
                    state.retired.retire_buffer(frame, old);
                }
                state.instance_capacity = capacity;
                current.insert(buffer)
            }
        };
        device.write_buffer(instance_buffer, bytemuck::cast_slice(&instances))?;
        device.cmd_barrier(commands, Access::HOST_WRITE, Access::ACCEL_STRUCT_BUILD_READ);

        let description = BuildDescription::top_level(
            config.tlas_flags,
            instance_buffer.device_address(),
            instances.len() as u32,
        );
        let sizes = device.build_sizes(&description)?;

        let structure = match &mut state.structure {
            Some(structure) if structure.buffer.size() >= sizes.acceleration_structure_size => {
                structure
            }
            current => {
                let size = config.byte_capacity(sizes.acceleration_structure_size);
                let structure = TopLevel::new(device, slot, size)?;
                tracing::info!(
                    slot,
                    kind = "structure",
                    from = current.as_ref().map_or(0, |s| s.buffer.size()),
                    to = size,
                    "Growing frame slot buffer"
                );
                if let Some(old) = current.take() {
                    state.retired.retire_accel_struct(frame, old.accel_struct);
                    state.retired.retire_buffer(frame, old.buffer);
                }
                current.insert(structure)
            }
        };

        let scratch = match &mut state.scratch {
            Some(scratch) if scratch.size() >= sizes.build_scratch_size => scratch,
            current => {
                let size = config.byte_capacity(sizes.build_scratch_size);
                let scratch = device.create_buffer(&BufferInfo::scratch(
                    size,
                    device.scratch_offset_alignment(),
                    &format!("TLASScratchBuffer/{}", slot),
                ))?;
                tracing::info!(
                    slot,
                    kind = "scratch",
                    from = current.as_ref().map_or(0, |s| s.size()),
                    to = size,
                    "Growing frame slot buffer"
                );
                if let Some(old) = current.take() {
                    state.retired.retire_buffer(frame, old);
                }
                current.insert(scratch)
            }
        };

        device.cmd_build_accel_structs(
            commands,
            &[BuildCommand {
                description: &description,
                dst: &structure.accel_struct,
                scratch_address: scratch.device_address(),
            }],
        );

        let address = structure.accel_struct.device_address();
        state.address = Some(address);
        state.last_frame = Some(frame);
        Ok(address)
    }

    /// Release every slot, including resources still waiting in deferred queues.
    /// Only valid once the device is idle.
    pub fn destroy(self, device: &D) {
        for slot in self.slots {
            slot.destroy(device);
        }
    }
}
