//! An in-memory [`AccelDevice`] recording everything the builders ask of the GPU.
use std::{
    cell::{Ref, RefCell},
    collections::{BTreeMap, BTreeSet},
};

use ash::vk;
use bevy::math::Mat4;

use crate::{
    access::Access,
    device::{AccelDevice, AccelStructLike, BufferInfo, BufferLike, BuildCommand, BuildSizes},
    geometry::BuildDescription,
    scene::{
        GeometryRange, GeometrySource, IndexStream, MeshGeometry, Model, ModelId, PositionStream,
        SceneObject,
    },
    Error, Result,
};

#[derive(Debug)]
pub struct MockBuffer {
    pub id: u64,
    pub size: vk::DeviceSize,
    pub address: vk::DeviceAddress,
}
impl BufferLike for MockBuffer {
    fn size(&self) -> vk::DeviceSize {
        self.size
    }
    fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }
}

#[derive(Debug)]
pub struct MockAccelStruct {
    pub id: u64,
    pub buffer: u64,
    pub size: vk::DeviceSize,
    pub address: vk::DeviceAddress,
    pub ty: vk::AccelerationStructureTypeKHR,
}
impl AccelStructLike for MockAccelStruct {
    fn size(&self) -> vk::DeviceSize {
        self.size
    }
    fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }
}

#[derive(Debug)]
pub struct MockQueryPool {
    pub id: u64,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockCommand {
    CopyBuffer {
        src: u64,
        dst: u64,
        size: vk::DeviceSize,
    },
    Barrier {
        src: Access,
        dst: Access,
    },
    Build {
        dst: u64,
        scratch_address: vk::DeviceAddress,
        description: BuildDescription,
    },
    ResetQueryPool {
        pool: u64,
    },
    WriteCompactedSizes {
        pool: u64,
        accel_structs: Vec<(u64, vk::DeviceSize)>,
    },
    CopyCompact {
        src: u64,
        dst: u64,
    },
}

#[derive(Debug, Default)]
pub struct MockCommandBuffer {
    pub commands: Vec<MockCommand>,
}

impl MockCommandBuffer {
    pub fn builds(&self) -> impl Iterator<Item = &BuildDescription> {
        self.commands.iter().filter_map(|c| match c {
            MockCommand::Build { description, .. } => Some(description),
            _ => None,
        })
    }
}

#[derive(Debug)]
pub struct MockSubmission {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    CreateBuffer { id: u64, size: vk::DeviceSize },
    DestroyBuffer(u64),
    CreateAccelStruct { id: u64, size: vk::DeviceSize },
    DestroyAccelStruct(u64),
    CreateQueryPool { id: u64, count: u32 },
    DestroyQueryPool(u64),
    Submit { id: u64, commands: Vec<MockCommand> },
    Wait(u64),
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    events: Vec<MockEvent>,
    live_buffers: BTreeMap<u64, vk::DeviceSize>,
    live_accel_structs: BTreeSet<u64>,
    live_query_pools: BTreeSet<u64>,
    contents: BTreeMap<u64, Vec<u8>>,
    names: BTreeMap<u64, String>,
    query_results: BTreeMap<u64, Vec<Option<u64>>>,
    pending: Vec<(u64, Vec<MockCommand>)>,
    executed: BTreeSet<u64>,
    busy: bool,
    fail_allocations: bool,
    /// Command buffers begun but neither submitted nor discarded.
    recording: usize,
}

impl MockState {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
    fn execute(&mut self) {
        for (id, commands) in std::mem::take(&mut self.pending) {
            for command in commands {
                if let MockCommand::WriteCompactedSizes {
                    pool,
                    accel_structs,
                } = command
                {
                    let results = self.query_results.entry(pool).or_default();
                    results.clear();
                    results.extend(
                        accel_structs
                            .iter()
                            .map(|(_, size)| Some(MockDevice::compacted_size(*size))),
                    );
                }
            }
            self.executed.insert(id);
        }
    }
}

/// Device addresses are spaced far enough apart that no two resources overlap.
const ADDRESS_SPACING: vk::DeviceAddress = 1 << 32;

pub struct MockDevice {
    state: RefCell<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(MockState::default()),
        }
    }

    /// Conservative size estimate reported for `primitives` primitives.
    pub fn conservative_size(primitives: u64) -> vk::DeviceSize {
        1024 + 256 * primitives
    }
    pub fn scratch_size(primitives: u64) -> vk::DeviceSize {
        512 + 128 * primitives
    }
    pub fn compacted_size(size: vk::DeviceSize) -> vk::DeviceSize {
        (size * 6 / 10).max(256)
    }

    pub fn buffer(&self, size: vk::DeviceSize) -> MockBuffer {
        self.create_buffer(&BufferInfo::storage(size, "test"))
            .unwrap()
    }

    /// While busy, submitted work does not complete until waited on.
    pub fn set_busy(&self, busy: bool) {
        let mut state = self.state.borrow_mut();
        state.busy = busy;
        if !busy {
            state.execute();
        }
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.state.borrow_mut().fail_allocations = fail;
    }

    pub fn events(&self) -> Ref<'_, Vec<MockEvent>> {
        Ref::map(self.state.borrow(), |s| &s.events)
    }
    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }
    pub fn live_buffers(&self) -> usize {
        self.state.borrow().live_buffers.len()
    }
    pub fn live_accel_structs(&self) -> usize {
        self.state.borrow().live_accel_structs.len()
    }
    pub fn live_query_pools(&self) -> usize {
        self.state.borrow().live_query_pools.len()
    }
    pub fn live_command_buffers(&self) -> usize {
        self.state.borrow().recording
    }
    pub fn is_live_buffer(&self, id: u64) -> bool {
        self.state.borrow().live_buffers.contains_key(&id)
    }
    pub fn is_live_accel_struct(&self, id: u64) -> bool {
        self.state.borrow().live_accel_structs.contains(&id)
    }
    pub fn contents(&self, id: u64) -> Vec<u8> {
        self.state
            .borrow()
            .contents
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
    pub fn name(&self, id: u64) -> Option<String> {
        self.state.borrow().names.get(&id).cloned()
    }
    pub fn submissions(&self) -> Vec<Vec<MockCommand>> {
        self.state
            .borrow()
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Submit { commands, .. } => Some(commands.clone()),
                _ => None,
            })
            .collect()
    }
}

impl AccelDevice for MockDevice {
    type Buffer = MockBuffer;
    type AccelStruct = MockAccelStruct;
    type QueryPool = MockQueryPool;
    type CommandBuffer = MockCommandBuffer;
    type Submission = MockSubmission;

    fn create_buffer(&self, info: &BufferInfo) -> Result<MockBuffer> {
        let mut state = self.state.borrow_mut();
        if state.fail_allocations {
            return Err(Error::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        assert!(info.size > 0, "zero sized buffer {}", info.name);
        let id = state.id();
        state.live_buffers.insert(id, info.size);
        state.names.insert(id, info.name.to_string());
        state.events.push(MockEvent::CreateBuffer {
            id,
            size: info.size,
        });
        Ok(MockBuffer {
            id,
            size: info.size,
            address: id * ADDRESS_SPACING,
        })
    }

    fn write_buffer(&self, buffer: &mut MockBuffer, data: &[u8]) -> Result<()> {
        assert!(data.len() as u64 <= buffer.size, "write overflows buffer");
        let mut state = self.state.borrow_mut();
        assert!(state.live_buffers.contains_key(&buffer.id), "write to destroyed buffer");
        state.contents.insert(buffer.id, data.to_vec());
        Ok(())
    }

    fn destroy_buffer(&self, buffer: MockBuffer) {
        let mut state = self.state.borrow_mut();
        assert!(
            state.live_buffers.remove(&buffer.id).is_some(),
            "double free of buffer {}",
            buffer.id
        );
        state.events.push(MockEvent::DestroyBuffer(buffer.id));
    }

    fn scratch_offset_alignment(&self) -> vk::DeviceSize {
        128
    }

    fn build_sizes(&self, description: &BuildDescription) -> Result<BuildSizes> {
        let primitives = description.primitive_count();
        Ok(BuildSizes {
            acceleration_structure_size: Self::conservative_size(primitives),
            build_scratch_size: Self::scratch_size(primitives),
        })
    }

    fn create_accel_struct(
        &self,
        buffer: &MockBuffer,
        ty: vk::AccelerationStructureTypeKHR,
    ) -> Result<MockAccelStruct> {
        let mut state = self.state.borrow_mut();
        assert!(state.live_buffers.contains_key(&buffer.id));
        let id = state.id();
        state.live_accel_structs.insert(id);
        state.events.push(MockEvent::CreateAccelStruct {
            id,
            size: buffer.size,
        });
        Ok(MockAccelStruct {
            id,
            buffer: buffer.id,
            size: buffer.size,
            address: buffer.address,
            ty,
        })
    }

    fn destroy_accel_struct(&self, accel_struct: MockAccelStruct) {
        let mut state = self.state.borrow_mut();
        assert!(
            state.live_accel_structs.remove(&accel_struct.id),
            "double free of acceleration structure {}",
            accel_struct.id
        );
        state
            .events
            .push(MockEvent::DestroyAccelStruct(accel_struct.id));
    }

    fn create_query_pool(&self, count: u32) -> Result<MockQueryPool> {
        let mut state = self.state.borrow_mut();
        let id = state.id();
        state.live_query_pools.insert(id);
        state
            .query_results
            .insert(id, vec![None; count as usize]);
        state.events.push(MockEvent::CreateQueryPool { id, count });
        Ok(MockQueryPool { id, count })
    }

    fn query_results(&self, pool: &MockQueryPool, results: &mut [u64]) -> Result<bool> {
        let state = self.state.borrow();
        let available = &state.query_results[&pool.id];
        if available.len() < results.len() || available.iter().any(Option::is_none) {
            return Ok(false);
        }
        for (dst, src) in results.iter_mut().zip(available) {
            *dst = src.unwrap_or_default();
        }
        Ok(true)
    }

    fn destroy_query_pool(&self, pool: MockQueryPool) {
        let mut state = self.state.borrow_mut();
        assert!(state.live_query_pools.remove(&pool.id));
        state.events.push(MockEvent::DestroyQueryPool(pool.id));
    }

    fn begin_commands(&self) -> Result<MockCommandBuffer> {
        self.state.borrow_mut().recording += 1;
        Ok(MockCommandBuffer::default())
    }

    fn discard_commands(&self, _commands: MockCommandBuffer) {
        let mut state = self.state.borrow_mut();
        assert!(state.recording > 0, "discarded a command buffer twice");
        state.recording -= 1;
    }

    fn submit(&self, commands: MockCommandBuffer) -> Result<MockSubmission> {
        let mut state = self.state.borrow_mut();
        state.recording = state.recording.saturating_sub(1);
        let id = state.id();
        state.events.push(MockEvent::Submit {
            id,
            commands: commands.commands.clone(),
        });
        state.pending.push((id, commands.commands));
        if !state.busy {
            state.execute();
        }
        Ok(MockSubmission { id })
    }

    fn is_complete(&self, submission: &MockSubmission) -> Result<bool> {
        Ok(self.state.borrow().executed.contains(&submission.id))
    }

    fn wait(&self, submission: MockSubmission) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.execute();
        state.events.push(MockEvent::Wait(submission.id));
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        commands: &mut MockCommandBuffer,
        src: &MockBuffer,
        dst: &MockBuffer,
        size: vk::DeviceSize,
    ) {
        assert!(size <= src.size && size <= dst.size);
        commands.commands.push(MockCommand::CopyBuffer {
            src: src.id,
            dst: dst.id,
            size,
        });
    }

    fn cmd_barrier(&self, commands: &mut MockCommandBuffer, src: Access, dst: Access) {
        commands.commands.push(MockCommand::Barrier { src, dst });
    }

    fn cmd_build_accel_structs(
        &self,
        commands: &mut MockCommandBuffer,
        builds: &[BuildCommand<'_, Self>],
    ) {
        for build in builds {
            let required = Self::conservative_size(build.description.primitive_count());
            assert!(build.dst.size >= required, "structure buffer too small");
            assert_eq!(build.dst.ty, build.description.ty);
            commands.commands.push(MockCommand::Build {
                dst: build.dst.id,
                scratch_address: build.scratch_address,
                description: build.description.clone(),
            });
        }
    }

    fn cmd_reset_query_pool(&self, commands: &mut MockCommandBuffer, pool: &MockQueryPool) {
        commands
            .commands
            .push(MockCommand::ResetQueryPool { pool: pool.id });
    }

    fn cmd_write_compacted_sizes(
        &self,
        commands: &mut MockCommandBuffer,
        accel_structs: &[&MockAccelStruct],
        pool: &MockQueryPool,
    ) {
        assert!(accel_structs.len() as u32 <= pool.count);
        commands.commands.push(MockCommand::WriteCompactedSizes {
            pool: pool.id,
            accel_structs: accel_structs.iter().map(|a| (a.id, a.size)).collect(),
        });
    }

    fn cmd_copy_compact(
        &self,
        commands: &mut MockCommandBuffer,
        src: &MockAccelStruct,
        dst: &MockAccelStruct,
    ) {
        assert!(dst.size <= src.size);
        commands.commands.push(MockCommand::CopyCompact {
            src: src.id,
            dst: dst.id,
        });
    }

    fn set_accel_struct_name(&self, accel_struct: &MockAccelStruct, name: &str) {
        self.state
            .borrow_mut()
            .names
            .insert(accel_struct.id, name.to_string());
    }
}

/// A geometry source with made up device addresses.
#[derive(Default)]
pub struct TestScene {
    models: Vec<Model>,
}

impl TestScene {
    pub const POSITIONS: vk::DeviceAddress = 0xA000_0000_0000;
    pub const INDICES: vk::DeviceAddress = 0xB000_0000_0000;

    pub fn new() -> Self {
        Self::default()
    }

    /// A mesh of `triangles` triangles at the start of the shared streams.
    pub fn mesh(triangles: u32) -> MeshGeometry {
        MeshGeometry::new(
            GeometryRange {
                offset: 0,
                count: triangles * 3,
            },
            GeometryRange {
                offset: 0,
                count: triangles * 3,
            },
        )
    }

    pub fn add_model(&mut self, meshes: Vec<MeshGeometry>) -> ModelId {
        self.models.push(Model::new(meshes));
        ModelId(self.models.len() - 1)
    }

    pub fn add_model_with_transform(&mut self, transform: Mat4, meshes: Vec<MeshGeometry>) -> ModelId {
        self.models.push(Model { transform, meshes });
        ModelId(self.models.len() - 1)
    }

    /// One model per entry of `mesh_counts`, each with that many single triangle meshes,
    /// and one object per model.
    pub fn with_objects(mesh_counts: &[usize]) -> (Self, Vec<SceneObject>) {
        let mut scene = Self::new();
        let objects = mesh_counts
            .iter()
            .map(|&count| SceneObject::new(scene.add_model(vec![Self::mesh(1); count])))
            .collect();
        (scene, objects)
    }
}

impl GeometrySource for TestScene {
    fn positions(&self) -> PositionStream {
        PositionStream {
            device_address: Self::POSITIONS,
            stride: 12,
            format: vk::Format::R32G32B32_SFLOAT,
        }
    }
    fn indices(&self) -> IndexStream {
        IndexStream {
            device_address: Self::INDICES,
            index_type: vk::IndexType::UINT32,
        }
    }
    fn model(&self, id: ModelId) -> &Model {
        &self.models[id.0]
    }
}
