//! Bottom-level acceleration structures, built once per scene load.
//!
//! Structures are first built into conservatively sized buffers with compaction
//! enabled. The true compacted sizes are then read back from a query pool, and each
//! structure is copied into a tightly sized buffer. Only the compacted copies survive.
//!
//! ```text
//! begin() --> Building --poll()/wait()--> SizeQueried --compact()--> Compacting --poll()/wait()--> Ready
//! ```
use ash::vk;
use itertools::Itertools;

use crate::{
    access::Access,
    config::AccelConfig,
    device::{AccelDevice, AccelStructLike, BufferInfo, BufferLike, BuildCommand},
    geometry::{BuildDescription, BuildGeometry},
    scene::{GeometrySource, Model, SceneObject},
    transform::{pack_transforms, TransformBuffer},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlasStage {
    /// Uncompacted builds and the compacted size query were submitted.
    Building,
    /// Compacted sizes were read back.
    SizeQueried,
    /// Copies into the compacted buffers were submitted.
    Compacting,
    /// Compaction finished and every intermediate resource was released.
    Ready,
}

/// A bottom-level structure together with the buffer backing it.
pub struct Blas<D: AccelDevice> {
    accel_struct: D::AccelStruct,
    buffer: D::Buffer,
}

impl<D: AccelDevice> Blas<D> {
    fn new(device: &D, size: vk::DeviceSize, name: &str) -> Result<Self> {
        let buffer = device.create_buffer(&BufferInfo::storage(size, name))?;
        let accel_struct = match device
            .create_accel_struct(&buffer, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
        {
            Ok(accel_struct) => accel_struct,
            Err(err) => {
                device.destroy_buffer(buffer);
                return Err(err);
            }
        };
        device.set_accel_struct_name(&accel_struct, name);
        Ok(Self {
            accel_struct,
            buffer,
        })
    }

    pub fn accel_struct(&self) -> &D::AccelStruct {
        &self.accel_struct
    }

    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.accel_struct.device_address()
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    fn destroy(self, device: &D) {
        device.destroy_accel_struct(self.accel_struct);
        device.destroy_buffer(self.buffer);
    }
}

struct PendingBlas<D: AccelDevice> {
    uncompacted: Blas<D>,
    scratch: D::Buffer,
    compacted_size: vk::DeviceSize,
    compacted: Option<Blas<D>>,
}

impl<D: AccelDevice> PendingBlas<D> {
    fn destroy_intermediates(self, device: &D) -> Option<Blas<D>> {
        self.uncompacted.destroy(device);
        device.destroy_buffer(self.scratch);
        self.compacted
    }
}

/// A batch of bottom-level structures moving through build and compaction.
pub struct BottomLevelBuild<D: AccelDevice> {
    stage: BlasStage,
    pending: Vec<PendingBlas<D>>,
    transforms: Option<TransformBuffer<D>>,
    query_pool: Option<D::QueryPool>,
    submission: Option<D::Submission>,
    ready: Vec<Blas<D>>,
}

impl<D: AccelDevice> BottomLevelBuild<D> {
    /// Records and submits one uncompacted build per scene object, followed by a query
    /// of every structure's compacted size. Does not wait for the GPU.
    pub fn begin<G: GeometrySource>(
        device: &D,
        source: &G,
        objects: &[SceneObject],
        config: &AccelConfig,
    ) -> Result<Self> {
        let mut build = Self {
            stage: BlasStage::Building,
            pending: Vec::with_capacity(objects.len()),
            transforms: None,
            query_pool: None,
            submission: None,
            ready: Vec::new(),
        };
        if objects.is_empty() {
            build.stage = BlasStage::Ready;
            return Ok(build);
        }
        let mut commands = match device.begin_commands() {
            Ok(commands) => commands,
            Err(err) => {
                build.abort(device);
                return Err(err);
            }
        };
        let submitted = match build.record_builds(device, &mut commands, source, objects, config) {
            Ok(()) => device.submit(commands),
            Err(err) => {
                device.discard_commands(commands);
                Err(err)
            }
        };
        match submitted {
            Ok(submission) => build.submission = Some(submission),
            Err(err) => {
                build.abort(device);
                return Err(err);
            }
        }
        Ok(build)
    }

    fn record_builds<G: GeometrySource>(
        &mut self,
        device: &D,
        commands: &mut D::CommandBuffer,
        source: &G,
        objects: &[SceneObject],
        config: &AccelConfig,
    ) -> Result<()> {
        let transforms = pack_transforms(source, objects)?;
        let transforms = self
            .transforms
            .insert(TransformBuffer::upload(device, commands, &transforms)?);

        let mut descriptions = Vec::with_capacity(objects.len());
        let mut first_transform = 0;
        for object in objects {
            let model = source.model(object.model);
            descriptions.push(describe(
                source,
                model,
                |mesh| transforms.address(first_transform + mesh),
                config.blas_flags,
            ));
            first_transform += model.meshes.len();
        }
        tracing::info!(
            objects = objects.len(),
            geometries = first_transform,
            "Building bottom-level acceleration structures"
        );

        let scratch_alignment = device.scratch_offset_alignment();
        for (index, description) in descriptions.iter().enumerate() {
            let sizes = device.build_sizes(description)?;
            let uncompacted = Blas::new(
                device,
                sizes.acceleration_structure_size,
                &format!("BLAS/{}", index),
            )?;
            let scratch = match device.create_buffer(&BufferInfo::scratch(
                sizes.build_scratch_size,
                scratch_alignment,
                &format!("BLASScratch/{}", index),
            )) {
                Ok(scratch) => scratch,
                Err(err) => {
                    uncompacted.destroy(device);
                    return Err(err);
                }
            };
            self.pending.push(PendingBlas {
                uncompacted,
                scratch,
                compacted_size: 0,
                compacted: None,
            });
        }

        let builds = descriptions
            .iter()
            .zip_eq(self.pending.iter())
            .map(|(description, pending)| BuildCommand {
                description,
                dst: pending.uncompacted.accel_struct(),
                scratch_address: pending.scratch.device_address(),
            })
            .collect::<Vec<_>>();
        device.cmd_build_accel_structs(commands, &builds);
        device.cmd_barrier(
            commands,
            Access::ACCEL_STRUCT_BUILD_WRITE,
            Access::ACCEL_STRUCT_BUILD_READ,
        );

        let query_pool = self
            .query_pool
            .insert(device.create_query_pool(self.pending.len() as u32)?);
        device.cmd_reset_query_pool(commands, query_pool);
        let accel_structs = self
            .pending
            .iter()
            .map(|p| p.uncompacted.accel_struct())
            .collect::<Vec<_>>();
        device.cmd_write_compacted_sizes(commands, &accel_structs, query_pool);
        Ok(())
    }

    pub fn stage(&self) -> BlasStage {
        self.stage
    }

    pub fn len(&self) -> usize {
        self.pending.len().max(self.ready.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address of the `index`th structure. Only available once the batch is `Ready`,
    /// since before that the address still points to the uncompacted copy.
    pub fn device_address(&self, index: usize) -> Result<vk::DeviceAddress> {
        if self.stage != BlasStage::Ready {
            return Err(Error::NotReady { stage: self.stage });
        }
        self.ready
            .get(index)
            .map(Blas::device_address)
            .ok_or(Error::NotReady { stage: self.stage })
    }

    /// Advance without blocking if the outstanding GPU work has completed.
    pub fn poll(&mut self, device: &D) -> Result<BlasStage> {
        let complete = match self.submission.as_ref() {
            Some(submission) => device.is_complete(submission)?,
            None => false,
        };
        if complete {
            self.advance(device)?;
        }
        Ok(self.stage)
    }

    /// Block until the outstanding GPU work has completed, then advance.
    pub fn wait(&mut self, device: &D) -> Result<BlasStage> {
        if self.submission.is_some() {
            self.advance(device)?;
        }
        Ok(self.stage)
    }

    fn advance(&mut self, device: &D) -> Result<()> {
        if let Some(submission) = self.submission.take() {
            device.wait(submission)?;
        }
        match self.stage {
            BlasStage::Building => self.read_compacted_sizes(device),
            BlasStage::Compacting => {
                self.release_intermediates(device);
                Ok(())
            }
            BlasStage::SizeQueried | BlasStage::Ready => Ok(()),
        }
    }

    fn read_compacted_sizes(&mut self, device: &D) -> Result<()> {
        let Some(query_pool) = self.query_pool.as_ref() else {
            return Err(Error::QueryUnavailable);
        };
        let mut sizes = vec![0_u64; self.pending.len()];
        if !device.query_results(query_pool, &mut sizes)? {
            return Err(Error::QueryUnavailable);
        }
        for (pending, size) in self.pending.iter_mut().zip_eq(sizes) {
            pending.compacted_size = size;
        }
        self.stage = BlasStage::SizeQueried;
        Ok(())
    }

    /// Records and submits copies of every structure into a buffer of its compacted size.
    pub fn compact(&mut self, device: &D) -> Result<()> {
        if self.stage != BlasStage::SizeQueried {
            return Err(Error::InvalidStage {
                expected: BlasStage::SizeQueried,
                found: self.stage,
            });
        }
        let mut commands = device.begin_commands()?;
        if let Err(err) = self.record_compaction(device, &mut commands) {
            device.discard_commands(commands);
            return Err(err);
        }
        self.submission = Some(device.submit(commands)?);
        self.stage = BlasStage::Compacting;
        Ok(())
    }

    /// Compacted structures created here are owned by `pending` even if recording fails.
    fn record_compaction(&mut self, device: &D, commands: &mut D::CommandBuffer) -> Result<()> {
        for (index, pending) in self.pending.iter_mut().enumerate() {
            let compacted = Blas::new(
                device,
                pending.compacted_size,
                &format!("BLAS/Compacted/{}", index),
            )?;
            device.cmd_copy_compact(
                commands,
                pending.uncompacted.accel_struct(),
                compacted.accel_struct(),
            );
            tracing::debug!(
                index,
                from = pending.uncompacted.size(),
                to = compacted.size(),
                "Compacting BLAS"
            );
            pending.compacted = Some(compacted);
        }
        Ok(())
    }

    fn release_intermediates(&mut self, device: &D) {
        let mut uncompacted_size = 0;
        for pending in self.pending.drain(..) {
            uncompacted_size += pending.uncompacted.size();
            if let Some(compacted) = pending.destroy_intermediates(device) {
                self.ready.push(compacted);
            }
        }
        if let Some(transforms) = self.transforms.take() {
            transforms.destroy(device);
        }
        if let Some(query_pool) = self.query_pool.take() {
            device.destroy_query_pool(query_pool);
        }
        tracing::info!(
            count = self.ready.len(),
            uncompacted_size,
            compacted_size = self.ready.iter().map(Blas::size).sum::<vk::DeviceSize>(),
            "Bottom-level acceleration structures ready"
        );
        self.stage = BlasStage::Ready;
    }

    /// Hands over the compacted structures, or returns the batch if it is not `Ready` yet.
    pub fn finish(self) -> std::result::Result<BottomLevelSet<D>, Self> {
        if self.stage != BlasStage::Ready {
            return Err(self);
        }
        Ok(BottomLevelSet::new(self.ready))
    }

    /// Release every resource of the batch, waiting for outstanding GPU work first.
    pub fn abort(mut self, device: &D) {
        if let Some(submission) = self.submission.take() {
            if let Err(err) = device.wait(submission) {
                tracing::error!(?err, "Failed to wait for bottom-level build while aborting");
            }
        }
        for pending in self.pending.drain(..) {
            if let Some(compacted) = pending.destroy_intermediates(device) {
                compacted.destroy(device);
            }
        }
        for blas in self.ready.drain(..) {
            blas.destroy(device);
        }
        if let Some(transforms) = self.transforms.take() {
            transforms.destroy(device);
        }
        if let Some(query_pool) = self.query_pool.take() {
            device.destroy_query_pool(query_pool);
        }
    }
}

/// One multi-geometry description per object, one triangle geometry per mesh.
fn describe<G: GeometrySource>(
    source: &G,
    model: &Model,
    transform_address: impl Fn(usize) -> vk::DeviceAddress,
    flags: vk::BuildAccelerationStructureFlagsKHR,
) -> BuildDescription {
    let positions = source.positions();
    let indices = source.indices();
    let mut description = BuildDescription::bottom_level(flags);
    description
        .geometries
        .extend(model.meshes.iter().enumerate().map(|(i, mesh)| {
            BuildGeometry::Triangles {
                vertex_format: positions.format,
                vertex_data: positions.device_address
                    + mesh.positions.offset as vk::DeviceAddress * positions.stride,
                vertex_stride: positions.stride,
                max_vertex: mesh.positions.count.saturating_sub(1),
                index_type: indices.index_type,
                index_data: indices.device_address
                    + mesh.indices.offset as vk::DeviceAddress * indices.index_size(),
                transform_data: transform_address(i),
                flags: mesh.geometry_flags(),
                primitive_count: mesh.triangle_count(),
            }
        }));
    description
}

/// Build and compact bottom-level structures for `objects`, blocking until done.
pub fn build_bottom_level<D: AccelDevice, G: GeometrySource>(
    device: &D,
    source: &G,
    objects: &[SceneObject],
    config: &AccelConfig,
) -> Result<BottomLevelSet<D>> {
    let mut build = BottomLevelBuild::begin(device, source, objects, config)?;
    if build.stage() == BlasStage::Ready {
        return build.finish().map_err(|build| Error::NotReady { stage: build.stage() });
    }
    let result = build
        .wait(device)
        .and_then(|_| build.compact(device))
        .and_then(|_| build.wait(device));
    if let Err(err) = result {
        build.abort(device);
        return Err(err);
    }
    match build.finish() {
        Ok(set) => Ok(set),
        Err(build) => {
            let stage = build.stage();
            build.abort(device);
            Err(Error::NotReady { stage })
        }
    }
}

/// The compacted bottom-level structures of a scene, indexed like its scene objects.
/// Immutable once built.
pub struct BottomLevelSet<D: AccelDevice> {
    structures: Vec<Blas<D>>,
    addresses: Vec<vk::DeviceAddress>,
}

impl<D: AccelDevice> Default for BottomLevelSet<D> {
    fn default() -> Self {
        Self {
            structures: Vec::new(),
            addresses: Vec::new(),
        }
    }
}

impl<D: AccelDevice> BottomLevelSet<D> {
    fn new(structures: Vec<Blas<D>>) -> Self {
        let addresses = structures.iter().map(Blas::device_address).collect();
        Self {
            structures,
            addresses,
        }
    }

    pub fn len(&self) -> usize {
        self.structures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structures.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Blas<D>> {
        self.structures.get(index)
    }

    pub fn device_address(&self, index: usize) -> Option<vk::DeviceAddress> {
        self.addresses.get(index).copied()
    }

    pub fn addresses(&self) -> &[vk::DeviceAddress] {
        &self.addresses
    }

    pub fn iter(&self) -> impl Iterator<Item = &Blas<D>> {
        self.structures.iter()
    }

    /// Only valid once no frame in flight references the structures.
    pub fn destroy(self, device: &D) {
        for blas in self.structures {
            blas.destroy(device);
        }
    }
}
