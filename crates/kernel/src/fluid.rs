//! The per-frame fluid step.
//!
//! [`FluidSystem::run`] records one tick into a command buffer:
//!
//! ```text
//! particles[read] --copy--> scratch
//! predict        particles[read].predicted = scratch.position + v * dt/2
//! assign_keys    particles[read].position.w = key(predicted)
//! sort           particles[read] by key (RadixSort, 32 passes)
//! fill           table[*] = EMPTY_CELL
//! build_lookup   table[key_i] = i   where key_i starts a run
//! density        density[i] from the 27 neighbouring cells
//! integrate      particles[write] = step(particles[read], density, table)
//! toggle         read <-> write
//! ```
//!
//! Every stage boundary carries an explicit barrier; nothing relies on
//! implicit ordering between dispatches.

use crate::config::FluidConfig;
use crate::error::{KernelError, Result};
use crate::gpu::{
    dispatch_groups, AccessFlags, BindPoint, BindingBuilder, BindingKind, BindingSet,
    BufferBarrier, BufferDesc, BufferHandle, BufferUsage, CommandBuffer, CommandBufferState,
    CommandPool, ComputeProgram, DispatchParams, GpuDevice, KernelDesc, KernelHandle,
    PipelineHandle, PipelineStages, ResourceBinding, SimulationParams,
};
use crate::particle::{ParticleRecord, ParticleStore, PingPong};
use crate::sort::{RadixSort, RecordLayout};

/// Lookup-table value of a key with no particles.
pub const EMPTY_CELL: u32 = u32::MAX;

const READ_ONLY: BindingKind = BindingKind::Storage { read_only: true };
const READ_WRITE: BindingKind = BindingKind::Storage { read_only: false };

#[derive(Debug)]
struct FluidKernels {
    predict: KernelHandle,
    assign_keys: KernelHandle,
    build_lookup: KernelHandle,
    density: KernelHandle,
    integrate: KernelHandle,
}

#[derive(Debug)]
struct FluidBindings {
    params: ResourceBinding,
    /// Read-only particle view, also visible to the vertex stage.
    particles_ro: ResourceBinding,
    particles_rw: ResourceBinding,
    scratch: ResourceBinding,
    lookup_ro: ResourceBinding,
    lookup_rw: ResourceBinding,
    density_ro: ResourceBinding,
    density_rw: ResourceBinding,
}

/// Host copy of the fluid state, for diagnostics and tests.
#[derive(Debug, Clone, Default)]
pub struct FluidSnapshot {
    /// Current read buffer, in sorted order.
    pub particles: Vec<ParticleRecord>,
    /// Density per sorted particle.
    pub density: Vec<f32>,
    /// Lookup table, `EMPTY_CELL` where a key has no particles.
    pub lookup: Vec<u32>,
}

/// GPU-resident SPH fluid.
#[derive(Debug)]
pub struct FluidSystem {
    config: FluidConfig,
    store: ParticleStore,
    scratch: BufferHandle,
    lookup: BufferHandle,
    density: BufferHandle,
    params: BufferHandle,
    sort: RadixSort,
    bindings: FluidBindings,
    kernels: FluidKernels,
    groups: [u32; 3],
    ticks: u64,
}

impl FluidSystem {
    /// Allocate every buffer, upload the simulation uniform and build all
    /// binding sets and kernels.
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        builder: &mut BindingBuilder,
        config: FluidConfig,
    ) -> Result<Self> {
        config.validate().map_err(KernelError::InvalidConfig)?;
        let n = config.particle_count;
        let groups = dispatch_groups(n, device.local_size());

        let store = ParticleStore::new(device, n)?;
        let storage = BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
        let scratch = device.create_buffer(&BufferDesc {
            label: "position_scratch",
            size: n as u64 * ParticleRecord::SIZE as u64,
            usage: storage,
        })?;
        let lookup = device.create_buffer(&BufferDesc {
            label: "spatial_lookup",
            size: config.table_size as u64 * 4,
            usage: storage,
        })?;
        let density = device.create_buffer(&BufferDesc {
            label: "density",
            size: n as u64 * 4,
            usage: storage,
        })?;
        let params = device.create_buffer(&BufferDesc {
            label: "simulation_params",
            size: std::mem::size_of::<SimulationParams>() as u64,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
        })?;
        device.write_buffer(params, 0, bytemuck::bytes_of(&SimulationParams::from_config(&config)))?;

        let compute_vertex = PipelineStages::COMPUTE | PipelineStages::VERTEX;
        let mut particles_ro = Vec::with_capacity(2);
        let mut particles_rw = Vec::with_capacity(2);
        for side in 0..2 {
            builder.clear();
            builder.bind_buffer(0, compute_vertex, READ_ONLY, store.buffer(side));
            particles_ro.push(builder.build()?.0);
            particles_rw.push(builder.single(READ_WRITE, store.buffer(side))?);
        }
        let per_frame = |sets: Vec<BindingSet>| -> Result<ResourceBinding> {
            let sets: [BindingSet; 2] = sets
                .try_into()
                .map_err(|_| KernelError::Binding("expected one set per side".into()))?;
            Ok(ResourceBinding::PerFrame(sets))
        };
        let bindings = FluidBindings {
            params: ResourceBinding::Static(builder.single(BindingKind::Uniform, params)?),
            particles_ro: per_frame(particles_ro)?,
            particles_rw: per_frame(particles_rw)?,
            scratch: ResourceBinding::Static(builder.single(READ_ONLY, scratch)?),
            lookup_ro: ResourceBinding::Static(builder.single(READ_ONLY, lookup)?),
            lookup_rw: ResourceBinding::Static(builder.single(READ_WRITE, lookup)?),
            density_ro: ResourceBinding::Static(builder.single(READ_ONLY, density)?),
            density_rw: ResourceBinding::Static(builder.single(READ_WRITE, density)?),
        };

        let mut sort = RadixSort::new(device, n, RecordLayout::PARTICLE)?;
        sort.prepare(device, builder, bindings.particles_rw.layout(), groups)?;

        let b = &bindings;
        let mut kernel = |label: &str,
                          program: ComputeProgram,
                          sets: &[&BindingSet]|
         -> Result<KernelHandle> {
            let set_layouts = builder.layouts_of(sets)?;
            device.create_kernel(&KernelDesc { label, program, set_layouts })
        };
        let kernels = FluidKernels {
            predict: kernel(
                "fluid_predict",
                ComputeProgram::Predict,
                &[b.params.set(0), b.particles_rw.set(0), b.scratch.set(0)],
            )?,
            assign_keys: kernel(
                "fluid_assign_keys",
                ComputeProgram::AssignKeys,
                &[b.params.set(0), b.particles_rw.set(0)],
            )?,
            build_lookup: kernel(
                "fluid_build_lookup",
                ComputeProgram::BuildLookup,
                &[b.params.set(0), b.particles_ro.set(0), b.lookup_rw.set(0)],
            )?,
            density: kernel(
                "fluid_density",
                ComputeProgram::Density,
                &[b.params.set(0), b.particles_ro.set(0), b.lookup_ro.set(0), b.density_rw.set(0)],
            )?,
            integrate: kernel(
                "fluid_integrate",
                ComputeProgram::Integrate,
                &[
                    b.params.set(0),
                    b.particles_ro.set(0),
                    b.lookup_ro.set(0),
                    b.density_ro.set(0),
                    b.particles_rw.set(1),
                ],
            )?,
        };

        tracing::info!(
            particles = n,
            table_size = config.table_size,
            radius = config.smoothing_radius,
            groups = groups[0],
            local_size = device.local_size(),
            "fluid system created"
        );

        Ok(Self {
            config,
            store,
            scratch,
            lookup,
            density,
            params,
            sort,
            bindings,
            kernels,
            groups,
            ticks: 0,
        })
    }

    /// Write the initial particle state into both store buffers.
    pub fn upload_particles<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        pool: &mut CommandPool,
        particles: &[ParticleRecord],
    ) -> Result<()> {
        let read = self.store.read_buffer();
        let write = self.store.write_buffer();
        let bytes: &[u8] = bytemuck::cast_slice(particles);
        if bytes.len() as u64 != read.size() {
            return Err(KernelError::SizeMismatch {
                expected: read.size(),
                actual: bytes.len() as u64,
            });
        }
        device.write_buffer(read, 0, bytes)?;
        pool.immediate(device, |commands| {
            commands.copy_buffer(read, write)?;
            commands.pipeline_barrier(
                PipelineStages::TRANSFER,
                PipelineStages::COMPUTE | PipelineStages::TRANSFER,
                &[BufferBarrier::new(
                    write,
                    AccessFlags::TRANSFER_WRITE,
                    AccessFlags::SHADER_READ | AccessFlags::TRANSFER_READ,
                )],
            )
        })?;
        tracing::debug!(particles = particles.len(), "initial particle state uploaded");
        Ok(())
    }

    /// Record one simulation tick into `commands`, then swap read and write.
    pub fn run(&mut self, commands: &mut CommandBuffer) -> Result<()> {
        commands.require(CommandBufferState::Recording)?;
        let read = self.store.selector().read();
        let write = self.store.selector().write();
        let read_buffer = self.store.read_buffer();
        let write_buffer = self.store.write_buffer();
        let b = &self.bindings;
        let k = &self.kernels;
        let params = DispatchParams::count(self.config.particle_count);
        let groups = self.groups;
        let uniform = b.params.set(read);

        // Prediction reads a frozen copy so it can overwrite the live record.
        commands.copy_buffer(read_buffer, self.scratch)?;
        commands.pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::COMPUTE,
            &[BufferBarrier::new(self.scratch, AccessFlags::TRANSFER_WRITE, AccessFlags::SHADER_READ)],
        )?;
        commands.dispatch(
            k.predict,
            &[uniform, b.particles_rw.set(read), b.scratch.set(read)],
            params,
            groups,
        )?;
        commands.pipeline_barrier(
            PipelineStages::COMPUTE,
            PipelineStages::COMPUTE,
            &[BufferBarrier::new(
                read_buffer,
                AccessFlags::SHADER_WRITE,
                AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
            )],
        )?;
        commands.dispatch(k.assign_keys, &[uniform, b.particles_rw.set(read)], params, groups)?;
        commands.pipeline_barrier(
            PipelineStages::COMPUTE,
            PipelineStages::TRANSFER,
            &[BufferBarrier::new(read_buffer, AccessFlags::SHADER_WRITE, AccessFlags::TRANSFER_READ)],
        )?;

        self.sort.run(commands, read_buffer)?;

        commands.fill_buffer(self.lookup, EMPTY_CELL)?;
        commands.pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::COMPUTE,
            &[BufferBarrier::new(
                self.lookup,
                AccessFlags::TRANSFER_WRITE,
                AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
            )],
        )?;
        commands.dispatch(
            k.build_lookup,
            &[uniform, b.particles_ro.set(read), b.lookup_rw.set(read)],
            params,
            groups,
        )?;
        commands.pipeline_barrier(
            PipelineStages::COMPUTE,
            PipelineStages::COMPUTE,
            &[BufferBarrier::new(self.lookup, AccessFlags::SHADER_WRITE, AccessFlags::SHADER_READ)],
        )?;

        commands.dispatch(
            k.density,
            &[uniform, b.particles_ro.set(read), b.lookup_ro.set(read), b.density_rw.set(read)],
            params,
            groups,
        )?;
        commands.pipeline_barrier(
            PipelineStages::COMPUTE,
            PipelineStages::COMPUTE,
            &[BufferBarrier::new(self.density, AccessFlags::SHADER_WRITE, AccessFlags::SHADER_READ)],
        )?;

        commands.dispatch(
            k.integrate,
            &[
                uniform,
                b.particles_ro.set(read),
                b.lookup_ro.set(read),
                b.density_ro.set(read),
                b.particles_rw.set(write),
            ],
            params,
            groups,
        )?;
        // The new state is drawn this frame and read again next tick.
        commands.pipeline_barrier(
            PipelineStages::COMPUTE,
            PipelineStages::VERTEX | PipelineStages::COMPUTE | PipelineStages::TRANSFER,
            &[BufferBarrier::new(
                write_buffer,
                AccessFlags::SHADER_WRITE,
                AccessFlags::VERTEX_READ | AccessFlags::SHADER_READ | AccessFlags::TRANSFER_READ,
            )],
        )?;

        self.store.toggle();
        self.ticks += 1;
        tracing::trace!(tick = self.ticks, read = self.store.selector().read(), "tick recorded");
        Ok(())
    }

    /// Bind the current read buffer to a renderer pipeline. Call after
    /// [`FluidSystem::run`] in the same frame so the freshly integrated state
    /// is drawn.
    pub fn bind_particles_for_render(
        &self,
        commands: &mut CommandBuffer,
        pipeline: PipelineHandle,
        bind_point: BindPoint,
    ) -> Result<()> {
        let set = self.bindings.particles_ro.set(self.store.selector().read());
        commands.bind_resources(pipeline, bind_point, set)
    }

    /// Blocking readback of the current state. Waits for all submitted work
    /// that touches the read buffer; not meant for the frame loop.
    pub fn snapshot<D: GpuDevice + ?Sized>(&self, device: &mut D) -> Result<FluidSnapshot> {
        let particles = device.read_buffer(self.store.read_buffer())?;
        let density = device.read_buffer(self.density)?;
        let lookup = device.read_buffer(self.lookup)?;
        Ok(FluidSnapshot {
            particles: bytemuck::pod_collect_to_vec(&particles),
            density: bytemuck::pod_collect_to_vec(&density),
            lookup: bytemuck::pod_collect_to_vec(&lookup),
        })
    }

    /// Configuration the system was built from.
    pub fn config(&self) -> &FluidConfig {
        &self.config
    }

    /// Particle capacity N.
    pub fn particle_count(&self) -> u32 {
        self.config.particle_count
    }

    /// Current ping-pong selector.
    pub fn selector(&self) -> PingPong {
        self.store.selector()
    }

    /// Side holding the current state.
    pub fn read_index(&self) -> usize {
        self.store.selector().read()
    }

    /// Side the next tick writes.
    pub fn write_index(&self) -> usize {
        self.store.selector().write()
    }

    /// Particle buffer at a fixed side.
    pub fn particle_buffer(&self, side: usize) -> BufferHandle {
        self.store.buffer(side)
    }

    /// Spatial lookup table buffer.
    pub fn lookup_buffer(&self) -> BufferHandle {
        self.lookup
    }

    /// Density field buffer.
    pub fn density_buffer(&self) -> BufferHandle {
        self.density
    }

    /// Simulation uniform buffer.
    pub fn params_buffer(&self) -> BufferHandle {
        self.params
    }

    /// The sort driving the key ordering.
    pub fn sort(&self) -> &RadixSort {
        &self.sort
    }

    /// Workgroup counts used by every dispatch.
    pub fn dispatch_groups(&self) -> [u32; 3] {
        self.groups
    }

    /// Ticks recorded so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}
