//! wgpu implementation of [`GpuDevice`].
//!
//! Every kernel's bind group 0 holds a dynamic-offset uniform with the
//! dispatch's [`DispatchParams`] at binding 0 and one buffer per binding set
//! at bindings 1.. in signature order. At submit time all parameter blocks of
//! the command buffer are packed into one uniform buffer at 256-byte stride
//! and written through the queue before the encoded commands run.
//!
//! Barriers close the current compute pass. wgpu tracks buffer usage
//! transitions itself, so the explicit barriers only decide pass boundaries;
//! they are still validated with [`check_hazards`] in debug builds so the
//! same command stream is correct on an explicit-barrier API.

use std::collections::HashMap;
use std::num::NonZeroU64;

use super::command::{Command, CommandBuffer, CommandBufferState};
use super::validation::check_hazards;
use super::{
    check_signature, BindingSet, BufferDesc, BufferHandle, BufferUsage, ComputeProgram,
    DispatchParams, GpuDevice, KernelDesc, KernelHandle, SetAccess, Submission,
};
use crate::error::{KernelError, Result};

const PARAMS_STRIDE: u64 = 256;
const PARAMS_SIZE: u64 = std::mem::size_of::<DispatchParams>() as u64;
/// Bind-group cache key used for the internal fill kernel.
const FILL_KERNEL: u32 = u32::MAX;

/// Which adapters [`WgpuDevice::new`] accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdapterPolicy {
    /// Also accept integrated GPUs. Discrete GPUs are always accepted.
    pub allow_integrated: bool,
}

impl AdapterPolicy {
    fn accepts(&self, info: &wgpu::AdapterInfo) -> bool {
        match info.device_type {
            wgpu::DeviceType::DiscreteGpu => true,
            wgpu::DeviceType::IntegratedGpu => self.allow_integrated,
            _ => false,
        }
    }
}

/// Check whether an adapter satisfying `policy` is present.
pub fn gpu_available(policy: AdapterPolicy) -> bool {
    select_adapter(policy).is_ok()
}

fn select_adapter(policy: AdapterPolicy) -> Result<wgpu::Adapter> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let mut rejected = Vec::new();
    let mut chosen = None;
    for adapter in instance.enumerate_adapters(wgpu::Backends::all()) {
        let info = adapter.get_info();
        let compute = adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS);
        if compute && policy.accepts(&info) {
            // Prefer a discrete GPU when integrated ones are also allowed.
            let discrete = info.device_type == wgpu::DeviceType::DiscreteGpu;
            if chosen.is_none() || discrete {
                chosen = Some(adapter);
                if discrete {
                    break;
                }
            }
        } else {
            rejected.push(format!("{} ({:?})", info.name, info.device_type));
        }
    }
    chosen.ok_or_else(|| {
        KernelError::NoAdapter(if rejected.is_empty() {
            "no adapters found".to_string()
        } else {
            format!("rejected: {}", rejected.join(", "))
        })
    })
}

struct WgpuKernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

/// GPU device backed by wgpu.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: wgpu::AdapterInfo,
    local_size: u32,
    validate: bool,
    buffers: Vec<wgpu::Buffer>,
    kernels: Vec<WgpuKernel>,
    fill: WgpuKernel,
    params: wgpu::Buffer,
    params_slots: u64,
    bind_groups: HashMap<(u32, Vec<u32>), wgpu::BindGroup>,
    submissions: Vec<wgpu::SubmissionIndex>,
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("adapter", &self.info.name)
            .field("backend", &self.info.backend)
            .field("local_size", &self.local_size)
            .field("buffers", &self.buffers.len())
            .field("kernels", &self.kernels.len())
            .finish()
    }
}

impl WgpuDevice {
    /// Select an adapter under `policy` and open a device on it.
    pub fn new(policy: AdapterPolicy, local_size: u32) -> Result<Self> {
        let adapter = select_adapter(policy)?;
        let info = adapter.get_info();
        tracing::info!("GPU adapter: {:?} ({:?}, {:?})", info.name, info.device_type, info.backend);

        let adapter_limits = adapter.limits();
        let mut required_limits = wgpu::Limits::default();
        required_limits.max_storage_buffers_per_shader_stage =
            adapter_limits.max_storage_buffers_per_shader_stage;
        required_limits.max_compute_workgroup_size_x =
            adapter_limits.max_compute_workgroup_size_x;
        required_limits.max_compute_invocations_per_workgroup =
            adapter_limits.max_compute_invocations_per_workgroup;
        if local_size > required_limits.max_compute_invocations_per_workgroup {
            return Err(KernelError::InvalidConfig(format!(
                "local_size {local_size} exceeds the adapter limit of {}",
                required_limits.max_compute_invocations_per_workgroup
            )));
        }

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("fluid_device"),
                required_features: wgpu::Features::empty(),
                required_limits,
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| KernelError::Device(format!("failed to create device: {e}")))?;

        let fill = build_fill_kernel(&device, local_size)?;
        let params_slots = 64;
        let params = create_params_buffer(&device, params_slots);

        Ok(Self {
            device,
            queue,
            info,
            local_size,
            validate: cfg!(debug_assertions),
            buffers: Vec::new(),
            kernels: Vec::new(),
            fill,
            params,
            params_slots,
            bind_groups: HashMap::new(),
            submissions: Vec::new(),
        })
    }

    /// Turn submit-time hazard validation on or off.
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Adapter the device runs on.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.info
    }

    /// Underlying wgpu objects, for a renderer sharing the device.
    pub fn raw(&self) -> (&wgpu::Device, &wgpu::Queue) {
        (&self.device, &self.queue)
    }

    /// Native buffer behind a handle.
    pub fn raw_buffer(&self, handle: BufferHandle) -> Result<&wgpu::Buffer> {
        self.buffers
            .get(handle.id() as usize)
            .ok_or_else(|| KernelError::Binding(format!("unknown buffer {}", handle.id())))
    }

    fn ensure_params_capacity(&mut self, slots: u64) {
        if slots <= self.params_slots {
            return;
        }
        let mut grown = self.params_slots.max(1);
        while grown < slots {
            grown *= 2;
        }
        tracing::debug!(slots = grown, "growing dispatch parameter buffer");
        self.params = create_params_buffer(&self.device, grown);
        self.params_slots = grown;
        // Every cached bind group references the old buffer.
        self.bind_groups.clear();
    }

    fn ensure_bind_group(&mut self, kernel: u32, buffers: Vec<u32>) -> Result<()> {
        let key = (kernel, buffers);
        if self.bind_groups.contains_key(&key) {
            return Ok(());
        }
        let layout = if kernel == FILL_KERNEL {
            &self.fill.layout
        } else {
            &self
                .kernels
                .get(kernel as usize)
                .ok_or_else(|| KernelError::Binding(format!("unknown kernel {kernel}")))?
                .layout
        };
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: &self.params,
                offset: 0,
                size: NonZeroU64::new(PARAMS_SIZE),
            }),
        }];
        for (slot, id) in key.1.iter().enumerate() {
            let buffer = self
                .buffers
                .get(*id as usize)
                .ok_or_else(|| KernelError::Binding(format!("unknown buffer {id}")))?;
            entries.push(wgpu::BindGroupEntry {
                binding: slot as u32 + 1,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout,
            entries: &entries,
        });
        self.bind_groups.insert(key, bind_group);
        Ok(())
    }
}

fn create_params_buffer(device: &wgpu::Device, slots: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("dispatch_params"),
        size: slots * PARAMS_STRIDE,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn set_key(sets: &[BindingSet]) -> Vec<u32> {
    sets.iter().map(|set| set.primary().id()).collect()
}

/// Commands encoded inside a compute pass.
fn in_pass(command: &Command) -> bool {
    match command {
        Command::Dispatch { .. } => true,
        Command::FillBuffer { value, .. } => *value != 0,
        _ => false,
    }
}

fn buffer_usages(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::empty();
    if usage.contains(BufferUsage::STORAGE) {
        out |= wgpu::BufferUsages::STORAGE;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        out |= wgpu::BufferUsages::UNIFORM;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        out |= wgpu::BufferUsages::COPY_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        out |= wgpu::BufferUsages::COPY_DST;
    }
    if usage.contains(BufferUsage::VERTEX) {
        out |= wgpu::BufferUsages::VERTEX;
    }
    out
}

// ---- Shader sources ----

const COMMON_WGSL: &str = include_str!("shaders/common.wgsl");

fn program_source(program: ComputeProgram) -> &'static str {
    match program {
        ComputeProgram::CountZeros => include_str!("shaders/count_zeros.wgsl"),
        ComputeProgram::WriteDigits => include_str!("shaders/write_digits.wgsl"),
        ComputeProgram::ScanStep => include_str!("shaders/scan_step.wgsl"),
        ComputeProgram::Split => include_str!("shaders/split.wgsl"),
        ComputeProgram::Predict => include_str!("shaders/predict.wgsl"),
        ComputeProgram::AssignKeys => include_str!("shaders/assign_keys.wgsl"),
        ComputeProgram::BuildLookup => include_str!("shaders/build_lookup.wgsl"),
        ComputeProgram::Density => include_str!("shaders/density.wgsl"),
        ComputeProgram::Integrate => include_str!("shaders/integrate.wgsl"),
    }
}

/// Common prelude plus `body`, with the workgroup size substituted.
fn shader_source(body: &str, local_size: u32) -> String {
    let wg_str = format!("@workgroup_size({})", local_size);
    format!("{COMMON_WGSL}\n{body}").replace("@workgroup_size(256)", &wg_str)
}

fn build_pipeline(
    device: &wgpu::Device,
    label: &str,
    entry_point: &str,
    source: String,
    entries: &[wgpu::BindGroupLayoutEntry],
) -> Result<WgpuKernel> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    });
    if let Some(error) = pollster::block_on(device.pop_error_scope()) {
        return Err(KernelError::KernelBuild {
            label: label.to_string(),
            reason: error.to_string(),
        });
    }
    Ok(WgpuKernel { pipeline, layout })
}

fn build_fill_kernel(device: &wgpu::Device, local_size: u32) -> Result<WgpuKernel> {
    build_pipeline(
        device,
        "fill_words",
        "fill_words",
        shader_source(include_str!("shaders/fill.wgsl"), local_size),
        &[bgl_params(), bgl_storage_rw(1)],
    )
}

impl GpuDevice for WgpuDevice {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle> {
        if desc.size == 0 || desc.size % 4 != 0 {
            return Err(KernelError::Allocation {
                label: desc.label.to_string(),
                requested: desc.size,
                reason: "size must be a non-zero multiple of 4".to_string(),
            });
        }
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: desc.size,
            usage: buffer_usages(desc.usage),
            mapped_at_creation: false,
        });
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(error) = out_of_memory.or(validation) {
            return Err(KernelError::Allocation {
                label: desc.label.to_string(),
                requested: desc.size,
                reason: error.to_string(),
            });
        }
        let id = self.buffers.len() as u32;
        self.buffers.push(buffer);
        Ok(BufferHandle::new(id, desc.size))
    }

    fn create_kernel(&mut self, desc: &KernelDesc<'_>) -> Result<KernelHandle> {
        check_signature(desc.program, &desc.set_layouts).map_err(|reason| {
            KernelError::KernelBuild {
                label: desc.label.to_string(),
                reason,
            }
        })?;
        let mut entries = vec![bgl_params()];
        for (slot, access) in desc.program.signature().iter().enumerate() {
            let binding = slot as u32 + 1;
            entries.push(match access {
                SetAccess::Uniform => bgl_uniform(binding),
                SetAccess::Read => bgl_storage_ro(binding),
                SetAccess::ReadWrite => bgl_storage_rw(binding),
            });
        }
        let kernel = build_pipeline(
            &self.device,
            desc.label,
            desc.program.name(),
            shader_source(program_source(desc.program), self.local_size),
            &entries,
        )?;
        let id = self.kernels.len() as u32;
        self.kernels.push(kernel);
        tracing::debug!(label = desc.label, program = desc.program.name(), "kernel built");
        Ok(KernelHandle::new(id, desc.program))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0
            || data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0
        {
            return Err(KernelError::Binding(
                "buffer writes must be 4-byte aligned".to_string(),
            ));
        }
        if offset + data.len() as u64 > buffer.size() {
            return Err(KernelError::SizeMismatch {
                expected: buffer.size(),
                actual: offset + data.len() as u64,
            });
        }
        let target = self.raw_buffer(buffer)?;
        self.queue.write_buffer(target, offset, data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>> {
        let source = self.raw_buffer(buffer)?;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size: buffer.size(),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, buffer.size());
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| KernelError::Readback(e.to_string()))?
            .map_err(|e| KernelError::Readback(e.to_string()))?;

        let data = slice.get_mapped_range();
        let result = data.to_vec();
        drop(data);
        staging.unmap();
        Ok(result)
    }

    fn submit(&mut self, commands: &CommandBuffer) -> Result<Submission> {
        commands.require(CommandBufferState::Executable)?;
        if self.validate {
            let hazards = check_hazards(commands);
            if !hazards.is_empty() {
                return Err(KernelError::Hazard {
                    label: commands.label().to_string(),
                    hazards,
                });
            }
        }
        let list = commands.commands();

        // Parameter blocks, one slot per command encoded in a pass.
        let mut blob: Vec<u8> = Vec::new();
        for command in list {
            let params = match command {
                Command::Dispatch { params, .. } => *params,
                Command::FillBuffer { dst, value } if *value != 0 => DispatchParams {
                    count: (dst.size() / 4) as u32,
                    value: *value,
                    ..DispatchParams::default()
                },
                _ => continue,
            };
            blob.extend_from_slice(bytemuck::bytes_of(&params));
            blob.resize(blob.len() + (PARAMS_STRIDE - PARAMS_SIZE) as usize, 0);
        }
        let slots = blob.len() as u64 / PARAMS_STRIDE;
        self.ensure_params_capacity(slots);
        if !blob.is_empty() {
            self.queue.write_buffer(&self.params, 0, &blob);
        }

        for command in list {
            match command {
                Command::Dispatch { kernel, sets, .. } => {
                    self.ensure_bind_group(kernel.id(), set_key(sets))?;
                }
                Command::FillBuffer { dst, value } if *value != 0 => {
                    self.ensure_bind_group(FILL_KERNEL, vec![dst.id()])?;
                }
                _ => {}
            }
        }

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(commands.label()),
        });
        let mut slot = 0u64;
        let mut i = 0;
        while i < list.len() {
            if in_pass(&list[i]) {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(commands.label()),
                    timestamp_writes: None,
                });
                while i < list.len() && in_pass(&list[i]) {
                    let offset = [(slot * PARAMS_STRIDE) as u32];
                    match &list[i] {
                        Command::Dispatch { kernel, sets, groups, .. } => {
                            let key = (kernel.id(), set_key(sets));
                            pass.set_pipeline(&self.kernels[kernel.id() as usize].pipeline);
                            pass.set_bind_group(0, &self.bind_groups[&key], &offset);
                            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
                        }
                        Command::FillBuffer { dst, .. } => {
                            let key = (FILL_KERNEL, vec![dst.id()]);
                            let words = (dst.size() / 4) as u32;
                            pass.set_pipeline(&self.fill.pipeline);
                            pass.set_bind_group(0, &self.bind_groups[&key], &offset);
                            pass.dispatch_workgroups(words.div_ceil(self.local_size), 1, 1);
                        }
                        _ => {}
                    }
                    slot += 1;
                    i += 1;
                }
                continue;
            }
            match &list[i] {
                Command::CopyBuffer { src, dst } => {
                    encoder.copy_buffer_to_buffer(
                        self.raw_buffer(*src)?,
                        0,
                        self.raw_buffer(*dst)?,
                        0,
                        src.size(),
                    );
                }
                Command::FillBuffer { dst, .. } => {
                    encoder.clear_buffer(self.raw_buffer(*dst)?, 0, None);
                }
                Command::Barrier { src_stages, dst_stages, buffers } => {
                    tracing::trace!(?src_stages, ?dst_stages, buffers = buffers.len(), "barrier");
                }
                Command::BindResources { pipeline, bind_point, set } => {
                    tracing::trace!(
                        pipeline = pipeline.0,
                        ?bind_point,
                        buffer = set.primary().id(),
                        "render binding recorded"
                    );
                }
                Command::Dispatch { .. } => {}
            }
            i += 1;
        }

        let index = self.queue.submit(std::iter::once(encoder.finish()));
        self.submissions.push(index);
        tracing::debug!(
            label = commands.label(),
            dispatches = commands.dispatch_count(),
            barriers = commands.barrier_count(),
            "submitted"
        );
        Ok(Submission(self.submissions.len() as u64))
    }

    fn wait(&mut self, submission: Submission) -> Result<()> {
        let index = submission
            .0
            .checked_sub(1)
            .and_then(|i| self.submissions.get(i as usize))
            .ok_or_else(|| {
                KernelError::Device(format!("submission {} was never issued", submission.0))
            })?
            .clone();
        self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        Ok(())
    }

    fn local_size(&self) -> u32 {
        self.local_size
    }
}

// ---- Bind group layout entry helpers ----

fn bgl_params() -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: true,
            min_binding_size: NonZeroU64::new(PARAMS_SIZE),
        },
        count: None,
    }
}

fn bgl_uniform(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_ro(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_rw(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}
