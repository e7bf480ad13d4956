//! CPU device: executes command buffers in recording order.
//!
//! Buffers are plain `Vec<u32>` and every compute program has a host body in
//! [`programs`]. Execution is sequential, so barriers have nothing to do at
//! run time; with validation on, every submission is checked for missing
//! barriers first and rejected with [`KernelError::Hazard`] if any are found.
//! That makes the host device a drop-in synchronization checker for command
//! streams that will later run on a real GPU.

mod programs;

use std::mem;

use super::command::{BindPoint, Command, CommandBuffer, CommandBufferState, PipelineHandle};
use super::validation::check_hazards;
use super::{
    check_signature, BufferDesc, BufferHandle, GpuDevice, KernelDesc, KernelHandle, SetAccess,
    Submission,
};
use crate::error::{KernelError, Result};

#[derive(Debug)]
struct HostBuffer {
    label: String,
    words: Vec<u32>,
}

#[derive(Debug)]
struct HostKernel {
    label: String,
}

/// Counters accumulated over the device's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub submissions: u64,
    pub dispatches: u64,
    pub copies: u64,
    pub fills: u64,
    pub barriers: u64,
}

/// Most recent resource binding recorded for a renderer pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderBinding {
    pub pipeline: PipelineHandle,
    pub bind_point: BindPoint,
    pub buffer: BufferHandle,
}

/// Device that runs everything on the calling thread.
#[derive(Debug)]
pub struct HostDevice {
    local_size: u32,
    buffers: Vec<HostBuffer>,
    kernels: Vec<HostKernel>,
    memory_limit: Option<u64>,
    allocated: u64,
    validate: bool,
    submitted: u64,
    completed: u64,
    last_render_binding: Option<RenderBinding>,
    stats: HostStats,
}

impl HostDevice {
    /// Device whose kernels run `local_size` invocations per workgroup.
    /// Hazard validation defaults to on in debug builds.
    pub fn new(local_size: u32) -> Self {
        Self {
            local_size: local_size.max(1),
            buffers: Vec::new(),
            kernels: Vec::new(),
            memory_limit: None,
            allocated: 0,
            validate: cfg!(debug_assertions),
            submitted: 0,
            completed: 0,
            last_render_binding: None,
            stats: HostStats::default(),
        }
    }

    /// Fail allocations once `bytes` total would be exceeded.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Turn submit-time hazard validation on or off.
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Bytes allocated so far.
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn stats(&self) -> HostStats {
        self.stats
    }

    pub fn last_render_binding(&self) -> Option<RenderBinding> {
        self.last_render_binding
    }

    /// Words of a buffer, for tests and diagnostics.
    pub fn words(&self, buffer: BufferHandle) -> Result<&[u32]> {
        Ok(&self.buffer(buffer)?.words)
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&HostBuffer> {
        self.buffers
            .get(handle.id() as usize)
            .ok_or_else(|| KernelError::Binding(format!("unknown buffer {}", handle.id())))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut HostBuffer> {
        self.buffers
            .get_mut(handle.id() as usize)
            .ok_or_else(|| KernelError::Binding(format!("unknown buffer {}", handle.id())))
    }

    fn execute(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::CopyBuffer { src, dst } => {
                let words = self.buffer(*src)?.words.clone();
                let target = self.buffer_mut(*dst)?;
                if target.words.len() != words.len() {
                    return Err(KernelError::SizeMismatch {
                        expected: target.words.len() as u64 * 4,
                        actual: words.len() as u64 * 4,
                    });
                }
                target.words.copy_from_slice(&words);
                self.stats.copies += 1;
            }
            Command::FillBuffer { dst, value } => {
                self.buffer_mut(*dst)?.words.fill(*value);
                self.stats.fills += 1;
            }
            Command::Dispatch { kernel, sets, params, groups } => {
                if kernel.id() as usize >= self.kernels.len() {
                    return Err(KernelError::Binding(format!("unknown kernel {}", kernel.id())));
                }
                let program = kernel.program();
                let signature = program.signature();

                let mut read_ids = Vec::new();
                let mut write_ids = Vec::new();
                for (set, access) in sets.iter().zip(signature) {
                    let id = set.primary().id() as usize;
                    if id >= self.buffers.len() {
                        return Err(KernelError::Binding(format!("unknown buffer {id}")));
                    }
                    match access {
                        SetAccess::ReadWrite => write_ids.push(id),
                        SetAccess::Uniform | SetAccess::Read => read_ids.push(id),
                    }
                }
                for (n, id) in write_ids.iter().enumerate() {
                    if read_ids.contains(id) || write_ids[..n].contains(id) {
                        return Err(KernelError::Binding(format!(
                            "{}: buffer `{}` bound for writing aliases another binding",
                            self.kernels[kernel.id() as usize].label,
                            self.buffers[*id].label
                        )));
                    }
                }

                let [gx, gy, gz] = *groups;
                let threads = (gx as u64 * gy as u64 * gz as u64 * self.local_size as u64)
                    .min(u32::MAX as u64) as u32;
                let invocations = params.count.min(threads);

                let mut taken: Vec<Vec<u32>> = write_ids
                    .iter()
                    .map(|&id| mem::take(&mut self.buffers[id].words))
                    .collect();
                {
                    let reads: Vec<&[u32]> =
                        read_ids.iter().map(|&id| self.buffers[id].words.as_slice()).collect();
                    let mut writes: Vec<&mut [u32]> =
                        taken.iter_mut().map(|w| w.as_mut_slice()).collect();
                    programs::execute(program, params, &reads, &mut writes, invocations);
                }
                for (id, words) in write_ids.into_iter().zip(taken) {
                    self.buffers[id].words = words;
                }
                self.stats.dispatches += 1;
            }
            Command::Barrier { .. } => {
                self.stats.barriers += 1;
            }
            Command::BindResources { pipeline, bind_point, set } => {
                self.last_render_binding = Some(RenderBinding {
                    pipeline: *pipeline,
                    bind_point: *bind_point,
                    buffer: set.primary(),
                });
            }
        }
        Ok(())
    }
}

impl GpuDevice for HostDevice {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle> {
        if desc.size == 0 || desc.size % 4 != 0 {
            return Err(KernelError::Allocation {
                label: desc.label.to_string(),
                requested: desc.size,
                reason: "size must be a non-zero multiple of 4".to_string(),
            });
        }
        if let Some(limit) = self.memory_limit {
            if self.allocated + desc.size > limit {
                return Err(KernelError::Allocation {
                    label: desc.label.to_string(),
                    requested: desc.size,
                    reason: format!(
                        "out of device memory ({} of {} bytes in use)",
                        self.allocated, limit
                    ),
                });
            }
        }
        let id = self.buffers.len() as u32;
        self.buffers.push(HostBuffer {
            label: desc.label.to_string(),
            words: vec![0; (desc.size / 4) as usize],
        });
        self.allocated += desc.size;
        tracing::debug!(label = desc.label, size = desc.size, "host buffer");
        Ok(BufferHandle::new(id, desc.size))
    }

    fn create_kernel(&mut self, desc: &KernelDesc<'_>) -> Result<KernelHandle> {
        check_signature(desc.program, &desc.set_layouts).map_err(|reason| {
            KernelError::KernelBuild {
                label: desc.label.to_string(),
                reason,
            }
        })?;
        let id = self.kernels.len() as u32;
        self.kernels.push(HostKernel {
            label: desc.label.to_string(),
        });
        Ok(KernelHandle::new(id, desc.program))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        if offset % 4 != 0 || data.len() % 4 != 0 {
            return Err(KernelError::Binding(
                "buffer writes must be 4-byte aligned".to_string(),
            ));
        }
        let target = self.buffer_mut(buffer)?;
        let start = (offset / 4) as usize;
        let end = start + data.len() / 4;
        if end > target.words.len() {
            return Err(KernelError::SizeMismatch {
                expected: target.words.len() as u64 * 4,
                actual: offset + data.len() as u64,
            });
        }
        for (word, chunk) in target.words[start..end].iter_mut().zip(data.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>> {
        Ok(bytemuck::cast_slice(&self.buffer(buffer)?.words).to_vec())
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
        for command in commands.commands() {
            self.execute(command)?;
        }
        self.submitted += 1;
        self.completed = self.submitted;
        self.stats.submissions += 1;
        Ok(Submission(self.submitted))
    }

    fn wait(&mut self, submission: Submission) -> Result<()> {
        if submission.0 > self.completed {
            return Err(KernelError::Device(format!(
                "submission {} was never issued",
                submission.0
            )));
        }
        Ok(())
    }

    fn local_size(&self) -> u32 {
        self.local_size
    }
}
