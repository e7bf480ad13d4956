//! Command buffers, barriers and the command pool.
//!
//! A [`CommandBuffer`] is a plain list of [`Command`]s plus a lifecycle state
//! (`Initial -> Recording -> Executable`). Recording never touches the
//! device; the device interprets the list at submit time.

use std::fmt;

use bitflags::bitflags;

use super::{BindingSet, BufferHandle, DispatchParams, GpuDevice, KernelHandle};
use crate::error::{KernelError, Result};

bitflags! {
    /// Pipeline stages a barrier waits on or unblocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipelineStages: u32 {
        const TRANSFER = 1 << 0;
        const COMPUTE = 1 << 1;
        const VERTEX = 1 << 2;
    }
}

bitflags! {
    /// Memory accesses made available or visible by a barrier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const TRANSFER_READ = 1 << 0;
        const TRANSFER_WRITE = 1 << 1;
        const SHADER_READ = 1 << 2;
        const SHADER_WRITE = 1 << 3;
        const UNIFORM_READ = 1 << 4;
        const VERTEX_READ = 1 << 5;
    }
}

/// Opaque handle to a render pipeline owned by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub u64);

/// Pipeline type a binding is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
}

/// Memory dependency on one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

impl BufferBarrier {
    pub fn new(buffer: BufferHandle, src_access: AccessFlags, dst_access: AccessFlags) -> Self {
        Self { buffer, src_access, dst_access }
    }
}

/// One recorded operation.
#[derive(Debug, Clone)]
pub enum Command {
    /// Copy the whole of `src` into `dst`. Both have the same size.
    CopyBuffer { src: BufferHandle, dst: BufferHandle },
    /// Set every 32-bit word of `dst` to `value`.
    FillBuffer { dst: BufferHandle, value: u32 },
    /// Run `kernel` with one binding set per signature entry.
    Dispatch {
        kernel: KernelHandle,
        sets: Vec<BindingSet>,
        params: DispatchParams,
        groups: [u32; 3],
    },
    /// Execution and memory dependency between everything before and after.
    Barrier {
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        buffers: Vec<BufferBarrier>,
    },
    /// Attach a set to a renderer pipeline for subsequent draws.
    BindResources {
        pipeline: PipelineHandle,
        bind_point: BindPoint,
        set: BindingSet,
    },
}

/// Lifecycle state of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

impl fmt::Display for CommandBufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandBufferState::Initial => "initial",
            CommandBufferState::Recording => "recording",
            CommandBufferState::Executable => "executable",
        };
        f.write_str(name)
    }
}

/// A recorded list of commands.
#[derive(Debug, Clone)]
pub struct CommandBuffer {
    label: String,
    state: CommandBufferState,
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: CommandBufferState::Initial,
            commands: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Number of recorded dispatches.
    pub fn dispatch_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Dispatch { .. }))
            .count()
    }

    /// Number of recorded barriers.
    pub fn barrier_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Barrier { .. }))
            .count()
    }

    /// Start recording. Discards whatever was recorded before.
    pub fn begin(&mut self) -> Result<()> {
        if self.state == CommandBufferState::Recording {
            return Err(self.state_error(CommandBufferState::Executable));
        }
        self.commands.clear();
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Finish recording.
    pub fn end(&mut self) -> Result<()> {
        self.require(CommandBufferState::Recording)?;
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Back to the initial state with no commands.
    pub fn reset(&mut self) {
        self.commands.clear();
        self.state = CommandBufferState::Initial;
    }

    /// Error unless the buffer is in `expected`.
    pub fn require(&self, expected: CommandBufferState) -> Result<()> {
        if self.state != expected {
            return Err(self.state_error(expected));
        }
        Ok(())
    }

    fn state_error(&self, expected: CommandBufferState) -> KernelError {
        KernelError::CommandState {
            label: self.label.clone(),
            expected,
            found: self.state,
        }
    }

    /// Record a whole-buffer copy. Sizes must match exactly.
    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle) -> Result<()> {
        self.require(CommandBufferState::Recording)?;
        if src.size() != dst.size() {
            return Err(KernelError::SizeMismatch {
                expected: dst.size(),
                actual: src.size(),
            });
        }
        self.commands.push(Command::CopyBuffer { src, dst });
        Ok(())
    }

    /// Record a fill of every word of `dst` with `value`.
    pub fn fill_buffer(&mut self, dst: BufferHandle, value: u32) -> Result<()> {
        self.require(CommandBufferState::Recording)?;
        self.commands.push(Command::FillBuffer { dst, value });
        Ok(())
    }

    /// Record a dispatch. `sets` must have one entry per signature slot of
    /// the kernel's program.
    pub fn dispatch(
        &mut self,
        kernel: KernelHandle,
        sets: &[&BindingSet],
        params: DispatchParams,
        groups: [u32; 3],
    ) -> Result<()> {
        self.require(CommandBufferState::Recording)?;
        let expected = kernel.program().signature().len();
        if sets.len() != expected {
            return Err(KernelError::Binding(format!(
                "{} dispatched with {} binding sets, expects {}",
                kernel.program().name(),
                sets.len(),
                expected
            )));
        }
        self.commands.push(Command::Dispatch {
            kernel,
            sets: sets.iter().map(|s| (*s).clone()).collect(),
            params,
            groups,
        });
        Ok(())
    }

    /// Record a pipeline barrier.
    pub fn pipeline_barrier(
        &mut self,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        buffers: &[BufferBarrier],
    ) -> Result<()> {
        self.require(CommandBufferState::Recording)?;
        self.commands.push(Command::Barrier {
            src_stages,
            dst_stages,
            buffers: buffers.to_vec(),
        });
        Ok(())
    }

    /// Record a resource binding for a renderer pipeline.
    pub fn bind_resources(
        &mut self,
        pipeline: PipelineHandle,
        bind_point: BindPoint,
        set: &BindingSet,
    ) -> Result<()> {
        self.require(CommandBufferState::Recording)?;
        self.commands.push(Command::BindResources {
            pipeline,
            bind_point,
            set: set.clone(),
        });
        Ok(())
    }
}

/// Allocates command buffers and runs one-off submissions.
#[derive(Debug)]
pub struct CommandPool {
    label: String,
    allocated: usize,
}

impl CommandPool {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            allocated: 0,
        }
    }

    /// `count` fresh buffers in the initial state.
    pub fn allocate(&mut self, count: usize) -> Vec<CommandBuffer> {
        let start = self.allocated;
        self.allocated += count;
        (start..start + count)
            .map(|i| CommandBuffer::new(format!("{}_{}", self.label, i)))
            .collect()
    }

    /// Record with `record`, submit, and block until the device is done.
    pub fn immediate<D, F>(&mut self, device: &mut D, record: F) -> Result<()>
    where
        D: GpuDevice + ?Sized,
        F: FnOnce(&mut CommandBuffer) -> Result<()>,
    {
        let mut commands = CommandBuffer::new(format!("{}_immediate", self.label));
        commands.begin()?;
        record(&mut commands)?;
        commands.end()?;
        let submission = device.submit(&commands)?;
        device.wait(submission)
    }
}
