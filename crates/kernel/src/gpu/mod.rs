//! Device abstraction the fluid pipeline records against.
//!
//! The pipeline never talks to a graphics API directly. It allocates buffers
//! and kernels through [`GpuDevice`], records [`Command`]s into a
//! [`CommandBuffer`] and hands the finished buffer to [`GpuDevice::submit`].
//!
//! Two devices implement the trait:
//! - [`host::HostDevice`]: executes command buffers on the CPU in recording
//!   order. Always available; used by tests and the headless runner.
//! - `wgpu_device::WgpuDevice` (feature `gpu`): translates command buffers
//!   into wgpu compute passes.
//!
//! # Binding model
//! Every kernel takes an ordered list of binding sets, one buffer each, plus a
//! small per-dispatch [`DispatchParams`] block. [`ComputeProgram::signature`]
//! fixes the access of each set; kernels are rejected at creation when the
//! supplied set layouts disagree with it.

pub mod binding;
pub mod buffers;
pub mod command;
pub mod host;
pub mod validation;

#[cfg(feature = "gpu")]
pub mod wgpu_device;

use bitflags::bitflags;

pub use binding::{
    BindingBuilder, BindingKind, BindingSet, LayoutEntry, LayoutHandle, ResourceBinding, SetLayout,
};
pub use buffers::{DispatchParams, SimulationParams};
pub use command::{
    AccessFlags, BindPoint, BufferBarrier, Command, CommandBuffer, CommandBufferState, CommandPool,
    PipelineHandle, PipelineStages,
};

use crate::error::Result;

/// Device buffer, identified by the device that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    id: u32,
    size: u64,
}

impl BufferHandle {
    pub(crate) fn new(id: u32, size: u64) -> Self {
        Self { id, size }
    }

    /// Device-local identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

bitflags! {
    /// How a buffer will be used. Backends map these to native usage flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const STORAGE = 1 << 0;
        const UNIFORM = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
        const VERTEX = 1 << 4;
    }
}

/// Buffer creation request.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    /// Size in bytes; must be a non-zero multiple of 4.
    pub size: u64,
    pub usage: BufferUsage,
}

/// Compiled compute kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle {
    id: u32,
    program: ComputeProgram,
}

impl KernelHandle {
    pub(crate) fn new(id: u32, program: ComputeProgram) -> Self {
        Self { id, program }
    }

    /// Device-local identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Program the kernel was built from.
    pub fn program(&self) -> ComputeProgram {
        self.program
    }
}

/// Ticket for a submitted command buffer; pass it to [`GpuDevice::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Submission(pub(crate) u64);

/// Access a program makes to one of its binding sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetAccess {
    Uniform,
    Read,
    ReadWrite,
}

impl SetAccess {
    /// Binding kind a set layout must have to satisfy this access.
    pub fn binding_kind(self) -> BindingKind {
        match self {
            SetAccess::Uniform => BindingKind::Uniform,
            SetAccess::Read => BindingKind::Storage { read_only: true },
            SetAccess::ReadWrite => BindingKind::Storage { read_only: false },
        }
    }
}

/// The closed set of compute programs the pipeline dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeProgram {
    /// Count records whose key bit `pass` is 0 into an atomic counter.
    CountZeros,
    /// Write bit==0 / bit==1 indicators into two scan pairs.
    WriteDigits,
    /// One Hillis-Steele step: `dst[i] = src[i] + src[i - stride]`.
    ScanStep,
    /// Stable split of records by key bit `pass`.
    Split,
    /// Half-step position prediction.
    Predict,
    /// Spatial key of each predicted position into `position.w`.
    AssignKeys,
    /// First sorted index of every key into the lookup table.
    BuildLookup,
    /// Per-particle density from the 27-cell neighbourhood.
    Density,
    /// Pressure and gravity integration into the write buffer.
    Integrate,
}

impl ComputeProgram {
    /// Every program, in pipeline order.
    pub const ALL: [ComputeProgram; 9] = [
        ComputeProgram::CountZeros,
        ComputeProgram::WriteDigits,
        ComputeProgram::ScanStep,
        ComputeProgram::Split,
        ComputeProgram::Predict,
        ComputeProgram::AssignKeys,
        ComputeProgram::BuildLookup,
        ComputeProgram::Density,
        ComputeProgram::Integrate,
    ];

    /// Access to each binding set, in set order.
    pub fn signature(self) -> &'static [SetAccess] {
        use SetAccess::*;
        match self {
            // keys, offset
            ComputeProgram::CountZeros => &[Read, ReadWrite],
            // keys, zero scan pair, one scan pair
            ComputeProgram::WriteDigits => &[Read, ReadWrite, ReadWrite, ReadWrite, ReadWrite],
            // src, dst
            ComputeProgram::ScanStep => &[Read, ReadWrite],
            // keys, dst records, offset, inclusive zero scan, inclusive one scan
            ComputeProgram::Split => &[Read, ReadWrite, Read, Read, Read],
            // params, particles, position scratch
            ComputeProgram::Predict => &[Uniform, ReadWrite, Read],
            // params, particles
            ComputeProgram::AssignKeys => &[Uniform, ReadWrite],
            // params, particles, lookup table
            ComputeProgram::BuildLookup => &[Uniform, Read, ReadWrite],
            // params, particles, lookup table, density
            ComputeProgram::Density => &[Uniform, Read, Read, ReadWrite],
            // params, particles in, lookup table, density, particles out
            ComputeProgram::Integrate => &[Uniform, Read, Read, Read, ReadWrite],
        }
    }

    /// Debug label and shader entry point name.
    pub fn name(self) -> &'static str {
        match self {
            ComputeProgram::CountZeros => "count_zeros",
            ComputeProgram::WriteDigits => "write_digits",
            ComputeProgram::ScanStep => "scan_step",
            ComputeProgram::Split => "split",
            ComputeProgram::Predict => "predict",
            ComputeProgram::AssignKeys => "assign_keys",
            ComputeProgram::BuildLookup => "build_lookup",
            ComputeProgram::Density => "density",
            ComputeProgram::Integrate => "integrate",
        }
    }
}

/// Kernel creation request.
#[derive(Debug, Clone)]
pub struct KernelDesc<'a> {
    pub label: &'a str,
    pub program: ComputeProgram,
    /// One layout per binding set, matching `program.signature()`.
    pub set_layouts: Vec<SetLayout>,
}

/// Check that `layouts` satisfy `program`'s signature.
pub fn check_signature(
    program: ComputeProgram,
    layouts: &[SetLayout],
) -> std::result::Result<(), String> {
    let signature = program.signature();
    if layouts.len() != signature.len() {
        return Err(format!(
            "{} takes {} binding sets, got {}",
            program.name(),
            signature.len(),
            layouts.len()
        ));
    }
    for (set, (access, layout)) in signature.iter().zip(layouts).enumerate() {
        match layout.entries() {
            [entry] if entry.kind == access.binding_kind() => {}
            entries => {
                return Err(format!(
                    "{} set {} must hold one {:?} binding, layout has {:?}",
                    program.name(),
                    set,
                    access.binding_kind(),
                    entries
                ));
            }
        }
    }
    Ok(())
}

/// Minimal device contract consumed by the fluid pipeline.
pub trait GpuDevice {
    /// Allocate a zero-initialized buffer.
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle>;

    /// Build a compute kernel.
    fn create_kernel(&mut self, desc: &KernelDesc<'_>) -> Result<KernelHandle>;

    /// Write host bytes into a buffer outside of any command buffer.
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;

    /// Blocking diagnostic readback of a whole buffer.
    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>>;

    /// Queue an executable command buffer.
    fn submit(&mut self, commands: &CommandBuffer) -> Result<Submission>;

    /// Block until `submission` has finished executing.
    fn wait(&mut self, submission: Submission) -> Result<()>;

    /// Threads per workgroup every kernel on this device is built with.
    fn local_size(&self) -> u32;
}

/// Workgroup counts covering `count` invocations: `ceil(count / local) + 1`
/// along x.
pub fn dispatch_groups(count: u32, local_size: u32) -> [u32; 3] {
    [count.div_ceil(local_size) + 1, 1, 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_groups_overshoot_by_one() {
        assert_eq!(dispatch_groups(20_000, 256), [80, 1, 1]);
        assert_eq!(dispatch_groups(256, 256), [2, 1, 1]);
        assert_eq!(dispatch_groups(1, 256), [2, 1, 1]);
    }

    #[test]
    fn signatures_use_one_binding_per_set() {
        for program in ComputeProgram::ALL {
            let layouts: Vec<SetLayout> = program
                .signature()
                .iter()
                .map(|access| SetLayout::single(access.binding_kind()))
                .collect();
            assert!(check_signature(program, &layouts).is_ok(), "{}", program.name());
        }
    }

    #[test]
    fn signature_mismatch_is_reported() {
        let layouts = vec![
            SetLayout::single(BindingKind::Storage { read_only: false }),
            SetLayout::single(BindingKind::Storage { read_only: false }),
        ];
        let err = check_signature(ComputeProgram::ScanStep, &layouts).unwrap_err();
        assert!(err.contains("scan_step set 0"));
    }
}
