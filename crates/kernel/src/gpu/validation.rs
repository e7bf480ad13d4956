//! Hazard validation for recorded command buffers.
//!
//! This is the equivalent of a graphics debug layer's synchronization check:
//! it replays a command buffer's accesses and reports every access that is
//! not ordered against an earlier conflicting one by a barrier. Each command
//! buffer is checked on its own; submissions are assumed fully ordered
//! against each other.

use std::collections::HashMap;
use std::fmt;

use super::command::{AccessFlags, BindPoint, Command, CommandBuffer, PipelineStages};
use super::{BufferHandle, SetAccess};

/// Kind of unsynchronized access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HazardKind {
    ReadAfterWrite,
    WriteAfterWrite,
    WriteAfterRead,
}

/// One unsynchronized access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hazard {
    /// Index of the offending command in the buffer.
    pub command: usize,
    pub buffer: BufferHandle,
    pub kind: HazardKind,
    /// Stage of the offending access.
    pub stage: PipelineStages,
}

impl fmt::Display for Hazard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} on buffer {} at command {} ({:?})",
            self.kind,
            self.buffer.id(),
            self.command,
            self.stage
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Access {
    buffer: BufferHandle,
    stage: PipelineStages,
    access: AccessFlags,
    write: bool,
}

/// Last write to a buffer.
#[derive(Debug, Clone, Copy)]
struct WriteState {
    stage: PipelineStages,
    access: AccessFlags,
    /// Made available by a barrier whose source scope covered it.
    available: bool,
    /// Stages execution-ordered after the write by barriers so far.
    ordered: PipelineStages,
    /// Scope the write has been made visible to.
    visible: (PipelineStages, AccessFlags),
}

/// A read since the last write.
#[derive(Debug, Clone, Copy)]
struct ReadState {
    stage: PipelineStages,
    ordered: PipelineStages,
}

#[derive(Debug, Default)]
struct BufferState {
    write: Option<WriteState>,
    reads: Vec<ReadState>,
}

/// Whether a barrier with source stages `src` waits on an access at `stage`
/// that is already ordered before `ordered`. Execution dependencies chain.
#[inline]
fn in_source_scope(src: PipelineStages, stage: PipelineStages, ordered: PipelineStages) -> bool {
    src.contains(stage) || src.intersects(ordered)
}

fn accesses(command: &Command) -> Vec<Access> {
    match command {
        Command::CopyBuffer { src, dst } => vec![
            Access {
                buffer: *src,
                stage: PipelineStages::TRANSFER,
                access: AccessFlags::TRANSFER_READ,
                write: false,
            },
            Access {
                buffer: *dst,
                stage: PipelineStages::TRANSFER,
                access: AccessFlags::TRANSFER_WRITE,
                write: true,
            },
        ],
        Command::FillBuffer { dst, .. } => vec![Access {
            buffer: *dst,
            stage: PipelineStages::TRANSFER,
            access: AccessFlags::TRANSFER_WRITE,
            write: true,
        }],
        Command::Dispatch { kernel, sets, .. } => {
            let mut out = Vec::new();
            for (set, access) in sets.iter().zip(kernel.program().signature()) {
                let (flags, write) = match access {
                    SetAccess::Uniform => (AccessFlags::UNIFORM_READ, false),
                    SetAccess::Read => (AccessFlags::SHADER_READ, false),
                    SetAccess::ReadWrite => (AccessFlags::SHADER_WRITE, true),
                };
                for (_, buffer) in set.bindings() {
                    out.push(Access {
                        buffer: *buffer,
                        stage: PipelineStages::COMPUTE,
                        access: flags,
                        write,
                    });
                }
            }
            out
        }
        Command::BindResources { bind_point, set, .. } => {
            let (stage, access) = match bind_point {
                BindPoint::Graphics => (PipelineStages::VERTEX, AccessFlags::VERTEX_READ),
                BindPoint::Compute => (PipelineStages::COMPUTE, AccessFlags::SHADER_READ),
            };
            set.bindings()
                .iter()
                .map(|(_, buffer)| Access {
                    buffer: *buffer,
                    stage,
                    access,
                    write: false,
                })
                .collect()
        }
        Command::Barrier { .. } => Vec::new(),
    }
}

/// Every unsynchronized access in `commands`, in recording order.
pub fn check_hazards(commands: &CommandBuffer) -> Vec<Hazard> {
    let mut states: HashMap<u32, BufferState> = HashMap::new();
    let mut hazards = Vec::new();

    for (index, command) in commands.commands().iter().enumerate() {
        if let Command::Barrier { src_stages, dst_stages, buffers } = command {
            for (id, state) in states.iter_mut() {
                for read in &mut state.reads {
                    if in_source_scope(*src_stages, read.stage, read.ordered) {
                        read.ordered |= *dst_stages;
                    }
                }
                let Some(write) = state.write.as_mut() else {
                    continue;
                };
                if !in_source_scope(*src_stages, write.stage, write.ordered) {
                    continue;
                }
                write.ordered |= *dst_stages;
                for barrier in buffers.iter().filter(|b| b.buffer.id() == *id) {
                    if write.available {
                        write.visible.0 |= *dst_stages;
                        write.visible.1 |= barrier.dst_access;
                    } else if barrier.src_access.contains(write.access) {
                        write.available = true;
                        write.visible = (*dst_stages, barrier.dst_access);
                    }
                }
            }
            continue;
        }

        let accesses = accesses(command);
        for access in accesses.iter().filter(|a| !a.write) {
            let state = states.entry(access.buffer.id()).or_default();
            let covered = match state.write {
                Some(write) => {
                    write.available
                        && write.visible.0.contains(access.stage)
                        && write.visible.1.contains(access.access)
                }
                None => true,
            };
            if !covered {
                hazards.push(Hazard {
                    command: index,
                    buffer: access.buffer,
                    kind: HazardKind::ReadAfterWrite,
                    stage: access.stage,
                });
            }
        }
        for access in accesses.iter().filter(|a| a.write) {
            let state = states.entry(access.buffer.id()).or_default();
            if let Some(write) = state.write {
                if !write.available || !write.ordered.contains(access.stage) {
                    hazards.push(Hazard {
                        command: index,
                        buffer: access.buffer,
                        kind: HazardKind::WriteAfterWrite,
                        stage: access.stage,
                    });
                }
            }
            if state.reads.iter().any(|r| !r.ordered.contains(access.stage)) {
                hazards.push(Hazard {
                    command: index,
                    buffer: access.buffer,
                    kind: HazardKind::WriteAfterRead,
                    stage: access.stage,
                });
            }
            state.write = Some(WriteState {
                stage: access.stage,
                access: access.access,
                available: false,
                ordered: PipelineStages::empty(),
                visible: (PipelineStages::empty(), AccessFlags::empty()),
            });
            state.reads.clear();
        }
        for access in accesses.iter().filter(|a| !a.write) {
            states.entry(access.buffer.id()).or_default().reads.push(ReadState {
                stage: access.stage,
                ordered: PipelineStages::empty(),
            });
        }
    }

    hazards
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::command::BufferBarrier;

    fn buf(id: u32) -> BufferHandle {
        BufferHandle::new(id, 64)
    }

    fn recording() -> CommandBuffer {
        let mut cb = CommandBuffer::new("test");
        cb.begin().unwrap();
        cb
    }

    #[test]
    fn copy_then_copy_out_without_barrier_is_read_after_write() {
        let mut cb = recording();
        cb.copy_buffer(buf(0), buf(1)).unwrap();
        cb.copy_buffer(buf(1), buf(2)).unwrap();
        let hazards = check_hazards(&cb);
        assert_eq!(hazards.len(), 1);
        assert_eq!(hazards[0].kind, HazardKind::ReadAfterWrite);
        assert_eq!(hazards[0].buffer, buf(1));
        assert_eq!(hazards[0].command, 1);
    }

    #[test]
    fn matching_barrier_clears_the_hazard() {
        let mut cb = recording();
        cb.copy_buffer(buf(0), buf(1)).unwrap();
        cb.pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::TRANSFER,
            &[BufferBarrier::new(buf(1), AccessFlags::TRANSFER_WRITE, AccessFlags::TRANSFER_READ)],
        )
        .unwrap();
        cb.copy_buffer(buf(1), buf(2)).unwrap();
        assert!(check_hazards(&cb).is_empty());
    }

    #[test]
    fn barrier_with_wrong_destination_scope_is_flagged() {
        let mut cb = recording();
        cb.fill_buffer(buf(1), 0).unwrap();
        cb.pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::COMPUTE,
            &[BufferBarrier::new(buf(1), AccessFlags::TRANSFER_WRITE, AccessFlags::SHADER_READ)],
        )
        .unwrap();
        // Transfer read is outside the barrier's destination scope.
        cb.copy_buffer(buf(1), buf(2)).unwrap();
        let hazards = check_hazards(&cb);
        assert_eq!(hazards.len(), 1);
        assert_eq!(hazards[0].kind, HazardKind::ReadAfterWrite);
    }

    #[test]
    fn overwriting_a_read_source_needs_an_execution_dependency() {
        let mut cb = recording();
        cb.copy_buffer(buf(0), buf(1)).unwrap();
        cb.fill_buffer(buf(0), 0).unwrap();
        let hazards = check_hazards(&cb);
        assert_eq!(hazards.len(), 1);
        assert_eq!(hazards[0].kind, HazardKind::WriteAfterRead);
        assert_eq!(hazards[0].buffer, buf(0));

        let mut cb = recording();
        cb.copy_buffer(buf(0), buf(1)).unwrap();
        cb.pipeline_barrier(PipelineStages::TRANSFER, PipelineStages::TRANSFER, &[])
            .unwrap();
        cb.fill_buffer(buf(0), 0).unwrap();
        assert!(check_hazards(&cb).is_empty());
    }

    #[test]
    fn double_write_is_write_after_write() {
        let mut cb = recording();
        cb.fill_buffer(buf(3), 1).unwrap();
        cb.fill_buffer(buf(3), 2).unwrap();
        let hazards = check_hazards(&cb);
        assert_eq!(hazards.len(), 1);
        assert_eq!(hazards[0].kind, HazardKind::WriteAfterWrite);
    }

    #[test]
    fn read_ordered_only_before_other_stages_is_write_after_read() {
        let mut cb = recording();
        cb.copy_buffer(buf(0), buf(1)).unwrap();
        // Orders the copy before vertex work, not before the next transfer.
        cb.pipeline_barrier(PipelineStages::TRANSFER, PipelineStages::VERTEX, &[])
            .unwrap();
        cb.fill_buffer(buf(0), 0).unwrap();
        let hazards = check_hazards(&cb);
        assert_eq!(hazards.len(), 1);
        assert_eq!(hazards[0].kind, HazardKind::WriteAfterRead);
        assert_eq!(hazards[0].buffer, buf(0));
    }

    #[test]
    fn write_flushed_to_other_stages_is_write_after_write() {
        let mut cb = recording();
        cb.fill_buffer(buf(4), 1).unwrap();
        cb.pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::COMPUTE,
            &[BufferBarrier::new(buf(4), AccessFlags::TRANSFER_WRITE, AccessFlags::SHADER_READ)],
        )
        .unwrap();
        cb.fill_buffer(buf(4), 2).unwrap();
        let hazards = check_hazards(&cb);
        assert_eq!(hazards.len(), 1);
        assert_eq!(hazards[0].kind, HazardKind::WriteAfterWrite);
        assert_eq!(hazards[0].command, 2);
    }

    #[test]
    fn execution_dependencies_chain() {
        let mut cb = recording();
        cb.fill_buffer(buf(5), 1).unwrap();
        cb.pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::COMPUTE,
            &[BufferBarrier::new(buf(5), AccessFlags::TRANSFER_WRITE, AccessFlags::SHADER_READ)],
        )
        .unwrap();
        // Compute -> transfer extends the chain back to the first fill.
        cb.pipeline_barrier(PipelineStages::COMPUTE, PipelineStages::TRANSFER, &[])
            .unwrap();
        cb.fill_buffer(buf(5), 2).unwrap();
        assert!(check_hazards(&cb).is_empty());
    }
}
