//! Error type shared by every kernel component.

use thiserror::Error;

use crate::gpu::command::CommandBufferState;
use crate::gpu::validation::Hazard;

/// Errors raised while building or recording the fluid pipeline.
///
/// Construction-time variants (`Allocation`, `KernelBuild`, `Binding`,
/// `InvalidConfig`, `NoAdapter`) are fatal: callers are expected to abort
/// startup. Caller-contract variants (`SizeMismatch`, `CommandState`,
/// `NotPrepared`) are reported instead of being silently tolerated.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Device memory could not be allocated.
    #[error("allocation of {requested} bytes for `{label}` failed: {reason}")]
    Allocation {
        /// Debug label of the buffer being created.
        label: String,
        /// Requested size in bytes.
        requested: u64,
        /// Backend-specific reason.
        reason: String,
    },

    /// A compute program could not be created.
    #[error("kernel `{label}` failed to build: {reason}")]
    KernelBuild {
        /// Debug label of the kernel.
        label: String,
        /// Backend-specific reason.
        reason: String,
    },

    /// A binding set or layout could not be created, or does not match what
    /// a kernel expects.
    #[error("binding error: {0}")]
    Binding(String),

    /// Two buffers passed to a copy or sort disagree in size.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Size the operation was configured for.
        expected: u64,
        /// Size of the buffer that was passed.
        actual: u64,
    },

    /// A command buffer was used in the wrong lifecycle state.
    #[error("command buffer `{label}` is {found}, expected {expected}")]
    CommandState {
        /// Debug label of the command buffer.
        label: String,
        /// State the operation requires.
        expected: CommandBufferState,
        /// State the buffer was actually in.
        found: CommandBufferState,
    },

    /// `run` was called before `prepare`.
    #[error("{0} has not been prepared")]
    NotPrepared(&'static str),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No adapter satisfied the selection policy.
    #[error("no suitable GPU adapter: {0}")]
    NoAdapter(String),

    /// The device rejected a submission or lost its context.
    #[error("device error: {0}")]
    Device(String),

    /// Hazard validation found unsynchronized accesses in a command buffer.
    #[error("{} unsynchronized access(es) in `{label}`, first: {}", .hazards.len(), .hazards[0])]
    Hazard {
        /// Debug label of the offending command buffer.
        label: String,
        /// Every hazard found, in recording order. Never empty.
        hazards: Vec<Hazard>,
    },

    /// A diagnostic readback failed.
    #[error("readback failed: {0}")]
    Readback(String),
}

/// Kernel result alias.
pub type Result<T> = std::result::Result<T, KernelError>;
