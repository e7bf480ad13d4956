//! Engine errors.

use std::path::PathBuf;

use fluid_kernel::KernelError;
use thiserror::Error;

/// Everything that can stop the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::EngineConfig`].
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The fluid kernel failed.
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Engine result alias.
pub type Result<T> = std::result::Result<T, EngineError>;
