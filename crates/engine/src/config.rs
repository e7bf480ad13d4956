//! Engine configuration parsing and validation

use std::fs;
use std::path::Path;

use fluid_kernel::FluidConfig;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Device the fluid runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Backend {
    /// CPU reference device; always available.
    #[default]
    Host,
    /// wgpu device. Requires the `gpu` feature and a suitable adapter.
    Gpu,
}

/// Top-level configuration of a headless run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Human-readable run name, used in logs.
    pub name: String,
    /// Frames to simulate before exiting.
    pub frames: u64,
    /// Which device to run on.
    pub backend: Backend,
    /// Accept integrated GPUs when no discrete GPU is present.
    pub allow_integrated: bool,
    /// Check every submitted command buffer for missing barriers.
    pub validate_hazards: bool,
    /// Optional cap on host device memory, in bytes.
    pub host_memory_limit: Option<u64>,
    /// Log a progress line every this many frames. 0 disables it.
    pub log_interval: u64,
    /// Fluid parameters.
    pub fluid: FluidConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "fluid".to_string(),
            frames: 240,
            backend: Backend::Host,
            allow_integrated: false,
            validate_hazards: cfg!(debug_assertions),
            host_memory_limit: None,
            log_interval: 60,
            fluid: FluidConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("name must not be empty".to_string()));
        }
        if self.frames == 0 {
            return Err(EngineError::Config("frames must be at least 1".to_string()));
        }
        if self.host_memory_limit == Some(0) {
            return Err(EngineError::Config(
                "host_memory_limit must be positive when set".to_string(),
            ));
        }
        self.fluid
            .validate()
            .map_err(|e| EngineError::Config(format!("fluid: {e}")))
    }
}
