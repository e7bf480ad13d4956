//! Headless frame loop for the particle fluid
//!
//! This crate wraps [`fluid_kernel::FluidSystem`] with what a running
//! application needs around it:
//! - JSON configuration ([`EngineConfig`])
//! - Seeded initial particle state
//! - Frames-in-flight pacing with per-slot fence waits ([`FramePacer`])
//! - A frame loop with an optional [`RenderHook`]
//! - Backend selection between the host device and the wgpu device

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod frame;
pub mod init;
pub mod runner;

pub use config::{Backend, EngineConfig};
pub use error::{EngineError, Result};
pub use frame::FramePacer;
pub use runner::{Engine, RenderHook, RunSummary};

use fluid_kernel::gpu::host::HostDevice;

/// Build the configured backend and run every frame without a renderer.
///
/// # Example
/// ```
/// use fluid_engine::{run_headless, EngineConfig};
/// use fluid_kernel::FluidConfig;
///
/// let config = EngineConfig {
///     frames: 2,
///     fluid: FluidConfig { local_size: 64, ..FluidConfig::with_particles(128) },
///     ..EngineConfig::default()
/// };
/// let summary = run_headless(config)?;
/// assert_eq!(summary.frames, 2);
/// # Ok::<(), fluid_engine::EngineError>(())
/// ```
pub fn run_headless(config: EngineConfig) -> Result<RunSummary> {
    config.validate()?;
    match config.backend {
        Backend::Host => {
            tracing::info!("Creating host device...");
            let mut device =
                HostDevice::new(config.fluid.local_size).with_validation(config.validate_hazards);
            if let Some(limit) = config.host_memory_limit {
                device = device.with_memory_limit(limit);
            }
            Engine::new(device, config)?.run(None)
        }
        #[cfg(feature = "gpu")]
        Backend::Gpu => {
            use fluid_kernel::gpu::wgpu_device::{AdapterPolicy, WgpuDevice};

            tracing::info!("Creating GPU device...");
            let policy = AdapterPolicy {
                allow_integrated: config.allow_integrated,
            };
            let device = WgpuDevice::new(policy, config.fluid.local_size)?
                .with_validation(config.validate_hazards);
            Engine::new(device, config)?.run(None)
        }
        #[cfg(not(feature = "gpu"))]
        Backend::Gpu => Err(EngineError::Config(
            "GPU backend requested but the `gpu` feature is not enabled. Compile with --features gpu"
                .to_string(),
        )),
    }
}
