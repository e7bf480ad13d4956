//! Headless fluid runner
//!
//! Usage: `fluid-engine [config.json]`. Without a path the default
//! configuration is used.

use std::process::ExitCode;

use fluid_engine::{run_headless, EngineConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fluid_engine=info,fluid_kernel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            tracing::info!("Loading config: {}", path);
            match EngineConfig::load(&path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!("{e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        None => EngineConfig::default(),
    };

    tracing::info!(name = %config.name, backend = ?config.backend, frames = config.frames, "starting");
    match run_headless(config) {
        Ok(summary) => {
            tracing::info!(
                frames = summary.frames,
                fps = summary.frames_per_sec,
                occupied_keys = summary.occupied_keys,
                mean_density = summary.mean_density,
                max_speed = summary.max_speed,
                "run complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
