//! Frame loop driving a [`FluidSystem`] on one device.

use std::time::Instant;

use fluid_kernel::gpu::{BindPoint, BindingBuilder, CommandBuffer, CommandPool, GpuDevice, PipelineHandle};
use fluid_kernel::{FluidSnapshot, FluidSystem, EMPTY_CELL};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::frame::FramePacer;
use crate::init::spawn_particles;

/// Renderer-side work appended to each frame after the fluid tick.
pub trait RenderHook {
    /// Pipeline the particle buffer is bound to.
    fn pipeline(&self) -> PipelineHandle;

    /// Record draw work into `commands`. The current particle buffer is
    /// already bound to [`RenderHook::pipeline`].
    fn record(&mut self, commands: &mut CommandBuffer, frame: u64) -> fluid_kernel::Result<()>;
}

/// Statistics reported at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Frames simulated.
    pub frames: u64,
    /// Wall time of the frame loop including the final drain.
    pub elapsed_secs: f64,
    /// `frames / elapsed_secs`.
    pub frames_per_sec: f64,
    /// Lookup-table entries that point at a particle.
    pub occupied_keys: usize,
    /// Mean of the final density field.
    pub mean_density: f32,
    /// Maximum of the final density field.
    pub max_density: f32,
    /// Largest particle speed in the final state.
    pub max_speed: f32,
}

impl RunSummary {
    fn from_snapshot(snapshot: &FluidSnapshot, frames: u64, elapsed_secs: f64) -> Self {
        let occupied_keys = snapshot.lookup.iter().filter(|&&s| s != EMPTY_CELL).count();
        let mean_density = if snapshot.density.is_empty() {
            0.0
        } else {
            snapshot.density.iter().sum::<f32>() / snapshot.density.len() as f32
        };
        let max_density = snapshot.density.iter().copied().fold(0.0, f32::max);
        let max_speed = snapshot
            .particles
            .iter()
            .map(|p| {
                let v = p.velocity;
                (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
            })
            .fold(0.0, f32::max);
        Self {
            frames,
            elapsed_secs,
            frames_per_sec: if elapsed_secs > 0.0 { frames as f64 / elapsed_secs } else { 0.0 },
            occupied_keys,
            mean_density,
            max_density,
            max_speed,
        }
    }
}

/// A fluid, its device and the frame pacer.
#[derive(Debug)]
pub struct Engine<D: GpuDevice> {
    config: EngineConfig,
    device: D,
    fluid: FluidSystem,
    pacer: FramePacer,
    frame: u64,
}

impl<D: GpuDevice> Engine<D> {
    /// Build the fluid on `device` and upload the spawned particles.
    pub fn new(mut device: D, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let mut builder = BindingBuilder::new();
        let mut pool = CommandPool::new("frame");
        let mut fluid = FluidSystem::new(&mut device, &mut builder, config.fluid.clone())?;
        fluid.upload_particles(&mut device, &mut pool, &spawn_particles(&config.fluid))?;
        let pacer = FramePacer::new(&mut pool, config.fluid.frames_in_flight);
        tracing::info!(
            name = %config.name,
            particles = config.fluid.particle_count,
            frames_in_flight = pacer.slots(),
            "engine ready"
        );
        Ok(Self {
            config,
            device,
            fluid,
            pacer,
            frame: 0,
        })
    }

    /// Record and submit one frame: the fluid tick, then the render hook if
    /// there is one.
    pub fn run_frame(&mut self, hook: Option<&mut (dyn RenderHook + '_)>) -> Result<()> {
        let commands = self.pacer.acquire(&mut self.device)?;
        self.fluid.run(commands)?;
        if let Some(hook) = hook {
            self.fluid
                .bind_particles_for_render(commands, hook.pipeline(), BindPoint::Graphics)?;
            hook.record(commands, self.frame)?;
        }
        self.pacer.submit(&mut self.device)?;
        self.frame += 1;
        Ok(())
    }

    /// Run the configured number of frames, then read the state back once
    /// for the summary.
    pub fn run(&mut self, mut hook: Option<&mut (dyn RenderHook + '_)>) -> Result<RunSummary> {
        let start = Instant::now();
        for _ in 0..self.config.frames {
            self.run_frame(hook.as_deref_mut())?;
            let interval = self.config.log_interval;
            if interval > 0 && self.frame % interval == 0 {
                tracing::info!(
                    frame = self.frame,
                    elapsed_secs = start.elapsed().as_secs_f64(),
                    "progress"
                );
            }
        }
        self.pacer.drain(&mut self.device)?;
        let elapsed = start.elapsed().as_secs_f64();

        let snapshot = self.fluid.snapshot(&mut self.device)?;
        let summary = RunSummary::from_snapshot(&snapshot, self.config.frames, elapsed);
        tracing::debug!(?summary, "run finished");
        Ok(summary)
    }

    /// Frames submitted so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// The simulated fluid.
    pub fn fluid(&self) -> &FluidSystem {
        &self.fluid
    }

    /// Frame slots and their tickets.
    pub fn pacer(&self) -> &FramePacer {
        &self.pacer
    }

    /// Device the fluid lives on.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Mutable device access, for readback between frames.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Configuration the engine was built from.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
