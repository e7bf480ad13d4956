//! Frame pacing, render hook and headless runs on the host device.

use fluid_engine::{Engine, EngineConfig, FramePacer, RenderHook};
use fluid_kernel::gpu::host::HostDevice;
use fluid_kernel::gpu::{
    BufferDesc, BufferHandle, CommandBuffer, CommandPool, GpuDevice, KernelDesc, KernelHandle,
    PipelineHandle, Submission,
};
use fluid_kernel::{FluidConfig, Result};

/// Host device that remembers the order of submits and waits.
#[derive(Debug)]
struct Recording {
    inner: HostDevice,
    submitted: Vec<Submission>,
    waited: Vec<Submission>,
}

impl Recording {
    fn new(local_size: u32) -> Self {
        Self {
            inner: HostDevice::new(local_size).with_validation(true),
            submitted: Vec::new(),
            waited: Vec::new(),
        }
    }
}

impl GpuDevice for Recording {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle> {
        self.inner.create_buffer(desc)
    }

    fn create_kernel(&mut self, desc: &KernelDesc<'_>) -> Result<KernelHandle> {
        self.inner.create_kernel(desc)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.write_buffer(buffer, offset, data)
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>> {
        self.inner.read_buffer(buffer)
    }

    fn submit(&mut self, commands: &CommandBuffer) -> Result<Submission> {
        let ticket = self.inner.submit(commands)?;
        self.submitted.push(ticket);
        Ok(ticket)
    }

    fn wait(&mut self, submission: Submission) -> Result<()> {
        self.waited.push(submission);
        self.inner.wait(submission)
    }

    fn local_size(&self) -> u32 {
        self.inner.local_size()
    }
}

fn small_config(n: u32, frames: u64) -> EngineConfig {
    EngineConfig {
        frames,
        validate_hazards: true,
        log_interval: 0,
        fluid: FluidConfig {
            local_size: 64,
            spawn_half_extent: 1.0,
            ..FluidConfig::with_particles(n)
        },
        ..EngineConfig::default()
    }
}

#[test]
fn pacer_waits_on_the_slot_it_reuses() {
    let mut device = Recording::new(64);
    let mut pool = CommandPool::new("frames");
    let mut pacer = FramePacer::new(&mut pool, 3);
    assert_eq!(pacer.slots(), 3);

    for frame in 0..7usize {
        assert_eq!(pacer.current_slot(), frame % 3);
        pacer.acquire(&mut device).unwrap();
        pacer.submit(&mut device).unwrap();
        assert!(pacer.in_flight() <= 3);
    }
    assert_eq!(pacer.submitted(), 7);
    // Frames 0..4 were waited on when their slots came round again.
    assert_eq!(device.waited, device.submitted[..4].to_vec());

    pacer.drain(&mut device).unwrap();
    assert_eq!(pacer.in_flight(), 0);
    assert_eq!(device.waited.len(), 7);
}

#[test]
fn first_pass_over_the_slots_does_not_wait() {
    let mut device = Recording::new(64);
    let mut pool = CommandPool::new("frames");
    let mut pacer = FramePacer::new(&mut pool, 4);
    for _ in 0..4 {
        pacer.acquire(&mut device).unwrap();
        pacer.submit(&mut device).unwrap();
    }
    assert!(device.waited.is_empty());
    assert_eq!(pacer.in_flight(), 4);
}

#[test]
fn submit_without_acquire_is_rejected() {
    let mut device = Recording::new(64);
    let mut pool = CommandPool::new("frames");
    let mut pacer = FramePacer::new(&mut pool, 2);
    assert!(pacer.submit(&mut device).is_err());
    assert!(device.submitted.is_empty());
}

struct CountingHook {
    frames: Vec<u64>,
}

impl RenderHook for CountingHook {
    fn pipeline(&self) -> PipelineHandle {
        PipelineHandle(3)
    }

    fn record(&mut self, commands: &mut CommandBuffer, frame: u64) -> Result<()> {
        assert!(!commands.commands().is_empty());
        self.frames.push(frame);
        Ok(())
    }
}

#[test]
fn engine_runs_frames_and_calls_the_hook() {
    let config = small_config(200, 6);
    let device = HostDevice::new(64).with_validation(true);
    let mut engine = Engine::new(device, config).unwrap();
    let mut hook = CountingHook { frames: Vec::new() };

    let summary = engine.run(Some(&mut hook)).unwrap();
    assert_eq!(summary.frames, 6);
    assert_eq!(hook.frames, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(engine.frame(), 6);
    assert_eq!(engine.fluid().ticks(), 6);
    assert_eq!(engine.pacer().in_flight(), 0);
    assert!(summary.occupied_keys > 0 && summary.occupied_keys <= 200);
    assert!(summary.mean_density > 0.0 && summary.mean_density.is_finite());
    assert!(summary.max_density >= summary.mean_density);

    let bound = engine.device().last_render_binding().unwrap();
    assert_eq!(bound.pipeline, PipelineHandle(3));
    assert_eq!(bound.buffer, engine.fluid().particle_buffer(engine.fluid().read_index()));
}

#[test]
fn engine_without_hook_binds_nothing() {
    let mut engine = Engine::new(HostDevice::new(64), small_config(64, 2)).unwrap();
    engine.run(None).unwrap();
    assert!(engine.device().last_render_binding().is_none());
}

#[test]
fn more_frames_than_slots_reuse_slots() {
    let mut engine = Engine::new(Recording::new(64), small_config(64, 9)).unwrap();
    engine.run(None).unwrap();
    let device = engine.device();
    // One upload submission plus nine frames.
    assert_eq!(device.submitted.len(), 10);
    // Every frame ticket is waited on exactly once: five on slot reuse, four on drain.
    let frames = &device.submitted[1..];
    for ticket in frames {
        assert_eq!(device.waited.iter().filter(|w| *w == ticket).count(), 1);
    }
}

#[test]
fn invalid_engine_config_fails_before_allocating() {
    let config = EngineConfig { frames: 0, ..small_config(64, 1) };
    let err = Engine::new(HostDevice::new(64), config).unwrap_err();
    assert!(matches!(err, fluid_engine::EngineError::Config(_)));
}

#[test]
fn memory_limit_is_reported_as_kernel_error() {
    let config = EngineConfig {
        host_memory_limit: Some(1024),
        ..small_config(1000, 1)
    };
    let err = fluid_engine::run_headless(config).unwrap_err();
    assert!(matches!(
        err,
        fluid_engine::EngineError::Kernel(fluid_kernel::KernelError::Allocation { .. })
    ));
}

#[cfg(not(feature = "gpu"))]
#[test]
fn gpu_backend_requires_the_feature() {
    let config = EngineConfig {
        backend: fluid_engine::Backend::Gpu,
        ..small_config(64, 1)
    };
    assert!(matches!(
        fluid_engine::run_headless(config),
        Err(fluid_engine::EngineError::Config(_))
    ));
}
