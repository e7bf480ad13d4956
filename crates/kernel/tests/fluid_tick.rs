//! Fluid tick end to end on the host device: ping-pong, sort order, lookup
//! table, density and the render binding.

use fluid_kernel::gpu::host::HostDevice;
use fluid_kernel::gpu::validation::check_hazards;
use fluid_kernel::gpu::{BindPoint, BindingBuilder, CommandBuffer, CommandPool, PipelineHandle};
use fluid_kernel::{
    FluidConfig, FluidSnapshot, FluidSystem, KernelError, ParticleRecord, SpatialHash, EMPTY_CELL,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn config(n: u32) -> FluidConfig {
    FluidConfig {
        local_size: 64,
        ..FluidConfig::with_particles(n)
    }
}

fn cloud(n: u32, half_extent: f32, seed: u64) -> Vec<ParticleRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let mut p = ParticleRecord::at([
                rng.gen_range(-half_extent..half_extent),
                rng.gen_range(-half_extent..half_extent),
                rng.gen_range(-half_extent..half_extent),
            ]);
            p.velocity = [rng.gen_range(-1.0..1.0), 0.0, rng.gen_range(-1.0..1.0), 0.0];
            p
        })
        .collect()
}

struct Scene {
    device: HostDevice,
    pool: CommandPool,
    fluid: FluidSystem,
}

impl Scene {
    fn new(config: FluidConfig, particles: &[ParticleRecord]) -> Self {
        let mut device = HostDevice::new(config.local_size).with_validation(true);
        let mut builder = BindingBuilder::new();
        let mut pool = CommandPool::new("fluid_test");
        let mut fluid = FluidSystem::new(&mut device, &mut builder, config).unwrap();
        fluid.upload_particles(&mut device, &mut pool, particles).unwrap();
        Self { device, pool, fluid }
    }

    fn tick(&mut self) {
        let fluid = &mut self.fluid;
        self.pool
            .immediate(&mut self.device, |commands| fluid.run(commands))
            .unwrap();
    }

    fn snapshot(&mut self) -> FluidSnapshot {
        self.fluid.snapshot(&mut self.device).unwrap()
    }
}

#[test]
fn ticks_alternate_buffers() {
    let mut scene = Scene::new(config(32), &cloud(32, 0.5, 1));
    let first = scene.fluid.particle_buffer(scene.fluid.read_index());
    for tick in 1..=4u64 {
        let before = scene.fluid.read_index();
        scene.tick();
        assert_ne!(scene.fluid.read_index(), before);
        assert_eq!(scene.fluid.ticks(), tick);
        assert_ne!(
            scene.fluid.particle_buffer(scene.fluid.read_index()),
            scene.fluid.particle_buffer(scene.fluid.write_index())
        );
    }
    assert_eq!(scene.fluid.particle_buffer(scene.fluid.read_index()), first);
}

#[test]
fn state_is_sorted_by_key_after_a_tick() {
    let n = 400;
    let mut scene = Scene::new(config(n), &cloud(n, 0.6, 2));
    scene.tick();
    let snapshot = scene.snapshot();
    let hash = SpatialHash::from_config(scene.fluid.config());

    assert_eq!(snapshot.particles.len(), n as usize);
    for pair in snapshot.particles.windows(2) {
        assert!(pair[0].key() <= pair[1].key());
    }
    for p in &snapshot.particles {
        assert!(p.key() < n);
        let q = p.predicted_position;
        assert_eq!(p.key(), hash.key([q[0], q[1], q[2]]));
    }
}

#[test]
fn lookup_points_at_first_particle_of_each_key() {
    let n = 300;
    let mut scene = Scene::new(config(n), &cloud(n, 1.0, 3));
    scene.tick();
    scene.tick();
    let snapshot = scene.snapshot();

    assert_eq!(snapshot.lookup.len(), n as usize);
    for (key, &start) in snapshot.lookup.iter().enumerate() {
        let first = snapshot.particles.iter().position(|p| p.key() as usize == key);
        match first {
            Some(index) => assert_eq!(start, index as u32, "key {key}"),
            None => assert_eq!(start, EMPTY_CELL, "key {key}"),
        }
    }
}

#[test]
fn densities_are_finite_and_include_self() {
    let n = 256;
    let mut scene = Scene::new(config(n), &cloud(n, 0.4, 4));
    scene.tick();
    let snapshot = scene.snapshot();
    let fluid_config = scene.fluid.config();
    let own = fluid_config.particle_mass
        * fluid_kernel::sph::spiky_pow2(0.0, fluid_config.smoothing_radius);

    assert_eq!(snapshot.density.len(), n as usize);
    for &d in &snapshot.density {
        assert!(d.is_finite());
        assert!(d >= own * 0.999, "density {d} below self contribution {own}");
    }
}

#[test]
fn particles_stay_inside_bounds() {
    let n = 128;
    let mut particles = cloud(n, 0.5, 5);
    particles[0].velocity = [4000.0, 0.0, 0.0, 0.0];
    let mut scene = Scene::new(config(n), &particles);
    for _ in 0..3 {
        scene.tick();
    }
    let limit = scene.fluid.config().bounds_half_extent;
    for p in scene.snapshot().particles {
        for axis in 0..3 {
            assert!(p.position[axis].is_finite());
            assert!(p.position[axis].abs() <= limit);
        }
    }
}

#[test]
fn identical_input_gives_identical_state() {
    let particles = cloud(200, 0.8, 6);
    let mut a = Scene::new(config(200), &particles);
    let mut b = Scene::new(config(200), &particles);
    for _ in 0..2 {
        a.tick();
        b.tick();
    }
    let (sa, sb) = (a.snapshot(), b.snapshot());
    assert_eq!(sa.particles, sb.particles);
    assert_eq!(sa.density, sb.density);
    assert_eq!(sa.lookup, sb.lookup);
}

#[test]
fn render_binding_follows_the_new_state() {
    let mut scene = Scene::new(config(64), &cloud(64, 0.5, 7));
    let pipeline = PipelineHandle(42);
    for _ in 0..2 {
        let fluid = &mut scene.fluid;
        scene
            .pool
            .immediate(&mut scene.device, |commands| {
                fluid.run(commands)?;
                fluid.bind_particles_for_render(commands, pipeline, BindPoint::Graphics)
            })
            .unwrap();
        let bound = scene.device.last_render_binding().unwrap();
        assert_eq!(bound.pipeline, pipeline);
        assert_eq!(bound.bind_point, BindPoint::Graphics);
        assert_eq!(bound.buffer, scene.fluid.particle_buffer(scene.fluid.read_index()));
    }
}

#[test]
fn several_ticks_in_one_buffer_have_no_hazards() {
    let mut device = HostDevice::new(64);
    let mut builder = BindingBuilder::new();
    let mut fluid = FluidSystem::new(&mut device, &mut builder, config(100)).unwrap();
    let mut commands = CommandBuffer::new("ticks");
    commands.begin().unwrap();
    for _ in 0..3 {
        fluid.run(&mut commands).unwrap();
    }
    fluid
        .bind_particles_for_render(&mut commands, PipelineHandle(1), BindPoint::Graphics)
        .unwrap();
    commands.end().unwrap();
    let hazards = check_hazards(&commands);
    assert!(hazards.is_empty(), "{hazards:?}");
}

#[test]
fn single_particle_fluid_runs() {
    let mut scene = Scene::new(config(1), &[ParticleRecord::at([0.1, 0.2, 0.3])]);
    scene.tick();
    let snapshot = scene.snapshot();
    assert_eq!(snapshot.lookup, vec![0]);
    assert_eq!(snapshot.particles[0].key(), 0);
    assert!(snapshot.particles[0].velocity[1] < 0.0);
}

#[test]
fn memory_limit_surfaces_as_allocation_error() {
    let mut device = HostDevice::new(64).with_memory_limit(4096);
    let mut builder = BindingBuilder::new();
    let err = FluidSystem::new(&mut device, &mut builder, config(1000)).unwrap_err();
    assert!(matches!(err, KernelError::Allocation { .. }));
}

#[test]
fn submission_counts_match_the_recorded_tick() {
    let mut scene = Scene::new(config(50), &cloud(50, 0.5, 8));
    let before = scene.device.stats();
    scene.tick();
    let after = scene.device.stats();
    let per_tick = 5 + scene.fluid.sort().dispatches_per_sort() as u64;
    assert_eq!(after.submissions - before.submissions, 1);
    assert_eq!(after.dispatches - before.dispatches, per_tick);
}
