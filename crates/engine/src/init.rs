//! Initial particle state.

use fluid_kernel::{FluidConfig, ParticleRecord};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// `config.particle_count` particles at rest, uniformly distributed in the
/// cube `[-spawn_half_extent, spawn_half_extent]^3`. The same seed always
/// gives the same particles.
pub fn spawn_particles(config: &FluidConfig) -> Vec<ParticleRecord> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let extent = config.spawn_half_extent;
    (0..config.particle_count)
        .map(|_| {
            ParticleRecord::at([
                rng.gen_range(-extent..=extent),
                rng.gen_range(-extent..=extent),
                rng.gen_range(-extent..=extent),
            ])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn particles_fill_the_spawn_cube_at_rest() {
        let config = FluidConfig::with_particles(1000);
        let particles = spawn_particles(&config);
        assert_eq!(particles.len(), 1000);
        for p in &particles {
            assert_eq!(p.velocity, [0.0; 4]);
            assert_eq!(p.key(), 0);
            for axis in 0..3 {
                assert!(p.position[axis].abs() <= config.spawn_half_extent);
            }
        }
        // Not all on one plane.
        assert!(particles.iter().any(|p| p.position[0] > 1.0));
        assert!(particles.iter().any(|p| p.position[0] < -1.0));
    }

    #[test]
    fn seed_is_deterministic() {
        let config = FluidConfig::with_particles(64);
        assert_eq!(spawn_particles(&config), spawn_particles(&config));

        let other = FluidConfig { seed: config.seed + 1, ..config.clone() };
        assert_ne!(spawn_particles(&config), spawn_particles(&other));
    }

    #[test]
    fn zero_extent_spawns_at_origin() {
        let config = FluidConfig { spawn_half_extent: 0.0, ..FluidConfig::with_particles(4) };
        for p in spawn_particles(&config) {
            assert_eq!(p.coordinate(), [0.0; 3]);
        }
    }
}
