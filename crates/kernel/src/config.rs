//! Fluid configuration: particle capacity, spatial hash constants and the
//! physical parameters uploaded to the simulation uniform.

use serde::{Deserialize, Serialize};

/// Largest particle count whose keys are exactly representable in the `f32`
/// key slot of [`crate::ParticleRecord`].
pub const MAX_PARTICLES: u32 = 1 << 24;

/// Workgroups a single dispatch may launch along x. This is the portable
/// WebGPU default for `max_compute_workgroups_per_dimension`.
pub const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65_535;

/// Large odd multipliers folding a 3D cell coordinate into one hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashConstants {
    /// Multiplier for the x cell coordinate.
    pub k1: u32,
    /// Multiplier for the y cell coordinate.
    pub k2: u32,
    /// Multiplier for the z cell coordinate.
    pub k3: u32,
}

impl Default for HashConstants {
    fn default() -> Self {
        Self {
            k1: 15823,
            k2: 9737333,
            k3: 440817757,
        }
    }
}

/// Everything a [`crate::FluidSystem`] needs at construction.
///
/// All fields have serde defaults so a partial JSON object is accepted.
///
/// Keys are reduced into `[0, particle_count)` and index the lookup table
/// directly, so `table_size` defaults to the particle count. A table smaller
/// than N (such as 17658 cells for 20000 particles) would be indexed out of
/// range and is rejected by [`FluidConfig::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FluidConfig {
    /// Particle capacity N. Fixed for the lifetime of the system.
    pub particle_count: u32,
    /// Grid cell edge and kernel support radius.
    pub smoothing_radius: f32,
    /// Spatial hash multipliers.
    pub hash: HashConstants,
    /// Number of cells C in the spatial lookup table. Must be >= N.
    pub table_size: u32,
    /// Host frames that may be recorded ahead of the device.
    pub frames_in_flight: u32,
    /// Threads per workgroup for every compute program.
    pub local_size: u32,
    /// Fixed integration step (seconds).
    pub time_step: f32,
    /// Target density the pressure term pushes toward.
    pub rest_density: f32,
    /// Stiffness applied to the density error.
    pub pressure_multiplier: f32,
    /// Gravitational acceleration along -y.
    pub gravity: f32,
    /// Mass carried by each particle.
    pub particle_mass: f32,
    /// Half-extent of the cubic container.
    pub bounds_half_extent: f32,
    /// Fraction of velocity kept after hitting a wall.
    pub collision_damping: f32,
    /// Half-extent of the cube initial positions are drawn from.
    pub spawn_half_extent: f32,
    /// Seed for initial particle placement.
    pub seed: u64,
}

impl Default for FluidConfig {
    fn default() -> Self {
        Self {
            particle_count: 20_000,
            smoothing_radius: 0.2,
            hash: HashConstants::default(),
            table_size: 20_000,
            frames_in_flight: 4,
            local_size: 256,
            time_step: 1.0 / 120.0,
            rest_density: 320.0,
            pressure_multiplier: 500.0,
            gravity: 9.81,
            particle_mass: 1.0,
            bounds_half_extent: 6.0,
            collision_damping: 0.95,
            spawn_half_extent: 5.0,
            seed: 0x5eed,
        }
    }
}

impl FluidConfig {
    /// Default configuration resized to `particle_count` particles, with the
    /// lookup table sized to match.
    pub fn with_particles(particle_count: u32) -> Self {
        Self {
            particle_count,
            table_size: particle_count,
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.particle_count == 0 {
            return Err("particle_count must be at least 1".to_string());
        }
        if self.particle_count > MAX_PARTICLES {
            return Err(format!(
                "particle_count {} exceeds {} (keys are stored as f32)",
                self.particle_count, MAX_PARTICLES
            ));
        }
        // Keys live in [0, N) and index the table directly.
        if self.table_size < self.particle_count {
            return Err(format!(
                "table_size {} must be >= particle_count {}",
                self.table_size, self.particle_count
            ));
        }
        if self.smoothing_radius <= 0.0 {
            return Err("smoothing_radius must be positive".to_string());
        }
        if self.frames_in_flight == 0 {
            return Err("frames_in_flight must be at least 1".to_string());
        }
        if !self.local_size.is_power_of_two() || self.local_size > 1024 {
            return Err("local_size must be a power of two no larger than 1024".to_string());
        }
        // Dispatches launch one workgroup past ceil(N / local_size).
        let groups = self.particle_count.div_ceil(self.local_size) + 1;
        if groups > MAX_WORKGROUPS_PER_DIMENSION {
            return Err(format!(
                "particle_count {} needs {groups} workgroups of {} (limit {}); raise local_size",
                self.particle_count, self.local_size, MAX_WORKGROUPS_PER_DIMENSION
            ));
        }
        if self.time_step <= 0.0 {
            return Err("time_step must be positive".to_string());
        }
        if self.particle_mass <= 0.0 {
            return Err("particle_mass must be positive".to_string());
        }
        if self.bounds_half_extent <= 0.0 {
            return Err("bounds_half_extent must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.collision_damping) {
            return Err("collision_damping must be in [0, 1]".to_string());
        }
        if self.spawn_half_extent < 0.0 {
            return Err("spawn_half_extent must be non-negative".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = FluidConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.particle_count, 20_000);
        assert_eq!(config.frames_in_flight, 4);
        assert_eq!(config.hash.k2, 9737333);
    }

    #[test]
    fn table_smaller_than_key_range_is_rejected() {
        let mut config = FluidConfig::with_particles(64);
        config.table_size = 63;
        assert!(config.validate().is_err());

        config.table_size = 128;
        assert!(config.validate().is_ok());

        let mut config = FluidConfig::default();
        config.table_size = 17_658;
        assert!(config.validate().unwrap_err().contains("table_size 17658"));
    }

    #[test]
    fn particle_count_limits() {
        let mut config = FluidConfig::with_particles(0);
        assert!(config.validate().is_err());

        config = FluidConfig::with_particles(MAX_PARTICLES + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn workgroup_count_must_fit_one_dimension() {
        let mut config = FluidConfig::with_particles(MAX_PARTICLES);
        config.local_size = 256;
        let err = config.validate().unwrap_err();
        assert!(err.contains("65537 workgroups"), "{err}");

        config.local_size = 1024;
        assert!(config.validate().is_ok());

        // 65534 full groups plus the overshoot group is exactly the limit.
        let mut config = FluidConfig::with_particles(65_534 * 256);
        config.local_size = 256;
        assert!(config.validate().is_ok());
        config.particle_count += 1;
        config.table_size += 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn local_size_must_be_power_of_two() {
        let mut config = FluidConfig::with_particles(16);
        config.local_size = 96;
        assert!(config.validate().is_err());
        config.local_size = 64;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: FluidConfig =
            serde_json::from_str(r#"{ "particle_count": 512, "table_size": 512 }"#).unwrap();
        assert_eq!(config.particle_count, 512);
        assert_eq!(config.smoothing_radius, 0.2);
        assert_eq!(config.hash, HashConstants::default());
        assert!(config.validate().is_ok());
    }
}
