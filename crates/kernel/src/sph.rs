//! Smoothing kernels and the per-particle SPH operators shared by the host
//! compute programs.
//!
//! The WGSL programs in `gpu/shaders/` implement the same formulas; keep the
//! two in step.

use std::f32::consts::PI;

use crate::particle::ParticleRecord;
use crate::spatial::SpatialHash;
use crate::EMPTY_CELL;

/// Spiky kernel with a squared falloff.
///
/// ```text
/// W(d, r) = 15 / (2 pi r^5) * (r - d)^2    for d < r
/// W(d, r) = 0                               otherwise
/// ```
///
/// Integrates to 1 over the ball of radius `r`.
pub fn spiky_pow2(distance: f32, radius: f32) -> f32 {
    if distance >= radius {
        return 0.0;
    }
    let v = radius - distance;
    v * v * 15.0 / (2.0 * PI * radius.powi(5))
}

/// Radial derivative of [`spiky_pow2`]. Negative inside the support.
///
/// ```text
/// dW/dd = -15 / (pi r^5) * (r - d)    for d < r
/// ```
pub fn spiky_pow2_derivative(distance: f32, radius: f32) -> f32 {
    if distance >= radius {
        return 0.0;
    }
    let v = radius - distance;
    -v * 15.0 / (PI * radius.powi(5))
}

#[inline]
fn sub(a: [f32; 4], b: [f32; 4]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
fn length(v: [f32; 3]) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// Visit every sorted index whose key matches one of the 27 cells around
/// `position`, using the lookup table to jump to the start of each run.
///
/// Hash collisions can yield particles from unrelated cells; callers filter
/// by distance.
pub fn for_each_candidate<F: FnMut(usize)>(
    hash: &SpatialHash,
    particles: &[ParticleRecord],
    table: &[u32],
    position: [f32; 3],
    mut visit: F,
) {
    for key in hash.neighbor_keys(position) {
        let Some(&start) = table.get(key as usize) else {
            continue;
        };
        if start == EMPTY_CELL {
            continue;
        }
        let mut j = start as usize;
        while j < particles.len() && particles[j].key() == key {
            visit(j);
            j += 1;
        }
    }
}

/// Density at sorted particle `i`, self contribution included.
pub fn density_at(
    hash: &SpatialHash,
    particles: &[ParticleRecord],
    table: &[u32],
    i: usize,
    mass: f32,
) -> f32 {
    let radius = hash.radius();
    let center = particles[i].predicted_position;
    let mut density = 0.0;
    for_each_candidate(hash, particles, table, xyz(center), |j| {
        let distance = length(sub(particles[j].predicted_position, center));
        if distance < radius {
            density += mass * spiky_pow2(distance, radius);
        }
    });
    density
}

/// Physical constants consumed by [`integrate_particle`].
#[derive(Debug, Clone, Copy)]
pub struct MotionParams {
    /// Integration step (seconds).
    pub time_step: f32,
    /// Density at which pressure vanishes.
    pub rest_density: f32,
    /// Stiffness applied to the density error.
    pub pressure_multiplier: f32,
    /// Acceleration along -y.
    pub gravity: f32,
    /// Mass of every particle.
    pub mass: f32,
    /// Half-extent of the cubic container.
    pub half_extent: f32,
    /// Velocity fraction kept on wall contact.
    pub damping: f32,
}

/// Pressure from the density error.
#[inline]
pub fn pressure(density: f32, params: &MotionParams) -> f32 {
    (density - params.rest_density) * params.pressure_multiplier
}

/// New state of sorted particle `i`: symmetric pressure force plus gravity,
/// explicit Euler step, then reflection off the container walls with
/// damping. `position.w` (the key) and the predicted position carry over.
pub fn integrate_particle(
    hash: &SpatialHash,
    particles: &[ParticleRecord],
    table: &[u32],
    density: &[f32],
    i: usize,
    params: &MotionParams,
) -> ParticleRecord {
    let radius = hash.radius();
    let current = particles[i];
    let center = current.predicted_position;
    let density_i = density[i];
    let pressure_i = pressure(density_i, params);

    let mut force = [0.0f32; 3];
    for_each_candidate(hash, particles, table, xyz(center), |j| {
        if j == i {
            return;
        }
        let offset = sub(particles[j].predicted_position, center);
        let distance = length(offset);
        let density_j = density[j];
        if distance >= radius || distance <= 0.0 || density_j <= 0.0 {
            return;
        }
        let shared = 0.5 * (pressure_i + pressure(density_j, params));
        let scale = spiky_pow2_derivative(distance, radius) * shared * params.mass / density_j;
        for axis in 0..3 {
            force[axis] += offset[axis] / distance * scale;
        }
    });

    let mut velocity = xyz(current.velocity);
    let mut position = xyz(current.position);
    for axis in 0..3 {
        let mut acceleration = if density_i > 0.0 { force[axis] / density_i } else { 0.0 };
        if axis == 1 {
            acceleration -= params.gravity;
        }
        velocity[axis] += acceleration * params.time_step;
        position[axis] += velocity[axis] * params.time_step;

        if position[axis].abs() > params.half_extent {
            position[axis] = params.half_extent.copysign(position[axis]);
            velocity[axis] *= -params.damping;
        }
    }

    ParticleRecord {
        position: [position[0], position[1], position[2], current.position[3]],
        velocity: [velocity[0], velocity[1], velocity[2], 0.0],
        predicted_position: current.predicted_position,
    }
}

#[inline]
fn xyz(v: [f32; 4]) -> [f32; 3] {
    [v[0], v[1], v[2]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HashConstants;

    #[test]
    fn kernel_is_zero_outside_support() {
        assert_eq!(spiky_pow2(0.2, 0.2), 0.0);
        assert_eq!(spiky_pow2(0.3, 0.2), 0.0);
        assert_eq!(spiky_pow2_derivative(0.25, 0.2), 0.0);
    }

    #[test]
    fn derivative_is_negative_inside_support() {
        assert!(spiky_pow2_derivative(0.05, 0.2) < 0.0);
        assert!(spiky_pow2(0.05, 0.2) > spiky_pow2(0.1, 0.2));
    }

    #[test]
    fn kernel_normalization_numerical() {
        let radius = 0.2_f32;
        let steps = 4000;
        let dr = radius / steps as f32;
        let mut integral = 0.0_f64;
        for k in 0..steps {
            let d = (k as f32 + 0.5) * dr;
            integral += (4.0 * PI * d * d * spiky_pow2(d, radius) * dr) as f64;
        }
        assert!((integral - 1.0).abs() < 1e-3, "integral = {integral}");
    }

    fn sorted_with_table(positions: &[[f32; 3]], hash: &SpatialHash) -> (Vec<ParticleRecord>, Vec<u32>) {
        let mut particles: Vec<ParticleRecord> = positions
            .iter()
            .map(|p| {
                let mut r = ParticleRecord::at(*p);
                r.set_key(hash.key(*p));
                r
            })
            .collect();
        particles.sort_by_key(|p| p.key());
        let mut table = vec![EMPTY_CELL; hash.key_range() as usize];
        for (i, p) in particles.iter().enumerate() {
            if i == 0 || particles[i - 1].key() != p.key() {
                table[p.key() as usize] = i as u32;
            }
        }
        (particles, table)
    }

    #[test]
    fn isolated_particle_density_is_self_contribution() {
        let hash = SpatialHash::new(0.2, HashConstants::default(), 8);
        let (particles, table) = sorted_with_table(&[[0.0, 0.0, 0.0], [3.0, 3.0, 3.0]], &hash);
        let d = density_at(&hash, &particles, &table, 0, 1.0);
        assert!((d - spiky_pow2(0.0, 0.2)).abs() < 1e-3);
    }

    #[test]
    fn close_pair_repels() {
        let hash = SpatialHash::new(0.2, HashConstants::default(), 16);
        let (particles, table) = sorted_with_table(&[[0.0, 0.0, 0.0], [0.05, 0.0, 0.0]], &hash);
        let density: Vec<f32> = (0..particles.len())
            .map(|i| density_at(&hash, &particles, &table, i, 1.0))
            .collect();
        let params = MotionParams {
            time_step: 0.01,
            rest_density: 0.0,
            pressure_multiplier: 1.0,
            gravity: 0.0,
            mass: 1.0,
            half_extent: 10.0,
            damping: 1.0,
        };
        let left = particles.iter().position(|p| p.position[0] == 0.0).unwrap();
        let moved = integrate_particle(&hash, &particles, &table, &density, left, &params);
        assert!(moved.velocity[0] < 0.0, "left particle should be pushed to -x");
        assert_eq!(moved.position[3], particles[left].position[3]);
    }

    #[test]
    fn walls_reflect_with_damping() {
        let hash = SpatialHash::new(0.2, HashConstants::default(), 1);
        let mut particle = ParticleRecord::at([0.99, 0.0, 0.0]);
        particle.velocity = [10.0, 0.0, 0.0, 0.0];
        let particles = vec![particle];
        let table = vec![0];
        let params = MotionParams {
            time_step: 0.01,
            rest_density: 0.0,
            pressure_multiplier: 0.0,
            gravity: 0.0,
            mass: 1.0,
            half_extent: 1.0,
            damping: 0.5,
        };
        let moved = integrate_particle(&hash, &particles, &table, &[1.0], 0, &params);
        assert_eq!(moved.position[0], 1.0);
        assert_eq!(moved.velocity[0], -5.0);
    }
}
