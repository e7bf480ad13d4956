//! CPU bodies of the compute programs.
//!
//! Each body runs invocations `0..invocations` sequentially, which is one
//! valid interleaving of the device's parallel execution. Reads and writes
//! arrive split by access, in signature order: `reads` holds the `Uniform`
//! and `Read` sets, `writes` the `ReadWrite` sets.

use crate::config::HashConstants;
use crate::gpu::{ComputeProgram, DispatchParams, SimulationParams};
use crate::particle::ParticleRecord;
use crate::spatial::SpatialHash;
use crate::sph::{self, MotionParams};

pub(crate) fn execute(
    program: ComputeProgram,
    params: &DispatchParams,
    reads: &[&[u32]],
    writes: &mut [&mut [u32]],
    invocations: u32,
) {
    match program {
        ComputeProgram::CountZeros => count_zeros(params, reads[0], writes, invocations),
        ComputeProgram::WriteDigits => write_digits(params, reads[0], writes, invocations),
        ComputeProgram::ScanStep => scan_step(params, reads[0], writes, invocations),
        ComputeProgram::Split => split(params, reads, writes, invocations),
        ComputeProgram::Predict => predict(reads, writes, invocations),
        ComputeProgram::AssignKeys => assign_keys(reads, writes, invocations),
        ComputeProgram::BuildLookup => build_lookup(reads, writes, invocations),
        ComputeProgram::Density => density(reads, writes, invocations),
        ComputeProgram::Integrate => integrate(reads, writes, invocations),
    }
}

fn simulation_params(words: &[u32]) -> SimulationParams {
    let size = std::mem::size_of::<SimulationParams>();
    bytemuck::pod_read_unaligned(&bytemuck::cast_slice::<u32, u8>(words)[..size])
}

fn spatial_hash(sim: &SimulationParams) -> SpatialHash {
    SpatialHash::new(
        sim.smoothing_radius,
        HashConstants { k1: sim.k1, k2: sim.k2, k3: sim.k3 },
        sim.particle_count,
    )
}

/// Key of record `i` in a generic record array.
#[inline]
fn record_key(records: &[u32], params: &DispatchParams, i: usize) -> u32 {
    let word = i * params.record_words as usize + params.key_word as usize;
    f32::from_bits(records[word]) as u32
}

#[inline]
fn record_count(records: &[u32], params: &DispatchParams, invocations: u32) -> usize {
    (invocations as usize).min(records.len() / params.record_words.max(1) as usize)
}

#[inline]
fn key_bit(key: u32, pass: u32) -> u32 {
    (key >> pass) & 1
}

fn count_zeros(params: &DispatchParams, keys: &[u32], writes: &mut [&mut [u32]], invocations: u32) {
    let n = record_count(keys, params, invocations);
    let offset = &mut writes[0];
    for i in 0..n {
        if key_bit(record_key(keys, params, i), params.pass) == 0 {
            offset[0] = offset[0].wrapping_add(1);
        }
    }
}

fn write_digits(params: &DispatchParams, keys: &[u32], writes: &mut [&mut [u32]], invocations: u32) {
    let n = record_count(keys, params, invocations).min(writes[0].len());
    for i in 0..n {
        let bit = key_bit(record_key(keys, params, i), params.pass);
        writes[0][i] = 1 - bit;
        writes[1][i] = 1 - bit;
        writes[2][i] = bit;
        writes[3][i] = bit;
    }
}

fn scan_step(params: &DispatchParams, src: &[u32], writes: &mut [&mut [u32]], invocations: u32) {
    let dst = &mut writes[0];
    let n = (invocations as usize).min(src.len()).min(dst.len());
    // Stride 0 would add each element to itself; treat it as a copy.
    let stride = params.stride as usize;
    for i in 0..n {
        let behind = if stride > 0 && i >= stride { src[i - stride] } else { 0 };
        dst[i] = src[i].wrapping_add(behind);
    }
}

fn split(params: &DispatchParams, reads: &[&[u32]], writes: &mut [&mut [u32]], invocations: u32) {
    let (keys, offset, zeros, ones) = (reads[0], reads[1][0], reads[2], reads[3]);
    let dst = &mut writes[0];
    let words = params.record_words as usize;
    let n = record_count(keys, params, invocations).min(zeros.len());
    for i in 0..n {
        // Inclusive scans minus the element's own indicator give exclusive
        // prefixes.
        let target = if key_bit(record_key(keys, params, i), params.pass) == 0 {
            zeros[i] - 1
        } else {
            offset + ones[i] - 1
        } as usize;
        if (target + 1) * words <= dst.len() {
            dst[target * words..(target + 1) * words]
                .copy_from_slice(&keys[i * words..(i + 1) * words]);
        }
    }
}

fn predict(reads: &[&[u32]], writes: &mut [&mut [u32]], invocations: u32) {
    let sim = simulation_params(reads[0]);
    let scratch: &[ParticleRecord] = bytemuck::cast_slice(reads[1]);
    let particles: &mut [ParticleRecord] = bytemuck::cast_slice_mut(&mut *writes[0]);
    let n = (invocations as usize).min(particles.len()).min(scratch.len());
    let half_step = 0.5 * sim.time_step;
    for i in 0..n {
        let source = scratch[i];
        particles[i].predicted_position = [
            source.position[0] + source.velocity[0] * half_step,
            source.position[1] + source.velocity[1] * half_step,
            source.position[2] + source.velocity[2] * half_step,
            0.0,
        ];
    }
}

fn assign_keys(reads: &[&[u32]], writes: &mut [&mut [u32]], invocations: u32) {
    let sim = simulation_params(reads[0]);
    let hash = spatial_hash(&sim);
    let particles: &mut [ParticleRecord] = bytemuck::cast_slice_mut(&mut *writes[0]);
    let n = (invocations as usize).min(particles.len());
    for particle in &mut particles[..n] {
        let p = particle.predicted_position;
        particle.set_key(hash.key([p[0], p[1], p[2]]));
    }
}

fn build_lookup(reads: &[&[u32]], writes: &mut [&mut [u32]], invocations: u32) {
    let particles: &[ParticleRecord] = bytemuck::cast_slice(reads[1]);
    let table = &mut writes[0];
    let n = (invocations as usize).min(particles.len());
    for i in 0..n {
        let key = particles[i].key();
        if (i == 0 || particles[i - 1].key() != key) && (key as usize) < table.len() {
            table[key as usize] = i as u32;
        }
    }
}

fn density(reads: &[&[u32]], writes: &mut [&mut [u32]], invocations: u32) {
    let sim = simulation_params(reads[0]);
    let hash = spatial_hash(&sim);
    let particles: &[ParticleRecord] = bytemuck::cast_slice(reads[1]);
    let table = reads[2];
    let density: &mut [f32] = bytemuck::cast_slice_mut(&mut *writes[0]);
    let n = (invocations as usize).min(particles.len()).min(density.len());
    for (i, out) in density.iter_mut().enumerate().take(n) {
        *out = sph::density_at(&hash, particles, table, i, sim.particle_mass);
    }
}

fn integrate(reads: &[&[u32]], writes: &mut [&mut [u32]], invocations: u32) {
    let sim = simulation_params(reads[0]);
    let hash = spatial_hash(&sim);
    let particles: &[ParticleRecord] = bytemuck::cast_slice(reads[1]);
    let table = reads[2];
    let density: &[f32] = bytemuck::cast_slice(reads[3]);
    let out: &mut [ParticleRecord] = bytemuck::cast_slice_mut(&mut *writes[0]);
    let motion = MotionParams {
        time_step: sim.time_step,
        rest_density: sim.rest_density,
        pressure_multiplier: sim.pressure_multiplier,
        gravity: sim.gravity,
        mass: sim.particle_mass,
        half_extent: sim.bounds_half_extent,
        damping: sim.collision_damping,
    };
    let n = (invocations as usize).min(particles.len()).min(out.len());
    for (i, record) in out.iter_mut().enumerate().take(n) {
        *record = sph::integrate_particle(&hash, particles, table, density, i, &motion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sort_params(pass: u32, count: u32) -> DispatchParams {
        DispatchParams {
            count,
            pass,
            record_words: 2,
            key_word: 0,
            ..DispatchParams::default()
        }
    }

    /// Two-word records: [key as f32 bits, tag].
    fn records(keys: &[u32]) -> Vec<u32> {
        keys.iter()
            .enumerate()
            .flat_map(|(tag, &k)| [(k as f32).to_bits(), tag as u32])
            .collect()
    }

    #[test]
    fn count_and_digits_agree() {
        let keys = records(&[3, 1, 0, 2]);
        let params = sort_params(0, 4);
        let mut offset = vec![0u32];
        count_zeros(&params, &keys, &mut [&mut offset], 4);
        assert_eq!(offset[0], 2);

        let (mut a, mut b, mut c, mut d) = (vec![0; 4], vec![0; 4], vec![0; 4], vec![0; 4]);
        write_digits(&params, &keys, &mut [&mut a, &mut b, &mut c, &mut d], 4);
        assert_eq!(a, vec![0, 0, 1, 1]);
        assert_eq!(a, b);
        assert_eq!(c, vec![1, 1, 0, 0]);
        assert_eq!(c, d);
    }

    #[test]
    fn scan_step_adds_stride_behind() {
        let src = vec![1, 1, 1, 1, 1];
        let mut dst = vec![0; 5];
        let params = DispatchParams { stride: 2, ..DispatchParams::count(5) };
        scan_step(&params, &src, &mut [&mut dst], 5);
        assert_eq!(dst, vec![1, 1, 2, 2, 2]);
    }

    #[test]
    fn split_is_stable() {
        // Keys [1, 0, 1, 0] on bit 0: zeros go first in original order.
        let keys = records(&[1, 0, 1, 0]);
        let zeros = vec![0, 1, 1, 2];
        let ones = vec![1, 1, 2, 2];
        let offset = vec![2];
        let mut dst = vec![0u32; keys.len()];
        split(&sort_params(0, 4), &[&keys, &offset, &zeros, &ones], &mut [&mut dst], 4);
        let tags: Vec<u32> = dst.chunks(2).map(|r| r[1]).collect();
        assert_eq!(tags, vec![1, 3, 0, 2]);
    }

    #[test]
    fn invocations_past_count_are_ignored() {
        let src = vec![5, 5, 5];
        let mut dst = vec![9; 3];
        let params = DispatchParams { stride: 1, ..DispatchParams::count(2) };
        scan_step(&params, &src, &mut [&mut dst], 2);
        assert_eq!(dst, vec![5, 10, 9]);
    }

    #[test]
    fn zero_stride_scan_step_copies() {
        let src = vec![3, 4, 5];
        let mut dst = vec![0; 3];
        scan_step(&DispatchParams::count(3), &src, &mut [&mut dst], 3);
        assert_eq!(dst, src);
    }
}
