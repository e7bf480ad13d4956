//! Host-side mirrors of the parameter blocks read by the compute programs.
//!
//! Both structs must match the `DispatchParams` / `SimParams` declarations in
//! `shaders/common.wgsl` field for field.

use crate::config::FluidConfig;

/// Per-dispatch parameter block.
///
/// Not every program reads every field; unused ones are zero.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DispatchParams {
    /// Number of elements the dispatch covers. Invocations at or past it
    /// return immediately.
    pub count: u32,
    /// Radix pass (key bit) for the sort programs.
    pub pass: u32,
    /// Scan stride for `scan_step`.
    pub stride: u32,
    /// Fill value for buffer fills.
    pub value: u32,
    /// Record stride in 32-bit words.
    pub record_words: u32,
    /// Word index of the key inside a record.
    pub key_word: u32,
    pub _pad0: u32,
    pub _pad1: u32,
}

impl DispatchParams {
    /// Params covering `count` elements, everything else zero.
    pub fn count(count: u32) -> Self {
        Self {
            count,
            ..Self::default()
        }
    }
}

/// Simulation uniform, written once at construction.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SimulationParams {
    pub smoothing_radius: f32,
    pub time_step: f32,
    pub rest_density: f32,
    pub pressure_multiplier: f32,
    pub gravity: f32,
    pub particle_mass: f32,
    pub bounds_half_extent: f32,
    pub collision_damping: f32,
    pub particle_count: u32,
    pub table_size: u32,
    pub k1: u32,
    pub k2: u32,
    pub k3: u32,
    pub _pad0: u32,
    pub _pad1: u32,
    pub _pad2: u32,
}

impl SimulationParams {
    pub fn from_config(config: &FluidConfig) -> Self {
        Self {
            smoothing_radius: config.smoothing_radius,
            time_step: config.time_step,
            rest_density: config.rest_density,
            pressure_multiplier: config.pressure_multiplier,
            gravity: config.gravity,
            particle_mass: config.particle_mass,
            bounds_half_extent: config.bounds_half_extent,
            collision_damping: config.collision_damping,
            particle_count: config.particle_count,
            table_size: config.table_size,
            k1: config.hash.k1,
            k2: config.hash.k2,
            k3: config.hash.k3,
            _pad0: 0,
            _pad1: 0,
            _pad2: 0,
        }
    }
}
