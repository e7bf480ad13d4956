//! Spatial key assignment.
//!
//! A position is quantized to an integer grid cell of edge `radius`, the
//! cell is folded into one hash with three large multipliers, and the hash is
//! reduced into `[0, key_range)`. The same arithmetic runs in the
//! `assign_keys` compute program; both must agree bit for bit.

use crate::config::{FluidConfig, HashConstants};

/// Integer cell coordinate.
pub type Cell = [i32; 3];

/// Offsets of the 27 cells in a 3x3x3 neighbourhood.
pub const NEIGHBOR_OFFSETS: [Cell; 27] = {
    let mut out = [[0i32; 3]; 27];
    let mut i = 0;
    while i < 27 {
        out[i] = [(i % 3) as i32 - 1, ((i / 3) % 3) as i32 - 1, (i / 9) as i32 - 1];
        i += 1;
    }
    out
};

/// Position to key mapping, built from explicit configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialHash {
    radius: f32,
    constants: HashConstants,
    key_range: u32,
}

impl SpatialHash {
    /// Hash over `key_range` keys with cell edge `radius`.
    ///
    /// `key_range` is clamped into `1..=i32::MAX` so every key computation is
    /// defined. A non-positive `radius` collapses positions onto saturated
    /// cells; [`FluidConfig::validate`] rejects it before it gets here.
    pub fn new(radius: f32, constants: HashConstants, key_range: u32) -> Self {
        Self {
            radius,
            constants,
            key_range: key_range.clamp(1, i32::MAX as u32),
        }
    }

    /// Hash for a fluid of `config.particle_count` particles.
    pub fn from_config(config: &FluidConfig) -> Self {
        Self::new(config.smoothing_radius, config.hash, config.particle_count)
    }

    /// Cell containing `position`. Uses floor, so negative coordinates round
    /// toward negative infinity.
    #[inline]
    pub fn cell(&self, position: [f32; 3]) -> Cell {
        [
            (position[0] / self.radius).floor() as i32,
            (position[1] / self.radius).floor() as i32,
            (position[2] / self.radius).floor() as i32,
        ]
    }

    /// Wrapping 32-bit hash of a cell.
    #[inline]
    pub fn hash_cell(&self, cell: Cell) -> i32 {
        cell[0]
            .wrapping_mul(self.constants.k1 as i32)
            .wrapping_add(cell[1].wrapping_mul(self.constants.k2 as i32))
            .wrapping_add(cell[2].wrapping_mul(self.constants.k3 as i32))
    }

    /// Key of a cell in `[0, key_range)`.
    #[inline]
    pub fn key_for_cell(&self, cell: Cell) -> u32 {
        self.hash_cell(cell).rem_euclid(self.key_range as i32) as u32
    }

    /// Key of the cell containing `position`.
    #[inline]
    pub fn key(&self, position: [f32; 3]) -> u32 {
        self.key_for_cell(self.cell(position))
    }

    /// Distinct keys of the 27 cells around `position`, in offset order.
    ///
    /// Neighbouring cells may collide onto one key; each key is returned once
    /// so a key's run of particles is visited only once.
    pub fn neighbor_keys(&self, position: [f32; 3]) -> Vec<u32> {
        let center = self.cell(position);
        let mut keys = Vec::with_capacity(NEIGHBOR_OFFSETS.len());
        for offset in NEIGHBOR_OFFSETS {
            let key = self.key_for_cell([
                center[0].wrapping_add(offset[0]),
                center[1].wrapping_add(offset[1]),
                center[2].wrapping_add(offset[2]),
            ]);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Cell edge length.
    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// Number of distinct keys.
    pub fn key_range(&self) -> u32 {
        self.key_range
    }
}
