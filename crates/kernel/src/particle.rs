//! Particle records and the double-buffered particle store.
//!
//! Records are array-of-structs with `vec4` members so the same bytes are
//! readable by compute programs, the vertex stage and the host.

use crate::error::Result;
use crate::gpu::{BufferDesc, BufferHandle, BufferUsage, GpuDevice};

/// One particle as laid out in device memory.
///
/// `position.w` carries the particle's spatial key as an exactly
/// representable `f32` integer; the sort reads it from word
/// [`ParticleRecord::KEY_WORD`].
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ParticleRecord {
    /// xyz = coordinate, w = sort key.
    pub position: [f32; 4],
    /// xyz = velocity, w unused.
    pub velocity: [f32; 4],
    /// xyz = half-step predicted position, w unused.
    pub predicted_position: [f32; 4],
}

impl ParticleRecord {
    /// Size of one record in bytes.
    pub const SIZE: u32 = std::mem::size_of::<ParticleRecord>() as u32;
    /// Index of the 32-bit word holding the key.
    pub const KEY_WORD: u32 = 3;

    /// A particle at rest at `position` with key 0.
    pub fn at(position: [f32; 3]) -> Self {
        Self {
            position: [position[0], position[1], position[2], 0.0],
            velocity: [0.0; 4],
            predicted_position: [position[0], position[1], position[2], 0.0],
        }
    }

    /// Spatial key stored in `position.w`.
    #[inline]
    pub fn key(&self) -> u32 {
        self.position[3] as u32
    }

    /// Overwrite the spatial key.
    #[inline]
    pub fn set_key(&mut self, key: u32) {
        self.position[3] = key as f32;
    }

    /// xyz of `position`.
    #[inline]
    pub fn coordinate(&self) -> [f32; 3] {
        [self.position[0], self.position[1], self.position[2]]
    }
}

/// A 0/1 selector over a fixed pair of resources.
///
/// `read` and `write` are always distinct; [`PingPong::toggle`] swaps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PingPong {
    read: usize,
}

impl PingPong {
    /// Index of the side being read this tick.
    #[inline]
    pub fn read(&self) -> usize {
        self.read
    }

    /// Index of the side being written this tick.
    #[inline]
    pub fn write(&self) -> usize {
        (self.read + 1) % 2
    }

    /// Swap read and write.
    #[inline]
    pub fn toggle(&mut self) {
        self.read = (self.read + 1) % 2;
    }
}

/// Two particle buffers of capacity N plus the selector choosing which one
/// holds the current state.
#[derive(Debug)]
pub struct ParticleStore {
    buffers: [BufferHandle; 2],
    selector: PingPong,
    capacity: u32,
}

impl ParticleStore {
    /// Allocate both particle buffers.
    pub fn new<D: GpuDevice + ?Sized>(device: &mut D, capacity: u32) -> Result<Self> {
        let size = capacity as u64 * ParticleRecord::SIZE as u64;
        let usage = BufferUsage::STORAGE
            | BufferUsage::VERTEX
            | BufferUsage::COPY_SRC
            | BufferUsage::COPY_DST;
        let buffers = [
            device.create_buffer(&BufferDesc { label: "particles_0", size, usage })?,
            device.create_buffer(&BufferDesc { label: "particles_1", size, usage })?,
        ];
        Ok(Self {
            buffers,
            selector: PingPong::default(),
            capacity,
        })
    }

    /// Number of records each buffer holds.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Current selector.
    pub fn selector(&self) -> PingPong {
        self.selector
    }

    /// Buffer holding the current state.
    pub fn read_buffer(&self) -> BufferHandle {
        self.buffers[self.selector.read()]
    }

    /// Buffer receiving the next state.
    pub fn write_buffer(&self) -> BufferHandle {
        self.buffers[self.selector.write()]
    }

    /// Buffer at a fixed side, independent of the selector.
    pub fn buffer(&self, side: usize) -> BufferHandle {
        self.buffers[side]
    }

    /// Swap the read and write sides. No data moves.
    pub fn toggle(&mut self) {
        self.selector.toggle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_three_vec4() {
        assert_eq!(ParticleRecord::SIZE, 48);
        assert_eq!(std::mem::align_of::<ParticleRecord>(), 4);

        let mut p = ParticleRecord::at([1.0, 2.0, 3.0]);
        p.set_key(17);
        let words: &[u32] = bytemuck::cast_slice(std::slice::from_ref(&p));
        assert_eq!(f32::from_bits(words[ParticleRecord::KEY_WORD as usize]), 17.0);
        assert_eq!(p.key(), 17);
        assert_eq!(p.coordinate(), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn ping_pong_sides_never_alias() {
        let mut pp = PingPong::default();
        for _ in 0..5 {
            assert_ne!(pp.read(), pp.write());
            let before = pp.read();
            pp.toggle();
            assert_eq!(pp.write(), before);
        }
    }

    #[test]
    fn large_keys_round_trip_through_f32() {
        let mut p = ParticleRecord::default();
        p.set_key(crate::config::MAX_PARTICLES - 1);
        assert_eq!(p.key(), crate::config::MAX_PARTICLES - 1);
    }
}
