//! GPU-resident SPH fluid step
//!
//! This crate records the per-frame compute pipeline of a particle fluid:
//! spatial key assignment, a device radix sort by key, spatial lookup table
//! construction, density and integration. Nothing is read back to the host
//! in steady state.
//!
//! # Modules
//! - [`gpu`] -- Device, command buffer, barrier and binding contracts, the
//!   CPU [`gpu::host::HostDevice`] and (feature `gpu`) the wgpu device.
//! - [`particle`] -- 48-byte particle records and the ping-pong store.
//! - [`spatial`] -- Position to cell to hashed key.
//! - [`sort`] -- 32-pass stable LSD radix sort over fixed-size records.
//! - [`fluid`] -- [`FluidSystem`], the 5-stage tick.
//! - [`sph`] -- Smoothing kernels and per-particle operators.
//! - [`config`] -- [`FluidConfig`] and its validation.
//!
//! # Example
//! ```
//! use fluid_kernel::gpu::{host::HostDevice, BindingBuilder, CommandBuffer, CommandPool, GpuDevice};
//! use fluid_kernel::{FluidConfig, FluidSystem, ParticleRecord};
//!
//! let config = FluidConfig { local_size: 64, ..FluidConfig::with_particles(64) };
//! let mut device = HostDevice::new(config.local_size);
//! let mut builder = BindingBuilder::new();
//! let mut pool = CommandPool::new("example");
//! let mut fluid = FluidSystem::new(&mut device, &mut builder, config)?;
//!
//! let particles: Vec<ParticleRecord> =
//!     (0..64).map(|i| ParticleRecord::at([i as f32 * 0.1, 0.0, 0.0])).collect();
//! fluid.upload_particles(&mut device, &mut pool, &particles)?;
//!
//! let mut commands = CommandBuffer::new("tick");
//! commands.begin()?;
//! fluid.run(&mut commands)?;
//! commands.end()?;
//! let submission = device.submit(&commands)?;
//! device.wait(submission)?;
//! # Ok::<(), fluid_kernel::KernelError>(())
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod fluid;
pub mod particle;
pub mod sort;
pub mod spatial;
pub mod sph;

#[allow(missing_docs)]
pub mod gpu;

pub use config::{FluidConfig, HashConstants, MAX_PARTICLES, MAX_WORKGROUPS_PER_DIMENSION};
pub use error::{KernelError, Result};
pub use fluid::{FluidSnapshot, FluidSystem, EMPTY_CELL};
pub use particle::{ParticleRecord, ParticleStore, PingPong};
pub use sort::{RadixSort, RecordLayout};
pub use spatial::SpatialHash;
