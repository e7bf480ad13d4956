//! Stable 1-bit LSD radix sort over fixed-size records.
//!
//! Each of the 32 passes partitions the records by one key bit while keeping
//! the relative order inside each partition:
//!
//! ```text
//! count    offset = #{ i : bit(key_i) == 0 }
//! digits   z_i = 1 - bit(key_i)      o_i = bit(key_i)
//! scan     Z = inclusive_scan(z)     O = inclusive_scan(o)
//! split    dst[Z_i - 1]              if bit(key_i) == 0
//!          dst[offset + O_i - 1]     otherwise
//! ```
//!
//! Scans are Hillis-Steele: `log2(N)` dispatches of
//! `dst[i] = src[i] + src[i - stride]` with doubling stride, ping-ponging
//! between the two buffers of a scan pair.
//!
//! Records are opaque except for one `f32` word holding an exactly
//! representable integer key; see [`RecordLayout`].

use crate::error::{KernelError, Result};
use crate::gpu::{
    AccessFlags, BindingBuilder, BindingKind, BindingSet, BufferBarrier, BufferDesc, BufferHandle,
    BufferUsage, CommandBuffer, CommandBufferState, ComputeProgram, DispatchParams, GpuDevice,
    KernelDesc, KernelHandle, LayoutHandle, PipelineStages,
};
use crate::particle::ParticleRecord;

/// Number of radix passes. Every key bit is visited.
pub const PASSES: u32 = 32;

const READ_ONLY: BindingKind = BindingKind::Storage { read_only: true };
const READ_WRITE: BindingKind = BindingKind::Storage { read_only: false };

/// Shape of the records being sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    /// Record size in bytes. Multiple of 4.
    pub stride: u32,
    /// Index of the 32-bit word holding the key as an `f32`.
    pub key_word: u32,
}

impl RecordLayout {
    /// Layout of [`ParticleRecord`]: key in `position.w`.
    pub const PARTICLE: RecordLayout = RecordLayout {
        stride: ParticleRecord::SIZE,
        key_word: ParticleRecord::KEY_WORD,
    };

    /// Record size in 32-bit words.
    pub fn words(&self) -> u32 {
        self.stride / 4
    }
}

/// Strides of a Hillis-Steele scan over `n` elements: 1, 2, 4, ... < n.
pub fn scan_strides(n: u32) -> impl Iterator<Item = u32> {
    std::iter::successors(Some(1u32), |s| s.checked_mul(2)).take_while(move |s| *s < n)
}

#[derive(Debug)]
struct SortKernels {
    count_zeros: KernelHandle,
    write_digits: KernelHandle,
    scan_step: KernelHandle,
    split: KernelHandle,
}

#[derive(Debug)]
struct SortBindings {
    temps: [BindingSet; 2],
    keys: BindingSet,
    offset_rw: BindingSet,
    offset_ro: BindingSet,
    scans_ro: [BindingSet; 4],
    scans_rw: [BindingSet; 4],
}

#[derive(Debug)]
struct Prepared {
    kernels: SortKernels,
    bindings: SortBindings,
    groups: [u32; 3],
}

/// Device radix sort with a fixed capacity and record layout.
///
/// The working set is allocated once in [`RadixSort::new`]; [`RadixSort::run`]
/// only records commands.
#[derive(Debug)]
pub struct RadixSort {
    capacity: u32,
    layout: RecordLayout,
    temps: [BufferHandle; 2],
    keys: BufferHandle,
    offset: BufferHandle,
    scans: [BufferHandle; 4],
    prepared: Option<Prepared>,
}

impl RadixSort {
    /// Allocate the working set for `capacity` records of `layout`.
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        capacity: u32,
        layout: RecordLayout,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(KernelError::InvalidConfig("sort capacity must be positive".into()));
        }
        if layout.stride == 0 || layout.stride % 4 != 0 || layout.key_word >= layout.words() {
            return Err(KernelError::InvalidConfig(format!(
                "bad record layout {layout:?}"
            )));
        }

        let records = capacity as u64 * layout.stride as u64;
        let scalars = capacity as u64 * 4;
        let storage = BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
        let mut buffer = |label: &str, size: u64| {
            device.create_buffer(&BufferDesc { label, size, usage: storage })
        };

        let temps = [buffer("sort_temp_0", records)?, buffer("sort_temp_1", records)?];
        let keys = buffer("sort_keys", records)?;
        let offset = buffer("sort_offset", 4)?;
        let scans = [
            buffer("sort_scan_zero_0", scalars)?,
            buffer("sort_scan_zero_1", scalars)?,
            buffer("sort_scan_one_0", scalars)?,
            buffer("sort_scan_one_1", scalars)?,
        ];

        tracing::debug!(capacity, stride = layout.stride, "radix sort working set allocated");
        Ok(Self {
            capacity,
            layout,
            temps,
            keys,
            offset,
            scans,
            prepared: None,
        })
    }

    /// Build binding sets and kernels.
    ///
    /// `record_layout` is the layout of the caller's read-write record set;
    /// the scratch record sets must come out with the same layout or the
    /// sort could not stand in for the caller's buffer.
    pub fn prepare<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        builder: &mut BindingBuilder,
        record_layout: LayoutHandle,
        groups: [u32; 3],
    ) -> Result<()> {
        let temps = [
            builder.single(READ_WRITE, self.temps[0])?,
            builder.single(READ_WRITE, self.temps[1])?,
        ];
        if temps[0].layout() != record_layout {
            return Err(KernelError::Binding(format!(
                "record layout {:?} does not match the sort's scratch layout {:?}",
                builder.layout(record_layout),
                builder.layout(temps[0].layout())
            )));
        }

        let keys = builder.single(READ_ONLY, self.keys)?;
        let offset_rw = builder.single(READ_WRITE, self.offset)?;
        let offset_ro = builder.single(READ_ONLY, self.offset)?;
        let scans_ro = [
            builder.single(READ_ONLY, self.scans[0])?,
            builder.single(READ_ONLY, self.scans[1])?,
            builder.single(READ_ONLY, self.scans[2])?,
            builder.single(READ_ONLY, self.scans[3])?,
        ];
        let scans_rw = [
            builder.single(READ_WRITE, self.scans[0])?,
            builder.single(READ_WRITE, self.scans[1])?,
            builder.single(READ_WRITE, self.scans[2])?,
            builder.single(READ_WRITE, self.scans[3])?,
        ];

        let mut kernel = |label: &str,
                          program: ComputeProgram,
                          sets: &[&BindingSet]|
         -> Result<KernelHandle> {
            let set_layouts = builder.layouts_of(sets)?;
            device.create_kernel(&KernelDesc { label, program, set_layouts })
        };
        let kernels = SortKernels {
            count_zeros: kernel("sort_count_zeros", ComputeProgram::CountZeros, &[&keys, &offset_rw])?,
            write_digits: kernel(
                "sort_write_digits",
                ComputeProgram::WriteDigits,
                &[&keys, &scans_rw[0], &scans_rw[1], &scans_rw[2], &scans_rw[3]],
            )?,
            scan_step: kernel("sort_scan_step", ComputeProgram::ScanStep, &[&scans_ro[0], &scans_rw[1]])?,
            split: kernel(
                "sort_split",
                ComputeProgram::Split,
                &[&keys, &temps[1], &offset_ro, &scans_ro[0], &scans_ro[2]],
            )?,
        };

        self.prepared = Some(Prepared {
            kernels,
            bindings: SortBindings {
                temps,
                keys,
                offset_rw,
                offset_ro,
                scans_ro,
                scans_rw,
            },
            groups,
        });
        Ok(())
    }

    /// Record a full sort of `data` into `commands`.
    ///
    /// `data` must hold exactly `capacity` records; it is sorted in place
    /// (copied into scratch, sorted there, copied back).
    pub fn run(&self, commands: &mut CommandBuffer, data: BufferHandle) -> Result<()> {
        let prepared = self.prepared.as_ref().ok_or(KernelError::NotPrepared("radix sort"))?;
        let expected = self.capacity as u64 * self.layout.stride as u64;
        if data.size() != expected {
            return Err(KernelError::SizeMismatch {
                expected,
                actual: data.size(),
            });
        }
        commands.require(CommandBufferState::Recording)?;

        let kernels = &prepared.kernels;
        let sets = &prepared.bindings;
        let groups = prepared.groups;
        let base = DispatchParams {
            count: self.capacity,
            record_words: self.layout.words(),
            key_word: self.layout.key_word,
            ..DispatchParams::default()
        };

        commands.copy_buffer(data, self.temps[0])?;
        commands.pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::COMPUTE | PipelineStages::TRANSFER,
            &[BufferBarrier::new(
                self.temps[0],
                AccessFlags::TRANSFER_WRITE,
                AccessFlags::SHADER_READ | AccessFlags::TRANSFER_READ,
            )],
        )?;

        let mut read = 0usize;
        for pass in 0..PASSES {
            let write = 1 - read;
            let params = DispatchParams { pass, ..base };

            // Keys are read from a private copy so the split can scatter into
            // the other scratch buffer.
            commands.copy_buffer(self.temps[read], self.keys)?;
            commands.pipeline_barrier(
                PipelineStages::TRANSFER,
                PipelineStages::COMPUTE,
                &[BufferBarrier::new(self.keys, AccessFlags::TRANSFER_WRITE, AccessFlags::SHADER_READ)],
            )?;

            commands.fill_buffer(self.offset, 0)?;
            commands.pipeline_barrier(
                PipelineStages::TRANSFER,
                PipelineStages::COMPUTE,
                &[BufferBarrier::new(
                    self.offset,
                    AccessFlags::TRANSFER_WRITE,
                    AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
                )],
            )?;

            commands.dispatch(kernels.count_zeros, &[&sets.keys, &sets.offset_rw], params, groups)?;
            commands.pipeline_barrier(
                PipelineStages::COMPUTE,
                PipelineStages::COMPUTE,
                &[BufferBarrier::new(self.offset, AccessFlags::SHADER_WRITE, AccessFlags::SHADER_READ)],
            )?;

            commands.dispatch(
                kernels.write_digits,
                &[&sets.keys, &sets.scans_rw[0], &sets.scans_rw[1], &sets.scans_rw[2], &sets.scans_rw[3]],
                params,
                groups,
            )?;
            let digit_barriers: Vec<BufferBarrier> = self
                .scans
                .iter()
                .map(|scan| {
                    BufferBarrier::new(
                        *scan,
                        AccessFlags::SHADER_WRITE,
                        AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
                    )
                })
                .collect();
            commands.pipeline_barrier(PipelineStages::COMPUTE, PipelineStages::COMPUTE, &digit_barriers)?;

            let zeros = self.scan_pair(commands, prepared, 0, params)?;
            let ones = self.scan_pair(commands, prepared, 2, params)?;

            commands.dispatch(
                kernels.split,
                &[&sets.keys, &sets.temps[write], &sets.offset_ro, &sets.scans_ro[zeros], &sets.scans_ro[ones]],
                params,
                groups,
            )?;
            commands.pipeline_barrier(
                PipelineStages::COMPUTE,
                PipelineStages::COMPUTE | PipelineStages::TRANSFER,
                &[BufferBarrier::new(
                    self.temps[write],
                    AccessFlags::SHADER_WRITE,
                    AccessFlags::SHADER_READ | AccessFlags::TRANSFER_READ,
                )],
            )?;

            tracing::trace!(pass, zeros, ones, "radix pass recorded");
            read = write;
        }

        // The caller may read the result in any stage or sort it again.
        commands.copy_buffer(self.temps[read], data)?;
        commands.pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::COMPUTE | PipelineStages::TRANSFER | PipelineStages::VERTEX,
            &[BufferBarrier::new(
                data,
                AccessFlags::TRANSFER_WRITE,
                AccessFlags::SHADER_READ
                    | AccessFlags::SHADER_WRITE
                    | AccessFlags::TRANSFER_READ
                    | AccessFlags::VERTEX_READ,
            )],
        )?;
        Ok(())
    }

    /// Inclusive scan of the pair starting at scan buffer `first`. Returns the
    /// index of the buffer holding the result.
    fn scan_pair(
        &self,
        commands: &mut CommandBuffer,
        prepared: &Prepared,
        first: usize,
        params: DispatchParams,
    ) -> Result<usize> {
        let sets = &prepared.bindings;
        let mut src = first;
        for stride in scan_strides(self.capacity) {
            let dst = if src == first { first + 1 } else { first };
            commands.dispatch(
                prepared.kernels.scan_step,
                &[&sets.scans_ro[src], &sets.scans_rw[dst]],
                DispatchParams { stride, ..params },
                prepared.groups,
            )?;
            commands.pipeline_barrier(
                PipelineStages::COMPUTE,
                PipelineStages::COMPUTE,
                &[BufferBarrier::new(self.scans[dst], AccessFlags::SHADER_WRITE, AccessFlags::SHADER_READ)],
            )?;
            src = dst;
        }
        Ok(src)
    }

    /// Number of records the sort was built for.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Record layout the working set was sized for.
    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Whether [`RadixSort::prepare`] has succeeded.
    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }

    /// Dispatches recorded by one [`RadixSort::run`].
    pub fn dispatches_per_sort(&self) -> usize {
        let steps = scan_strides(self.capacity).count();
        PASSES as usize * (3 + 2 * steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::host::HostDevice;

    #[test]
    fn scan_strides_stop_below_n() {
        assert_eq!(scan_strides(1).count(), 0);
        assert_eq!(scan_strides(4).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(scan_strides(5).collect::<Vec<_>>(), vec![1, 2, 4]);
        assert_eq!(scan_strides(20_000).count(), 15);
    }

    #[test]
    fn run_before_prepare_is_rejected() {
        let mut device = HostDevice::new(64);
        let sort = RadixSort::new(&mut device, 4, RecordLayout { stride: 8, key_word: 0 }).unwrap();
        let data = device
            .create_buffer(&BufferDesc { label: "data", size: 32, usage: BufferUsage::STORAGE })
            .unwrap();
        let mut cb = CommandBuffer::new("sort");
        cb.begin().unwrap();
        assert!(matches!(sort.run(&mut cb, data), Err(KernelError::NotPrepared(_))));
    }

    #[test]
    fn bad_layouts_are_rejected() {
        let mut device = HostDevice::new(64);
        assert!(RadixSort::new(&mut device, 4, RecordLayout { stride: 6, key_word: 0 }).is_err());
        assert!(RadixSort::new(&mut device, 4, RecordLayout { stride: 8, key_word: 2 }).is_err());
        assert!(RadixSort::new(&mut device, 0, RecordLayout::PARTICLE).is_err());
    }

    #[test]
    fn mismatched_record_layout_fails_prepare() {
        let mut device = HostDevice::new(64);
        let mut builder = BindingBuilder::new();
        let mut sort = RadixSort::new(&mut device, 4, RecordLayout::PARTICLE).unwrap();
        let other = builder.single(READ_ONLY, sort.keys).unwrap().layout();
        let err = sort.prepare(&mut device, &mut builder, other, [1, 1, 1]).unwrap_err();
        assert!(matches!(err, KernelError::Binding(_)));
        assert!(!sort.is_prepared());
    }

    #[test]
    fn dispatch_count_matches_recording() {
        let mut device = HostDevice::new(64);
        let mut builder = BindingBuilder::new();
        let mut sort = RadixSort::new(&mut device, 5, RecordLayout { stride: 8, key_word: 0 }).unwrap();
        let data = device
            .create_buffer(&BufferDesc { label: "data", size: 40, usage: BufferUsage::STORAGE })
            .unwrap();
        let layout = builder.single(READ_WRITE, data).unwrap().layout();
        sort.prepare(&mut device, &mut builder, layout, [2, 1, 1]).unwrap();

        let mut cb = CommandBuffer::new("sort");
        cb.begin().unwrap();
        sort.run(&mut cb, data).unwrap();
        assert_eq!(cb.dispatch_count(), sort.dispatches_per_sort());
        assert_eq!(sort.dispatches_per_sort(), 32 * (3 + 2 * 3));
    }

    #[test]
    fn sorted_data_is_ready_for_another_sort_or_a_copy() {
        let mut device = HostDevice::new(64);
        let mut builder = BindingBuilder::new();
        let mut sort = RadixSort::new(&mut device, 5, RecordLayout { stride: 8, key_word: 0 }).unwrap();
        let desc = BufferDesc { label: "data", size: 40, usage: BufferUsage::STORAGE };
        let data = device.create_buffer(&desc).unwrap();
        let out = device.create_buffer(&desc).unwrap();
        let layout = builder.single(READ_WRITE, data).unwrap().layout();
        sort.prepare(&mut device, &mut builder, layout, [2, 1, 1]).unwrap();

        let mut cb = CommandBuffer::new("sort");
        cb.begin().unwrap();
        sort.run(&mut cb, data).unwrap();
        sort.run(&mut cb, data).unwrap();
        cb.copy_buffer(data, out).unwrap();
        let hazards = crate::gpu::validation::check_hazards(&cb);
        assert!(hazards.is_empty(), "{hazards:?}");
    }
}
