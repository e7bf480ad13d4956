//! Binding sets, their layouts, and the builder that creates both.

use std::collections::HashMap;

use super::command::PipelineStages;
use super::BufferHandle;
use crate::error::{KernelError, Result};

/// What a shader sees through a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Uniform,
    Storage { read_only: bool },
}

/// One slot of a set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutEntry {
    pub slot: u32,
    pub stages: PipelineStages,
    pub kind: BindingKind,
}

/// Shape of a binding set, independent of the buffers bound into it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetLayout {
    entries: Vec<LayoutEntry>,
}

impl SetLayout {
    /// Entries sorted by slot.
    pub fn new(mut entries: Vec<LayoutEntry>) -> Self {
        entries.sort_by_key(|e| e.slot);
        Self { entries }
    }

    /// One compute-visible binding at slot 0.
    pub fn single(kind: BindingKind) -> Self {
        Self::new(vec![LayoutEntry {
            slot: 0,
            stages: PipelineStages::COMPUTE,
            kind,
        }])
    }

    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }
}

/// Deduplicated layout handle. Equal layouts always get the same handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutHandle(u32);

/// Buffers bound to the slots of one layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingSet {
    layout: LayoutHandle,
    bindings: Vec<(u32, BufferHandle)>,
}

impl BindingSet {
    pub fn layout(&self) -> LayoutHandle {
        self.layout
    }

    /// `(slot, buffer)` pairs sorted by slot.
    pub fn bindings(&self) -> &[(u32, BufferHandle)] {
        &self.bindings
    }

    /// Buffer at the lowest slot.
    pub fn primary(&self) -> BufferHandle {
        self.bindings[0].1
    }
}

/// Layout cache: maps each distinct [`SetLayout`] to one handle.
#[derive(Debug, Default)]
pub struct LayoutCache {
    layouts: Vec<SetLayout>,
    index: HashMap<SetLayout, LayoutHandle>,
}

impl LayoutCache {
    fn intern(&mut self, layout: SetLayout) -> LayoutHandle {
        if let Some(handle) = self.index.get(&layout) {
            return *handle;
        }
        let handle = LayoutHandle(self.layouts.len() as u32);
        self.layouts.push(layout.clone());
        self.index.insert(layout, handle);
        handle
    }

    fn get(&self, handle: LayoutHandle) -> Option<&SetLayout> {
        self.layouts.get(handle.0 as usize)
    }

    fn len(&self) -> usize {
        self.layouts.len()
    }
}

/// Accumulates `bind_buffer` calls and turns them into a [`BindingSet`].
///
/// ```
/// use fluid_kernel::gpu::{BindingBuilder, BindingKind, PipelineStages};
/// # use fluid_kernel::gpu::{host::HostDevice, BufferDesc, BufferUsage, GpuDevice};
/// # let mut device = HostDevice::new(64);
/// # let buffer = device.create_buffer(&BufferDesc { label: "b", size: 16, usage: BufferUsage::STORAGE }).unwrap();
/// let mut builder = BindingBuilder::new();
/// let (set, layout) = builder
///     .bind_buffer(0, PipelineStages::COMPUTE, BindingKind::Storage { read_only: true }, buffer)
///     .build()
///     .unwrap();
/// assert_eq!(set.layout(), layout);
/// ```
#[derive(Debug, Default)]
pub struct BindingBuilder {
    cache: LayoutCache,
    pending: Vec<(LayoutEntry, BufferHandle)>,
}

impl BindingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `buffer` at `slot`.
    pub fn bind_buffer(
        &mut self,
        slot: u32,
        stages: PipelineStages,
        kind: BindingKind,
        buffer: BufferHandle,
    ) -> &mut Self {
        self.pending.push((LayoutEntry { slot, stages, kind }, buffer));
        self
    }

    /// Build a set from everything queued since the last build or clear.
    pub fn build(&mut self) -> Result<(BindingSet, LayoutHandle)> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Err(KernelError::Binding("binding set has no bindings".to_string()));
        }

        let mut bindings: Vec<(u32, BufferHandle)> =
            pending.iter().map(|(entry, buffer)| (entry.slot, *buffer)).collect();
        bindings.sort_by_key(|(slot, _)| *slot);
        if let Some(pair) = bindings.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(KernelError::Binding(format!(
                "slot {} bound more than once",
                pair[0].0
            )));
        }
        if let Some((entry, _)) = pending.iter().find(|(_, buffer)| buffer.size() == 0) {
            return Err(KernelError::Binding(format!(
                "slot {} bound to an empty buffer",
                entry.slot
            )));
        }

        let layout = self
            .cache
            .intern(SetLayout::new(pending.iter().map(|(entry, _)| *entry).collect()));
        Ok((BindingSet { layout, bindings }, layout))
    }

    /// Single compute-visible binding at slot 0.
    pub fn single(&mut self, kind: BindingKind, buffer: BufferHandle) -> Result<BindingSet> {
        self.clear();
        self.bind_buffer(0, PipelineStages::COMPUTE, kind, buffer);
        Ok(self.build()?.0)
    }

    /// Drop queued bindings without building.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Layout behind a handle.
    pub fn layout(&self, handle: LayoutHandle) -> Option<&SetLayout> {
        self.cache.get(handle)
    }

    /// Layouts of `sets`, in order, for kernel creation.
    pub fn layouts_of(&self, sets: &[&BindingSet]) -> Result<Vec<SetLayout>> {
        sets.iter()
            .map(|set| {
                self.layout(set.layout()).cloned().ok_or_else(|| {
                    KernelError::Binding(format!("unknown layout {:?}", set.layout()))
                })
            })
            .collect()
    }

    /// Number of distinct layouts created so far.
    pub fn layout_count(&self) -> usize {
        self.cache.len()
    }
}

/// A resource exposed to kernels either per ping-pong side or once.
#[derive(Debug, Clone)]
pub enum ResourceBinding {
    /// One set per side, selected by the frame's ping-pong index.
    PerFrame([BindingSet; 2]),
    /// The same set every frame.
    Static(BindingSet),
}

impl ResourceBinding {
    /// Set to bind for ping-pong side `side`.
    pub fn set(&self, side: usize) -> &BindingSet {
        match self {
            ResourceBinding::PerFrame(sets) => &sets[side % 2],
            ResourceBinding::Static(set) => set,
        }
    }

    /// Buffer bound for `side`.
    pub fn buffer(&self, side: usize) -> BufferHandle {
        self.set(side).primary()
    }

    /// Shared layout of every set.
    pub fn layout(&self) -> LayoutHandle {
        self.set(0).layout()
    }
}
