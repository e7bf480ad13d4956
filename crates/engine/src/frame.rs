//! Frames-in-flight pacing.
//!
//! Each slot owns one command buffer and the ticket of the last submission
//! recorded into it. Re-acquiring a slot first waits on that ticket, which
//! bounds how far the host can run ahead of the device.

use fluid_kernel::gpu::{CommandBuffer, CommandPool, GpuDevice, Submission};
use fluid_kernel::Result;

#[derive(Debug)]
struct FrameSlot {
    commands: CommandBuffer,
    ticket: Option<Submission>,
}

/// Round-robin owner of the per-frame command buffers.
#[derive(Debug)]
pub struct FramePacer {
    slots: Vec<FrameSlot>,
    current: usize,
    submitted: u64,
}

impl FramePacer {
    /// `frames_in_flight` slots, each with a fresh command buffer from `pool`.
    pub fn new(pool: &mut CommandPool, frames_in_flight: u32) -> Self {
        let slots = pool
            .allocate(frames_in_flight.max(1) as usize)
            .into_iter()
            .map(|commands| FrameSlot { commands, ticket: None })
            .collect();
        Self {
            slots,
            current: 0,
            submitted: 0,
        }
    }

    /// Wait until the current slot's previous frame is done, then hand out its
    /// command buffer in the recording state.
    pub fn acquire<D: GpuDevice + ?Sized>(&mut self, device: &mut D) -> Result<&mut CommandBuffer> {
        let slot = &mut self.slots[self.current];
        if let Some(ticket) = slot.ticket.take() {
            device.wait(ticket)?;
        }
        slot.commands.reset();
        slot.commands.begin()?;
        Ok(&mut slot.commands)
    }

    /// Finish the current slot's command buffer, submit it and move on to the
    /// next slot.
    pub fn submit<D: GpuDevice + ?Sized>(&mut self, device: &mut D) -> Result<Submission> {
        let slot = &mut self.slots[self.current];
        slot.commands.end()?;
        let ticket = device.submit(&slot.commands)?;
        slot.ticket = Some(ticket);
        tracing::trace!(frame = self.submitted, slot = self.current, "frame submitted");
        self.current = (self.current + 1) % self.slots.len();
        self.submitted += 1;
        Ok(ticket)
    }

    /// Wait for every outstanding frame.
    pub fn drain<D: GpuDevice + ?Sized>(&mut self, device: &mut D) -> Result<()> {
        for slot in &mut self.slots {
            if let Some(ticket) = slot.ticket.take() {
                device.wait(ticket)?;
            }
        }
        Ok(())
    }

    /// Number of slots.
    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    /// Slot the next frame records into.
    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Frames submitted but not yet waited on.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.ticket.is_some()).count()
    }

    /// Frames submitted so far.
    pub fn submitted(&self) -> u64 {
        self.submitted
    }
}
