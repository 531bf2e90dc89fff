//! Two-slot block lookahead: the block on air and at most one queued next.
//!
//! Core feeds just-in-time; the engine never holds more than one block of
//! lookahead. Enqueueing while the next slot is occupied is refused so Core
//! gets immediate backpressure.

use parking_lot::Mutex;

use crate::error::PlanRejection;

use super::ValidatedBlock;

#[derive(Default)]
struct Slots {
    current: Option<ValidatedBlock>,
    next: Option<ValidatedBlock>,
}

/// Thread-safe two-slot holder. The tick thread takes slots by move;
/// the ingestion side enqueues validated plans.
#[derive(Default)]
pub struct BlockPlanQueue {
    slots: Mutex<Slots>,
}

impl BlockPlanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a validated block. Fills `current` first, then `next`;
    /// fails if both are occupied.
    pub fn enqueue(&self, block: ValidatedBlock) -> Result<(), PlanRejection> {
        let mut slots = self.slots.lock();
        if slots.current.is_none() {
            slots.current = Some(block);
            Ok(())
        } else if slots.next.is_none() {
            slots.next = Some(block);
            Ok(())
        } else {
            Err(PlanRejection::SlotOccupied {
                occupied_by: slots
                    .next
                    .as_ref()
                    .map(|b| b.block_id().to_string())
                    .unwrap_or_default(),
            })
        }
    }

    /// Take the current slot (used once at session start).
    pub fn take_current(&self) -> Option<ValidatedBlock> {
        self.slots.lock().current.take()
    }

    /// At the fence: promote `next` into `current` and return a clone of the
    /// promoted block. `None` means underrun.
    pub fn advance(&self) -> Option<ValidatedBlock> {
        let mut slots = self.slots.lock();
        let next = slots.next.take()?;
        slots.current = Some(next.clone());
        Some(next)
    }

    /// Peek the queued next block id, if any.
    pub fn next_block_id(&self) -> Option<String> {
        self.slots
            .lock()
            .next
            .as_ref()
            .map(|b| b.block_id().to_string())
    }

    /// Clone of the queued next block, if any (for preparation kickoff).
    pub fn peek_next(&self) -> Option<ValidatedBlock> {
        self.slots.lock().next.clone()
    }

    pub fn has_next(&self) -> bool {
        self.slots.lock().next.is_some()
    }

    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        slots.current = None;
        slots.next = None;
    }
}
