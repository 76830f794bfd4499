//! Backup slot table
//!
//! Fixed-layout scratch memory shared between the CPU and the command-queue
//! engine. Batches write into it, hardware loops branch on it, and the CPU
//! reads it back after completion. One table per display.

use super::CmdqEngine;

/// Base of display 0's slot table
pub const SLOT_BASE: u64 = 0x1480_0000;
/// Distance between two displays' tables
pub const SLOT_STRIDE: u64 = 0x1000;
/// Layers with a fence counter
pub const MAX_LAYERS: usize = 12;

/// Symbolic slot offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Applied bandwidth request
    BwRequest,
    HrtIndex,
    PresentFence,
    /// Adaptive-refresh merge-skip counter; nonzero skips the TE wait
    MergeSkip,
    /// Nonzero enables the idle-power hooks in the trigger loop
    IdleHook,
    TraceStatus,
    LayerFence(usize),
}

impl Slot {
    pub fn offset(self) -> u64 {
        match self {
            Self::BwRequest => 0x00,
            Self::HrtIndex => 0x04,
            Self::PresentFence => 0x08,
            Self::MergeSkip => 0x0c,
            Self::IdleHook => 0x10,
            Self::TraceStatus => 0x14,
            Self::LayerFence(n) => 0x40 + (n.min(MAX_LAYERS - 1) as u64) * 4,
        }
    }

    /// Engine-visible address of this slot for a display
    pub fn addr(self, display: usize) -> u64 {
        SLOT_BASE + display as u64 * SLOT_STRIDE + self.offset()
    }

    /// Every slot of the table
    pub fn all() -> impl Iterator<Item = Slot> {
        [
            Self::BwRequest,
            Self::HrtIndex,
            Self::PresentFence,
            Self::MergeSkip,
            Self::IdleHook,
            Self::TraceStatus,
        ]
        .into_iter()
        .chain((0..MAX_LAYERS).map(Self::LayerFence))
    }
}

/// Zero the whole table of a display
pub fn init_slots(engine: &dyn CmdqEngine, display: usize) {
    for slot in Slot::all() {
        engine.write_mem(slot.addr(display), 0);
    }
}

/// Read a slot back through the engine
pub fn read_slot(engine: &dyn CmdqEngine, display: usize, slot: Slot) -> u32 {
    engine.read_mem(slot.addr(display))
}
