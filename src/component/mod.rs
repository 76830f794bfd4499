//! Display Pipeline Components
//!
//! Every hardware processing block of the display subsystem is a
//! [`Component`]. Components live in a dense, id-indexed arena owned by the
//! [`Registry`](registry::Registry); paths, sync mutexes and the dual-pipe
//! map only ever hold [`ComponentId`]s.
//!
//! Blocks that a SoC variant lacks are still present in the arena as
//! [`ComponentKind::Virtual`] placeholders, so path iteration and indexing
//! are identical across variants. Every capability call on a placeholder
//! is a no-op.
//!
//! # Module Structure
//!
//! - `registry` - the arena and capability dispatch
//! - `blocks` - per-type block models
//! - `soc` - per-SoC component tables and topologies

pub mod blocks;
pub mod registry;
pub mod soc;

use std::fmt;

use bitflags::bitflags;

use crate::cmdq::CommandBatch;
use crate::commit::LayerConfig;
use crate::error::DpcResult;
use crate::path::PipeId;

pub use registry::Registry;
pub use soc::{SocTable, SocVariant};

// =============================================================================
// Component Identifiers
// =============================================================================

/// Component identifier (index into the registry arena)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u16);

impl ComponentId {
    // Pipe 0 blocks
    pub const OVL0: Self = Self(0);
    pub const OVL1: Self = Self(1);
    pub const OVL2: Self = Self(2);
    pub const RSZ0: Self = Self(3);
    pub const AAL0: Self = Self(4);
    pub const COLOR0: Self = Self(5);
    pub const CHIST0: Self = Self(6);
    pub const DSC0: Self = Self(7);
    pub const WDMA0: Self = Self(8);
    pub const DSI0: Self = Self(9);
    // Pipe 1 twins of the pipe 0 blocks
    pub const OVL3: Self = Self(10);
    pub const OVL4: Self = Self(11);
    pub const OVL5: Self = Self(12);
    pub const RSZ1: Self = Self(13);
    pub const AAL1: Self = Self(14);
    pub const COLOR1: Self = Self(15);
    pub const CHIST1: Self = Self(16);
    pub const DSC1: Self = Self(17);
    pub const WDMA1: Self = Self(18);
    pub const DSI1: Self = Self(19);
    // External display blocks
    pub const OVL6: Self = Self(20);
    pub const OVL7: Self = Self(21);
    pub const DP_INTF0: Self = Self(22);
    pub const OVL8: Self = Self(23);
    pub const OVL9: Self = Self(24);
    pub const DP_INTF1: Self = Self(25);
    pub const WDMA2: Self = Self(26);
    // Placeholders
    pub const VIRTUAL0: Self = Self(27);
    pub const VIRTUAL1: Self = Self(28);

    /// Number of ids in the arena
    pub const COUNT: usize = 29;

    /// Boundary sentinel: "no neighbor" in wiring, "no twin" in the dual map
    pub const NONE: Self = Self(u16::MAX);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// Iterate all ids of the arena
    pub fn all() -> impl Iterator<Item = ComponentId> {
        (0..Self::COUNT as u16).map(ComponentId)
    }

    pub fn name(self) -> &'static str {
        const NAMES: [&str; ComponentId::COUNT] = [
            "OVL0", "OVL1", "OVL2", "RSZ0", "AAL0", "COLOR0", "CHIST0", "DSC0", "WDMA0", "DSI0",
            "OVL3", "OVL4", "OVL5", "RSZ1", "AAL1", "COLOR1", "CHIST1", "DSC1", "WDMA1", "DSI1",
            "OVL6", "OVL7", "DP_INTF0", "OVL8", "OVL9", "DP_INTF1", "WDMA2", "VIRTUAL0",
            "VIRTUAL1",
        ];
        if self.is_none() {
            return "NONE";
        }
        NAMES.get(self.index()).copied().unwrap_or("UNKNOWN")
    }

    /// Register window of this block
    pub fn regs_base(self) -> u64 {
        COMP_REG_BASE + self.0 as u64 * COMP_REG_STRIDE
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Base of the per-component register windows
pub const COMP_REG_BASE: u64 = 0x1410_0000;
/// Size of one component register window
pub const COMP_REG_STRIDE: u64 = 0x1000;

// =============================================================================
// Types and Capabilities
// =============================================================================

/// Closed set of block types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    /// Overlay / composition engine
    CompositionEngine,
    Resizer,
    /// Post-processing color corrector (AAL, COLOR)
    ColorCorrector,
    Histogram,
    /// Compression encoder (DSC)
    Encoder,
    /// Write-back DMA
    WritebackDma,
    /// Panel output interface (DSI, DP)
    OutputInterface,
    /// Placeholder for a block the SoC lacks
    Virtual,
}

bitflags! {
    /// Capability set of a block
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        const CONFIGURE      = 1 << 0;
        const START          = 1 << 1;
        const STOP           = 1 << 2;
        const RESET          = 1 << 3;
        const PREPARE        = 1 << 4;
        const PARTIAL_UPDATE = 1 << 5;
        const BYPASS         = 1 << 6;
        const LAYER          = 1 << 7;
        /// Consumes tile overhead columns in dual-pipe mode
        const OVERHEAD       = 1 << 8;
        /// Output interface driven by explicit triggers (command-driven panel)
        const COMMAND_MODE   = 1 << 9;
    }
}

/// Panel driving discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    /// Explicit per-frame trigger (command-mode panels)
    CommandDriven,
    /// Free-running timing generator (video-mode panels)
    Continuous,
}

/// Rectangle in panel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Per-pipe block configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdpConfig {
    /// Output width of this pipe
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
    /// Overhead columns this block must produce (per component)
    pub overhead: u32,
    pub pipe: PipeId,
    pub dual: bool,
}

impl DdpConfig {
    /// Input width including the overhead columns
    pub fn in_width(&self) -> u32 {
        self.width + self.overhead
    }
}

/// A capability call routed through [`Registry::dispatch`]
#[derive(Debug, Clone, Copy)]
pub enum Capability<'a> {
    Configure(&'a DdpConfig),
    Start,
    Stop,
    Reset,
    Prepare,
    Unprepare,
    PartialUpdate(Rect),
    Bypass(bool),
    Layer(&'a LayerConfig),
}

impl Capability<'_> {
    /// Capability bit a block must advertise to accept this call
    pub fn required(&self) -> Caps {
        match self {
            Self::Configure(_) => Caps::CONFIGURE,
            Self::Start => Caps::START,
            Self::Stop => Caps::STOP,
            Self::Reset => Caps::RESET,
            Self::Prepare | Self::Unprepare => Caps::PREPARE,
            Self::PartialUpdate(_) => Caps::PARTIAL_UPDATE,
            Self::Bypass(_) => Caps::BYPASS,
            Self::Layer(_) => Caps::LAYER,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Configure(_) => "configure",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reset => "reset",
            Self::Prepare => "prepare",
            Self::Unprepare => "unprepare",
            Self::PartialUpdate(_) => "partial_update",
            Self::Bypass(_) => "bypass",
            Self::Layer(_) => "layer",
        }
    }
}

// =============================================================================
// Block Trait
// =============================================================================

/// Behaviour of a real hardware block.
///
/// Every operation has a no-op default; [`Registry::dispatch`] only calls an
/// operation when [`Block::caps`] advertises it.
pub trait Block: Send + Sync {
    fn ty(&self) -> ComponentType;

    fn caps(&self) -> Caps;

    /// Extra source columns this block reads across the split midline
    fn overhead_columns(&self) -> u32 {
        0
    }

    fn configure(&mut self, cfg: &DdpConfig, batch: &mut CommandBatch) -> DpcResult<()> {
        let _ = (cfg, batch);
        Ok(())
    }

    fn start(&mut self, batch: &mut CommandBatch) -> DpcResult<()> {
        let _ = batch;
        Ok(())
    }

    fn stop(&mut self, batch: &mut CommandBatch) -> DpcResult<()> {
        let _ = batch;
        Ok(())
    }

    fn reset(&mut self, batch: &mut CommandBatch) -> DpcResult<()> {
        let _ = batch;
        Ok(())
    }

    fn prepare(&mut self, batch: &mut CommandBatch) -> DpcResult<()> {
        let _ = batch;
        Ok(())
    }

    fn unprepare(&mut self, batch: &mut CommandBatch) -> DpcResult<()> {
        let _ = batch;
        Ok(())
    }

    fn partial_update(&mut self, roi: &Rect, batch: &mut CommandBatch) -> DpcResult<()> {
        let _ = (roi, batch);
        Ok(())
    }

    fn bypass(&mut self, enable: bool, batch: &mut CommandBatch) -> DpcResult<()> {
        let _ = (enable, batch);
        Ok(())
    }

    fn layer(&mut self, layer: &LayerConfig, batch: &mut CommandBatch) -> DpcResult<()> {
        let _ = (layer, batch);
        Ok(())
    }

    /// One-line state summary for diagnostic dumps
    fn dump(&self) -> String;
}

/// Real block or placeholder
pub enum ComponentKind {
    Real(Box<dyn Block>),
    Virtual,
}

impl fmt::Debug for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real(block) => write!(f, "Real({:?})", block.ty()),
            Self::Virtual => f.write_str("Virtual"),
        }
    }
}

// =============================================================================
// Component
// =============================================================================

/// One arena entry
#[derive(Debug)]
pub struct Component {
    pub id: ComponentId,
    pub kind: ComponentKind,
    /// Display currently owning this block. Written only under that
    /// display's lock.
    pub(crate) owner: Option<usize>,
    /// Overhead columns assigned by the last overhead computation
    pub(crate) overhead: u32,
}

impl Component {
    pub fn new(id: ComponentId, kind: ComponentKind) -> Self {
        Self { id, kind, owner: None, overhead: 0 }
    }

    pub fn virtual_placeholder(id: ComponentId) -> Self {
        Self::new(id, ComponentKind::Virtual)
    }

    pub fn ty(&self) -> ComponentType {
        match &self.kind {
            ComponentKind::Real(block) => block.ty(),
            ComponentKind::Virtual => ComponentType::Virtual,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, ComponentKind::Virtual)
    }

    pub fn caps(&self) -> Caps {
        match &self.kind {
            ComponentKind::Real(block) => block.caps(),
            ComponentKind::Virtual => Caps::empty(),
        }
    }

    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    pub fn overhead(&self) -> u32 {
        self.overhead
    }

    pub fn overhead_columns(&self) -> u32 {
        match &self.kind {
            ComponentKind::Real(block) if block.caps().contains(Caps::OVERHEAD) => {
                block.overhead_columns()
            }
            _ => 0,
        }
    }

    /// Driving discipline, defined only for output interfaces
    pub fn drive_mode(&self) -> Option<DriveMode> {
        if self.ty() != ComponentType::OutputInterface {
            return None;
        }
        if self.caps().contains(Caps::COMMAND_MODE) {
            Some(DriveMode::CommandDriven)
        } else {
            Some(DriveMode::Continuous)
        }
    }

    pub fn dump(&self) -> String {
        match &self.kind {
            ComponentKind::Real(block) => block.dump(),
            ComponentKind::Virtual => "virtual".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_names() {
        assert_eq!(ComponentId::OVL0.name(), "OVL0");
        assert_eq!(ComponentId::DP_INTF1.name(), "DP_INTF1");
        assert_eq!(ComponentId::VIRTUAL1.name(), "VIRTUAL1");
        assert_eq!(ComponentId::NONE.to_string(), "NONE");
        assert_eq!(ComponentId(200).name(), "UNKNOWN");
    }

    #[test]
    fn test_ids_are_dense() {
        let ids: Vec<_> = ComponentId::all().collect();
        assert_eq!(ids.len(), ComponentId::COUNT);
        assert_eq!(ids.last().copied(), Some(ComponentId::VIRTUAL1));
    }

    #[test]
    fn test_register_windows_do_not_overlap() {
        let a = ComponentId::OVL0.regs_base();
        let b = ComponentId::OVL1.regs_base();
        assert_eq!(b - a, COMP_REG_STRIDE);
    }

    #[test]
    fn test_virtual_has_no_caps() {
        let comp = Component::virtual_placeholder(ComponentId::VIRTUAL0);
        assert!(comp.is_virtual());
        assert!(comp.caps().is_empty());
        assert_eq!(comp.drive_mode(), None);
        assert_eq!(comp.overhead_columns(), 0);
    }

    #[test]
    fn test_capability_bits() {
        assert_eq!(Capability::Unprepare.required(), Caps::PREPARE);
        assert_eq!(Capability::Bypass(true).required(), Caps::BYPASS);
        assert_eq!(Capability::Start.name(), "start");
    }
}
