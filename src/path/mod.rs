//! Path Graph
//!
//! A path is the ordered chain of components one display mode drives on one
//! pipe. Wiring is tracked in a CPU-side shadow of the routing registers so
//! topology queries never read hardware.
//!
//! ```text
//!   engines (mask-selected)        fixed sink stage (per mode)
//!   +------+   +------+        +-----+   +-----+       +-----+
//!   | OVL0 |-->| OVL1 |------->| RSZ |-->| AAL |--...->| DSI |
//!   +------+   +------+        +-----+   +-----+       +-----+
//!                                           |
//!                                   addon   +--> WDMA
//! ```
//!
//! Routing registers of component `c`:
//!
//! ```text
//!   SEL_IN(c)    MMSYS_BASE + 0x100 + c * 8       predecessor id or SEL_NONE
//!   SEL_OUT(c)   MMSYS_BASE + 0x104 + c * 8       successor id or SEL_NONE
//!   ADDON_OUT(c) MMSYS_BASE + 0x800 + c * 4       addon branch head or SEL_NONE
//! ```

mod graph;

use std::fmt;

use crate::component::ComponentId;

pub use graph::{GraphCtx, GraphSnapshot, PathGraph};

pub const MMSYS_BASE: u64 = 0x1400_0000;
/// Routing value meaning "not connected"
pub const SEL_NONE: u32 = 0xffff;

pub fn sel_in(id: ComponentId) -> u64 {
    MMSYS_BASE + 0x100 + id.0 as u64 * 8
}

pub fn sel_out(id: ComponentId) -> u64 {
    MMSYS_BASE + 0x104 + id.0 as u64 * 8
}

pub fn addon_out(id: ComponentId) -> u64 {
    MMSYS_BASE + 0x800 + id.0 as u64 * 4
}

/// Routing register value for a neighbor
pub fn sel_value(id: ComponentId) -> u32 {
    if id.is_none() {
        SEL_NONE
    } else {
        id.0 as u32
    }
}

/// Display mode; exactly one is active per display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum DisplayMode {
    #[default]
    NoUse = 0,
    Major = 1,
    Minor = 2,
}

impl DisplayMode {
    pub const ALL: [DisplayMode; 3] = [Self::NoUse, Self::Major, Self::Minor];

    /// Decode a raw mode request; out-of-range values yield `None`
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::NoUse),
            1 => Some(Self::Major),
            2 => Some(Self::Minor),
            _ => None,
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoUse => "nouse",
            Self::Major => "major",
            Self::Minor => "minor",
        };
        f.write_str(name)
    }
}

/// Pipeline half of a dual-pipe display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipeId {
    Pipe0,
    Pipe1,
}

impl PipeId {
    pub const ALL: [PipeId; 2] = [Self::Pipe0, Self::Pipe1];
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe0 => f.write_str("pipe0"),
            Self::Pipe1 => f.write_str("pipe1"),
        }
    }
}

/// Shadow of one component's routing registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub prev: ComponentId,
    pub next: ComponentId,
}

/// Ordered components of one (mode, pipe)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub mode: DisplayMode,
    pub pipe: PipeId,
    pub comps: Vec<ComponentId>,
    /// Leading entries that are composition engines
    pub engines: usize,
}

impl Path {
    pub fn empty(mode: DisplayMode, pipe: PipeId) -> Self {
        Self { mode, pipe, comps: Vec::new(), engines: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.comps.is_empty()
    }

    pub fn engines(&self) -> &[ComponentId] {
        &self.comps[..self.engines.min(self.comps.len())]
    }

    pub fn tail(&self) -> &[ComponentId] {
        &self.comps[self.engines.min(self.comps.len())..]
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.comps.contains(&id)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:", self.mode, self.pipe)?;
        for (i, id) in self.comps.iter().enumerate() {
            let sep = if i == 0 { " " } else { " -> " };
            write!(f, "{}{}", sep, id)?;
        }
        Ok(())
    }
}
