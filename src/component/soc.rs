//! Per-SoC component tables
//!
//! A [`SocTable`] lists which blocks physically exist on a variant, the
//! path topology of each display, the dual-pipe twin pairs and the addon
//! scenarios. Everything else (arena layout, path iteration) is shared.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::blocks::AAL_OVERHEAD;
use super::{ComponentId, DriveMode};
use crate::error::DpcError;
use crate::path::DisplayMode;

/// Registered SoC variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocVariant {
    /// Flagship: full twin pipeline
    Mt6985,
    /// Discrete-path variant without resizers
    Mt6989,
    /// Single-pipe mid-range part
    Mt6878,
}

impl SocVariant {
    pub const ALL: [SocVariant; 3] = [Self::Mt6985, Self::Mt6989, Self::Mt6878];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mt6985 => "mt6985",
            Self::Mt6989 => "mt6989",
            Self::Mt6878 => "mt6878",
        }
    }
}

impl fmt::Display for SocVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocVariant {
    type Err = DpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DpcError::Config(format!("unknown SoC '{}'", s)))
    }
}

/// Block model to instantiate for a real component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSpec {
    Ovl,
    Resizer,
    Color { overhead: u32 },
    Histogram,
    Encoder,
    Wdma,
    Output { mode: DriveMode, dual_port: bool },
}

/// Path topology of one display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayTopology {
    pub index: usize,
    /// Parallel composition engines; bit `n` of an engine mask selects
    /// `engine_pool[n]`
    pub engine_pool: Vec<ComponentId>,
    pub default_mask: u32,
    /// Fixed sink stage after the engines, per mode
    pub major_tail: Vec<ComponentId>,
    pub minor_tail: Vec<ComponentId>,
}

impl DisplayTopology {
    pub fn tail(&self, mode: DisplayMode) -> &[ComponentId] {
        match mode {
            DisplayMode::Major => &self.major_tail,
            DisplayMode::Minor => &self.minor_tail,
            DisplayMode::NoUse => &[],
        }
    }

    /// Mask with every pool engine selected
    pub fn full_mask(&self) -> u32 {
        if self.engine_pool.len() >= 32 {
            u32::MAX
        } else {
            (1u32 << self.engine_pool.len()) - 1
        }
    }

    /// Engines selected by a mask, in bit-index order
    pub fn select(&self, mask: u32) -> Vec<ComponentId> {
        self.engine_pool
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) != 0)
            .map(|(_, id)| *id)
            .collect()
    }
}

/// Optional module branch attached to a path component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonScenario {
    pub name: &'static str,
    pub display: usize,
    /// Path component the branch hangs off
    pub attach_after: ComponentId,
    pub modules: Vec<ComponentId>,
}

/// Everything variant-specific
#[derive(Debug, Clone)]
pub struct SocTable {
    pub variant: SocVariant,
    pub components: Vec<(ComponentId, BlockSpec)>,
    pub displays: Vec<DisplayTopology>,
    /// Pipe 0 component to pipe 1 twin
    pub twins: Vec<(ComponentId, ComponentId)>,
    pub addons: Vec<AddonScenario>,
    pub mutex_count: usize,
    pub dual_capable: bool,
    /// Compositor-less path variant; takes an extra mutex and bypasses the
    /// bandwidth raise/lazy-lower policy
    pub discrete_path: bool,
}

const PIPE0_BLOCKS: [(ComponentId, BlockSpec); 10] = [
    (ComponentId::OVL0, BlockSpec::Ovl),
    (ComponentId::OVL1, BlockSpec::Ovl),
    (ComponentId::OVL2, BlockSpec::Ovl),
    (ComponentId::RSZ0, BlockSpec::Resizer),
    (ComponentId::AAL0, BlockSpec::Color { overhead: AAL_OVERHEAD }),
    (ComponentId::COLOR0, BlockSpec::Color { overhead: 0 }),
    (ComponentId::CHIST0, BlockSpec::Histogram),
    (ComponentId::DSC0, BlockSpec::Encoder),
    (ComponentId::WDMA0, BlockSpec::Wdma),
    (
        ComponentId::DSI0,
        BlockSpec::Output { mode: DriveMode::CommandDriven, dual_port: false },
    ),
];

const EXT_BLOCKS: [(ComponentId, BlockSpec); 4] = [
    (ComponentId::OVL6, BlockSpec::Ovl),
    (ComponentId::OVL7, BlockSpec::Ovl),
    (
        ComponentId::DP_INTF0,
        BlockSpec::Output { mode: DriveMode::Continuous, dual_port: false },
    ),
    (ComponentId::WDMA2, BlockSpec::Wdma),
];

const EXT_TWIN_BLOCKS: [(ComponentId, BlockSpec); 3] = [
    (ComponentId::OVL8, BlockSpec::Ovl),
    (ComponentId::OVL9, BlockSpec::Ovl),
    (
        ComponentId::DP_INTF1,
        BlockSpec::Output { mode: DriveMode::Continuous, dual_port: false },
    ),
];

/// Pipe 0 id to its pipe 1 twin; the blocks share a 10-id offset
fn pipe1_twin(id: ComponentId) -> ComponentId {
    ComponentId(id.0 + 10)
}

fn default_displays() -> Vec<DisplayTopology> {
    vec![
        DisplayTopology {
            index: 0,
            engine_pool: vec![ComponentId::OVL0, ComponentId::OVL1, ComponentId::OVL2],
            default_mask: 0b011,
            major_tail: vec![
                ComponentId::RSZ0,
                ComponentId::AAL0,
                ComponentId::COLOR0,
                ComponentId::CHIST0,
                ComponentId::DSC0,
                ComponentId::DSI0,
            ],
            minor_tail: vec![ComponentId::VIRTUAL0, ComponentId::DSC0, ComponentId::DSI0],
        },
        DisplayTopology {
            index: 1,
            engine_pool: vec![ComponentId::OVL6, ComponentId::OVL7],
            default_mask: 0b11,
            major_tail: vec![ComponentId::VIRTUAL1, ComponentId::DP_INTF0],
            minor_tail: vec![ComponentId::DP_INTF0],
        },
    ]
}

fn default_addons() -> Vec<AddonScenario> {
    vec![
        AddonScenario {
            name: "wb-capture",
            display: 0,
            attach_after: ComponentId::CHIST0,
            modules: vec![ComponentId::WDMA0],
        },
        AddonScenario {
            name: "wb-capture",
            display: 1,
            attach_after: ComponentId::OVL7,
            modules: vec![ComponentId::WDMA2],
        },
    ]
}

fn full_twins() -> Vec<(ComponentId, ComponentId)> {
    let mut twins: Vec<_> = PIPE0_BLOCKS.iter().map(|(id, _)| (*id, pipe1_twin(*id))).collect();
    twins.push((ComponentId::OVL6, ComponentId::OVL8));
    twins.push((ComponentId::OVL7, ComponentId::OVL9));
    twins.push((ComponentId::DP_INTF0, ComponentId::DP_INTF1));
    twins
}

fn twin_blocks() -> Vec<(ComponentId, BlockSpec)> {
    PIPE0_BLOCKS
        .iter()
        .map(|(id, spec)| (pipe1_twin(*id), *spec))
        .chain(EXT_TWIN_BLOCKS.iter().copied())
        .collect()
}

impl SocTable {
    pub fn for_variant(variant: SocVariant) -> Self {
        match variant {
            SocVariant::Mt6985 => Self {
                variant,
                components: PIPE0_BLOCKS
                    .iter()
                    .copied()
                    .chain(EXT_BLOCKS.iter().copied())
                    .chain(twin_blocks())
                    .collect(),
                displays: default_displays(),
                twins: full_twins(),
                addons: default_addons(),
                mutex_count: 6,
                dual_capable: true,
                discrete_path: false,
            },
            SocVariant::Mt6989 => {
                let lacks = [ComponentId::RSZ0, ComponentId::RSZ1];
                Self {
                    variant,
                    components: PIPE0_BLOCKS
                        .iter()
                        .copied()
                        .chain(EXT_BLOCKS.iter().copied())
                        .chain(twin_blocks())
                        .filter(|(id, _)| !lacks.contains(id))
                        .collect(),
                    displays: default_displays(),
                    twins: full_twins()
                        .into_iter()
                        .filter(|(id, _)| !lacks.contains(id))
                        .collect(),
                    addons: default_addons(),
                    mutex_count: 6,
                    dual_capable: true,
                    discrete_path: true,
                }
            }
            SocVariant::Mt6878 => {
                let lacks = [ComponentId::RSZ0, ComponentId::CHIST0];
                Self {
                    variant,
                    components: PIPE0_BLOCKS
                        .iter()
                        .copied()
                        .chain(EXT_BLOCKS.iter().copied())
                        .filter(|(id, _)| !lacks.contains(id))
                        .collect(),
                    displays: default_displays(),
                    twins: Vec::new(),
                    addons: vec![
                        AddonScenario {
                            name: "wb-capture",
                            display: 0,
                            attach_after: ComponentId::COLOR0,
                            modules: vec![ComponentId::WDMA0],
                        },
                        AddonScenario {
                            name: "wb-capture",
                            display: 1,
                            attach_after: ComponentId::OVL7,
                            modules: vec![ComponentId::WDMA2],
                        },
                    ],
                    mutex_count: 4,
                    dual_capable: false,
                    discrete_path: false,
                }
            }
        }
    }

    pub fn display(&self, index: usize) -> Option<&DisplayTopology> {
        self.displays.iter().find(|d| d.index == index)
    }

    pub fn addon(&self, display: usize, name: &str) -> Option<&AddonScenario> {
        self.addons.iter().find(|a| a.display == display && a.name == name)
    }

    /// Whether an id is a real block on this variant
    pub fn has(&self, id: ComponentId) -> bool {
        self.components.iter().any(|(c, _)| *c == id)
    }

    /// Override the output interface of a display's path with the panel's
    /// driving discipline and port count
    pub fn apply_panel(&mut self, display: usize, mode: DriveMode, dual_port: bool) {
        let outputs: Vec<ComponentId> = self
            .display(display)
            .map(|t| t.major_tail.iter().chain(t.minor_tail.iter()).copied().collect())
            .unwrap_or_default();
        let twins: Vec<ComponentId> = outputs
            .iter()
            .filter_map(|id| self.twins.iter().find(|(p, _)| p == id).map(|(_, t)| *t))
            .collect();
        for (id, spec) in &mut self.components {
            if let BlockSpec::Output { .. } = spec {
                if outputs.contains(id) || twins.contains(id) {
                    *spec = BlockSpec::Output { mode, dual_port };
                }
            }
        }
    }
}
