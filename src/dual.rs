//! Dual-Pipe Coordinator
//!
//! Very wide or fast panels are split down the middle across two twin
//! pipelines. This module decides when a display splits, maps pipe 0
//! components to their pipe 1 twins, and computes the tile overhead each
//! pipe reads across the midline.
//!
//! ```text
//!            width / 2              width / 2
//!   +----------------------+----------------------+
//!   |        pipe 0        |        pipe 1        |
//!   |                 |<-->|<-->|                 |
//!   +-----------------+----+----+-----------------+
//!                  right ovh  left ovh
//! ```

use std::collections::BTreeMap;

use crate::component::{ComponentId, Registry, SocTable};
use crate::error::{DpcError, DpcResult};
use crate::path::Path;

// =============================================================================
// Twin Map
// =============================================================================

/// Injective map from pipe 0 components to their pipe 1 twins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DualPipeMap {
    pairs: BTreeMap<ComponentId, ComponentId>,
}

impl DualPipeMap {
    pub fn from_soc(soc: &SocTable) -> Self {
        Self { pairs: soc.twins.iter().copied().collect() }
    }

    /// Twin of `id`, or [`ComponentId::NONE`] when it has none
    pub fn map(&self, id: ComponentId) -> ComponentId {
        self.pairs.get(&id).copied().unwrap_or(ComponentId::NONE)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

// =============================================================================
// Split Decision
// =============================================================================

/// Active display timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
    /// Pixel clock
    pub clock_khz: u32,
}

impl Geometry {
    pub fn validate(&self) -> DpcResult<()> {
        if self.width == 0 || self.height == 0 || self.refresh == 0 {
            return Err(DpcError::InvalidGeometry(format!(
                "{}x{}@{}",
                self.width, self.height, self.refresh
            )));
        }
        Ok(())
    }

    /// Frame period in microseconds
    pub fn frame_period_us(&self) -> u32 {
        1_000_000 / self.refresh.max(1)
    }
}

/// Thresholds above which the secondary display splits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualPolicy {
    pub width_threshold: u32,
    pub refresh_threshold: u32,
    pub clock_khz_threshold: u32,
}

impl Default for DualPolicy {
    fn default() -> Self {
        Self { width_threshold: 2560, refresh_threshold: 120, clock_khz_threshold: 600_000 }
    }
}

/// Whether a display must split across two pipes.
///
/// Pure function of geometry, panel capability and SoC flags.
pub fn is_dual(
    display: usize,
    geo: &Geometry,
    dual_port: bool,
    soc: &SocTable,
    policy: &DualPolicy,
) -> bool {
    if !soc.dual_capable {
        return false;
    }
    if dual_port {
        return true;
    }
    if soc.discrete_path && display == 0 {
        return true;
    }
    display == 1
        && (geo.width > policy.width_threshold
            || geo.refresh >= policy.refresh_threshold
            || geo.clock_khz > policy.clock_khz_threshold)
}

/// Width one pipe outputs
pub fn split_width(width: u32, dual: bool) -> DpcResult<u32> {
    if !dual {
        return Ok(width);
    }
    if width % 2 != 0 {
        return Err(DpcError::InvalidGeometry(format!("odd width {} cannot split", width)));
    }
    Ok(width / 2)
}

// =============================================================================
// Tile Overhead
// =============================================================================

/// Per-pipe midline context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileOverhead {
    pub supported: bool,
    /// Columns pipe 0 reads past its right edge
    pub left_overhead: u32,
    /// Columns pipe 1 reads past its left edge
    pub right_overhead: u32,
    pub left_in_width: u32,
    pub right_in_width: u32,
}

impl TileOverhead {
    pub fn total(&self) -> u32 {
        self.left_overhead.max(self.right_overhead)
    }
}

/// Walk a path sink-first and record on every component the overhead its
/// downstream stages need. Returns the path maximum.
fn walk_overhead(path: &Path, reg: &mut Registry, enabled: bool) -> DpcResult<u32> {
    let mut running = 0;
    for id in path.comps.iter().rev() {
        let own = reg.get(*id)?.overhead_columns();
        running = running.max(own);
        reg.set_overhead(*id, if enabled { running } else { 0 })?;
    }
    Ok(if enabled { running } else { 0 })
}

/// Recompute the tile overhead of a display's pipes.
///
/// `pipe1` is only walked for dual displays. Overhead is zero unless the
/// platform supports it and the display is split.
pub fn compute_overhead(
    pipe0: &Path,
    pipe1: Option<&Path>,
    reg: &mut Registry,
    width: u32,
    supported: bool,
) -> DpcResult<TileOverhead> {
    let dual = pipe1.is_some();
    let enabled = supported && dual;
    let half = split_width(width, dual)?;
    let left = walk_overhead(pipe0, reg, enabled)?;
    let right = match pipe1 {
        Some(path) => walk_overhead(path, reg, enabled)?,
        None => 0,
    };
    let tile = TileOverhead {
        supported,
        left_overhead: left,
        right_overhead: right,
        left_in_width: half + left,
        right_in_width: if dual { half + right } else { 0 },
    };
    log::debug!("tile overhead: {:?}", tile);
    Ok(tile)
}
