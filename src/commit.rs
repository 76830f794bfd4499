//! Commit Protocol
//!
//! One commit turns a [`FrameConfig`] into one command batch:
//!
//! ```text
//!   BEGIN
//!     -> WAIT_PREV_FRAME_DONE     wait_no_clear(stream-eof)
//!     -> CONFIGURE                slots, addons, roi, layers
//!     -> MARK                     command-driven: release stream-block, set stream-dirty
//!                                 continuous:     wait continuous-eof, set stream-eof
//!     -> SUBMIT
//!     .. hardware ..
//!     -> CALLBACK                 fences, bandwidth bookkeeping
//! ```
//!
//! Configuration-class failures inside CONFIGURE skip the failing step
//! and the frame goes on; a full batch aborts the commit.

use crate::cmdq::slots::{Slot, MAX_LAYERS};
use crate::cmdq::{CommandBatch, EventId, EventName, EventTable};
use crate::component::blocks::OVL_LAYERS;
use crate::component::{Capability, ComponentId, DriveMode, Rect, Registry};
use crate::dual::TileOverhead;
use crate::error::{DpcError, DpcResult};

// =============================================================================
// Frame Description
// =============================================================================

/// One composition layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerConfig {
    /// Global layer index; engine `n` blends layers `n*4 .. n*4+4`
    pub index: usize,
    pub enabled: bool,
    pub src: Rect,
    /// Destination in panel coordinates
    pub dst: Rect,
    pub format: u32,
    pub pitch: u32,
    /// Fence value signalled when this frame retires
    pub fence: u32,
}

impl LayerConfig {
    /// Opaque full-screen layer
    pub fn full_screen(index: usize, width: u32, height: u32) -> Self {
        let rect = Rect::new(0, 0, width, height);
        Self { index, enabled: true, src: rect, dst: rect, format: 0, pitch: width * 4, fence: 0 }
    }

    /// Part of the layer inside columns `[x0, x1)`, shifted so `x0` is 0
    pub fn clip_columns(&self, x0: u32, x1: u32) -> Self {
        let left = self.dst.x.max(x0);
        let right = (self.dst.x + self.dst.width).min(x1);
        let mut out = *self;
        if right <= left {
            out.enabled = false;
            out.dst = Rect::default();
            return out;
        }
        let skipped = left - self.dst.x;
        out.dst = Rect::new(left - x0, self.dst.y, right - left, self.dst.height);
        out.src = Rect::new(self.src.x + skipped, self.src.y, right - left, self.src.height);
        out
    }
}

/// Everything one commit applies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameConfig {
    pub layers: Vec<LayerConfig>,
    /// Requested bandwidth for this frame
    pub bandwidth: u32,
    pub hrt_index: u32,
    pub present_fence: u32,
    /// Addon scenarios active for this frame
    pub addons: Vec<String>,
    /// Partial-update region
    pub roi: Option<Rect>,
    /// Adaptive-refresh merge-skip counter
    pub merge_skip: u32,
}

impl FrameConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, layer: LayerConfig) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: u32) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn with_addon(mut self, name: &str) -> Self {
        self.addons.push(name.to_string());
        self
    }

    pub fn with_roi(mut self, roi: Rect) -> Self {
        self.roi = Some(roi);
        self
    }

    pub fn with_present_fence(mut self, fence: u32) -> Self {
        self.present_fence = fence;
        self
    }
}

/// State carried into a frame's completion callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePayload {
    pub display: usize,
    pub seq: u64,
    pub bandwidth: u32,
    pub present_fence: u32,
    /// (layer index, fence value)
    pub layer_fences: Vec<(usize, u32)>,
}

// =============================================================================
// Bandwidth Budget
// =============================================================================

/// Raise-now, lower-later bandwidth bookkeeping.
///
/// A raise is applied before the frame that needs it is triggered. A
/// decrease waits until the frame that asked for it has completed, so it
/// can never overtake a heavier frame still in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BandwidthBudget {
    applied: u32,
    staged: Option<(u64, u32)>,
    /// Apply every request as-is (discrete-path SoCs)
    bypass: bool,
}

impl BandwidthBudget {
    pub fn new(bypass: bool) -> Self {
        Self { bypass, ..Default::default() }
    }

    pub fn applied(&self) -> u32 {
        self.applied
    }

    pub fn staged(&self) -> Option<(u64, u32)> {
        self.staged
    }

    pub fn is_bypass(&self) -> bool {
        self.bypass
    }

    /// Record frame `seq`'s request. Returns the value to push to QoS now.
    pub fn request(&mut self, seq: u64, value: u32) -> Option<u32> {
        if self.bypass {
            let changed = value != self.applied;
            self.applied = value;
            return changed.then_some(value);
        }
        if value >= self.applied {
            let changed = value != self.applied;
            self.applied = value;
            self.staged = None;
            changed.then_some(value)
        } else {
            self.staged = Some((seq, value));
            None
        }
    }

    /// Frame `seq` completed. Returns a decrease that became safe.
    pub fn complete(&mut self, seq: u64) -> Option<u32> {
        match self.staged {
            Some((staged_seq, value)) if staged_seq <= seq => {
                self.staged = None;
                self.applied = value;
                Some(value)
            }
            _ => None,
        }
    }

    /// Forget pending decreases (display disable)
    pub fn reset(&mut self) {
        self.applied = 0;
        self.staged = None;
    }
}

// =============================================================================
// Batch Stages
// =============================================================================

/// Stage reached by a commit, for trace output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStage {
    Begin,
    WaitPrevFrameDone,
    Configure,
    Mark,
    Submit,
    Callback,
}

/// Semaphores a commit uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitEvents {
    pub stream_eof: Option<EventId>,
    pub stream_dirty: Option<EventId>,
    pub stream_block: Option<EventId>,
    pub continuous_eof: Option<EventId>,
}

impl CommitEvents {
    pub fn from_table(table: &EventTable) -> Self {
        Self {
            stream_eof: table.get(EventName::StreamEof),
            stream_dirty: table.get(EventName::StreamDirty),
            stream_block: table.get(EventName::StreamBlock),
            continuous_eof: table.get(EventName::ContinuousEof),
        }
    }
}

/// Emit BEGIN and WAIT_PREV_FRAME_DONE, plus the head of the discipline's
/// framing
pub fn open_frame(batch: &mut CommandBatch, mode: DriveMode, ev: &CommitEvents) -> DpcResult<()> {
    if let Some(eof) = ev.stream_eof {
        batch.wait_no_clear(eof)?;
    }
    match mode {
        DriveMode::CommandDriven => {
            if let Some(block) = ev.stream_block {
                batch.wait_and_clear(block)?;
            }
        }
        DriveMode::Continuous => {
            if let Some(eof) = ev.stream_eof {
                batch.clear_event(eof)?;
            }
        }
    }
    Ok(())
}

/// Emit MARK: hand the frame to the trigger loop, or close the continuous
/// frame on the next end of frame
pub fn close_frame(batch: &mut CommandBatch, mode: DriveMode, ev: &CommitEvents) -> DpcResult<()> {
    match mode {
        DriveMode::CommandDriven => {
            if let Some(block) = ev.stream_block {
                batch.set_event(block)?;
            }
            if let Some(dirty) = ev.stream_dirty {
                batch.set_event(dirty)?;
            }
        }
        DriveMode::Continuous => {
            if let Some(ceof) = ev.continuous_eof {
                batch.wait_and_clear(ceof)?;
            }
            if let Some(eof) = ev.stream_eof {
                batch.set_event(eof)?;
            }
        }
    }
    Ok(())
}

/// Slot writes of CONFIGURE
pub fn write_frame_slots(
    batch: &mut CommandBatch,
    display: usize,
    frame: &FrameConfig,
    applied_bw: u32,
    seq: u64,
) -> DpcResult<()> {
    batch.write_value(Slot::BwRequest.addr(display), applied_bw)?;
    batch.write_value(Slot::HrtIndex.addr(display), frame.hrt_index)?;
    batch.write_value(Slot::MergeSkip.addr(display), frame.merge_skip)?;
    for layer in frame.layers.iter().filter(|l| l.index < MAX_LAYERS) {
        batch.write_value(Slot::LayerFence(layer.index).addr(display), layer.fence)?;
    }
    batch.write_value(Slot::PresentFence.addr(display), frame.present_fence)?;
    batch.write_value(Slot::TraceStatus.addr(display), seq as u32)
}

/// Log and drop configuration-class errors; pass everything else up
pub fn best_effort(display: usize, what: &str, result: DpcResult<()>) -> DpcResult<()> {
    match result {
        Err(err) if err.is_config_class() => {
            log::warn!("[disp{}] {} skipped: {}", display, what, err);
            Ok(())
        }
        other => other,
    }
}

/// Dispatch layers to their engines. On dual displays each pipe receives
/// its half of every layer, widened past the midline by the pipe's tile
/// overhead.
pub fn configure_layers(
    reg: &mut Registry,
    batch: &mut CommandBatch,
    display: usize,
    layers: &[LayerConfig],
    engines: &[ComponentId],
    twins: Option<(&[ComponentId], u32, &TileOverhead)>,
) -> DpcResult<()> {
    for layer in layers {
        let engine = match engines.get(layer.index / OVL_LAYERS) {
            Some(engine) => *engine,
            None => {
                best_effort(
                    display,
                    "layer",
                    Err(DpcError::InvalidArgument(format!(
                        "layer {} beyond {} engines",
                        layer.index,
                        engines.len()
                    ))),
                )?;
                continue;
            }
        };
        match twins {
            None => {
                let r = reg.dispatch(Capability::Layer(layer), engine, batch);
                best_effort(display, "layer", r)?;
            }
            Some((twin_engines, half, tile)) => {
                let left = layer.clip_columns(0, half + tile.left_overhead);
                let r = reg.dispatch(Capability::Layer(&left), engine, batch);
                best_effort(display, "layer", r)?;
                if let Some(twin) = twin_engines.get(layer.index / OVL_LAYERS) {
                    let right = layer.clip_columns(half.saturating_sub(tile.right_overhead), half * 2);
                    let r = reg.dispatch(Capability::Layer(&right), *twin, batch);
                    best_effort(display, "layer", r)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdq::Instruction;
    use crate::component::{SocTable, SocVariant};

    #[test]
    fn test_raise_applies_immediately() {
        let mut bw = BandwidthBudget::new(false);
        assert_eq!(bw.request(1, 100), Some(100));
        assert_eq!(bw.request(2, 300), Some(300));
        assert_eq!(bw.applied(), 300);
        assert_eq!(bw.request(3, 300), None);
    }

    #[test]
    fn test_decrease_waits_for_completion() {
        let mut bw = BandwidthBudget::new(false);
        bw.request(1, 300);
        assert_eq!(bw.request(2, 100), None);
        assert_eq!(bw.applied(), 300);
        assert_eq!(bw.complete(1), None);
        assert_eq!(bw.applied(), 300);
        assert_eq!(bw.complete(2), Some(100));
        assert_eq!(bw.applied(), 100);
    }

    #[test]
    fn test_raise_cancels_staged_decrease() {
        let mut bw = BandwidthBudget::new(false);
        bw.request(1, 300);
        bw.request(2, 100);
        assert_eq!(bw.request(3, 400), Some(400));
        assert_eq!(bw.staged(), None);
        assert_eq!(bw.complete(2), None);
        assert_eq!(bw.applied(), 400);
    }

    #[test]
    fn test_bypass_applies_everything() {
        let mut bw = BandwidthBudget::new(true);
        bw.request(1, 300);
        assert_eq!(bw.request(2, 100), Some(100));
        assert_eq!(bw.applied(), 100);
        assert_eq!(bw.complete(2), None);
    }

    #[test]
    fn test_clip_columns() {
        let layer = LayerConfig::full_screen(0, 3840, 1080);
        let left = layer.clip_columns(0, 1920);
        assert_eq!(left.dst, Rect::new(0, 0, 1920, 1080));
        let right = layer.clip_columns(1920, 3840);
        assert_eq!(right.dst, Rect::new(0, 0, 1920, 1080));
        assert_eq!(right.src.x, 1920);
        let mut small = LayerConfig::full_screen(1, 100, 100);
        small.dst.x = 10;
        assert!(!small.clip_columns(1920, 3840).enabled);
    }

    #[test]
    fn test_command_driven_framing() {
        let ev = CommitEvents {
            stream_eof: Some(EventId(1)),
            stream_dirty: Some(EventId(2)),
            stream_block: Some(EventId(3)),
            continuous_eof: Some(EventId(4)),
        };
        let mut batch = CommandBatch::new("frame");
        open_frame(&mut batch, DriveMode::CommandDriven, &ev).unwrap();
        close_frame(&mut batch, DriveMode::CommandDriven, &ev).unwrap();
        assert_eq!(
            batch.instructions(),
            &[
                Instruction::WaitNoClear(EventId(1)),
                Instruction::WaitAndClear(EventId(3)),
                Instruction::SetEvent(EventId(3)),
                Instruction::SetEvent(EventId(2)),
            ]
        );
    }

    #[test]
    fn test_continuous_framing() {
        let ev = CommitEvents {
            stream_eof: Some(EventId(1)),
            continuous_eof: Some(EventId(4)),
            ..Default::default()
        };
        let mut batch = CommandBatch::new("frame");
        open_frame(&mut batch, DriveMode::Continuous, &ev).unwrap();
        close_frame(&mut batch, DriveMode::Continuous, &ev).unwrap();
        assert_eq!(
            batch.instructions(),
            &[
                Instruction::WaitNoClear(EventId(1)),
                Instruction::ClearEvent(EventId(1)),
                Instruction::WaitAndClear(EventId(4)),
                Instruction::SetEvent(EventId(1)),
            ]
        );
    }

    #[test]
    fn test_layer_beyond_engines_skipped() {
        let soc = SocTable::for_variant(SocVariant::Mt6985);
        let mut reg = Registry::for_soc(&soc);
        let mut batch = CommandBatch::new("frame");
        let layers = [LayerConfig::full_screen(0, 1920, 1080), LayerConfig::full_screen(9, 1920, 1080)];
        configure_layers(&mut reg, &mut batch, 0, &layers, &[ComponentId::OVL0], None).unwrap();
        assert!(!batch.is_empty());
    }

    #[test]
    fn test_dual_layers_fetch_overhead_columns() {
        use crate::component::blocks::{LAYER_STRIDE, REG_LAYER_BASE};

        let soc = SocTable::for_variant(SocVariant::Mt6985);
        let mut reg = Registry::for_soc(&soc);
        let mut batch = CommandBatch::new("frame");
        let tile = TileOverhead {
            supported: true,
            left_overhead: 8,
            right_overhead: 8,
            left_in_width: 728,
            right_in_width: 728,
        };
        let layers = [LayerConfig::full_screen(0, 1440, 3200), LayerConfig::full_screen(1, 716, 3200)];
        configure_layers(
            &mut reg,
            &mut batch,
            0,
            &layers,
            &[ComponentId::OVL0],
            Some((&[ComponentId::OVL3], 720, &tile)),
        )
        .unwrap();

        let written = |id: ComponentId, slot: u64, off: u64| -> Option<u32> {
            let addr = id.regs_base() + REG_LAYER_BASE + slot * LAYER_STRIDE + off;
            batch.instructions().iter().rev().find_map(|i| match i {
                Instruction::Write { addr: a, value, .. } if *a == addr => Some(*value),
                _ => None,
            })
        };
        // src size is packed height << 16 | width
        assert_eq!(written(ComponentId::OVL0, 0, 0x0c), Some(3200 << 16 | 728));
        assert_eq!(written(ComponentId::OVL3, 0, 0x0c), Some(3200 << 16 | 728));
        // the right pipe starts fetching 8 columns left of the midline
        assert_eq!(written(ComponentId::OVL3, 0, 0x04), Some(0));
        // a layer ending 4 columns past the overhead start reaches pipe 1
        assert_eq!(written(ComponentId::OVL3, 1, 0x0c), Some(3200 << 16 | 4));
        assert_eq!(written(ComponentId::OVL0, 1, 0x0c), Some(3200 << 16 | 716));
    }

    #[test]
    fn test_best_effort_passes_resource_errors() {
        assert!(best_effort(0, "x", Err(DpcError::InvalidGeometry("0x0".into()))).is_ok());
        assert!(best_effort(0, "x", Err(DpcError::BatchFull(4))).is_err());
    }
}
