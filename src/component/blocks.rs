//! Block Models
//!
//! One model per block type. Each model keeps a small amount of CPU-side
//! state (running, powered, last geometry) and emits register writes into
//! the active command batch; it never touches hardware directly.
//!
//! Register layout shared by every block window:
//!
//! ```text
//!   +0x000  EN          bit0 = running
//!   +0x004  RST         bit0 = reset pulse
//!   +0x008  SIZE        [31:16] height, [15:0] width
//!   +0x00c  SRC_SIZE    input size incl. overhead columns
//!   +0x010  CFG         type-specific control
//!   +0x014  ROI_XY      partial-update origin
//!   +0x018  ROI_SIZE    partial-update size
//!   +0x01c  BYPASS      bit0 = relay mode
//!   +0x020  POWER       bit0 = clock enabled
//!   +0x100  LAYER(n)    per-layer windows, 0x20 each
//! ```

use super::{Block, Caps, ComponentId, ComponentType, DdpConfig, DriveMode, Rect};
use crate::cmdq::CommandBatch;
use crate::commit::LayerConfig;
use crate::error::{DpcError, DpcResult};

pub const REG_EN: u64 = 0x000;
pub const REG_RST: u64 = 0x004;
pub const REG_SIZE: u64 = 0x008;
pub const REG_SRC_SIZE: u64 = 0x00c;
pub const REG_CFG: u64 = 0x010;
pub const REG_ROI_XY: u64 = 0x014;
pub const REG_ROI_SIZE: u64 = 0x018;
pub const REG_BYPASS: u64 = 0x01c;
pub const REG_POWER: u64 = 0x020;
pub const REG_LAYER_BASE: u64 = 0x100;
pub const LAYER_STRIDE: u64 = 0x20;

/// Overhead columns of the adaptive-luma corrector
pub const AAL_OVERHEAD: u32 = 8;
/// Overhead columns of the histogram engine
pub const CHIST_OVERHEAD: u32 = 4;

/// Layers an overlay engine blends
pub const OVL_LAYERS: usize = 4;

fn pack(hi: u32, lo: u32) -> u32 {
    (hi << 16) | (lo & 0xffff)
}

fn check_geometry(id: ComponentId, cfg: &DdpConfig) -> DpcResult<()> {
    if cfg.width == 0 || cfg.height == 0 {
        return Err(DpcError::InvalidGeometry(format!(
            "{}: {}x{}",
            id, cfg.width, cfg.height
        )));
    }
    if cfg.width > 0xffff || cfg.height > 0xffff {
        return Err(DpcError::InvalidGeometry(format!(
            "{}: {}x{} exceeds size register",
            id, cfg.width, cfg.height
        )));
    }
    Ok(())
}

// =============================================================================
// Common State
// =============================================================================

/// State every block model shares
#[derive(Debug, Clone)]
struct BlockState {
    id: ComponentId,
    base: u64,
    running: bool,
    powered: bool,
    bypass: bool,
    width: u32,
    height: u32,
}

impl BlockState {
    fn new(id: ComponentId) -> Self {
        Self {
            id,
            base: id.regs_base(),
            running: false,
            powered: false,
            bypass: false,
            width: 0,
            height: 0,
        }
    }

    fn reg(&self, off: u64) -> u64 {
        self.base + off
    }

    fn configure(&mut self, cfg: &DdpConfig, batch: &mut CommandBatch) -> DpcResult<()> {
        check_geometry(self.id, cfg)?;
        batch.write_value(self.reg(REG_SIZE), pack(cfg.height, cfg.width))?;
        batch.write_value(self.reg(REG_SRC_SIZE), pack(cfg.height, cfg.in_width()))?;
        self.width = cfg.width;
        self.height = cfg.height;
        Ok(())
    }

    fn start(&mut self, batch: &mut CommandBatch) -> DpcResult<()> {
        batch.write(self.reg(REG_EN), 1, 1)?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self, batch: &mut CommandBatch) -> DpcResult<()> {
        batch.write(self.reg(REG_EN), 0, 1)?;
        self.running = false;
        Ok(())
    }

    fn reset(&mut self, batch: &mut CommandBatch) -> DpcResult<()> {
        batch.write(self.reg(REG_RST), 1, 1)?;
        batch.write(self.reg(REG_RST), 0, 1)?;
        Ok(())
    }

    fn power(&mut self, on: bool, batch: &mut CommandBatch) -> DpcResult<()> {
        batch.write(self.reg(REG_POWER), on as u32, 1)?;
        self.powered = on;
        Ok(())
    }

    fn roi(&mut self, roi: &Rect, batch: &mut CommandBatch) -> DpcResult<()> {
        if roi.is_empty() {
            return Err(DpcError::InvalidGeometry(format!("{}: empty roi", self.id)));
        }
        batch.write_value(self.reg(REG_ROI_XY), pack(roi.y, roi.x))?;
        batch.write_value(self.reg(REG_ROI_SIZE), pack(roi.height, roi.width))
    }

    fn set_bypass(&mut self, enable: bool, batch: &mut CommandBatch) -> DpcResult<()> {
        batch.write(self.reg(REG_BYPASS), enable as u32, 1)?;
        self.bypass = enable;
        Ok(())
    }

    fn summary(&self, name: &str) -> String {
        format!(
            "{} {} {}x{} run={} pwr={} bypass={}",
            self.id, name, self.width, self.height, self.running, self.powered, self.bypass
        )
    }
}

/// Forward the power/run operations every model implements the same way
macro_rules! common_ops {
    () => {
        fn start(&mut self, batch: &mut CommandBatch) -> DpcResult<()> {
            self.state.start(batch)
        }

        fn stop(&mut self, batch: &mut CommandBatch) -> DpcResult<()> {
            self.state.stop(batch)
        }

        fn reset(&mut self, batch: &mut CommandBatch) -> DpcResult<()> {
            self.state.reset(batch)
        }

        fn prepare(&mut self, batch: &mut CommandBatch) -> DpcResult<()> {
            self.state.power(true, batch)
        }

        fn unprepare(&mut self, batch: &mut CommandBatch) -> DpcResult<()> {
            self.state.power(false, batch)
        }
    };
}

const BASE_CAPS: Caps = Caps::CONFIGURE
    .union(Caps::START)
    .union(Caps::STOP)
    .union(Caps::RESET)
    .union(Caps::PREPARE);

// =============================================================================
// Composition Engine (OVL)
// =============================================================================

/// Overlay composition engine
#[derive(Debug)]
pub struct Ovl {
    state: BlockState,
    layers: [bool; OVL_LAYERS],
}

impl Ovl {
    pub fn new(id: ComponentId) -> Self {
        Self { state: BlockState::new(id), layers: [false; OVL_LAYERS] }
    }

    pub fn enabled_layers(&self) -> usize {
        self.layers.iter().filter(|on| **on).count()
    }
}

impl Block for Ovl {
    fn ty(&self) -> ComponentType {
        ComponentType::CompositionEngine
    }

    fn caps(&self) -> Caps {
        BASE_CAPS | Caps::LAYER | Caps::PARTIAL_UPDATE
    }

    fn configure(&mut self, cfg: &DdpConfig, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.configure(cfg, batch)
    }

    common_ops!();

    fn partial_update(&mut self, roi: &Rect, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.roi(roi, batch)
    }

    fn layer(&mut self, layer: &LayerConfig, batch: &mut CommandBatch) -> DpcResult<()> {
        let slot = layer.index % OVL_LAYERS;
        let base = self.state.reg(REG_LAYER_BASE + slot as u64 * LAYER_STRIDE);
        if !layer.enabled {
            batch.write(base, 0, 1)?;
            self.layers[slot] = false;
            return Ok(());
        }
        if layer.src.is_empty() || layer.dst.is_empty() {
            return Err(DpcError::InvalidGeometry(format!(
                "{}: layer {} has empty window",
                self.state.id, layer.index
            )));
        }
        batch.write(base, 1, 1)?;
        batch.write_value(base + 0x04, pack(layer.dst.y, layer.dst.x))?;
        batch.write_value(base + 0x08, pack(layer.dst.height, layer.dst.width))?;
        batch.write_value(base + 0x0c, pack(layer.src.height, layer.src.width))?;
        batch.write_value(base + 0x10, layer.format)?;
        batch.write_value(base + 0x14, layer.pitch)?;
        self.layers[slot] = true;
        Ok(())
    }

    fn dump(&self) -> String {
        format!("{} layers={}", self.state.summary("ovl"), self.enabled_layers())
    }
}

// =============================================================================
// Resizer
// =============================================================================

#[derive(Debug)]
pub struct Resizer {
    state: BlockState,
}

impl Resizer {
    pub fn new(id: ComponentId) -> Self {
        Self { state: BlockState::new(id) }
    }
}

impl Block for Resizer {
    fn ty(&self) -> ComponentType {
        ComponentType::Resizer
    }

    fn caps(&self) -> Caps {
        BASE_CAPS | Caps::BYPASS | Caps::PARTIAL_UPDATE
    }

    fn configure(&mut self, cfg: &DdpConfig, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.configure(cfg, batch)?;
        // 1:1 scaling unless a layering decision requests otherwise
        batch.write_value(self.state.reg(REG_CFG), 0x1_0000)
    }

    common_ops!();

    fn partial_update(&mut self, roi: &Rect, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.roi(roi, batch)
    }

    fn bypass(&mut self, enable: bool, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.set_bypass(enable, batch)
    }

    fn dump(&self) -> String {
        self.state.summary("rsz")
    }
}

// =============================================================================
// Color Corrector (AAL, COLOR)
// =============================================================================

/// Post-processing color stage. The adaptive-luma variant reads context
/// columns across the split midline.
#[derive(Debug)]
pub struct ColorCorrector {
    state: BlockState,
    overhead: u32,
}

impl ColorCorrector {
    pub fn new(id: ComponentId, overhead: u32) -> Self {
        Self { state: BlockState::new(id), overhead }
    }
}

impl Block for ColorCorrector {
    fn ty(&self) -> ComponentType {
        ComponentType::ColorCorrector
    }

    fn caps(&self) -> Caps {
        let caps = BASE_CAPS | Caps::BYPASS | Caps::PARTIAL_UPDATE;
        if self.overhead > 0 {
            caps | Caps::OVERHEAD
        } else {
            caps
        }
    }

    fn overhead_columns(&self) -> u32 {
        self.overhead
    }

    fn configure(&mut self, cfg: &DdpConfig, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.configure(cfg, batch)?;
        // CFG[0] selects two-pipe edge handling, CFG[15:8] the overhead
        let ctrl = (cfg.dual as u32) | ((cfg.overhead & 0xff) << 8);
        batch.write_value(self.state.reg(REG_CFG), ctrl)
    }

    common_ops!();

    fn partial_update(&mut self, roi: &Rect, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.roi(roi, batch)
    }

    fn bypass(&mut self, enable: bool, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.set_bypass(enable, batch)
    }

    fn dump(&self) -> String {
        format!("{} overhead={}", self.state.summary("color"), self.overhead)
    }
}

// =============================================================================
// Histogram
// =============================================================================

/// Decoupled statistics engine. Runs beside the pixel stream, so it has
/// no relay mode and ignores partial updates.
#[derive(Debug)]
pub struct Histogram {
    state: BlockState,
    overhead: u32,
}

impl Histogram {
    pub fn new(id: ComponentId) -> Self {
        Self { state: BlockState::new(id), overhead: CHIST_OVERHEAD }
    }
}

impl Block for Histogram {
    fn ty(&self) -> ComponentType {
        ComponentType::Histogram
    }

    fn caps(&self) -> Caps {
        BASE_CAPS | Caps::OVERHEAD
    }

    fn overhead_columns(&self) -> u32 {
        self.overhead
    }

    fn configure(&mut self, cfg: &DdpConfig, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.configure(cfg, batch)?;
        // Statistics window excludes the overhead columns
        let (start, end) = match cfg.pipe {
            crate::path::PipeId::Pipe0 => (0, cfg.width.saturating_sub(1)),
            crate::path::PipeId::Pipe1 => (cfg.overhead, cfg.in_width().saturating_sub(1)),
        };
        batch.write_value(self.state.reg(REG_CFG), pack(end, start))
    }

    common_ops!();

    fn dump(&self) -> String {
        self.state.summary("chist")
    }
}

// =============================================================================
// Encoder (DSC)
// =============================================================================

#[derive(Debug)]
pub struct Encoder {
    state: BlockState,
    slice_width: u32,
}

impl Encoder {
    pub fn new(id: ComponentId) -> Self {
        Self { state: BlockState::new(id), slice_width: 0 }
    }
}

impl Block for Encoder {
    fn ty(&self) -> ComponentType {
        ComponentType::Encoder
    }

    fn caps(&self) -> Caps {
        BASE_CAPS | Caps::BYPASS | Caps::PARTIAL_UPDATE
    }

    fn configure(&mut self, cfg: &DdpConfig, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.configure(cfg, batch)?;
        // Two slices per pipe
        self.slice_width = cfg.width.div_ceil(2);
        batch.write_value(self.state.reg(REG_CFG), self.slice_width)
    }

    common_ops!();

    fn partial_update(&mut self, roi: &Rect, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.roi(roi, batch)
    }

    fn bypass(&mut self, enable: bool, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.set_bypass(enable, batch)
    }

    fn dump(&self) -> String {
        format!("{} slice={}", self.state.summary("dsc"), self.slice_width)
    }
}

// =============================================================================
// Write-back DMA
// =============================================================================

#[derive(Debug)]
pub struct WritebackDma {
    state: BlockState,
    frames: u64,
}

impl WritebackDma {
    pub fn new(id: ComponentId) -> Self {
        Self { state: BlockState::new(id), frames: 0 }
    }
}

impl Block for WritebackDma {
    fn ty(&self) -> ComponentType {
        ComponentType::WritebackDma
    }

    fn caps(&self) -> Caps {
        BASE_CAPS
    }

    fn configure(&mut self, cfg: &DdpConfig, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.configure(cfg, batch)?;
        self.frames += 1;
        Ok(())
    }

    common_ops!();

    fn dump(&self) -> String {
        format!("{} frames={}", self.state.summary("wdma"), self.frames)
    }
}

// =============================================================================
// Output Interface (DSI, DP)
// =============================================================================

/// Panel-facing output interface
#[derive(Debug)]
pub struct OutputInterface {
    state: BlockState,
    mode: DriveMode,
    dual_port: bool,
}

impl OutputInterface {
    pub fn new(id: ComponentId, mode: DriveMode, dual_port: bool) -> Self {
        Self { state: BlockState::new(id), mode, dual_port }
    }

    pub fn dual_port(&self) -> bool {
        self.dual_port
    }
}

impl Block for OutputInterface {
    fn ty(&self) -> ComponentType {
        ComponentType::OutputInterface
    }

    fn caps(&self) -> Caps {
        let caps = BASE_CAPS | Caps::PARTIAL_UPDATE;
        match self.mode {
            DriveMode::CommandDriven => caps | Caps::COMMAND_MODE,
            DriveMode::Continuous => caps,
        }
    }

    fn configure(&mut self, cfg: &DdpConfig, batch: &mut CommandBatch) -> DpcResult<()> {
        self.state.configure(cfg, batch)?;
        let ctrl = match self.mode {
            DriveMode::CommandDriven => 0x1,
            DriveMode::Continuous => 0x2,
        } | ((cfg.dual as u32) << 4);
        batch.write_value(self.state.reg(REG_CFG), ctrl)?;
        batch.write_value(self.state.reg(REG_CFG + 0x40), cfg.refresh)
    }

    common_ops!();

    fn partial_update(&mut self, roi: &Rect, batch: &mut CommandBatch) -> DpcResult<()> {
        if self.mode == DriveMode::Continuous {
            log::debug!("{}: partial update ignored in continuous mode", self.state.id);
            return Ok(());
        }
        self.state.roi(roi, batch)
    }

    fn dump(&self) -> String {
        format!("{} mode={:?} dual_port={}", self.state.summary("out"), self.mode, self.dual_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdq::Instruction;
    use crate::path::PipeId;

    fn cfg(width: u32, overhead: u32) -> DdpConfig {
        DdpConfig { width, height: 1080, refresh: 60, overhead, pipe: PipeId::Pipe0, dual: false }
    }

    #[test]
    fn test_configure_writes_size() {
        let mut ovl = Ovl::new(ComponentId::OVL0);
        let mut batch = CommandBatch::new("test");
        ovl.configure(&cfg(1920, 0), &mut batch).unwrap();
        let base = ComponentId::OVL0.regs_base();
        assert_eq!(
            batch.instructions()[0],
            Instruction::Write { addr: base + REG_SIZE, value: (1080 << 16) | 1920, mask: u32::MAX }
        );
    }

    #[test]
    fn test_zero_geometry_rejected() {
        let mut aal = ColorCorrector::new(ComponentId::AAL0, AAL_OVERHEAD);
        let mut batch = CommandBatch::new("test");
        let err = aal.configure(&cfg(0, 0), &mut batch).unwrap_err();
        assert!(err.is_config_class());
        assert!(batch.is_empty());
    }

    #[test]
    fn test_overhead_caps() {
        assert!(ColorCorrector::new(ComponentId::AAL0, AAL_OVERHEAD).caps().contains(Caps::OVERHEAD));
        assert!(!ColorCorrector::new(ComponentId::COLOR0, 0).caps().contains(Caps::OVERHEAD));
        let chist = Histogram::new(ComponentId::CHIST0);
        assert!(chist.caps().contains(Caps::OVERHEAD));
        assert!(!chist.caps().contains(Caps::BYPASS));
    }

    #[test]
    fn test_source_width_includes_overhead() {
        let mut aal = ColorCorrector::new(ComponentId::AAL0, AAL_OVERHEAD);
        let mut batch = CommandBatch::new("test");
        aal.configure(&cfg(960, 8), &mut batch).unwrap();
        let base = ComponentId::AAL0.regs_base();
        assert!(batch.instructions().contains(&Instruction::Write {
            addr: base + REG_SRC_SIZE,
            value: (1080 << 16) | 968,
            mask: u32::MAX,
        }));
    }

    #[test]
    fn test_output_drive_mode_caps() {
        let dsi = OutputInterface::new(ComponentId::DSI0, DriveMode::CommandDriven, false);
        assert!(dsi.caps().contains(Caps::COMMAND_MODE));
        let dp = OutputInterface::new(ComponentId::DP_INTF0, DriveMode::Continuous, false);
        assert!(!dp.caps().contains(Caps::COMMAND_MODE));
    }

    #[test]
    fn test_ovl_layer_toggle() {
        let mut ovl = Ovl::new(ComponentId::OVL1);
        let mut batch = CommandBatch::new("test");
        let mut layer = LayerConfig::full_screen(0, 1920, 1080);
        ovl.layer(&layer, &mut batch).unwrap();
        assert_eq!(ovl.enabled_layers(), 1);
        layer.enabled = false;
        ovl.layer(&layer, &mut batch).unwrap();
        assert_eq!(ovl.enabled_layers(), 0);
    }
}
