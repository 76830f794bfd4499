//! Platform Configuration
//!
//! Platform description files are TOML:
//!
//! ```toml
//! [platform]
//! soc = "mt6985"
//! timeout_ms = 100
//!
//! [[display]]
//! index = 0
//! panel = { width = 1080, height = 2400, refresh = 120, cmd_mode = true }
//! trigger_loop = { te_wait = true, prefetch_offset_us = 200 }
//!
//! [display.events]
//! stream-eof = 100
//! stream-dirty = 101
//! ```
//!
//! Every section is optional and falls back to its `Default`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cmdq::{EventName, EventTable};
use crate::component::{DriveMode, SocVariant};
use crate::dual::{DualPolicy, Geometry};
use crate::error::{DpcError, DpcResult};

/// Semaphore ids start here on display 0
const EVENT_BASE: u16 = 100;
/// Semaphore id stride between displays
const EVENT_STRIDE: u16 = 16;

/// Root of a platform file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub platform: PlatformSection,
    #[serde(default, rename = "display")]
    pub displays: Vec<DisplayConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSection {
    pub soc: String,
    /// Overrides the SoC table's discrete-path flag
    pub discrete_path: Option<bool>,
    /// Whether dual-pipe tile overhead is applied
    pub tile_overhead: bool,
    pub dual_width_threshold: u32,
    pub dual_refresh_threshold: u32,
    pub dual_clock_khz_threshold: u32,
    /// Bound on every blocking hardware wait
    pub timeout_ms: u64,
    /// Instruction capacity of commit batches
    pub batch_capacity: usize,
}

impl Default for PlatformSection {
    fn default() -> Self {
        let policy = DualPolicy::default();
        Self {
            soc: SocVariant::Mt6985.as_str().to_string(),
            discrete_path: None,
            tile_overhead: true,
            dual_width_threshold: policy.width_threshold,
            dual_refresh_threshold: policy.refresh_threshold,
            dual_clock_khz_threshold: policy.clock_khz_threshold,
            timeout_ms: 100,
            batch_capacity: crate::cmdq::DEFAULT_BATCH_CAPACITY,
        }
    }
}

impl PlatformSection {
    pub fn variant(&self) -> DpcResult<SocVariant> {
        self.soc.parse()
    }

    pub fn dual_policy(&self) -> DualPolicy {
        DualPolicy {
            width_threshold: self.dual_width_threshold,
            refresh_threshold: self.dual_refresh_threshold,
            clock_khz_threshold: self.dual_clock_khz_threshold,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One display surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub index: usize,
    #[serde(default)]
    pub panel: PanelConfig,
    #[serde(default)]
    pub trigger_loop: TriggerLoopConfig,
    #[serde(default)]
    pub event_loop: EventLoopConfig,
    /// Initial composition-engine mask; the SoC default when absent
    #[serde(default)]
    pub engine_mask: Option<u32>,
    /// Semaphore ids by name; the built-in numbering when absent
    #[serde(default)]
    pub events: Option<BTreeMap<String, u16>>,
}

impl DisplayConfig {
    pub fn new(index: usize, panel: PanelConfig) -> Self {
        Self {
            index,
            panel,
            trigger_loop: TriggerLoopConfig::default(),
            event_loop: EventLoopConfig::default(),
            engine_mask: None,
            events: None,
        }
    }

    /// Resolve this display's semaphores
    pub fn event_table(&self) -> EventTable {
        match &self.events {
            Some(events) => EventTable::resolve(self.index, events.iter()),
            None => {
                let defaults = default_events(self.index);
                EventTable::resolve(self.index, defaults.iter())
            }
        }
    }
}

/// Built-in semaphore numbering of a display
pub fn default_events(index: usize) -> BTreeMap<String, u16> {
    let base = EVENT_BASE + index as u16 * EVENT_STRIDE;
    EventName::ALL
        .iter()
        .enumerate()
        .map(|(i, ev)| (ev.as_str().to_string(), base + i as u16))
        .collect()
}

/// Attached panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
    /// Command-mode panel (explicit triggers) rather than video mode
    pub cmd_mode: bool,
    pub dual_port: bool,
    /// Pixel clock; derived from the timing when 0
    pub clock_khz: u32,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self { width: 1920, height: 1080, refresh: 60, cmd_mode: true, dual_port: false, clock_khz: 0 }
    }
}

impl PanelConfig {
    pub fn new(width: u32, height: u32, refresh: u32) -> Self {
        Self { width, height, refresh, ..Default::default() }
    }

    pub fn video_mode(mut self) -> Self {
        self.cmd_mode = false;
        self
    }

    pub fn with_dual_port(mut self) -> Self {
        self.dual_port = true;
        self
    }

    pub fn drive_mode(&self) -> DriveMode {
        if self.cmd_mode {
            DriveMode::CommandDriven
        } else {
            DriveMode::Continuous
        }
    }

    pub fn geometry(&self) -> Geometry {
        let derived = self.width as u64 * self.height as u64 * self.refresh as u64 / 1000;
        Geometry {
            width: self.width,
            height: self.height,
            refresh: self.refresh,
            clock_khz: if self.clock_khz == 0 {
                derived.min(u32::MAX as u64) as u32
            } else {
                self.clock_khz
            },
        }
    }
}

/// Trigger loop options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerLoopConfig {
    /// Wait for the panel timing edge before firing
    pub te_wait: bool,
    pub prefetch_offset_us: u32,
    /// Emit the idle-power pre/post hooks around the trigger
    pub idle_hooks: bool,
}

impl Default for TriggerLoopConfig {
    fn default() -> Self {
        Self { te_wait: true, prefetch_offset_us: 0, idle_hooks: false }
    }
}

/// Event loop options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopConfig {
    pub enabled: bool,
    pub te_offset_us: u32,
    pub prefetch_offset_us: u32,
}

impl PlatformConfig {
    pub fn from_toml_str(s: &str) -> DpcResult<Self> {
        let cfg: PlatformConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> DpcResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        log::info!("loading platform description {}", path.as_ref().display());
        Self::from_toml_str(&text)
    }

    /// Platform with the given displays and default settings
    pub fn with_displays(soc: SocVariant, displays: Vec<DisplayConfig>) -> Self {
        Self {
            platform: PlatformSection { soc: soc.as_str().to_string(), ..Default::default() },
            displays,
        }
    }

    pub fn display(&self, index: usize) -> Option<&DisplayConfig> {
        self.displays.iter().find(|d| d.index == index)
    }

    pub fn validate(&self) -> DpcResult<()> {
        self.platform.variant()?;
        if self.platform.timeout_ms == 0 {
            return Err(DpcError::Config("timeout_ms must be nonzero".into()));
        }
        let mut seen = Vec::new();
        for disp in &self.displays {
            if seen.contains(&disp.index) {
                return Err(DpcError::Config(format!("display {} listed twice", disp.index)));
            }
            seen.push(disp.index);
            disp.panel.geometry().validate().map_err(|e| {
                DpcError::Config(format!("display {}: {}", disp.index, e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[platform]
soc = "mt6989"
timeout_ms = 40

[[display]]
index = 0
panel = { width = 1080, height = 2400, refresh = 120 }
trigger_loop = { te_wait = true, prefetch_offset_us = 200, idle_hooks = true }
event_loop = { enabled = true, te_offset_us = 1000 }

[[display]]
index = 1
panel = { width = 3840, height = 1080, refresh = 60, cmd_mode = false }

[display.events]
stream-eof = 200
continuous-eof = 201
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = PlatformConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.platform.variant().unwrap(), SocVariant::Mt6989);
        assert_eq!(cfg.platform.timeout(), Duration::from_millis(40));
        assert!(cfg.platform.tile_overhead);
        let d0 = cfg.display(0).unwrap();
        assert!(d0.trigger_loop.idle_hooks);
        assert_eq!(d0.event_loop.prefetch_offset_us, 0);
        assert_eq!(d0.panel.drive_mode(), DriveMode::CommandDriven);
        let d1 = cfg.display(1).unwrap();
        assert_eq!(d1.panel.drive_mode(), DriveMode::Continuous);
        let table = d1.event_table();
        assert_eq!(table.get(EventName::StreamEof).map(|e| e.0), Some(200));
        assert_eq!(table.get(EventName::StreamDirty), None);
    }

    #[test]
    fn test_default_events_resolve_everything() {
        let disp = DisplayConfig::new(1, PanelConfig::default());
        let table = disp.event_table();
        for ev in EventName::ALL {
            assert!(table.get(ev).is_some());
        }
        assert_eq!(table.get(EventName::StreamEof).map(|e| e.0), Some(116));
    }

    #[test]
    fn test_unknown_soc_is_config_error() {
        let err = PlatformConfig::from_toml_str("[platform]\nsoc = \"mt0000\"\n").unwrap_err();
        assert!(matches!(err, DpcError::Config(_)));
    }

    #[test]
    fn test_bad_geometry_rejected() {
        let text = "[[display]]\nindex = 0\npanel = { width = 0 }\n";
        assert!(matches!(PlatformConfig::from_toml_str(text), Err(DpcError::Config(_))));
    }

    #[test]
    fn test_empty_file_defaults() {
        let cfg = PlatformConfig::from_toml_str("").unwrap();
        assert!(cfg.displays.is_empty());
        assert_eq!(cfg.platform.variant().unwrap(), SocVariant::Mt6985);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("platform.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = PlatformConfig::load(&path).unwrap();
        assert_eq!(cfg.displays.len(), 2);
        assert!(matches!(
            PlatformConfig::load(dir.path().join("missing.toml")),
            Err(DpcError::Io(_))
        ));
    }

    #[test]
    fn test_clock_derived() {
        let panel = PanelConfig::new(3840, 1080, 120);
        assert_eq!(panel.geometry().clock_khz, 497_664);
    }
}
