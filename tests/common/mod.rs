//! Shared fixtures for the simulator-driven integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use dpc::cmdq::SimEngine;
use dpc::component::SocTable;
use dpc::{
    logger, Collaborators, DisplayConfig, DisplayPipeline, DisplaySubsystem, FenceSink,
    FrameConfig, LayerConfig, LayeringRule, PlatformConfig, PowerHooks, QosSink, SocVariant,
};

/// Collaborator that records every call
#[derive(Default)]
pub struct Recorder {
    pub qos: Mutex<Vec<(usize, u32)>>,
    pub layer_fences: Mutex<Vec<(usize, usize, u32)>>,
    pub present_fences: Mutex<Vec<(usize, u32)>>,
    pub vblank: Mutex<Vec<(usize, bool)>>,
    pub kicks: AtomicU64,
    /// Engine mask the layering rule asks for
    pub mask: Mutex<Option<u32>>,
}

impl Recorder {
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            layering: self.clone(),
            qos: self.clone(),
            fences: self.clone(),
            power: self.clone(),
        }
    }

    pub fn last_qos(&self) -> Option<u32> {
        self.qos.lock().last().map(|(_, v)| *v)
    }

    pub fn presents(&self) -> Vec<u32> {
        self.present_fences.lock().iter().map(|(_, f)| *f).collect()
    }

    pub fn kicks(&self) -> u64 {
        self.kicks.load(Ordering::Relaxed)
    }
}

impl LayeringRule for Recorder {
    fn engine_mask(&self, _display: usize, _frame: &FrameConfig, current: u32) -> Option<u32> {
        Some(self.mask.lock().unwrap_or(current))
    }
}

impl QosSink for Recorder {
    fn update_bandwidth(&self, display: usize, value: u32) {
        self.qos.lock().push((display, value));
    }
}

impl FenceSink for Recorder {
    fn release_layer(&self, display: usize, layer: usize, fence: u32) {
        self.layer_fences.lock().push((display, layer, fence));
    }

    fn release_present(&self, display: usize, fence: u32) {
        self.present_fences.lock().push((display, fence));
    }
}

impl PowerHooks for Recorder {
    fn kick_idle(&self, _display: usize) {
        self.kicks.fetch_add(1, Ordering::Relaxed);
    }

    fn vblank_enable(&self, display: usize, enable: bool) {
        self.vblank.lock().push((display, enable));
    }
}

/// Simulated SoC with one subsystem
pub struct Harness {
    pub engine: Arc<SimEngine>,
    pub subsystem: DisplaySubsystem,
    pub recorder: Arc<Recorder>,
}

impl Harness {
    pub fn new(variant: SocVariant, displays: Vec<DisplayConfig>) -> Self {
        Self::with_timeout(variant, displays, 50)
    }

    pub fn with_timeout(variant: SocVariant, displays: Vec<DisplayConfig>, timeout_ms: u64) -> Self {
        logger::init_for_tests();
        let mut cfg = PlatformConfig::with_displays(variant, displays);
        cfg.platform.timeout_ms = timeout_ms;
        Self::from_config(cfg)
    }

    pub fn from_config(cfg: PlatformConfig) -> Self {
        logger::init_for_tests();
        let variant = cfg.platform.variant().expect("known SoC");
        let engine = Arc::new(SimEngine::new(SocTable::for_variant(variant).mutex_count));
        let subsystem = DisplaySubsystem::new(cfg, engine.clone()).expect("subsystem");
        Self { engine, subsystem, recorder: Arc::new(Recorder::default()) }
    }

    pub fn display(&self, index: usize) -> DisplayPipeline {
        self.subsystem
            .create_display(index, self.recorder.collaborators())
            .expect("display pipeline")
    }

    /// Commit then let one frame of display timing pass
    pub fn frame(&self, disp: &DisplayPipeline, frame: &FrameConfig) -> u64 {
        let seq = disp.commit(frame).expect("commit");
        self.engine.tick();
        seq
    }
}

/// Frame with `layers` full-screen layers, all fenced with `fence`
pub fn frame(width: u32, height: u32, layers: usize, fence: u32, bandwidth: u32) -> FrameConfig {
    let mut cfg = FrameConfig::new().with_bandwidth(bandwidth).with_present_fence(fence);
    for n in 0..layers {
        let mut layer = LayerConfig::full_screen(n, width, height);
        layer.fence = fence;
        cfg = cfg.with_layer(layer);
    }
    cfg
}
