//! External collaborators
//!
//! Narrow interfaces to the subsystems the controller drives but does not
//! own. Each has a logging default so a display works without any of them.

use std::fmt;

use crate::commit::FrameConfig;

/// Composition policy: picks the engine subset for a frame
pub trait LayeringRule: Send + Sync {
    /// Engine mask for the next frame, or `None` to keep the current one
    fn engine_mask(&self, display: usize, frame: &FrameConfig, current: u32) -> Option<u32> {
        let _ = (display, frame);
        Some(current)
    }
}

/// Memory bandwidth consumer
pub trait QosSink: Send + Sync {
    fn update_bandwidth(&self, display: usize, value: u32) {
        log::debug!("[disp{}] qos bandwidth {}", display, value);
    }
}

/// Buffer fence timeline
pub trait FenceSink: Send + Sync {
    fn release_layer(&self, display: usize, layer: usize, fence: u32) {
        log::trace!("[disp{}] layer {} fence {} released", display, layer, fence);
    }

    fn release_present(&self, display: usize, fence: u32) {
        log::trace!("[disp{}] present fence {} released", display, fence);
    }
}

/// Idle/power management policy
pub trait PowerHooks: Send + Sync {
    /// Leave idle before hardware is touched
    fn kick_idle(&self, display: usize) {
        log::trace!("[disp{}] idle kick", display);
    }

    fn vblank_enable(&self, display: usize, enable: bool) {
        log::trace!("[disp{}] vblank {}", display, if enable { "on" } else { "off" });
    }
}

/// Logging-only implementation of every collaborator
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCollaborator;

impl LayeringRule for LogCollaborator {}
impl QosSink for LogCollaborator {}
impl FenceSink for LogCollaborator {}
impl PowerHooks for LogCollaborator {}

/// Collaborators of one display
#[derive(Clone)]
pub struct Collaborators {
    pub layering: std::sync::Arc<dyn LayeringRule>,
    pub qos: std::sync::Arc<dyn QosSink>,
    pub fences: std::sync::Arc<dyn FenceSink>,
    pub power: std::sync::Arc<dyn PowerHooks>,
}

impl Default for Collaborators {
    fn default() -> Self {
        let log = std::sync::Arc::new(LogCollaborator);
        Self { layering: log.clone(), qos: log.clone(), fences: log.clone(), power: log }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
