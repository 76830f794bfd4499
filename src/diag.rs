//! Diagnostic dumps
//!
//! Taken when a hardware wait times out. A report captures the engine
//! thread program counters, semaphore levels, per-component register state,
//! wiring and mutex membership of one display, logs it at `error` and keeps
//! it in a bounded process-wide history.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::cmdq::{ClientId, ClientKind, CmdqEngine, EventName, EventTable, ThreadSnapshot};
use crate::component::{ComponentId, Registry};
use crate::mutex::{MutexAllocator, SyncSource};
use crate::path::{DisplayMode, Link, PathGraph};

/// Reports kept in the history
pub const MAX_HISTORY: usize = 32;

/// State of one display at the moment of a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagReport {
    pub display: usize,
    pub reason: String,
    pub taken_at: SystemTime,
    pub threads: Vec<ThreadSnapshot>,
    /// Resolved semaphores and whether each is set
    pub events: Vec<(EventName, bool)>,
    /// `NAME: block state` per path component
    pub components: Vec<String>,
    pub links: Vec<(ComponentId, Link)>,
    pub mutex: usize,
    pub mutex_source: Option<SyncSource>,
    pub mutex_members: BTreeSet<ComponentId>,
}

impl fmt::Display for DiagReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "disp{} diagnostic: {}", self.display, self.reason)?;
        for t in &self.threads {
            let cur = t.current.map(|i| i.to_string()).unwrap_or_else(|| "-".into());
            writeln!(
                f,
                "  {} pc={} pending={} loop={} at: {}",
                t.client, t.pc, t.pending, t.looping, cur
            )?;
        }
        let events: Vec<String> = self
            .events
            .iter()
            .map(|(name, set)| format!("{}={}", name, u8::from(*set)))
            .collect();
        writeln!(f, "  events: {}", events.join(" "))?;
        writeln!(
            f,
            "  mutex {} source={:?} members={:?}",
            self.mutex, self.mutex_source, self.mutex_members
        )?;
        for (id, link) in &self.links {
            writeln!(f, "  {} <- {} -> {}", id, link.prev, link.next)?;
        }
        for comp in &self.components {
            writeln!(f, "  {}", comp)?;
        }
        Ok(())
    }
}

/// Capture, log and record a report
pub fn dump(
    reason: &str,
    engine: &dyn CmdqEngine,
    graph: &PathGraph,
    registry: &Registry,
    mutexes: &MutexAllocator,
    events: &EventTable,
) -> DiagReport {
    let display = graph.display();
    let threads = [ClientKind::Config, ClientKind::TriggerLoop, ClientKind::EventLoop]
        .iter()
        .map(|kind| engine.snapshot(ClientId::new(display, *kind)))
        .collect();
    let events = EventName::ALL
        .iter()
        .filter_map(|name| events.get(*name).map(|id| (*name, engine.event_state(id))))
        .collect();

    let mut seen = BTreeSet::new();
    let mut components = Vec::new();
    for mode in [DisplayMode::Major, DisplayMode::Minor] {
        for id in graph.components(mode) {
            if !seen.insert(id) {
                continue;
            }
            if let Ok(comp) = registry.get(id) {
                components.push(format!("{}: {}", id, comp.dump()));
            }
        }
    }

    let links = graph.snapshot().links.into_iter().collect();
    let m = graph.mutex();
    let report = DiagReport {
        display,
        reason: reason.to_string(),
        taken_at: SystemTime::now(),
        threads,
        events,
        components,
        links,
        mutex: m,
        mutex_source: mutexes.source(m),
        mutex_members: mutexes.members(m).cloned().unwrap_or_default(),
    };
    log::error!("{}", report);
    record(report.clone());
    report
}

// =============================================================================
// History
// =============================================================================

static HISTORY: OnceLock<RwLock<Vec<DiagReport>>> = OnceLock::new();

fn store() -> &'static RwLock<Vec<DiagReport>> {
    HISTORY.get_or_init(|| RwLock::new(Vec::with_capacity(MAX_HISTORY)))
}

fn record(report: DiagReport) {
    let mut history = store().write();
    if history.len() >= MAX_HISTORY {
        history.remove(0);
    }
    history.push(report);
}

/// Reports taken so far, oldest first
pub fn history() -> Vec<DiagReport> {
    store().read().clone()
}

/// Reports of one display
pub fn history_for(display: usize) -> Vec<DiagReport> {
    store().read().iter().filter(|r| r.display == display).cloned().collect()
}

pub fn clear_history() {
    store().write().clear();
}
