//! Display Pipelines
//!
//! A [`DisplaySubsystem`] owns what all displays share: the SoC table, the
//! component registry, the sync mutex pool and the command-queue engine.
//! Each [`DisplayPipeline`] drives one display surface on top of it.
//!
//! ```text
//!                     DisplaySubsystem
//!   +---------------------------------------------------------+
//!   |  SocTable   Registry (RwLock)   MutexAllocator (Mutex)  |
//!   |                       CmdqEngine                        |
//!   +------------+------------------------------+-------------+
//!                |                              |
//!        DisplayPipeline 0              DisplayPipeline 1
//!   +-------------------------+    +-------------------------+
//!   | state lock:             |    |                         |
//!   |   PathGraph, loops,     |    |          ...            |
//!   |   mode, geometry, seq   |    |                         |
//!   | bandwidth lock          |    |                         |
//!   | workers (4 threads)     |    |                         |
//!   +-------------------------+    +-------------------------+
//! ```
//!
//! Lock order is display state, then registry, then mutex pool. Completion
//! callbacks run on whichever thread drives the engine and only ever take
//! the bandwidth lock.

mod frame;
mod lifecycle;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

use crate::cmdq::{ClientId, ClientKind, CmdqEngine, EventTable, TaskId};
use crate::collab::Collaborators;
use crate::commit::{BandwidthBudget, FrameConfig, FramePayload};
use crate::component::{ComponentId, DriveMode, Registry, SocTable};
use crate::config::{DisplayConfig, PanelConfig, PlatformConfig, PlatformSection};
use crate::dual::{self, DualPipeMap, Geometry, TileOverhead};
use crate::error::{DpcError, DpcResult};
use crate::loops::{LoopControl, LoopKind, LoopState};
use crate::mutex::{MutexAllocator, SyncSource};
use crate::path::{DisplayMode, GraphSnapshot, Path, PathGraph, PipeId};
use crate::workers::{
    self, KickRequest, ModeRequest, TriggerRequest, WorkSender, Worker, WorkerPool,
};

// =============================================================================
// Subsystem
// =============================================================================

/// Resources shared by every display of one SoC
pub struct DisplaySubsystem {
    platform: PlatformSection,
    displays: Vec<DisplayConfig>,
    soc: Arc<SocTable>,
    registry: Arc<RwLock<Registry>>,
    mutexes: Arc<Mutex<MutexAllocator>>,
    map: DualPipeMap,
    engine: Arc<dyn CmdqEngine>,
}

impl DisplaySubsystem {
    pub fn new(config: PlatformConfig, engine: Arc<dyn CmdqEngine>) -> DpcResult<Self> {
        config.validate()?;
        let variant = config.platform.variant()?;
        let mut soc = SocTable::for_variant(variant);
        if let Some(discrete) = config.platform.discrete_path {
            soc.discrete_path = discrete;
        }
        for disp in &config.displays {
            soc.apply_panel(disp.index, disp.panel.drive_mode(), disp.panel.dual_port);
        }
        let registry = Registry::for_soc(&soc);
        let mutexes = MutexAllocator::new(soc.mutex_count);
        let map = DualPipeMap::from_soc(&soc);
        log::info!(
            "display subsystem up: {} with {} display(s), {} mutexes",
            variant,
            config.displays.len(),
            soc.mutex_count
        );
        Ok(Self {
            platform: config.platform,
            displays: config.displays,
            soc: Arc::new(soc),
            registry: Arc::new(RwLock::new(registry)),
            mutexes: Arc::new(Mutex::new(mutexes)),
            map,
            engine,
        })
    }

    pub fn soc(&self) -> &SocTable {
        &self.soc
    }

    pub fn platform(&self) -> &PlatformSection {
        &self.platform
    }

    pub fn engine(&self) -> &Arc<dyn CmdqEngine> {
        &self.engine
    }

    pub fn dual_map(&self) -> &DualPipeMap {
        &self.map
    }

    pub fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read()
    }

    pub fn mutexes(&self) -> MutexGuard<'_, MutexAllocator> {
        self.mutexes.lock()
    }

    /// Displays described by the platform file
    pub fn display_indices(&self) -> Vec<usize> {
        self.displays.iter().map(|d| d.index).collect()
    }

    /// Build the pipeline of a described display. Its sync mutex is bound
    /// here and returned to the pool when the pipeline is dropped.
    pub fn create_display(
        &self,
        index: usize,
        collab: Collaborators,
    ) -> DpcResult<DisplayPipeline> {
        let cfg = self
            .displays
            .iter()
            .find(|d| d.index == index)
            .cloned()
            .ok_or_else(|| DpcError::Config(format!("display {} not described", index)))?;
        let topo = self.soc.display(index).cloned().ok_or_else(|| {
            DpcError::Config(format!("{} has no display {}", self.soc.variant, index))
        })?;

        let mutex = self.mutexes.lock().bind(index)?;
        // Addon branches of the discrete path arm on a second unit
        let reserved = if self.soc.discrete_path && index == 0 {
            match self.mutexes.lock().bind(index) {
                Ok(m) => Some(m),
                Err(err) => {
                    log::warn!("[disp{}] no mutex for the discrete path: {}", index, err);
                    None
                }
            }
        } else {
            None
        };

        let geometry = cfg.panel.geometry();
        let dual = dual::is_dual(
            index,
            &geometry,
            cfg.panel.dual_port,
            &self.soc,
            &self.platform.dual_policy(),
        );
        let mask = cfg.engine_mask.unwrap_or(topo.default_mask);
        let graph = PathGraph::new(topo, self.map.clone(), &self.registry.read(), mutex, mask)
            .and_then(|mut graph| -> DpcResult<PathGraph> {
                graph.set_dual(dual)?;
                if let Some(m) = reserved {
                    graph.set_addon_mutex(m)?;
                }
                Ok(graph)
            });
        let graph = match graph {
            Ok(graph) => graph,
            Err(err) => {
                let mut pool = self.mutexes.lock();
                for m in std::iter::once(mutex).chain(reserved) {
                    if let Err(release) = pool.release(m) {
                        log::warn!("[disp{}] mutex {} release: {}", index, m, release);
                    }
                }
                return Err(err);
            }
        };

        let state = DisplayState {
            graph,
            loops: LoopControl::new(),
            mode: DisplayMode::Major,
            enabled: false,
            panel: cfg.panel,
            geometry,
            tile: TileOverhead::default(),
            bypass: false,
            seq: 0,
            last_task: None,
            events: cfg.event_table(),
        };

        let (trigger_tx, trigger_rx) = workers::queue("trigger-delay");
        let (kick_tx, kick_rx) = workers::queue("kick");
        let (mode_tx, mode_rx) = workers::queue("mode-switch");
        let (fence_tx, fence_rx) = workers::queue("fence-release");

        let inner = Arc::new(DisplayInner {
            index,
            cfg,
            platform: self.platform.clone(),
            soc: Arc::clone(&self.soc),
            engine: Arc::clone(&self.engine),
            registry: Arc::clone(&self.registry),
            mutexes: Arc::clone(&self.mutexes),
            state: Mutex::new(state),
            bw: Arc::new(Mutex::new(BandwidthBudget::new(self.soc.discrete_path))),
            collab,
            queues: Queues {
                trigger: trigger_tx.clone(),
                kick: kick_tx.clone(),
                mode: mode_tx.clone(),
                fence: fence_tx.clone(),
            },
            stats: Arc::new(FrameStats::default()),
        });

        let index = inner.index;
        let weak = Arc::downgrade(&inner);
        let trigger = Worker::spawn(index, trigger_tx, trigger_rx, move |req: TriggerRequest| {
            if let Some(inner) = weak.upgrade() {
                inner.cpu_trigger(req);
            }
        })?;

        let power = Arc::clone(&inner.collab.power);
        let kick = Worker::spawn(index, kick_tx, kick_rx, move |req: KickRequest| match req {
            KickRequest::Idle => power.kick_idle(index),
            KickRequest::Vblank(on) => power.vblank_enable(index, on),
        })?;

        let weak = Arc::downgrade(&inner);
        let mode = Worker::spawn(index, mode_tx, mode_rx, move |ModeRequest(raw)| {
            if let Some(inner) = weak.upgrade() {
                if let Err(err) = inner.request_mode(raw) {
                    log::error!("[disp{}] async mode request {} failed: {}", index, raw, err);
                }
            }
        })?;

        let fences = Arc::clone(&inner.collab.fences);
        let fence = Worker::spawn(index, fence_tx, fence_rx, move |payload: FramePayload| {
            for (layer, value) in &payload.layer_fences {
                fences.release_layer(payload.display, *layer, *value);
            }
            fences.release_present(payload.display, payload.present_fence);
        })?;

        log::info!("[disp{}] pipeline created on mutex {}", index, mutex);
        Ok(DisplayPipeline { workers: WorkerPool { trigger, kick, mode, fence }, inner })
    }
}

impl fmt::Debug for DisplaySubsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplaySubsystem")
            .field("soc", &self.soc.variant)
            .field("displays", &self.display_indices())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Per-display state
// =============================================================================

/// Everything guarded by the display lock
pub(crate) struct DisplayState {
    pub(crate) graph: PathGraph,
    pub(crate) loops: LoopControl,
    pub(crate) mode: DisplayMode,
    pub(crate) enabled: bool,
    pub(crate) panel: PanelConfig,
    pub(crate) geometry: Geometry,
    pub(crate) tile: TileOverhead,
    pub(crate) bypass: bool,
    pub(crate) seq: u64,
    /// Last batch queued on the config client
    pub(crate) last_task: Option<TaskId>,
    pub(crate) events: EventTable,
}

struct Queues {
    trigger: WorkSender<TriggerRequest>,
    kick: WorkSender<KickRequest>,
    mode: WorkSender<ModeRequest>,
    fence: WorkSender<FramePayload>,
}

#[derive(Debug, Default)]
struct FrameStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    timeouts: AtomicU64,
    recoveries: AtomicU64,
}

/// Frame counters of one display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    pub submitted: u64,
    pub completed: u64,
    /// Frames whose batch was dropped (stall recovery)
    pub aborted: u64,
    pub timeouts: u64,
    pub recoveries: u64,
}

impl FrameStats {
    fn snapshot(&self) -> FrameCounters {
        FrameCounters {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct DisplayInner {
    index: usize,
    cfg: DisplayConfig,
    platform: PlatformSection,
    soc: Arc<SocTable>,
    engine: Arc<dyn CmdqEngine>,
    registry: Arc<RwLock<Registry>>,
    mutexes: Arc<Mutex<MutexAllocator>>,
    state: Mutex<DisplayState>,
    bw: Arc<Mutex<BandwidthBudget>>,
    collab: Collaborators,
    queues: Queues,
    stats: Arc<FrameStats>,
}

impl DisplayInner {
    fn config_client(&self) -> ClientId {
        ClientId::new(self.index, ClientKind::Config)
    }

    fn kick(&self, req: KickRequest) {
        if let Err(err) = self.queues.kick.send(req) {
            log::debug!("[disp{}] {:?} dropped: {}", self.index, req, err);
        }
    }
}

impl Drop for DisplayInner {
    fn drop(&mut self) {
        let mutexes = self.state.get_mut().graph.mutexes();
        let mut pool = self.mutexes.lock();
        for m in mutexes {
            if let Err(err) = pool.release(m) {
                log::warn!("[disp{}] mutex {} release: {}", self.index, m, err);
            }
        }
    }
}

// =============================================================================
// Pipeline handle
// =============================================================================

/// One display surface
pub struct DisplayPipeline {
    workers: WorkerPool,
    inner: Arc<DisplayInner>,
}

impl DisplayPipeline {
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// Bring the display up: bind timing, zero the slot table, connect and
    /// start the current mode, then start the hardware loops
    pub fn enable(&self) -> DpcResult<()> {
        self.inner.enable()
    }

    /// Stop the loops, tear the path down and release the mutex members
    pub fn disable(&self) -> DpcResult<()> {
        self.inner.disable()
    }

    /// Build and submit one frame. Returns its sequence number.
    pub fn commit(&self, frame: &FrameConfig) -> DpcResult<u64> {
        self.inner.commit(frame)
    }

    /// Switch display mode synchronously. Out-of-range values are ignored.
    pub fn request_mode(&self, raw: u32) -> DpcResult<()> {
        self.inner.request_mode(raw)
    }

    /// Queue a mode switch on the mode-switch worker
    pub fn request_mode_async(&self, raw: u32) -> DpcResult<()> {
        self.inner.queues.mode.send(ModeRequest(raw))
    }

    pub fn set_geometry(&self, geometry: Geometry) -> DpcResult<()> {
        self.inner.set_geometry(geometry)
    }

    /// Connector change: new panel, new output interface discipline
    pub fn set_panel(&self, panel: PanelConfig) -> DpcResult<()> {
        self.inner.set_panel(panel)
    }

    /// Change the composition-engine subset while live
    pub fn splice(&self, mask: u32) -> DpcResult<()> {
        self.inner.splice(mask)
    }

    /// Post-processing bypass on every path component
    pub fn set_bypass(&self, enable: bool) -> DpcResult<()> {
        self.inner.set_bypass(enable)
    }

    /// Explicit display-health reset
    pub fn recover(&self) -> DpcResult<()> {
        let mut st = self.inner.state.lock();
        self.inner.recover_locked(&mut st)
    }

    /// Drain the worker queues and wait for the last queued batch
    pub fn wait_idle(&self) -> DpcResult<()> {
        self.workers.flush()?;
        self.inner.wait_last()?;
        // Completion callbacks may have queued fence releases
        self.workers.fence.flush()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn state(&self) -> MutexGuard<'_, DisplayState> {
        self.inner.state.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    pub fn mode(&self) -> DisplayMode {
        self.state().mode
    }

    pub fn geometry(&self) -> Geometry {
        self.state().geometry
    }

    pub fn panel(&self) -> PanelConfig {
        self.state().panel
    }

    pub fn drive_mode(&self) -> DriveMode {
        let st = self.state();
        self.inner.drive_mode(&st)
    }

    pub fn tile(&self) -> TileOverhead {
        self.state().tile
    }

    pub fn is_dual(&self) -> bool {
        self.state().graph.is_dual()
    }

    pub fn engine_mask(&self) -> u32 {
        self.state().graph.mask()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.state().graph.snapshot()
    }

    pub fn path(&self, mode: DisplayMode, pipe: PipeId) -> Option<Path> {
        self.state().graph.path(mode, pipe).cloned()
    }

    pub fn is_connected(&self, mode: DisplayMode, pipe: PipeId) -> bool {
        self.state().graph.is_connected(mode, pipe)
    }

    /// Real components of a mode on the active pipes
    pub fn components(&self, mode: DisplayMode) -> Vec<ComponentId> {
        self.state().graph.components(mode)
    }

    pub fn addon_active(&self, name: &str) -> bool {
        self.state().graph.addon_active(name)
    }

    pub fn loop_state(&self, kind: LoopKind) -> LoopState {
        self.state().loops.state(kind)
    }

    pub fn seq(&self) -> u64 {
        self.state().seq
    }

    pub fn mutex(&self) -> usize {
        self.state().graph.mutex()
    }

    /// Second mutex the addon branches arm on, on discrete-path SoCs
    pub fn reserved_mutex(&self) -> Option<usize> {
        self.state().graph.addon_mutex()
    }

    pub fn sync_source(&self) -> Option<SyncSource> {
        let m = self.mutex();
        self.inner.mutexes.lock().source(m)
    }

    pub fn mutex_members(&self) -> BTreeSet<ComponentId> {
        let m = self.mutex();
        self.inner.mutexes.lock().members(m).cloned().unwrap_or_default()
    }

    /// Bandwidth currently applied
    pub fn bandwidth(&self) -> u32 {
        self.inner.bw.lock().applied()
    }

    /// Decrease waiting for its frame to complete
    pub fn staged_bandwidth(&self) -> Option<u32> {
        self.inner.bw.lock().staged().map(|(_, value)| value)
    }

    pub fn counters(&self) -> FrameCounters {
        self.inner.stats.snapshot()
    }
}

impl fmt::Debug for DisplayPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayPipeline").field("index", &self.inner.index).finish_non_exhaustive()
    }
}

impl Drop for DisplayPipeline {
    fn drop(&mut self) {
        if let Err(err) = self.inner.disable() {
            log::warn!("[disp{}] disable on drop: {}", self.inner.index, err);
        }
        self.workers.shutdown();
    }
}
