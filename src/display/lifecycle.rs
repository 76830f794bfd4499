//! Bring-up, teardown and topology changes of one display.
//!
//! Every topology change runs as one transaction under the display lock:
//!
//! ```text
//!   drain in-flight config batch
//!   stop loops (reconfiguring)
//!   clone graph + mutex pool, build batch on the clones
//!   submit, wait
//!   ok  -> adopt clones          err -> restore ownership, keep old shadow
//!   end reconfiguration, restart loops
//! ```
//!
//! A hardware timeout inside a transaction dumps diagnostics, aborts the
//! config thread and, on a live display, runs recovery.

use crate::cmdq::slots::{self, Slot};
use crate::cmdq::{ClientId, ClientKind, CommandBatch, EventName, EventTable, TimingBinding};
use crate::commit::best_effort;
use crate::component::{Capability, ComponentId, ComponentType, DdpConfig, DriveMode, Registry};
use crate::config::PanelConfig;
use crate::diag;
use crate::dual::{self, Geometry, TileOverhead};
use crate::error::{DpcError, DpcResult};
use crate::loops::{self, LoopKind, LoopState};
use crate::mutex::SyncSource;
use crate::path::{DisplayMode, GraphCtx, PathGraph, PipeId};
use crate::workers::KickRequest;

use super::{DisplayInner, DisplayState};

/// Where a topology change should land
#[derive(Debug, Clone, Copy)]
struct Target {
    mode: DisplayMode,
    dual: bool,
    geometry: Geometry,
    drive: DriveMode,
    bypass: bool,
}

impl DisplayInner {
    // =========================================================================
    // Helpers
    // =========================================================================

    /// Drive discipline of the live output, falling back to the panel
    pub(super) fn drive_mode(&self, st: &DisplayState) -> DriveMode {
        let reg = self.registry.read();
        st.graph
            .output(st.mode, PipeId::Pipe0, &reg)
            .and_then(|id| reg.get(id).ok())
            .and_then(|comp| comp.drive_mode())
            .unwrap_or_else(|| st.panel.drive_mode())
    }

    fn dual_for(&self, geometry: &Geometry, panel: &PanelConfig) -> bool {
        dual::is_dual(self.index, geometry, panel.dual_port, &self.soc, &self.platform.dual_policy())
    }

    fn timing_binding(&self, st: &DisplayState) -> TimingBinding {
        TimingBinding {
            display: self.index,
            mutex: st.graph.mutex(),
            panel_te: st.events.get(EventName::PanelTe),
            prefetch_te: st.events.get(EventName::PrefetchTe),
            cmd_eof: st.events.get(EventName::CmdEof),
            continuous_eof: st.events.get(EventName::ContinuousEof),
            dma_eof: st.events.get(EventName::WdmaEof),
        }
    }

    /// Frame semaphores back to their idle levels: no frame pending, last
    /// frame done
    fn reset_semaphores(&self, events: &EventTable) {
        for name in [
            EventName::StreamDirty,
            EventName::StreamBlock,
            EventName::CmdEof,
            EventName::ContinuousEof,
        ] {
            if let Some(ev) = events.get(name) {
                self.engine.clear_event(ev);
            }
        }
        if let Some(eof) = events.get(EventName::StreamEof) {
            self.engine.set_event(eof);
        }
    }

    /// Wait for the last config batch. A timeout is handled here.
    pub(super) fn drain(&self, st: &mut DisplayState) {
        let task = match st.last_task {
            Some(task) if !self.engine.is_done(task) => task,
            _ => return,
        };
        if let Err(err) = self.engine.wait(task, self.platform.timeout()) {
            log::error!("[disp{}] previous config batch: {}", self.index, err);
            self.on_timeout(st, "previous config batch");
        }
    }

    /// Diagnostics, abort, and recovery of a live display
    pub(super) fn on_timeout(&self, st: &mut DisplayState, what: &str) {
        self.stats.timeouts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        {
            let reg = self.registry.read();
            let pool = self.mutexes.lock();
            diag::dump(
                &format!("{} timed out", what),
                self.engine.as_ref(),
                &st.graph,
                &reg,
                &pool,
                &st.events,
            );
        }
        let dropped = self.engine.abort(self.config_client());
        st.last_task = None;
        log::error!("[disp{}] {} timed out, {} batch(es) dropped", self.index, what, dropped);
        if st.enabled {
            if let Err(err) = self.recover_locked(st) {
                log::error!("[disp{}] recovery failed: {}", self.index, err);
            }
        }
    }

    /// Start the loops the current mode needs and open the config gate.
    /// Loops already running, as after a recovery, are left alone.
    pub(super) fn start_loops(&self, st: &mut DisplayState) -> DpcResult<()> {
        if !st.enabled {
            return Ok(());
        }
        if let Some(block) = st.events.get(EventName::StreamBlock) {
            self.engine.set_event(block);
        }
        if st.mode == DisplayMode::NoUse {
            return Ok(());
        }
        let engine = self.engine.as_ref();
        if st.loops.state(LoopKind::Event) == LoopState::Stopped {
            let event_loop = loops::build_event_loop(
                self.index,
                st.geometry.refresh,
                &st.events,
                &self.cfg.event_loop,
            )?;
            if let Some(batch) = event_loop {
                let client = ClientId::new(self.index, ClientKind::EventLoop);
                st.loops.start(LoopKind::Event, engine, client, batch)?;
            }
        }
        if self.drive_mode(st) == DriveMode::CommandDriven
            && st.loops.state(LoopKind::Trigger) == LoopState::Stopped
        {
            let trigger = {
                let pool = self.mutexes.lock();
                loops::build_trigger_loop(
                    self.index,
                    &st.graph.mutexes(),
                    &pool,
                    &st.events,
                    &self.cfg.trigger_loop,
                )?
            };
            if let Some(batch) = trigger {
                let client = ClientId::new(self.index, ClientKind::TriggerLoop);
                st.loops.start(LoopKind::Trigger, engine, client, batch)?;
            }
        }
        Ok(())
    }

    fn restart_loops(&self, st: &mut DisplayState) {
        if let Err(err) = self.start_loops(st) {
            log::error!("[disp{}] loops not restarted: {}", self.index, err);
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    fn transact<R, F>(&self, st: &mut DisplayState, label: &'static str, op: F) -> DpcResult<R>
    where
        F: FnOnce(&mut PathGraph, &mut GraphCtx<'_>) -> DpcResult<R>,
    {
        self.drain(st);
        st.loops.begin_reconfig(self.engine.as_ref())?;
        // A frame picked up by the stopped trigger loop is dropped
        self.reset_semaphores(&st.events);
        let result = self.apply(st, label, op);
        st.loops.end_reconfig();
        if let Err(DpcError::Timeout { .. }) = &result {
            self.on_timeout(st, label);
        }
        result
    }

    /// Build on clones, submit, wait, then adopt or roll back
    fn apply<R, F>(&self, st: &mut DisplayState, label: &'static str, op: F) -> DpcResult<R>
    where
        F: FnOnce(&mut PathGraph, &mut GraphCtx<'_>) -> DpcResult<R>,
    {
        let mut reg = self.registry.write();
        let mut pool_guard = self.mutexes.lock();
        let mut graph = st.graph.clone();
        let mut pool = pool_guard.clone();
        let mut batch = CommandBatch::with_capacity(label, self.platform.batch_capacity);

        let built = {
            let mut ctx = GraphCtx { registry: &mut reg, mutexes: &mut pool, batch: &mut batch };
            op(&mut graph, &mut ctx)
        };
        let value = match built {
            Ok(value) => value,
            Err(err) => {
                restore_owners(&mut reg, &st.graph, self.index);
                log::warn!("[disp{}] {} rolled back: {}", self.index, label, err);
                return Err(err);
            }
        };

        let done = match self.engine.submit(self.config_client(), batch) {
            Ok(task) => {
                st.last_task = Some(task);
                self.engine.wait(task, self.platform.timeout())
            }
            Err(err) => Err(err),
        };
        if let Err(err) = done {
            restore_owners(&mut reg, &st.graph, self.index);
            log::error!("[disp{}] {} failed: {}", self.index, label, err);
            return Err(err);
        }

        st.graph = graph;
        *pool_guard = pool;
        Ok(value)
    }

    // =========================================================================
    // Enable / Disable
    // =========================================================================

    pub(super) fn enable(&self) -> DpcResult<()> {
        let mut st = self.state.lock();
        self.enable_locked(&mut st)
    }

    fn enable_locked(&self, st: &mut DisplayState) -> DpcResult<()> {
        if st.enabled {
            return Ok(());
        }
        st.geometry.validate()?;
        let dual = self.dual_for(&st.geometry, &st.panel);
        st.graph.set_dual(dual)?;
        let drive = self.drive_mode(st);

        self.engine.bind_timing(self.timing_binding(st));
        slots::init_slots(self.engine.as_ref(), self.index);
        if self.cfg.trigger_loop.idle_hooks {
            self.engine.write_mem(Slot::IdleHook.addr(self.index), 1);
        }
        self.reset_semaphores(&st.events);
        self.kick(KickRequest::Vblank(true));

        let source = match drive {
            DriveMode::CommandDriven => SyncSource::CommandDriven,
            DriveMode::Continuous => SyncSource::OutputSof,
        };
        let target =
            Target { mode: st.mode, dual, geometry: st.geometry, drive, bypass: st.bypass };
        let old = st.mode;
        let supported = self.platform.tile_overhead;
        let result = self.transact(st, "enable", |graph, ctx| {
            apply_topology(graph, ctx, old, &target, supported, Some(source))
        });
        match result {
            Ok(tile) => {
                st.tile = tile;
                st.enabled = true;
                self.start_loops(st)?;
                log::info!(
                    "[disp{}] enabled: {} {}x{}@{} {:?}{}",
                    self.index,
                    st.mode,
                    st.geometry.width,
                    st.geometry.height,
                    st.geometry.refresh,
                    drive,
                    if dual { " dual" } else { "" }
                );
                Ok(())
            }
            Err(err) => {
                self.engine.unbind_timing(self.index);
                self.kick(KickRequest::Vblank(false));
                Err(err)
            }
        }
    }

    pub(super) fn disable(&self) -> DpcResult<()> {
        let mut st = self.state.lock();
        self.disable_locked(&mut st)
    }

    fn disable_locked(&self, st: &mut DisplayState) -> DpcResult<()> {
        if !st.enabled {
            return Ok(());
        }
        // No recovery while tearing down
        st.enabled = false;
        let old = st.mode;
        let result = self.transact(st, "disable", |graph, ctx| teardown(graph, ctx, old));

        self.engine.unbind_timing(self.index);
        self.bw.lock().reset();
        self.collab.qos.update_bandwidth(self.index, 0);
        self.kick(KickRequest::Vblank(false));
        st.last_task = None;
        st.tile = TileOverhead::default();
        log::info!("[disp{}] disabled", self.index);
        result
    }

    // =========================================================================
    // Reconfiguration
    // =========================================================================

    pub(super) fn request_mode(&self, raw: u32) -> DpcResult<()> {
        let mode = match DisplayMode::from_raw(raw) {
            Some(mode) => mode,
            None => {
                log::warn!("[disp{}] mode {} out of range, ignored", self.index, raw);
                return Ok(());
            }
        };
        let mut st = self.state.lock();
        if mode == st.mode {
            return Ok(());
        }
        if !st.enabled {
            st.mode = mode;
            return Ok(());
        }
        let target = Target {
            mode,
            dual: st.graph.is_dual(),
            geometry: st.geometry,
            drive: self.drive_mode(&st),
            bypass: st.bypass,
        };
        let old = st.mode;
        let supported = self.platform.tile_overhead;
        let result = self.transact(&mut st, "mode-switch", |graph, ctx| {
            apply_topology(graph, ctx, old, &target, supported, None)
        });
        match &result {
            Ok(tile) => {
                st.mode = mode;
                st.tile = *tile;
                log::info!("[disp{}] mode {} -> {}", self.index, old, mode);
            }
            Err(err) => log::error!("[disp{}] mode {} -> {} failed: {}", self.index, old, mode, err),
        }
        self.restart_loops(&mut st);
        result.map(|_| ())
    }

    pub(super) fn set_geometry(&self, geometry: Geometry) -> DpcResult<()> {
        geometry.validate()?;
        let mut st = self.state.lock();
        let dual = self.dual_for(&geometry, &st.panel);
        dual::split_width(geometry.width, dual)?;
        if !st.enabled {
            st.graph.set_dual(dual)?;
            st.geometry = geometry;
            return Ok(());
        }
        let target = Target {
            mode: st.mode,
            dual,
            geometry,
            drive: self.drive_mode(&st),
            bypass: st.bypass,
        };
        let old = st.mode;
        let supported = self.platform.tile_overhead;
        let result = self.transact(&mut st, "geometry", |graph, ctx| {
            apply_topology(graph, ctx, old, &target, supported, None)
        });
        if let Ok(tile) = &result {
            st.geometry = geometry;
            st.tile = *tile;
            log::info!(
                "[disp{}] geometry {}x{}@{}{}",
                self.index,
                geometry.width,
                geometry.height,
                geometry.refresh,
                if dual { " dual" } else { "" }
            );
        }
        self.restart_loops(&mut st);
        result.map(|_| ())
    }

    /// Connector change. A failed bring-up on the new panel restores the
    /// old one.
    pub(super) fn set_panel(&self, panel: PanelConfig) -> DpcResult<()> {
        panel.geometry().validate()?;
        let mut st = self.state.lock();
        let was_enabled = st.enabled;
        if was_enabled {
            self.disable_locked(&mut st)?;
        }
        let old = st.panel;
        self.install_panel(&mut st, panel)?;
        if !was_enabled {
            return Ok(());
        }
        match self.enable_locked(&mut st) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::error!("[disp{}] new panel rejected, restoring: {}", self.index, err);
                self.install_panel(&mut st, old)?;
                self.enable_locked(&mut st)?;
                Err(err)
            }
        }
    }

    /// Swap the output interfaces of every path for the panel's discipline
    fn install_panel(&self, st: &mut DisplayState, panel: PanelConfig) -> DpcResult<()> {
        let mut reg = self.registry.write();
        let mut outputs: Vec<ComponentId> = Vec::new();
        for mode in [DisplayMode::Major, DisplayMode::Minor] {
            for pipe in PipeId::ALL {
                if let Some(path) = st.graph.path(mode, pipe) {
                    outputs.extend(path.comps.iter().copied().filter(|id| {
                        reg.get(*id).map(|c| c.ty() == ComponentType::OutputInterface).unwrap_or(false)
                    }));
                }
            }
        }
        outputs.sort();
        outputs.dedup();
        for id in outputs {
            reg.replace_output(id, panel.drive_mode(), panel.dual_port)?;
        }
        st.panel = panel;
        st.geometry = panel.geometry();
        Ok(())
    }

    pub(super) fn splice(&self, mask: u32) -> DpcResult<()> {
        let mut st = self.state.lock();
        self.splice_locked(&mut st, mask)
    }

    pub(super) fn splice_locked(&self, st: &mut DisplayState, mask: u32) -> DpcResult<()> {
        if mask == st.graph.mask() {
            return Ok(());
        }
        if !st.enabled {
            // Nothing wired: only the paths are rebuilt
            let mut reg = self.registry.write();
            let mut pool = self.mutexes.lock();
            let mut scratch = CommandBatch::new("splice");
            let mut ctx = GraphCtx { registry: &mut reg, mutexes: &mut pool, batch: &mut scratch };
            return st.graph.splice_subset(mask, &mut ctx).map(|_| ());
        }
        let mode = st.mode;
        let geometry = st.geometry;
        let supported = self.platform.tile_overhead;
        let result = self.transact(st, "splice", |graph, ctx| {
            let wired = graph.splice_subset(mask, ctx)?;
            let tile = overhead_for(graph, ctx.registry, mode, geometry.width, supported)?;
            let display = graph.display();
            for (pipe, id) in wired {
                let cfg = pipe_config(graph, &geometry, &tile, pipe)?;
                let r = ctx.registry.dispatch(Capability::Configure(&cfg), id, ctx.batch);
                best_effort(display, "configure", r)?;
                best_effort(display, "start", ctx.registry.dispatch(Capability::Start, id, ctx.batch))?;
            }
            Ok(tile)
        });
        if let Ok(tile) = &result {
            st.tile = *tile;
        }
        self.restart_loops(st);
        result.map(|_| ())
    }

    /// Bypass is queued behind the in-flight frame, not waited on
    pub(super) fn set_bypass(&self, enable: bool) -> DpcResult<()> {
        let mut st = self.state.lock();
        st.bypass = enable;
        if !st.enabled || st.mode == DisplayMode::NoUse {
            return Ok(());
        }
        let mut batch = CommandBatch::new("bypass");
        {
            let mut reg = self.registry.write();
            for id in st.graph.components(st.mode) {
                let r = reg.dispatch(Capability::Bypass(enable), id, &mut batch);
                best_effort(self.index, "bypass", r)?;
            }
        }
        st.last_task = Some(self.engine.submit(self.config_client(), batch)?);
        log::debug!("[disp{}] bypass {}", self.index, if enable { "on" } else { "off" });
        Ok(())
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Reset and rewire the live path from the shadow, then restore loops
    /// and bandwidth
    pub(super) fn recover_locked(&self, st: &mut DisplayState) -> DpcResult<()> {
        if !st.enabled {
            return Err(DpcError::NotEnabled(self.index));
        }
        self.stats.recoveries.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        log::warn!("[disp{}] recovering {} path", self.index, st.mode);
        let engine = self.engine.as_ref();
        st.loops.stop_all(engine)?;
        self.engine.abort(self.config_client());
        st.last_task = None;
        self.reset_semaphores(&st.events);

        let drive = self.drive_mode(st);
        let mut batch = CommandBatch::with_capacity("recover", self.platform.batch_capacity);
        {
            let mut reg = self.registry.write();
            let pool = self.mutexes.lock();
            let mutexes = st.graph.mutexes();
            for m in &mutexes {
                pool.reset(*m, &mut batch)?;
            }
            for id in st.graph.components(st.mode) {
                best_effort(self.index, "reset", reg.dispatch(Capability::Reset, id, &mut batch))?;
            }
            st.graph.rewire(&mut batch)?;
            configure_path(&st.graph, &mut reg, &mut batch, st.mode, &st.geometry, &st.tile)?;
            if drive == DriveMode::Continuous && st.mode != DisplayMode::NoUse {
                for m in &mutexes {
                    pool.trigger(*m, &mut batch)?;
                }
            }
        }
        let task = self.engine.submit(self.config_client(), batch)?;
        st.last_task = Some(task);
        self.engine.wait(task, self.platform.timeout())?;

        self.start_loops(st)?;
        let applied = self.bw.lock().applied();
        self.engine.write_mem(Slot::BwRequest.addr(self.index), applied);
        self.collab.qos.update_bandwidth(self.index, applied);
        log::info!("[disp{}] recovered", self.index);
        Ok(())
    }

    /// Wait for the last config batch, handling a timeout
    pub(super) fn wait_last(&self) -> DpcResult<()> {
        let mut st = self.state.lock();
        let task = match st.last_task {
            Some(task) => task,
            None => return Ok(()),
        };
        match self.engine.wait(task, self.platform.timeout()) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let DpcError::Timeout { .. } = err {
                    self.on_timeout(&mut st, "idle wait");
                }
                Err(err)
            }
        }
    }
}

// =============================================================================
// Batch builders
// =============================================================================

/// Stop the old mode, rewire for the target and start it
fn apply_topology(
    graph: &mut PathGraph,
    ctx: &mut GraphCtx<'_>,
    old: DisplayMode,
    target: &Target,
    tile_supported: bool,
    source: Option<SyncSource>,
) -> DpcResult<TileOverhead> {
    let display = graph.display();
    let old_comps = if graph.any_connected() { graph.components(old) } else { Vec::new() };
    for id in &old_comps {
        best_effort(display, "stop", ctx.registry.dispatch(Capability::Stop, *id, ctx.batch))?;
    }
    graph.disconnect(old, ctx)?;
    graph.set_dual(target.dual)?;
    if let Some(source) = source {
        for m in graph.mutexes() {
            ctx.mutexes.set_sync_source(m, source, ctx.batch)?;
        }
    }

    let new_comps = match target.mode {
        DisplayMode::NoUse => Vec::new(),
        mode => graph.components(mode),
    };
    for id in old_comps.iter().filter(|id| !new_comps.contains(id)) {
        let r = ctx.registry.dispatch(Capability::Unprepare, *id, ctx.batch);
        best_effort(display, "unprepare", r)?;
    }
    if target.mode == DisplayMode::NoUse {
        return Ok(TileOverhead::default());
    }

    for id in &new_comps {
        best_effort(display, "prepare", ctx.registry.dispatch(Capability::Prepare, *id, ctx.batch))?;
    }
    graph.connect(target.mode, ctx)?;
    let tile =
        overhead_for(graph, ctx.registry, target.mode, target.geometry.width, tile_supported)?;
    configure_path(graph, ctx.registry, ctx.batch, target.mode, &target.geometry, &tile)?;
    if target.bypass {
        for id in &new_comps {
            let r = ctx.registry.dispatch(Capability::Bypass(true), *id, ctx.batch);
            best_effort(display, "bypass", r)?;
        }
    }
    if target.drive == DriveMode::Continuous {
        for m in graph.mutexes() {
            ctx.mutexes.trigger(m, ctx.batch)?;
        }
    }
    Ok(tile)
}

/// Stop, disconnect, power down and disarm the mutexes
fn teardown(graph: &mut PathGraph, ctx: &mut GraphCtx<'_>, old: DisplayMode) -> DpcResult<()> {
    let display = graph.display();
    let comps = graph.components(old);
    for id in &comps {
        best_effort(display, "stop", ctx.registry.dispatch(Capability::Stop, *id, ctx.batch))?;
    }
    graph.disconnect(old, ctx)?;
    for id in &comps {
        let r = ctx.registry.dispatch(Capability::Unprepare, *id, ctx.batch);
        best_effort(display, "unprepare", r)?;
    }
    for m in graph.mutexes() {
        ctx.mutexes.disable(m, ctx.batch)?;
    }
    Ok(())
}

/// Block configuration of one pipe. The registry narrows `overhead` to
/// each component's recorded share on dispatch.
fn pipe_config(
    graph: &PathGraph,
    geometry: &Geometry,
    tile: &TileOverhead,
    pipe: PipeId,
) -> DpcResult<DdpConfig> {
    let dual = graph.is_dual();
    Ok(DdpConfig {
        width: dual::split_width(geometry.width, dual)?,
        height: geometry.height,
        refresh: geometry.refresh,
        overhead: match pipe {
            PipeId::Pipe0 => tile.left_overhead,
            PipeId::Pipe1 => tile.right_overhead,
        },
        pipe,
        dual,
    })
}

/// Configure and start every real component of a mode, per pipe
pub(super) fn configure_path(
    graph: &PathGraph,
    reg: &mut Registry,
    batch: &mut CommandBatch,
    mode: DisplayMode,
    geometry: &Geometry,
    tile: &TileOverhead,
) -> DpcResult<()> {
    let display = graph.display();
    for pipe in graph.pipes() {
        let cfg = pipe_config(graph, geometry, tile, *pipe)?;
        let comps: Vec<ComponentId> = match graph.path(mode, *pipe) {
            Some(path) => path.comps.iter().copied().filter(|id| !graph.is_virtual(*id)).collect(),
            None => continue,
        };
        for id in comps {
            best_effort(display, "configure", reg.dispatch(Capability::Configure(&cfg), id, batch))?;
            best_effort(display, "start", reg.dispatch(Capability::Start, id, batch))?;
        }
    }
    Ok(())
}

fn overhead_for(
    graph: &PathGraph,
    reg: &mut Registry,
    mode: DisplayMode,
    width: u32,
    supported: bool,
) -> DpcResult<TileOverhead> {
    let pipe0 = match graph.path(mode, PipeId::Pipe0) {
        Some(path) if !path.is_empty() => path.clone(),
        _ => return Ok(TileOverhead::default()),
    };
    let pipe1 = if graph.is_dual() { graph.path(mode, PipeId::Pipe1).cloned() } else { None };
    dual::compute_overhead(&pipe0, pipe1.as_ref(), reg, width, supported)
}

/// Ownership back to what `kept` holds after a failed change
pub(super) fn restore_owners(reg: &mut Registry, kept: &PathGraph, display: usize) {
    let owned: Vec<ComponentId> =
        reg.iter().filter(|c| c.owner() == Some(display)).map(|c| c.id).collect();
    for id in owned {
        reg.release(id, display);
    }
    for id in kept.snapshot().links.keys() {
        if let Err(err) = reg.claim(*id, display) {
            log::error!("[disp{}] {} not reclaimed: {}", display, id, err);
        }
    }
}
