//! Frame commit.
//!
//! The batch is built on clones of the path graph and mutex pool, which
//! are adopted only once the engine has accepted it. Callbacks capture the
//! bandwidth budget and collaborator handles, never the display state.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::cmdq::{Callback, CommandBatch, TaskStatus};
use crate::commit::{
    self, best_effort, BandwidthBudget, CommitEvents, CommitStage, FrameConfig, FramePayload,
};
use crate::component::{Capability, ComponentId, DriveMode};
use crate::dual::TileOverhead;
use crate::error::{DpcError, DpcResult};
use crate::loops::{self, LoopKind};
use crate::path::{DisplayMode, GraphCtx, PathGraph, PipeId};
use crate::workers::{KickRequest, TriggerRequest};

use super::lifecycle::restore_owners;
use super::{DisplayInner, DisplayState};

impl DisplayInner {
    pub(super) fn commit(&self, frame: &FrameConfig) -> DpcResult<u64> {
        let mut st = self.state.lock();
        if !st.enabled {
            return Err(DpcError::NotEnabled(self.index));
        }
        if st.mode == DisplayMode::NoUse {
            log::debug!("[disp{}] no path in use, frame dropped", self.index);
            return Ok(st.seq);
        }
        self.kick(KickRequest::Idle);
        self.drain(&mut st);

        st.seq += 1;
        let seq = st.seq;
        self.trace(seq, CommitStage::Begin);
        self.apply_layering(&mut st, frame);

        let (prior, raised, applied) = {
            let mut bw = self.bw.lock();
            let prior = bw.clone();
            let raised = bw.request(seq, frame.bandwidth);
            (prior, raised, bw.applied())
        };

        let drive = self.drive_mode(&st);
        let events = CommitEvents::from_table(&st.events);
        let mode = st.mode;
        let half = st.geometry.width / 2;
        let tile = st.tile;

        let mut reg = self.registry.write();
        let mut pool_guard = self.mutexes.lock();
        let mut graph = st.graph.clone();
        let mut pool = pool_guard.clone();
        let mut batch = CommandBatch::with_capacity("commit", self.platform.batch_capacity);

        let built = {
            let mut ctx = GraphCtx { registry: &mut reg, mutexes: &mut pool, batch: &mut batch };
            self.build_frame(
                &mut graph, &mut ctx, mode, half, &tile, frame, drive, &events, applied, seq,
            )
        };
        if let Err(err) = built {
            restore_owners(&mut reg, &st.graph, self.index);
            self.revert_bandwidth(prior, false);
            log::error!("[disp{}] frame {} not built: {}", self.index, seq, err);
            return Err(err);
        }

        // A raise reaches QoS before the frame can be triggered
        if let Some(value) = raised {
            self.collab.qos.update_bandwidth(self.index, value);
        }
        self.trace(seq, CommitStage::Submit);
        batch.set_callback(self.frame_callback(seq, frame));
        let task = match self.engine.submit(self.config_client(), batch) {
            Ok(task) => task,
            Err(err) => {
                restore_owners(&mut reg, &st.graph, self.index);
                self.revert_bandwidth(prior, raised.is_some());
                log::error!("[disp{}] frame {} not submitted: {}", self.index, seq, err);
                return Err(err);
            }
        };
        st.graph = graph;
        *pool_guard = pool;
        drop(pool_guard);
        drop(reg);

        st.last_task = Some(task);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        if drive == DriveMode::CommandDriven && !st.loops.is_running(LoopKind::Trigger) {
            if let Err(err) = self.queues.trigger.send(TriggerRequest { seq }) {
                log::error!("[disp{}] frame {} not triggered: {}", self.index, seq, err);
            }
        }
        Ok(seq)
    }

    /// Undo the request of a frame that never reached the engine. Earlier
    /// frame callbacks cannot move the budget meanwhile: the request
    /// replaced any decrease they could have completed.
    fn revert_bandwidth(&self, prior: BandwidthBudget, pushed: bool) {
        let applied = prior.applied();
        *self.bw.lock() = prior;
        if pushed {
            self.collab.qos.update_bandwidth(self.index, applied);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_frame(
        &self,
        graph: &mut PathGraph,
        ctx: &mut GraphCtx<'_>,
        mode: DisplayMode,
        half: u32,
        tile: &TileOverhead,
        frame: &FrameConfig,
        drive: DriveMode,
        events: &CommitEvents,
        applied: u32,
        seq: u64,
    ) -> DpcResult<()> {
        self.trace(seq, CommitStage::WaitPrevFrameDone);
        commit::open_frame(ctx.batch, drive, events)?;

        self.trace(seq, CommitStage::Configure);
        commit::write_frame_slots(ctx.batch, self.index, frame, applied, seq)?;
        self.apply_addons(graph, ctx, frame)?;
        if let Some(roi) = frame.roi {
            for id in graph.components(mode) {
                let r = ctx.registry.dispatch(Capability::PartialUpdate(roi), id, ctx.batch);
                best_effort(self.index, "partial update", r)?;
            }
        }

        let engines = real_engines(graph, mode, PipeId::Pipe0);
        if graph.is_dual() {
            let twins = real_engines(graph, mode, PipeId::Pipe1);
            commit::configure_layers(
                ctx.registry,
                ctx.batch,
                self.index,
                &frame.layers,
                &engines,
                Some((&twins, half, tile)),
            )?;
        } else {
            commit::configure_layers(ctx.registry, ctx.batch, self.index, &frame.layers, &engines, None)?;
        }

        self.trace(seq, CommitStage::Mark);
        commit::close_frame(ctx.batch, drive, events)
    }

    /// Attach the addons this frame asks for, detach the others
    fn apply_addons(
        &self,
        graph: &mut PathGraph,
        ctx: &mut GraphCtx<'_>,
        frame: &FrameConfig,
    ) -> DpcResult<()> {
        let stale: Vec<String> = graph
            .active_addons()
            .filter(|name| !frame.addons.iter().any(|a| a == name))
            .map(str::to_string)
            .collect();
        for name in stale {
            graph.disconnect_addon(&name, ctx)?;
        }
        for name in &frame.addons {
            if graph.addon_active(name) {
                continue;
            }
            let result = match self.soc.addon(self.index, name) {
                Some(scenario) => graph.connect_addon(scenario, ctx),
                None => Err(DpcError::InvalidArgument(format!("unknown addon '{}'", name))),
            };
            match result {
                Err(DpcError::BatchFull(n)) => return Err(DpcError::BatchFull(n)),
                Err(err) => log::warn!("[disp{}] addon '{}' skipped: {}", self.index, name, err),
                Ok(()) => {}
            }
        }
        Ok(())
    }

    /// Let the layering rule pick the engine subset. A refused splice
    /// keeps the current one for this frame.
    fn apply_layering(&self, st: &mut DisplayState, frame: &FrameConfig) {
        let current = st.graph.mask();
        match self.collab.layering.engine_mask(self.index, frame, current) {
            Some(mask) if mask != current => {
                if let Err(err) = self.splice_locked(st, mask) {
                    log::warn!("[disp{}] engine subset {:#b} skipped: {}", self.index, mask, err);
                }
            }
            _ => {}
        }
    }

    fn frame_callback(&self, seq: u64, frame: &FrameConfig) -> Callback {
        let payload = FramePayload {
            display: self.index,
            seq,
            bandwidth: frame.bandwidth,
            present_fence: frame.present_fence,
            layer_fences: frame.layers.iter().map(|l| (l.index, l.fence)).collect(),
        };
        let bw = Arc::clone(&self.bw);
        let qos = Arc::clone(&self.collab.qos);
        let fences = self.queues.fence.clone();
        let stats = Arc::clone(&self.stats);
        Box::new(move |status| {
            match status {
                TaskStatus::Done => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                    let lowered = bw.lock().complete(payload.seq);
                    if let Some(value) = lowered {
                        qos.update_bandwidth(payload.display, value);
                    }
                }
                other => {
                    stats.aborted.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[disp{}] frame {} {:?}", payload.display, payload.seq, other);
                }
            }
            let (display, seq) = (payload.display, payload.seq);
            if let Err(err) = fences.send(payload) {
                log::debug!("[disp{}] frame {} fences: {}", display, seq, err);
            }
        })
    }

    /// Trigger-delay worker: trigger a frame the loop cannot pick up
    pub(super) fn cpu_trigger(&self, req: TriggerRequest) {
        let mut st = self.state.lock();
        if !st.enabled || st.loops.is_running(LoopKind::Trigger) {
            return;
        }
        let batch = {
            let pool = self.mutexes.lock();
            loops::build_cpu_trigger(self.index, &st.graph.mutexes(), &pool, &st.events)
        };
        match batch.and_then(|batch| self.engine.submit(self.config_client(), batch)) {
            Ok(task) => {
                st.last_task = Some(task);
                log::trace!("[disp{}] cpu trigger for frame {}", self.index, req.seq);
            }
            Err(err) => log::error!("[disp{}] cpu trigger for frame {}: {}", self.index, req.seq, err),
        }
    }

    #[cfg(feature = "sim_trace")]
    fn trace(&self, seq: u64, stage: CommitStage) {
        log::trace!("[disp{}] frame {} {:?}", self.index, seq, stage);
    }

    #[cfg(not(feature = "sim_trace"))]
    fn trace(&self, _seq: u64, _stage: CommitStage) {}
}

fn real_engines(graph: &PathGraph, mode: DisplayMode, pipe: PipeId) -> Vec<ComponentId> {
    graph
        .path(mode, pipe)
        .map(|path| path.engines().iter().copied().filter(|id| !graph.is_virtual(*id)).collect())
        .unwrap_or_default()
}
