//! Trigger Loop and Event Loop
//!
//! Two hardware-resident command loops take the CPU out of per-frame
//! timing. The trigger loop picks up frames marked dirty by commits and
//! fires the display's sync mutexes at the next panel edge; the event loop
//! pre-arms power transitions ahead of that edge.
//!
//! Trigger loop body:
//!
//! ```text
//!   L0: wait_and_clear(stream-dirty)
//!       wait_no_clear(stream-block)
//!       clear(stream-eof)
//!       if slot[MergeSkip] != 0 goto L1          (te_wait only)
//!       clear(panel-te); wait_and_clear(panel-te); sleep(prefetch)
//!   L1: if slot[IdleHook] == 0 goto L2            (idle hooks only)
//!       write PRE_HOOK
//!   L2: mutex trigger
//!       wait_and_clear(cmd-eof)
//!       if slot[IdleHook] == 0 goto L3            (idle hooks only)
//!       write POST_HOOK
//!   L3: set(stream-eof)
//! ```
//!
//! Both loops are started and stopped by the CPU only, and are always
//! stopped before the path graph changes.

use crate::cmdq::slots::Slot;
use crate::cmdq::{us_to_ticks, ClientId, CmdqEngine, CommandBatch, CondOp, EventName, EventTable, LoopHandle};
use crate::config::{EventLoopConfig, TriggerLoopConfig};
use crate::error::{DpcError, DpcResult};
use crate::mutex::MutexAllocator;

pub const POWER_BASE: u64 = 0x1400_f000;
pub const POWER_STRIDE: u64 = 0x100;

pub const POWER_PRE_HOOK: u64 = 0x0;
pub const POWER_POST_HOOK: u64 = 0x4;
pub const POWER_EVENT_PREARM: u64 = 0x8;
pub const POWER_EVENT_RELEASE: u64 = 0xc;

/// Power-control register of a display
pub fn power_reg(display: usize, off: u64) -> u64 {
    POWER_BASE + display as u64 * POWER_STRIDE + off
}

// =============================================================================
// Builders
// =============================================================================

/// Build the trigger loop. `None` when a required semaphore is missing.
pub fn build_trigger_loop(
    display: usize,
    mutexes: &[usize],
    pool: &MutexAllocator,
    events: &EventTable,
    cfg: &TriggerLoopConfig,
) -> DpcResult<Option<CommandBatch>> {
    if !events.has_trigger_set() {
        log::warn!("[disp{}] trigger loop unavailable, using CPU trigger", display);
        return Ok(None);
    }
    let mut batch = CommandBatch::new("trigger-loop");
    emit_trigger_body(&mut batch, display, mutexes, pool, events, cfg, true)?;
    batch.finalize_as_loop()?;
    Ok(Some(batch))
}

/// One-shot CPU trigger with whatever semaphores resolve
pub fn build_cpu_trigger(
    display: usize,
    mutexes: &[usize],
    pool: &MutexAllocator,
    events: &EventTable,
) -> DpcResult<CommandBatch> {
    let mut batch = CommandBatch::new("cpu-trigger");
    let cfg = TriggerLoopConfig { te_wait: false, ..Default::default() };
    emit_trigger_body(&mut batch, display, mutexes, pool, events, &cfg, false)?;
    Ok(batch)
}

fn emit_trigger_body(
    batch: &mut CommandBatch,
    display: usize,
    mutexes: &[usize],
    pool: &MutexAllocator,
    events: &EventTable,
    cfg: &TriggerLoopConfig,
    idle_hooks: bool,
) -> DpcResult<()> {
    if let Some(dirty) = events.get(EventName::StreamDirty) {
        batch.wait_and_clear(dirty)?;
    }
    if let Some(block) = events.get(EventName::StreamBlock) {
        batch.wait_no_clear(block)?;
    }
    if let Some(eof) = events.get(EventName::StreamEof) {
        batch.clear_event(eof)?;
    }

    match events.get(EventName::PanelTe) {
        Some(te) if cfg.te_wait => {
            let skip = batch.branch_forward(Slot::MergeSkip.addr(display), CondOp::Ne, 0)?;
            batch.clear_event(te)?;
            batch.wait_and_clear(te)?;
            if cfg.prefetch_offset_us > 0 {
                batch.sleep(us_to_ticks(cfg.prefetch_offset_us))?;
            }
            batch.bind_here(skip);
        }
        None if cfg.te_wait => {
            log::warn!("[disp{}] panel-te unresolved, triggering without TE", display);
        }
        _ => {}
    }

    let hooks = idle_hooks && cfg.idle_hooks;
    if hooks {
        let skip = batch.branch_forward(Slot::IdleHook.addr(display), CondOp::Eq, 0)?;
        batch.write_value(power_reg(display, POWER_PRE_HOOK), 1)?;
        batch.bind_here(skip);
    }

    for m in mutexes {
        pool.trigger(*m, batch)?;
    }
    if let Some(cmd_eof) = events.get(EventName::CmdEof) {
        batch.wait_and_clear(cmd_eof)?;
    }

    if hooks {
        let skip = batch.branch_forward(Slot::IdleHook.addr(display), CondOp::Eq, 0)?;
        batch.write_value(power_reg(display, POWER_POST_HOOK), 1)?;
        batch.bind_here(skip);
    }

    if let Some(eof) = events.get(EventName::StreamEof) {
        batch.set_event(eof)?;
    }
    Ok(())
}

/// Time left between the prefetch edge and the panel edge, or `None` when
/// the offsets exceed the frame period
pub fn event_loop_budget(refresh: u32, cfg: &EventLoopConfig) -> Option<u32> {
    let period = 1_000_000i64 / refresh.max(1) as i64;
    let budget = period - cfg.te_offset_us as i64 - cfg.prefetch_offset_us as i64;
    (budget >= 0).then_some(budget as u32)
}

/// Build the event loop. `None` when disabled, when the budget is negative
/// or when `prefetch-te` does not resolve.
pub fn build_event_loop(
    display: usize,
    refresh: u32,
    events: &EventTable,
    cfg: &EventLoopConfig,
) -> DpcResult<Option<CommandBatch>> {
    if !cfg.enabled {
        return Ok(None);
    }
    let prefetch = match events.get(EventName::PrefetchTe) {
        Some(ev) => ev,
        None => {
            log::warn!("[disp{}] prefetch-te unresolved, event loop disabled", display);
            return Ok(None);
        }
    };
    let budget = match event_loop_budget(refresh, cfg) {
        Some(budget) => budget,
        None => {
            log::warn!(
                "[disp{}] event loop offsets exceed frame period at {}Hz, disabled",
                display,
                refresh
            );
            return Ok(None);
        }
    };
    let mut batch = CommandBatch::new("event-loop");
    batch.wait_and_clear(prefetch)?;
    batch.write_value(power_reg(display, POWER_EVENT_PREARM), 1)?;
    batch.sleep(us_to_ticks(budget))?;
    batch.write_value(power_reg(display, POWER_EVENT_RELEASE), 1)?;
    batch.finalize_as_loop()?;
    Ok(Some(batch))
}

// =============================================================================
// Loop Control
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Trigger,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    #[default]
    Stopped,
    /// Batch built, not yet on the engine
    Armed,
    /// Resident on the engine
    Running,
}

#[derive(Debug, Clone, Copy, Default)]
struct LoopSlot {
    state: LoopState,
    handle: Option<LoopHandle>,
}

/// Lifecycle of a display's two loops
#[derive(Debug, Clone, Default)]
pub struct LoopControl {
    trigger: LoopSlot,
    event: LoopSlot,
    reconfiguring: bool,
}

impl LoopControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: LoopKind) -> &LoopSlot {
        match kind {
            LoopKind::Trigger => &self.trigger,
            LoopKind::Event => &self.event,
        }
    }

    fn slot_mut(&mut self, kind: LoopKind) -> &mut LoopSlot {
        match kind {
            LoopKind::Trigger => &mut self.trigger,
            LoopKind::Event => &mut self.event,
        }
    }

    pub fn state(&self, kind: LoopKind) -> LoopState {
        self.slot(kind).state
    }

    pub fn is_running(&self, kind: LoopKind) -> bool {
        self.state(kind) == LoopState::Running
    }

    pub fn is_reconfiguring(&self) -> bool {
        self.reconfiguring
    }

    /// No loop is live while the graph is being reconfigured
    pub fn invariant_holds(&self) -> bool {
        !(self.reconfiguring
            && (self.trigger.state != LoopState::Stopped || self.event.state != LoopState::Stopped))
    }

    /// Put a loop on the engine
    pub fn start(
        &mut self,
        kind: LoopKind,
        engine: &dyn CmdqEngine,
        client: ClientId,
        batch: CommandBatch,
    ) -> DpcResult<()> {
        if self.reconfiguring {
            return Err(DpcError::InvalidArgument(format!(
                "{:?} loop start during reconfiguration",
                kind
            )));
        }
        if self.state(kind) != LoopState::Stopped {
            return Err(DpcError::LoopActive);
        }
        self.slot_mut(kind).state = LoopState::Armed;
        match engine.start_loop(client, batch) {
            Ok(handle) => {
                *self.slot_mut(kind) = LoopSlot { state: LoopState::Running, handle: Some(handle) };
            }
            Err(err) => {
                *self.slot_mut(kind) = LoopSlot::default();
                return Err(err);
            }
        }
        debug_assert!(self.invariant_holds());
        Ok(())
    }

    /// Tear a loop down; stopping a stopped loop is a no-op
    pub fn stop(&mut self, kind: LoopKind, engine: &dyn CmdqEngine) -> DpcResult<()> {
        let slot = std::mem::take(self.slot_mut(kind));
        if let Some(handle) = slot.handle {
            engine.stop_loop(handle)?;
        }
        Ok(())
    }

    pub fn stop_all(&mut self, engine: &dyn CmdqEngine) -> DpcResult<()> {
        self.stop(LoopKind::Event, engine)?;
        self.stop(LoopKind::Trigger, engine)
    }

    /// Stop both loops and enter reconfiguration
    pub fn begin_reconfig(&mut self, engine: &dyn CmdqEngine) -> DpcResult<()> {
        self.stop_all(engine)?;
        self.reconfiguring = true;
        debug_assert!(self.invariant_holds());
        Ok(())
    }

    pub fn end_reconfig(&mut self) {
        self.reconfiguring = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdq::{ClientKind, EventId, Instruction, SimEngine};

    fn events() -> EventTable {
        let mut table = EventTable::default();
        table.insert(EventName::StreamEof, EventId(1));
        table.insert(EventName::StreamDirty, EventId(2));
        table.insert(EventName::StreamBlock, EventId(3));
        table.insert(EventName::CmdEof, EventId(4));
        table.insert(EventName::PanelTe, EventId(5));
        table.insert(EventName::PrefetchTe, EventId(6));
        table
    }

    fn pool() -> MutexAllocator {
        let mut pool = MutexAllocator::new(2);
        pool.bind(0).unwrap();
        pool
    }

    #[test]
    fn test_trigger_loop_layout() {
        let cfg = TriggerLoopConfig { te_wait: true, prefetch_offset_us: 100, idle_hooks: false };
        let batch = build_trigger_loop(0, &[0], &pool(), &events(), &cfg).unwrap().unwrap();
        let instrs = batch.instructions();
        assert!(batch.is_loop());
        assert_eq!(instrs[0], Instruction::WaitAndClear(EventId(2)));
        assert_eq!(instrs[1], Instruction::WaitNoClear(EventId(3)));
        assert_eq!(instrs[2], Instruction::ClearEvent(EventId(1)));
        // merge-skip branch jumps over the TE wait
        match instrs[3] {
            Instruction::Branch { target, op: CondOp::Ne, .. } => assert_eq!(target, 7),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(instrs[6], Instruction::Sleep(2600));
        assert_eq!(instrs.last(), Some(&Instruction::SetEvent(EventId(1))));
    }

    #[test]
    fn test_trigger_loop_needs_core_events() {
        let mut table = EventTable::default();
        table.insert(EventName::StreamEof, EventId(1));
        let cfg = TriggerLoopConfig::default();
        assert!(build_trigger_loop(0, &[0], &pool(), &table, &cfg).unwrap().is_none());
        let cpu = build_cpu_trigger(0, &[0], &pool(), &table).unwrap();
        assert!(!cpu.is_loop());
        assert!(!cpu.is_empty());
    }

    #[test]
    fn test_idle_hooks_branch() {
        let cfg = TriggerLoopConfig { te_wait: false, prefetch_offset_us: 0, idle_hooks: true };
        let batch = build_trigger_loop(0, &[0], &pool(), &events(), &cfg).unwrap().unwrap();
        let hooks = batch
            .instructions()
            .iter()
            .filter(|i| matches!(i, Instruction::Branch { op: CondOp::Eq, .. }))
            .count();
        assert_eq!(hooks, 2);
    }

    #[test]
    fn test_event_loop_budget() {
        let cfg = EventLoopConfig { enabled: true, te_offset_us: 1000, prefetch_offset_us: 500 };
        assert_eq!(event_loop_budget(60, &cfg), Some(16666 - 1500));
        let tight = EventLoopConfig { enabled: true, te_offset_us: 8000, prefetch_offset_us: 1000 };
        assert_eq!(event_loop_budget(120, &tight), None);
        assert!(build_event_loop(0, 120, &events(), &tight).unwrap().is_none());
        assert!(build_event_loop(0, 60, &events(), &cfg).unwrap().is_some());
        assert!(build_event_loop(0, 60, &EventTable::default(), &cfg).unwrap().is_none());
    }

    #[test]
    fn test_loop_control_refuses_start_during_reconfig() {
        let engine = SimEngine::default();
        let mut ctl = LoopControl::new();
        let client = ClientId::new(0, ClientKind::TriggerLoop);
        let cfg = TriggerLoopConfig::default();
        let batch = build_trigger_loop(0, &[0], &pool(), &events(), &cfg).unwrap().unwrap();
        ctl.start(LoopKind::Trigger, &engine, client, batch).unwrap();
        assert!(ctl.is_running(LoopKind::Trigger));
        ctl.begin_reconfig(&engine).unwrap();
        assert!(!ctl.is_running(LoopKind::Trigger));
        assert!(!engine.loop_running(client));
        let batch = build_trigger_loop(0, &[0], &pool(), &events(), &cfg).unwrap().unwrap();
        assert!(ctl.start(LoopKind::Trigger, &engine, client, batch).is_err());
        assert!(ctl.invariant_holds());
        ctl.end_reconfig();
        let batch = build_trigger_loop(0, &[0], &pool(), &events(), &cfg).unwrap().unwrap();
        ctl.start(LoopKind::Trigger, &engine, client, batch).unwrap();
    }
}
