//! Command Queue Interface
//!
//! A [`CommandBatch`] is an append-only list of hardware instructions that
//! the command-queue engine executes asynchronously. Batches are owned by
//! the submitter until [`CmdqEngine::submit`], then by the engine until the
//! completion callback fires.
//!
//! Hardware-resident loops are ordinary batches finalized with
//! [`CommandBatch::finalize_as_loop`]; the CPU only keeps a [`LoopHandle`].
//!
//! ```text
//!   CPU commit path                 command-queue engine
//!  +----------------+   submit    +----------------------+
//!  | CommandBatch   | ----------> | thread per client    |
//!  |  write/wait/.. |             |  pc, semaphores, mem |
//!  +----------------+ <---------- +----------------------+
//!                      callback
//! ```

pub mod event;
pub mod sim;
pub mod slots;

use std::fmt;
use std::time::Duration;

use crate::error::{DpcError, DpcResult};

pub use event::{EventId, EventName, EventTable};
pub use sim::SimEngine;
pub use slots::Slot;

/// Default instruction capacity of one batch
pub const DEFAULT_BATCH_CAPACITY: usize = 4096;

/// Command-queue engine ticks per microsecond
pub const TICKS_PER_US: u32 = 26;

/// Convert microseconds to engine sleep ticks
pub fn us_to_ticks(us: u32) -> u32 {
    us.saturating_mul(TICKS_PER_US)
}

// =============================================================================
// Instructions
// =============================================================================

/// Comparison evaluated by the engine for conditional branches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CondOp {
    pub fn eval(self, lhs: u32, rhs: u32) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
        }
    }
}

/// One hardware instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Masked register write
    Write { addr: u64, value: u32, mask: u32 },
    /// Block until the semaphore is set, then clear it
    WaitAndClear(EventId),
    /// Block until the semaphore is set
    WaitNoClear(EventId),
    SetEvent(EventId),
    ClearEvent(EventId),
    /// Jump to `target` when `mem[addr] <op> value` holds
    Branch { addr: u64, op: CondOp, value: u32, target: usize },
    Sleep(u32),
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write { addr, value, mask } => {
                write!(f, "write {:#010x} = {:#x} & {:#x}", addr, value, mask)
            }
            Self::WaitAndClear(ev) => write!(f, "wfe {}", ev),
            Self::WaitNoClear(ev) => write!(f, "wait_no_clear {}", ev),
            Self::SetEvent(ev) => write!(f, "set {}", ev),
            Self::ClearEvent(ev) => write!(f, "clear {}", ev),
            Self::Branch { addr, op, value, target } => {
                write!(f, "if [{:#010x}] {:?} {} goto {}", addr, op, value, target)
            }
            Self::Sleep(ticks) => write!(f, "sleep {}", ticks),
        }
    }
}

/// Final state reported to a completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Done,
    /// Dropped by the CPU (stall recovery, loop stop)
    Aborted,
    Timeout,
}

/// Completion callback. The payload travels as captured state.
pub type Callback = Box<dyn FnOnce(TaskStatus) + Send>;

/// Forward branch awaiting its target
#[must_use]
#[derive(Debug)]
pub struct BranchPatch(usize);

// =============================================================================
// Command Batch
// =============================================================================

/// Append-only hardware instruction batch
pub struct CommandBatch {
    label: &'static str,
    instrs: Vec<Instruction>,
    capacity: usize,
    looping: bool,
    callback: Option<Callback>,
}

impl CommandBatch {
    pub fn new(label: &'static str) -> Self {
        Self::with_capacity(label, DEFAULT_BATCH_CAPACITY)
    }

    pub fn with_capacity(label: &'static str, capacity: usize) -> Self {
        Self {
            label,
            instrs: Vec::new(),
            capacity,
            looping: false,
            callback: None,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instrs
    }

    pub fn is_loop(&self) -> bool {
        self.looping
    }

    fn push(&mut self, instr: Instruction) -> DpcResult<()> {
        if self.looping {
            return Err(DpcError::InvalidArgument(format!(
                "batch '{}' already finalized as loop",
                self.label
            )));
        }
        if self.instrs.len() >= self.capacity {
            return Err(DpcError::BatchFull(self.capacity));
        }
        self.instrs
            .try_reserve(1)
            .map_err(|_| DpcError::BatchFull(self.capacity))?;
        self.instrs.push(instr);
        Ok(())
    }

    /// Masked register write
    pub fn write(&mut self, addr: u64, value: u32, mask: u32) -> DpcResult<()> {
        self.push(Instruction::Write { addr, value, mask })
    }

    /// Full-width register write
    pub fn write_value(&mut self, addr: u64, value: u32) -> DpcResult<()> {
        self.write(addr, value, u32::MAX)
    }

    pub fn wait_and_clear(&mut self, ev: EventId) -> DpcResult<()> {
        self.push(Instruction::WaitAndClear(ev))
    }

    pub fn wait_no_clear(&mut self, ev: EventId) -> DpcResult<()> {
        self.push(Instruction::WaitNoClear(ev))
    }

    pub fn set_event(&mut self, ev: EventId) -> DpcResult<()> {
        self.push(Instruction::SetEvent(ev))
    }

    pub fn clear_event(&mut self, ev: EventId) -> DpcResult<()> {
        self.push(Instruction::ClearEvent(ev))
    }

    pub fn sleep(&mut self, ticks: u32) -> DpcResult<()> {
        self.push(Instruction::Sleep(ticks))
    }

    /// Emit a conditional forward branch whose target is bound later with
    /// [`CommandBatch::bind_here`].
    pub fn branch_forward(&mut self, addr: u64, op: CondOp, value: u32) -> DpcResult<BranchPatch> {
        let at = self.instrs.len();
        self.push(Instruction::Branch { addr, op, value, target: usize::MAX })?;
        Ok(BranchPatch(at))
    }

    /// Point a pending branch at the next instruction to be emitted
    pub fn bind_here(&mut self, patch: BranchPatch) {
        let here = self.instrs.len();
        if let Some(Instruction::Branch { target, .. }) = self.instrs.get_mut(patch.0) {
            *target = here;
        }
    }

    /// Turn the batch into a self-repeating hardware loop
    pub fn finalize_as_loop(&mut self) -> DpcResult<()> {
        if self.instrs.is_empty() {
            return Err(DpcError::InvalidArgument(format!(
                "empty loop batch '{}'",
                self.label
            )));
        }
        // A branch bound past the last instruction restarts the loop.
        let len = self.instrs.len();
        for instr in &mut self.instrs {
            if let Instruction::Branch { target, .. } = instr {
                if *target >= len {
                    *target = 0;
                }
            }
        }
        self.looping = true;
        Ok(())
    }

    pub fn set_callback(&mut self, callback: Callback) {
        self.callback = Some(callback);
    }

    pub fn take_callback(&mut self) -> Option<Callback> {
        self.callback.take()
    }

    /// Split into the instruction list and the callback
    pub fn into_parts(mut self) -> (Vec<Instruction>, bool, Option<Callback>) {
        let callback = self.callback.take();
        (std::mem::take(&mut self.instrs), self.looping, callback)
    }
}

impl fmt::Debug for CommandBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBatch")
            .field("label", &self.label)
            .field("len", &self.instrs.len())
            .field("looping", &self.looping)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

// =============================================================================
// Engine Interface
// =============================================================================

/// Engine thread roles per display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    /// Per-frame commit batches
    Config = 0,
    TriggerLoop = 1,
    EventLoop = 2,
}

/// Engine thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn new(display: usize, kind: ClientKind) -> Self {
        Self(display as u32 * 4 + kind as u32)
    }

    pub fn display(self) -> usize {
        (self.0 / 4) as usize
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client{}", self.0)
    }
}

/// Handle of a submitted batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// CPU-side stop handle of a hardware-resident loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopHandle {
    pub client: ClientId,
    pub task: TaskId,
}

/// Program state of one engine thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub client: ClientId,
    pub pc: usize,
    pub current: Option<Instruction>,
    pub pending: usize,
    pub looping: bool,
}

/// Timing-signal routing of one display, consumed by engines that model
/// hardware event sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingBinding {
    pub display: usize,
    pub mutex: usize,
    pub panel_te: Option<EventId>,
    pub prefetch_te: Option<EventId>,
    pub cmd_eof: Option<EventId>,
    pub continuous_eof: Option<EventId>,
    pub dma_eof: Option<EventId>,
}

/// Hardware command-queue engine
pub trait CmdqEngine: Send + Sync {
    /// Queue a batch on a client thread; batches of one client run in order
    fn submit(&self, client: ClientId, batch: CommandBatch) -> DpcResult<TaskId>;

    /// Block until the task completes
    fn wait(&self, task: TaskId, timeout: Duration) -> DpcResult<()>;

    fn is_done(&self, task: TaskId) -> bool;

    /// Start a batch finalized as loop on its own client
    fn start_loop(&self, client: ClientId, batch: CommandBatch) -> DpcResult<LoopHandle>;

    /// Stop and destroy a loop
    fn stop_loop(&self, handle: LoopHandle) -> DpcResult<()>;

    /// Drop every queued task of a client; callbacks fire with `Aborted`
    fn abort(&self, client: ClientId) -> usize;

    fn set_event(&self, ev: EventId);

    fn clear_event(&self, ev: EventId);

    fn event_state(&self, ev: EventId) -> bool;

    fn read_mem(&self, addr: u64) -> u32;

    fn write_mem(&self, addr: u64, value: u32);

    fn snapshot(&self, client: ClientId) -> ThreadSnapshot;

    /// Route a display's timing signals
    fn bind_timing(&self, binding: TimingBinding) {
        let _ = binding;
    }

    fn unbind_timing(&self, display: usize) {
        let _ = display;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_capacity() {
        let mut batch = CommandBatch::with_capacity("tiny", 2);
        batch.write_value(0x1000, 1).unwrap();
        batch.sleep(10).unwrap();
        let err = batch.write_value(0x1000, 2).unwrap_err();
        assert!(matches!(err, DpcError::BatchFull(2)));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_forward_branch_patch() {
        let mut batch = CommandBatch::new("branch");
        let patch = batch.branch_forward(0x2000, CondOp::Ne, 0).unwrap();
        batch.sleep(1).unwrap();
        batch.sleep(2).unwrap();
        batch.bind_here(patch);
        batch.sleep(3).unwrap();
        match batch.instructions()[0] {
            Instruction::Branch { target, .. } => assert_eq!(target, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_loop_finalize_wraps_trailing_branch() {
        let mut batch = CommandBatch::new("loop");
        batch.sleep(1).unwrap();
        let patch = batch.branch_forward(0x2000, CondOp::Eq, 0).unwrap();
        batch.bind_here(patch);
        batch.finalize_as_loop().unwrap();
        assert!(batch.is_loop());
        match batch.instructions()[1] {
            Instruction::Branch { target, .. } => assert_eq!(target, 0),
            other => panic!("unexpected {:?}", other),
        }
        assert!(batch.sleep(1).is_err());
    }

    #[test]
    fn test_empty_loop_rejected() {
        let mut batch = CommandBatch::new("empty");
        assert!(batch.finalize_as_loop().is_err());
    }

    #[test]
    fn test_client_ids() {
        let c = ClientId::new(1, ClientKind::TriggerLoop);
        assert_eq!(c.0, 5);
        assert_eq!(c.display(), 1);
        assert_ne!(c, ClientId::new(1, ClientKind::EventLoop));
    }

    #[test]
    fn test_cond_ops() {
        assert!(CondOp::Ne.eval(1, 0));
        assert!(!CondOp::Eq.eval(1, 0));
        assert!(CondOp::Ge.eval(2, 2));
        assert!(CondOp::Lt.eval(1, 2));
    }
}
