//! Simulated Command-Queue Engine
//!
//! Deterministic stand-in for the command-queue hardware plus the display
//! timing sources it listens to. Every client is a thread with a program
//! counter that runs until it blocks on a semaphore. Threads are pumped on
//! submit, on every external semaphore change and on [`SimEngine::tick`];
//! nothing runs in the background.
//!
//! ```text
//!   tick()  -->  prefetch-te  -->  pump
//!           -->  panel-te     -->  pump
//!           -->  continuous-eof (streaming displays)  -->  pump
//!
//!   write MUTEX.EN = 1
//!       command-driven source   ->  cmd-eof, dma-eof
//!       output-sof/eof source   ->  stream starts (continuous-eof per tick)
//! ```
//!
//! A display can be stalled with [`SimEngine::set_stall`]: its mutex
//! triggers then never complete and its stream raises no end of frame,
//! which is how hardware timeouts are exercised in tests.
//!
//! Completion callbacks run after the internal lock is released.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{
    Callback, ClientId, CmdqEngine, CommandBatch, EventId, Instruction, LoopHandle, TaskId,
    TaskStatus, ThreadSnapshot, TimingBinding,
};
use crate::error::{DpcError, DpcResult};
use crate::mutex::{self, MutexReg, SyncSource};

/// Instructions one thread may execute per pump before yielding
const STEP_BUDGET: usize = 4096;
/// Pump rounds before giving up on reaching a fixpoint
const MAX_ROUNDS: usize = 64;

/// A submitted batch on a thread queue
struct Job {
    task: TaskId,
    instrs: Vec<Instruction>,
    looping: bool,
    pc: usize,
    callback: Option<Callback>,
}

#[derive(Default)]
struct SimThread {
    jobs: VecDeque<Job>,
}

#[derive(Debug, Clone, Copy)]
struct TaskRecord {
    client: ClientId,
    status: Option<TaskStatus>,
}

/// Per-display counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayStats {
    /// Mutex triggers seen
    pub triggers: u64,
    /// Frames that reached end of frame
    pub frames: u64,
    pub te_edges: u64,
}

#[derive(Default)]
struct SimState {
    events: BTreeSet<EventId>,
    mem: HashMap<u64, u32>,
    threads: BTreeMap<ClientId, SimThread>,
    tasks: HashMap<TaskId, TaskRecord>,
    next_task: u64,
    bindings: BTreeMap<usize, TimingBinding>,
    streaming: BTreeSet<usize>,
    stalled: BTreeSet<usize>,
    stats: BTreeMap<usize, DisplayStats>,
    sleep_ticks: u64,
    stopped: bool,
}

/// Simulated command-queue engine
pub struct SimEngine {
    state: Mutex<SimState>,
    progress: Condvar,
    mutex_count: usize,
}

/// What a thread did during one run
enum RunResult {
    Idle,
    Progress,
}

impl SimEngine {
    pub fn new(mutex_count: usize) -> Self {
        Self { state: Mutex::new(SimState::default()), progress: Condvar::new(), mutex_count }
    }

    /// Advance display timing by one frame
    pub fn tick(&self) {
        let bindings: Vec<TimingBinding> = self.state.lock().bindings.values().cloned().collect();
        for binding in bindings {
            if let Some(ev) = binding.prefetch_te {
                self.raise(ev);
            }
            if let Some(ev) = binding.panel_te {
                self.state.lock().stats.entry(binding.display).or_default().te_edges += 1;
                self.raise(ev);
            }
            let streaming = {
                let st = self.state.lock();
                st.streaming.contains(&binding.display) && !st.stalled.contains(&binding.display)
            };
            if streaming {
                self.state.lock().stats.entry(binding.display).or_default().frames += 1;
                if let Some(ev) = binding.continuous_eof {
                    self.raise(ev);
                }
            }
        }
    }

    /// Run `n` frames of display timing
    pub fn run_frames(&self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Make a display's hardware stop completing frames
    pub fn set_stall(&self, display: usize, stalled: bool) {
        let mut st = self.state.lock();
        if stalled {
            st.stalled.insert(display);
        } else {
            st.stalled.remove(&display);
        }
    }

    pub fn stats(&self, display: usize) -> DisplayStats {
        self.state.lock().stats.get(&display).copied().unwrap_or_default()
    }

    /// Whether a continuous stream is running on a display
    pub fn is_streaming(&self, display: usize) -> bool {
        self.state.lock().streaming.contains(&display)
    }

    /// Whether a hardware loop occupies a client
    pub fn loop_running(&self, client: ClientId) -> bool {
        self.state
            .lock()
            .threads
            .get(&client)
            .map(|t| t.jobs.iter().any(|j| j.looping))
            .unwrap_or(false)
    }

    /// Total sleep ticks executed
    pub fn sleep_ticks(&self) -> u64 {
        self.state.lock().sleep_ticks
    }

    /// Refuse further submissions
    pub fn shutdown(&self) {
        self.state.lock().stopped = true;
    }

    fn raise(&self, ev: EventId) {
        let callbacks = {
            let mut st = self.state.lock();
            st.events.insert(ev);
            self.pump_locked(&mut st)
        };
        self.finish(callbacks);
    }

    fn pump(&self) {
        let callbacks = {
            let mut st = self.state.lock();
            self.pump_locked(&mut st)
        };
        self.finish(callbacks);
    }

    fn finish(&self, callbacks: Vec<(Callback, TaskStatus)>) {
        self.progress.notify_all();
        for (callback, status) in callbacks {
            callback(status);
        }
    }

    fn alloc_task(st: &mut SimState, client: ClientId) -> TaskId {
        st.next_task += 1;
        let task = TaskId(st.next_task);
        st.tasks.insert(task, TaskRecord { client, status: None });
        task
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn pump_locked(&self, st: &mut SimState) -> Vec<(Callback, TaskStatus)> {
        let mut done = Vec::new();
        for _ in 0..MAX_ROUNDS {
            let clients: Vec<ClientId> = st.threads.keys().copied().collect();
            let mut progressed = false;
            for client in clients {
                if let RunResult::Progress = self.run_thread(st, client, &mut done) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        done
    }

    fn run_thread(
        &self,
        st: &mut SimState,
        client: ClientId,
        done: &mut Vec<(Callback, TaskStatus)>,
    ) -> RunResult {
        let mut result = RunResult::Idle;
        for _ in 0..STEP_BUDGET {
            let step = {
                let thread = match st.threads.get_mut(&client) {
                    Some(thread) => thread,
                    None => return result,
                };
                let job = match thread.jobs.front_mut() {
                    Some(job) => job,
                    None => return result,
                };
                if job.pc >= job.instrs.len() {
                    if job.looping {
                        job.pc = 0;
                        None
                    } else {
                        Some(Err(()))
                    }
                } else {
                    Some(Ok((job.instrs[job.pc], job.pc)))
                }
            };
            let (instr, pc) = match step {
                None => continue,
                Some(Err(())) => {
                    self.complete_front(st, client, TaskStatus::Done, done);
                    result = RunResult::Progress;
                    continue;
                }
                Some(Ok(step)) => step,
            };
            #[cfg(feature = "sim_trace")]
            log::trace!("{} pc={} {}", client, pc, instr);
            let next = match self.execute(st, instr, pc) {
                Some(next) => next,
                None => return result,
            };
            if let Some(job) = st.threads.get_mut(&client).and_then(|t| t.jobs.front_mut()) {
                job.pc = next;
            }
            result = RunResult::Progress;
        }
        log::warn!("sim: {} exceeded step budget", client);
        result
    }

    /// Execute one instruction; `None` means the thread blocks
    fn execute(&self, st: &mut SimState, instr: Instruction, pc: usize) -> Option<usize> {
        match instr {
            Instruction::Write { addr, value, mask } => {
                let old = st.mem.get(&addr).copied().unwrap_or(0);
                let new = (old & !mask) | (value & mask);
                st.mem.insert(addr, new);
                self.hw_write(st, addr, new);
                Some(pc + 1)
            }
            Instruction::WaitAndClear(ev) => {
                if st.events.remove(&ev) {
                    Some(pc + 1)
                } else {
                    None
                }
            }
            Instruction::WaitNoClear(ev) => st.events.contains(&ev).then_some(pc + 1),
            Instruction::SetEvent(ev) => {
                st.events.insert(ev);
                Some(pc + 1)
            }
            Instruction::ClearEvent(ev) => {
                st.events.remove(&ev);
                Some(pc + 1)
            }
            Instruction::Branch { addr, op, value, target } => {
                let cur = st.mem.get(&addr).copied().unwrap_or(0);
                Some(if op.eval(cur, value) { target } else { pc + 1 })
            }
            Instruction::Sleep(ticks) => {
                st.sleep_ticks += ticks as u64;
                Some(pc + 1)
            }
        }
    }

    /// Hardware side effects of a register write
    fn hw_write(&self, st: &mut SimState, addr: u64, value: u32) {
        let (m, reg) = match mutex::decode(addr, self.mutex_count) {
            Some(decoded) => decoded,
            None => return,
        };
        let binding = match st.bindings.values().find(|b| b.mutex == m) {
            Some(binding) => binding.clone(),
            None => return,
        };
        let display = binding.display;
        match reg {
            MutexReg::En if value & 1 == 1 => {
                st.stats.entry(display).or_default().triggers += 1;
                let sof = st.mem.get(&mutex::reg_addr(m, MutexReg::Sof)).copied().unwrap_or(0);
                match SyncSource::from_raw(sof) {
                    Some(SyncSource::CommandDriven) => {
                        if st.stalled.contains(&display) {
                            return;
                        }
                        st.stats.entry(display).or_default().frames += 1;
                        st.events.extend(binding.cmd_eof);
                        st.events.extend(binding.dma_eof);
                    }
                    Some(_) => {
                        st.streaming.insert(display);
                    }
                    None => log::warn!("sim: mutex {} triggered with bad SOF {}", m, sof),
                }
            }
            MutexReg::En => {
                st.streaming.remove(&display);
            }
            MutexReg::Rst if value & 1 == 1 => {
                st.streaming.remove(&display);
            }
            _ => {}
        }
    }

    fn complete_front(
        &self,
        st: &mut SimState,
        client: ClientId,
        status: TaskStatus,
        done: &mut Vec<(Callback, TaskStatus)>,
    ) {
        let job = match st.threads.get_mut(&client).and_then(|t| t.jobs.pop_front()) {
            Some(job) => job,
            None => return,
        };
        Self::retire(st, job, status, done);
    }

    fn retire(st: &mut SimState, mut job: Job, status: TaskStatus, done: &mut Vec<(Callback, TaskStatus)>) {
        if let Some(record) = st.tasks.get_mut(&job.task) {
            record.status = Some(status);
        }
        if let Some(callback) = job.callback.take() {
            done.push((callback, status));
        }
    }

    fn enqueue(&self, client: ClientId, batch: CommandBatch) -> DpcResult<TaskId> {
        let callbacks;
        let task = {
            let mut st = self.state.lock();
            if st.stopped {
                return Err(DpcError::EngineStopped);
            }
            let (instrs, looping, callback) = batch.into_parts();
            let task = Self::alloc_task(&mut st, client);
            st.threads.entry(client).or_default().jobs.push_back(Job {
                task,
                instrs,
                looping,
                pc: 0,
                callback,
            });
            callbacks = self.pump_locked(&mut st);
            task
        };
        self.finish(callbacks);
        Ok(task)
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new(6)
    }
}

impl CmdqEngine for SimEngine {
    fn submit(&self, client: ClientId, batch: CommandBatch) -> DpcResult<TaskId> {
        if batch.is_loop() {
            return Err(DpcError::InvalidArgument(format!(
                "loop batch '{}' submitted as task",
                batch.label()
            )));
        }
        self.enqueue(client, batch)
    }

    fn wait(&self, task: TaskId, timeout: Duration) -> DpcResult<()> {
        self.pump();
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            let record = st
                .tasks
                .get(&task)
                .copied()
                .ok_or_else(|| DpcError::InvalidArgument(format!("unknown task {}", task.0)))?;
            match record.status {
                Some(TaskStatus::Done) => return Ok(()),
                Some(_) => {
                    return Err(DpcError::Timeout { client: record.client.0, pc: 0 });
                }
                None => {}
            }
            if self.progress.wait_until(&mut st, deadline).timed_out() {
                let pc = st
                    .threads
                    .get(&record.client)
                    .and_then(|t| t.jobs.iter().find(|j| j.task == task))
                    .map(|j| j.pc)
                    .unwrap_or(0);
                return Err(DpcError::Timeout { client: record.client.0, pc });
            }
        }
    }

    fn is_done(&self, task: TaskId) -> bool {
        self.state
            .lock()
            .tasks
            .get(&task)
            .map(|r| r.status.is_some())
            .unwrap_or(true)
    }

    fn start_loop(&self, client: ClientId, batch: CommandBatch) -> DpcResult<LoopHandle> {
        if !batch.is_loop() {
            return Err(DpcError::InvalidArgument(format!(
                "batch '{}' not finalized as loop",
                batch.label()
            )));
        }
        if self.loop_running(client) {
            return Err(DpcError::LoopActive);
        }
        let task = self.enqueue(client, batch)?;
        Ok(LoopHandle { client, task })
    }

    fn stop_loop(&self, handle: LoopHandle) -> DpcResult<()> {
        let mut done = Vec::new();
        {
            let mut st = self.state.lock();
            let job = st.threads.get_mut(&handle.client).and_then(|t| {
                let pos = t.jobs.iter().position(|j| j.task == handle.task)?;
                t.jobs.remove(pos)
            });
            if let Some(job) = job {
                Self::retire(&mut st, job, TaskStatus::Aborted, &mut done);
            }
        }
        self.finish(done);
        Ok(())
    }

    fn abort(&self, client: ClientId) -> usize {
        let mut done = Vec::new();
        let n;
        {
            let mut st = self.state.lock();
            let jobs: Vec<Job> = st
                .threads
                .get_mut(&client)
                .map(|t| t.jobs.drain(..).collect())
                .unwrap_or_default();
            n = jobs.len();
            for job in jobs {
                Self::retire(&mut st, job, TaskStatus::Aborted, &mut done);
            }
        }
        self.finish(done);
        n
    }

    fn set_event(&self, ev: EventId) {
        self.raise(ev);
    }

    fn clear_event(&self, ev: EventId) {
        self.state.lock().events.remove(&ev);
    }

    fn event_state(&self, ev: EventId) -> bool {
        self.state.lock().events.contains(&ev)
    }

    fn read_mem(&self, addr: u64) -> u32 {
        self.state.lock().mem.get(&addr).copied().unwrap_or(0)
    }

    fn write_mem(&self, addr: u64, value: u32) {
        self.state.lock().mem.insert(addr, value);
    }

    fn snapshot(&self, client: ClientId) -> ThreadSnapshot {
        let st = self.state.lock();
        let thread = st.threads.get(&client);
        let front = thread.and_then(|t| t.jobs.front());
        ThreadSnapshot {
            client,
            pc: front.map(|j| j.pc).unwrap_or(0),
            current: front.and_then(|j| j.instrs.get(j.pc).copied()),
            pending: thread.map(|t| t.jobs.len()).unwrap_or(0),
            looping: front.map(|j| j.looping).unwrap_or(false),
        }
    }

    fn bind_timing(&self, binding: TimingBinding) {
        log::debug!("sim: timing bound for disp{} on mutex {}", binding.display, binding.mutex);
        self.state.lock().bindings.insert(binding.display, binding);
    }

    fn unbind_timing(&self, display: usize) {
        let mut st = self.state.lock();
        st.bindings.remove(&display);
        st.streaming.remove(&display);
    }
}
