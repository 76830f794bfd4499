//! Per-display worker threads
//!
//! Some hardware waits are too long to perform under the display lock.
//! Each display runs one thread per concern, so a slow mode switch never
//! delays fence release:
//!
//! ```text
//!   commit / callbacks ──► trigger-delay   CPU trigger when no trigger loop
//!                     ──► kick            idle kick, blocking vblank enable
//!                     ──► mode-switch     asynchronous mode requests
//!                     ──► fence-release   layer and present fences
//! ```
//!
//! Queues are unbounded crossbeam channels. A worker exits on `Shutdown`
//! or when every sender is gone, and is joined on drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::commit::FramePayload;
use crate::error::{DpcError, DpcResult};

/// CPU trigger for a frame the trigger loop cannot pick up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerRequest {
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickRequest {
    /// Leave idle before new work reaches the hardware
    Idle,
    Vblank(bool),
}

/// Asynchronous mode request (raw mode value)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRequest(pub u32);

/// Worker queue message
pub enum Msg<T> {
    Job(T),
    /// Reply once everything queued before has been handled
    Flush(Sender<()>),
    Shutdown,
}

/// Cloneable producer side of a worker queue
pub struct WorkSender<T> {
    name: &'static str,
    tx: Sender<Msg<T>>,
}

impl<T> Clone for WorkSender<T> {
    fn clone(&self) -> Self {
        Self { name: self.name, tx: self.tx.clone() }
    }
}

impl<T> WorkSender<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn send(&self, item: T) -> DpcResult<()> {
        self.tx.send(Msg::Job(item)).map_err(|_| DpcError::WorkerStopped(self.name))
    }

    /// Block until the worker has handled everything queued so far
    pub fn flush(&self) -> DpcResult<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Msg::Flush(reply_tx))
            .map_err(|_| DpcError::WorkerStopped(self.name))?;
        reply_rx.recv().map_err(|_| DpcError::WorkerStopped(self.name))
    }
}

/// Create a worker queue
pub fn queue<T>(name: &'static str) -> (WorkSender<T>, Receiver<Msg<T>>) {
    let (tx, rx) = unbounded();
    (WorkSender { name, tx }, rx)
}

// =============================================================================
// Worker
// =============================================================================

/// One dedicated thread draining one queue
pub struct Worker<T: Send + 'static> {
    sender: WorkSender<T>,
    handle: Option<JoinHandle<()>>,
    handled: Arc<AtomicU64>,
}

impl<T: Send + 'static> Worker<T> {
    /// Start a thread named `disp<N>-<queue>` running `handler` per job
    pub fn spawn<F>(
        display: usize,
        sender: WorkSender<T>,
        rx: Receiver<Msg<T>>,
        mut handler: F,
    ) -> DpcResult<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        let handled = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&handled);
        let name = sender.name;
        let handle = thread::Builder::new()
            .name(format!("disp{}-{}", display, name))
            .spawn(move || {
                log::trace!("[disp{}] {} worker up", display, name);
                for msg in rx.iter() {
                    match msg {
                        Msg::Job(item) => {
                            handler(item);
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                        Msg::Flush(reply) => {
                            let _ = reply.send(());
                        }
                        Msg::Shutdown => break,
                    }
                }
                log::trace!("[disp{}] {} worker down", display, name);
            })?;
        Ok(Self { sender, handle: Some(handle), handled })
    }

    pub fn sender(&self) -> WorkSender<T> {
        self.sender.clone()
    }

    /// Jobs handled so far
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> DpcResult<()> {
        self.sender.flush()
    }

    /// Stop the thread after the queued jobs and join it
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.tx.send(Msg::Shutdown);
            if handle.join().is_err() {
                log::error!("{} worker panicked", self.sender.name);
            }
        }
    }
}

impl<T: Send + 'static> Drop for Worker<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Pool
// =============================================================================

/// The fixed worker set of one display
pub struct WorkerPool {
    pub trigger: Worker<TriggerRequest>,
    pub kick: Worker<KickRequest>,
    pub mode: Worker<ModeRequest>,
    pub fence: Worker<FramePayload>,
}

impl WorkerPool {
    /// Drain every queue
    pub fn flush(&self) -> DpcResult<()> {
        self.trigger.flush()?;
        self.kick.flush()?;
        self.mode.flush()?;
        // Mode switches and CPU triggers may queue fence releases
        self.fence.flush()
    }

    pub fn shutdown(&mut self) {
        self.mode.shutdown();
        self.trigger.shutdown();
        self.kick.shutdown();
        self.fence.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_worker_handles_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (tx, rx) = queue::<u32>("test");
        let worker = Worker::spawn(0, tx.clone(), rx, move |n| sink.lock().push(n)).unwrap();
        for n in 0..5 {
            tx.send(n).unwrap();
        }
        worker.flush().unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(worker.handled(), 5);
    }

    #[test]
    fn test_send_after_shutdown_fails() {
        let (tx, rx) = queue::<u32>("gone");
        let mut worker = Worker::spawn(0, tx.clone(), rx, |_| {}).unwrap();
        worker.shutdown();
        assert!(matches!(tx.send(1), Err(DpcError::WorkerStopped("gone"))));
        assert!(tx.flush().is_err());
        // Second shutdown is a no-op
        worker.shutdown();
    }

    #[test]
    fn test_queued_jobs_run_before_shutdown() {
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let (tx, rx) = queue::<()>("drain");
        let worker = Worker::spawn(1, tx.clone(), rx, move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        for _ in 0..10 {
            tx.send(()).unwrap();
        }
        drop(worker);
        assert_eq!(count.load(Ordering::Relaxed), 10);
    }
}
