//! Work dispatch abstraction.
//!
//! The orchestrator submits each unit's stage chain as one opaque job and
//! gets back a handle it can wait on. Production runs hand jobs to a tokio
//! blocking thread; tests use the synchronous in-process dispatcher for
//! deterministic ordering.

use std::sync::mpsc;

/// A unit of work: the full stage chain for one processing unit.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion handle for a submitted job.
pub struct JobHandle {
    done: mpsc::Receiver<()>,
}

impl JobHandle {
    /// Block until the job has run to completion. Returns immediately for
    /// jobs that already finished.
    pub fn wait(self) {
        // A dropped sender means the job ran (or panicked); either way the
        // chain is finished.
        let _ = self.done.recv();
    }
}

/// Submits jobs for execution and returns a completion handle.
pub trait Dispatcher: Send + Sync {
    fn submit(&self, job: Job) -> JobHandle;
}

/// Runs the job on the calling thread before returning.
#[derive(Default)]
pub struct InProcessDispatcher;

impl InProcessDispatcher {
    pub fn new() -> Self {
        Self
    }
}

impl Dispatcher for InProcessDispatcher {
    fn submit(&self, job: Job) -> JobHandle {
        let (tx, rx) = mpsc::channel();
        job();
        drop(tx);
        JobHandle { done: rx }
    }
}

/// Dispatches jobs onto the tokio blocking pool. Stage chains are CPU-bound,
/// so they must not run on the async worker threads.
pub struct TokioDispatcher {
    handle: tokio::runtime::Handle,
}

impl TokioDispatcher {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl Dispatcher for TokioDispatcher {
    fn submit(&self, job: Job) -> JobHandle {
        let (tx, rx) = mpsc::channel();
        self.handle.spawn_blocking(move || {
            job();
            drop(tx);
        });
        JobHandle { done: rx }
    }
}
