//! Task schedulers that host watcher event loops.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, WatcherError};

/// A unit of background work. The token is cancelled when the submitter
/// asks the work to stop.
pub type Job = Box<dyn FnOnce(CancellationToken) + Send + 'static>;

/// Runs jobs on background workers.
///
/// Every submitted job occupies one worker for as long as it runs, so a
/// scheduler needs one free worker per running watcher. `submit` may also
/// run the job to completion before it returns.
pub trait TaskScheduler: Send + Sync + fmt::Debug {
    fn submit(&self, job: Job) -> Result<ScheduledTask>;

    fn is_shut_down(&self) -> bool;
}

/// Handle to a submitted job.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    token: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl ScheduledTask {
    /// Bind `job` to a fresh handle. The returned closure runs the job and
    /// marks the handle finished, even if the job panics.
    pub fn prepare(job: Job) -> (Self, impl FnOnce() + Send + 'static) {
        let token = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let task = Self {
            token: token.clone(),
            finished: Arc::clone(&finished),
        };
        let run = move || {
            let _finished = FinishGuard(finished);
            job(token);
        };
        (task, run)
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the job has returned.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

struct FinishGuard(Arc<AtomicBool>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Runs each job on its own named OS thread.
#[derive(Debug)]
pub struct ThreadScheduler {
    name_prefix: String,
    spawned: AtomicUsize,
    shut_down: AtomicBool,
}

impl ThreadScheduler {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            spawned: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Refuse further jobs. Running jobs are not affected.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new("path-watcher")
    }
}

impl TaskScheduler for ThreadScheduler {
    fn submit(&self, job: Job) -> Result<ScheduledTask> {
        if self.is_shut_down() {
            return Err(WatcherError::SchedulerShutDown);
        }
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{n}", self.name_prefix);
        let (task, run) = ScheduledTask::prepare(job);
        thread::Builder::new()
            .name(name.clone())
            .spawn(run)
            .map_err(|e| WatcherError::Schedule(e.to_string()))?;
        debug!("Spawned watcher thread {name}");
        Ok(task)
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// Runs jobs on a tokio runtime's blocking pool.
#[derive(Debug)]
pub struct TokioScheduler {
    handle: Handle,
    shut_down: AtomicBool,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Scheduler on the runtime the caller is running in.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| WatcherError::Schedule(e.to_string()))?;
        Ok(Self::new(handle))
    }

    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

impl TaskScheduler for TokioScheduler {
    fn submit(&self, job: Job) -> Result<ScheduledTask> {
        if self.is_shut_down() {
            return Err(WatcherError::SchedulerShutDown);
        }
        let (task, run) = ScheduledTask::prepare(job);
        drop(self.handle.spawn_blocking(run));
        Ok(task)
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}
