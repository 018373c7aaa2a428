//! Runs a [`WatchEngine`] as a cancellable background task.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::engine::{EventLoop, WatchEngine};
use crate::error::{Result, WatcherError};
use crate::listener::{LifecycleListener, WatcherId, guarded};
use crate::scheduler::{Job, ScheduledTask, TaskScheduler};
use crate::strategy::RegistrationStrategy;

const NOT_STARTED: u8 = 0;
const SCHEDULED: u8 = 1;
const FINISHED: u8 = 2;

/// Where a [`WatcherTask`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    NotStarted,
    Scheduled,
    Finished,
}

/// A watcher bound to a scheduler and a lifecycle listener.
///
/// `start` sets up watching on the caller's thread and hands the event loop
/// to the scheduler. Failures of the loop are reported to the lifecycle
/// listener and never propagate to the scheduler's thread or the caller.
/// A task runs at most once; create a new one to watch again.
pub struct WatcherTask {
    id: WatcherId,
    engine: Arc<WatchEngine>,
    scheduler: Arc<dyn TaskScheduler>,
    lifecycle: Arc<dyn LifecycleListener>,
    scheduled: Arc<Mutex<Slot>>,
    state: Arc<AtomicU8>,
}

/// The handle of the scheduled run. A run that fails may finish before
/// `start` gets to store its handle, so it leaves `failed` behind.
#[derive(Default)]
struct Slot {
    task: Option<ScheduledTask>,
    failed: bool,
}

impl WatcherTask {
    pub fn new(
        engine: WatchEngine,
        scheduler: Arc<dyn TaskScheduler>,
        lifecycle: Arc<dyn LifecycleListener>,
    ) -> Self {
        Self {
            id: WatcherId::next(),
            engine: Arc::new(engine),
            scheduler,
            lifecycle,
            scheduled: Arc::default(),
            state: Arc::new(AtomicU8::new(NOT_STARTED)),
        }
    }

    pub fn id(&self) -> WatcherId {
        self.id
    }

    pub fn root(&self) -> &Path {
        self.engine.root()
    }

    pub fn strategy(&self) -> RegistrationStrategy {
        self.engine.strategy()
    }

    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::SeqCst) {
            NOT_STARTED => TaskState::NotStarted,
            SCHEDULED => TaskState::Scheduled,
            _ => TaskState::Finished,
        }
    }

    /// Whether the underlying engine is watching.
    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Register the root and schedule the event loop.
    ///
    /// Setup errors are returned here. Once this returns `Ok` the watcher is
    /// running, though the loop may not have picked up its first batch yet.
    pub fn start(&self) -> Result<&Self> {
        if self
            .state
            .compare_exchange(NOT_STARTED, SCHEDULED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(WatcherError::AlreadyStarted(self.describe()));
        }

        let event_loop = match self.engine.prepare() {
            Ok(event_loop) => event_loop,
            Err(e) => {
                self.state.store(NOT_STARTED, Ordering::SeqCst);
                return Err(e);
            }
        };

        match self.scheduler.submit(self.body(event_loop)) {
            Ok(task) => {
                let mut slot = self.scheduled.lock();
                if !slot.failed {
                    slot.task = Some(task);
                }
                debug!("[{}] scheduled watcher for {}", self.id, self.describe());
                Ok(self)
            }
            Err(e) => {
                if let Err(stop_error) = self.engine.stop() {
                    debug!("[{}] engine stop after failed submit: {stop_error}", self.id);
                }
                self.state.store(FINISHED, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Request the background run to stop. Returns once the request is
    /// issued; `on_stop` reports when the loop has actually exited.
    pub fn stop(&self) -> Result<()> {
        let Some(task) = self.scheduled.lock().task.take() else {
            return Err(WatcherError::NotStarted(self.describe()));
        };
        task.cancel();
        if let Err(e) = self.engine.stop() {
            debug!("[{}] engine stop: {e}", self.id);
        }
        Ok(())
    }

    fn body(&self, event_loop: EventLoop) -> Job {
        let id = self.id;
        let engine = Arc::clone(&self.engine);
        let lifecycle = Arc::clone(&self.lifecycle);
        let scheduled = Arc::clone(&self.scheduled);
        let state = Arc::clone(&self.state);

        Box::new(move |token: CancellationToken| {
            guarded(id, "on_start", || lifecycle.on_start(id));

            if let Err(e) = engine.run(event_loop, &token) {
                error!("[{id}] watcher for {} failed: {e}", engine.root().display());
                guarded(id, "on_exception", || lifecycle.on_exception(id, &e));
                {
                    let mut slot = scheduled.lock();
                    slot.task = None;
                    slot.failed = true;
                }
                if let Err(stop_error) = engine.stop() {
                    warn!("[{id}] failed to stop watcher: {stop_error}");
                }
            }

            guarded(id, "on_stop", || lifecycle.on_stop(id));
            state.store(FINISHED, Ordering::SeqCst);
        })
    }

    fn describe(&self) -> String {
        self.engine.root().display().to_string()
    }
}

impl fmt::Debug for WatcherTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherTask")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
