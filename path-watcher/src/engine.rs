//! The blocking event loop for one watch root.

use std::fs;
use std::io::ErrorKind;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, WatcherError, panic_message};
use crate::event::EventKind;
use crate::listener::PathChangeListener;
use crate::primitive::{PrimitiveCloser, PrimitiveProvider, RawEvent, Wait, WatchPrimitive};
use crate::registry::WatchRegistry;
use crate::strategy::RegistrationStrategy;

const IDLE: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const STOPPED: u8 = 3;

/// Observable state of a [`WatchEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    /// Terminal; an engine is never restarted.
    Stopped,
}

/// Primitive and registry of a started engine, owned by the thread running
/// its loop.
pub(crate) struct EventLoop {
    primitive: Box<dyn WatchPrimitive>,
    registry: WatchRegistry,
}

/// Watches one root directory and reports its changes to a listener.
///
/// [`start`](Self::start) blocks the calling thread for as long as the
/// engine watches; [`stop`](Self::stop) and [`is_running`](Self::is_running)
/// may be called from any thread.
pub struct WatchEngine {
    root: PathBuf,
    strategy: RegistrationStrategy,
    listener: Arc<dyn PathChangeListener>,
    provider: Arc<dyn PrimitiveProvider>,
    state: AtomicU8,
    closer: Mutex<Option<PrimitiveCloser>>,
}

impl WatchEngine {
    /// Create an idle engine. `root` must be an existing, readable directory.
    pub fn new(
        root: impl Into<PathBuf>,
        strategy: RegistrationStrategy,
        listener: Arc<dyn PathChangeListener>,
        provider: Arc<dyn PrimitiveProvider>,
    ) -> Result<Self> {
        let root = root.into();
        validate_root(&root)?;

        Ok(Self {
            root,
            strategy,
            listener,
            provider,
            state: AtomicU8::new(IDLE),
            closer: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn strategy(&self) -> RegistrationStrategy {
        self.strategy
    }

    pub fn state(&self) -> EngineState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => EngineState::Running,
            STOPPED => EngineState::Stopped,
            _ => EngineState::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Set up watching and run the event loop on the calling thread until
    /// the engine is stopped or nothing is left to watch.
    pub fn start(&self) -> Result<()> {
        let event_loop = self.prepare()?;
        self.run(event_loop, &CancellationToken::new())
    }

    /// Open the primitive and register the root. On failure the engine
    /// stays idle.
    pub(crate) fn prepare(&self) -> Result<EventLoop> {
        if self
            .state
            .compare_exchange(IDLE, STARTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(WatcherError::AlreadyStarted(self.root.display().to_string()));
        }

        let event_loop = match self.open() {
            Ok(event_loop) => event_loop,
            Err(e) => {
                let _ = self.state.compare_exchange(
                    STARTING,
                    IDLE,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                return Err(WatcherError::setup(&self.root, e));
            }
        };

        *self.closer.lock() = Some(event_loop.primitive.closer());
        if self
            .state
            .compare_exchange(STARTING, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Stop requested while starting {}", self.root.display());
        }
        Ok(event_loop)
    }

    fn open(&self) -> Result<EventLoop> {
        let mut primitive = self.provider.open(&self.root)?;
        let mut registry = WatchRegistry::new();
        self.strategy
            .register_root(primitive.as_mut(), &mut registry, &self.root)?;
        Ok(EventLoop {
            primitive,
            registry,
        })
    }

    /// Run the loop of a prepared engine. Cleanup happens exactly once,
    /// whichever way the loop ends.
    pub(crate) fn run(&self, mut event_loop: EventLoop, cancel: &CancellationToken) -> Result<()> {
        info!(
            "Started watching: {} ({:?}, {} directories)",
            self.root.display(),
            self.strategy,
            event_loop.registry.len()
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.process(&mut event_loop, cancel)
        }));
        self.finish(event_loop);

        match outcome {
            Ok(result) => result,
            Err(payload) => Err(WatcherError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    fn process(&self, event_loop: &mut EventLoop, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() || !self.is_running() {
                debug!("Watch loop for {} cancelled", self.root.display());
                return Ok(());
            }

            let batch = match event_loop.primitive.wait()? {
                Wait::Batch(batch) => batch,
                Wait::Closed => {
                    debug!("Watch primitive for {} closed", self.root.display());
                    return Ok(());
                }
            };

            let Some(dir) = event_loop
                .registry
                .resolve(batch.handle)
                .map(Path::to_path_buf)
            else {
                warn!("Ignoring events for unknown watch handle {}", batch.handle);
                continue;
            };

            self.dispatch(event_loop, &dir, &batch.events)?;

            if !event_loop.primitive.rearm(batch.handle) {
                event_loop.registry.remove(batch.handle);
                debug!("{} is no longer watchable", dir.display());
                if event_loop.registry.is_empty() {
                    info!("Nothing left to watch under {}", self.root.display());
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&self, event_loop: &mut EventLoop, dir: &Path, events: &[RawEvent]) -> Result<()> {
        for event in events {
            if event.is_overflow() {
                debug!("Changes under {} overflowed; some were dropped", dir.display());
                continue;
            }

            let path = dir.join(&event.name);
            let kind = EventKind::try_from(event.kind)?;
            trace!("{kind}: {}", path.display());
            self.notify(kind, &path)?;

            if kind == EventKind::Created {
                if let Err(e) = self.strategy.register_child(
                    event_loop.primitive.as_mut(),
                    &mut event_loop.registry,
                    &path,
                ) {
                    warn!("Could not register watch for {}: {e}", path.display());
                }
            }
        }
        Ok(())
    }

    fn notify(&self, kind: EventKind, path: &Path) -> Result<()> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.listener.on_path_changed(kind, path))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(WatcherError::Listener {
                path: path.to_path_buf(),
                source,
            }),
            Err(payload) => Err(WatcherError::ListenerPanicked {
                path: path.to_path_buf(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    fn finish(&self, mut event_loop: EventLoop) {
        if let Err(e) = event_loop.primitive.close() {
            warn!(
                "Failed to close watch primitive for {}: {e}",
                self.root.display()
            );
        }
        event_loop.registry.clear();
        self.state.store(STOPPED, Ordering::SeqCst);
        self.closer.lock().take();
        info!("Stopped watching: {}", self.root.display());
    }

    /// Stop a started engine, unblocking its loop. Stopping an engine that
    /// already stopped does nothing.
    pub fn stop(&self) -> Result<()> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            match current {
                IDLE => return Err(WatcherError::NotStarted(self.root.display().to_string())),
                STOPPED => return Ok(()),
                _ => match self.state.compare_exchange(
                    current,
                    STOPPED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                },
            }
        }

        if let Some(closer) = self.closer.lock().take() {
            closer.close();
        }
        debug!("Stop requested for {}", self.root.display());
        Ok(())
    }
}

impl std::fmt::Debug for WatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchEngine")
            .field("root", &self.root)
            .field("strategy", &self.strategy)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn validate_root(root: &Path) -> Result<()> {
    let describe = || root.display().to_string();
    let metadata = fs::metadata(root).map_err(|e| match e.kind() {
        ErrorKind::NotFound => WatcherError::DirectoryNotFound(describe()),
        ErrorKind::PermissionDenied => WatcherError::PermissionDenied(describe()),
        _ => WatcherError::Io(e),
    })?;
    if !metadata.is_dir() {
        return Err(WatcherError::NotADirectory(describe()));
    }
    fs::read_dir(root).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => WatcherError::PermissionDenied(describe()),
        _ => WatcherError::Io(e),
    })?;
    Ok(())
}
