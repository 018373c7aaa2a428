//! Listener traits for path changes and watcher lifecycle transitions.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{WatcherError, panic_message};
use crate::event::{EventKind, PathEvent};

/// Receives path change callbacks from a watcher's background thread.
///
/// Implement either [`on_path_changed`](Self::on_path_changed) or any of the
/// split `on_path_*` callbacks; the default `on_path_changed` dispatches to
/// the split ones, which do nothing unless overridden.
///
/// Callbacks must return promptly. Returning an error (or panicking) ends the
/// watcher that made the call; the failure is reported to its lifecycle
/// listener.
pub trait PathChangeListener: Send + Sync {
    /// Called for every change on a watched path.
    fn on_path_changed(&self, kind: EventKind, path: &Path) -> anyhow::Result<()> {
        match kind {
            EventKind::Created => self.on_path_created(path),
            EventKind::Modified => self.on_path_modified(path),
            EventKind::Deleted => self.on_path_deleted(path),
        }
    }

    /// Called when a path was created.
    fn on_path_created(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when a path was modified.
    fn on_path_modified(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when a path was deleted.
    fn on_path_deleted(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<F> PathChangeListener for F
where
    F: Fn(EventKind, &Path) -> anyhow::Result<()> + Send + Sync,
{
    fn on_path_changed(&self, kind: EventKind, path: &Path) -> anyhow::Result<()> {
        self(kind, path)
    }
}

/// Forwards every change into an unbounded channel as a [`PathEvent`].
///
/// Once the receiver is dropped the listener fails, which stops the watcher.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<PathEvent>,
}

impl ChannelListener {
    /// Create a listener together with the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PathEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PathChangeListener for ChannelListener {
    fn on_path_changed(&self, kind: EventKind, path: &Path) -> anyhow::Result<()> {
        self.tx
            .send(PathEvent::new(kind, path))
            .map_err(|_| anyhow!("path event receiver was dropped"))
    }
}

/// Process-unique identifier of a watcher, passed to lifecycle callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(u64);

impl WatcherId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of the identifier.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watcher-{}", self.0)
    }
}

/// Observes start, failure and stop of watchers.
///
/// Called from the watcher's background thread; implementations must not
/// block. Errors and panics raised here are logged and otherwise ignored.
pub trait LifecycleListener: Send + Sync {
    /// The watcher is about to process events.
    fn on_start(&self, _watcher: WatcherId) -> anyhow::Result<()> {
        Ok(())
    }

    /// The watcher failed and is being stopped.
    fn on_exception(&self, _watcher: WatcherId, _error: &WatcherError) -> anyhow::Result<()> {
        Ok(())
    }

    /// The watcher has left its event loop.
    fn on_stop(&self, _watcher: WatcherId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Lifecycle listener that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifecycleListener;

impl LifecycleListener for NoopLifecycleListener {}

/// Runs a lifecycle callback, logging instead of propagating its failure.
pub(crate) fn guarded<F>(watcher: WatcherId, callback: &str, f: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("[{watcher}] lifecycle listener {callback} failed: {e:#}"),
        Err(payload) => warn!(
            "[{watcher}] lifecycle listener {callback} panicked: {}",
            panic_message(payload.as_ref())
        ),
    }
}
