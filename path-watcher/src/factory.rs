//! Public entry point for building watchers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::config::WatcherConfig;
use crate::engine::WatchEngine;
use crate::error::{Result, WatcherError};
use crate::event::EventKind;
use crate::listener::{LifecycleListener, NoopLifecycleListener, PathChangeListener};
use crate::primitive::PrimitiveProvider;
use crate::primitive::backend::NotifyProvider;
use crate::scheduler::{TaskScheduler, ThreadScheduler};
use crate::strategy::RegistrationStrategy;
use crate::task::WatcherTask;

/// Builds [`WatcherTask`]s that share a scheduler, lifecycle listener and
/// primitive provider.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use codex_path_watcher::{ChannelListener, ThreadScheduler, WatcherFactory};
/// # fn main() -> codex_path_watcher::Result<()> {
/// let factory = WatcherFactory::new(Arc::new(ThreadScheduler::default()))?;
/// let (listener, _events) = ChannelListener::new();
/// let watcher = factory.create_recursive_watcher("/tmp/project", Arc::new(listener))?;
/// watcher.start()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WatcherFactory {
    scheduler: Arc<dyn TaskScheduler>,
    lifecycle: Arc<dyn LifecycleListener>,
    provider: Arc<dyn PrimitiveProvider>,
    config: WatcherConfig,
}

impl WatcherFactory {
    /// Create a factory using the default [`WatcherConfig`] and a no-op
    /// lifecycle listener. Fails if `scheduler` is shut down.
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Result<Self> {
        if scheduler.is_shut_down() {
            return Err(WatcherError::SchedulerShutDown);
        }
        let config = WatcherConfig::default();
        Ok(Self {
            scheduler,
            lifecycle: Arc::new(NoopLifecycleListener),
            provider: Arc::new(NotifyProvider::new(config.clone())),
            config,
        })
    }

    /// Report every watcher's lifecycle to `lifecycle`.
    pub fn with_lifecycle_listener(mut self, lifecycle: Arc<dyn LifecycleListener>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Use `config` for subsequently created watchers.
    pub fn with_config(mut self, config: WatcherConfig) -> Result<Self> {
        config.validate()?;
        self.provider = Arc::new(NotifyProvider::new(config.clone()));
        self.config = config;
        Ok(self)
    }

    /// Use a custom primitive provider instead of the notify backend.
    pub fn with_provider(mut self, provider: Arc<dyn PrimitiveProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Watch `root` and every directory below it, including directories
    /// created later.
    pub fn create_recursive_watcher(
        &self,
        root: impl AsRef<Path>,
        listener: Arc<dyn PathChangeListener>,
    ) -> Result<WatcherTask> {
        self.create(root.as_ref(), true, listener)
    }

    /// Watch only the direct entries of `root`.
    pub fn create_non_recursive_watcher(
        &self,
        root: impl AsRef<Path>,
        listener: Arc<dyn PathChangeListener>,
    ) -> Result<WatcherTask> {
        self.create(root.as_ref(), false, listener)
    }

    fn create(
        &self,
        root: &Path,
        recursive: bool,
        listener: Arc<dyn PathChangeListener>,
    ) -> Result<WatcherTask> {
        if self.scheduler.is_shut_down() {
            return Err(WatcherError::SchedulerShutDown);
        }
        let strategy =
            RegistrationStrategy::select(recursive, self.provider.supports_native_recursion());
        let engine = WatchEngine::new(root, strategy, listener, Arc::clone(&self.provider))?;
        let task = WatcherTask::new(
            engine,
            Arc::clone(&self.scheduler),
            Arc::clone(&self.lifecycle),
        );
        debug!("[{}] created {strategy:?} watcher for {}", task.id(), root.display());
        Ok(task)
    }

    /// Watch a single path: its parent directory is watched non-recursively
    /// and only events for exactly `path` reach `listener`.
    pub fn create_single_path_watcher(
        &self,
        path: impl AsRef<Path>,
        listener: Arc<dyn PathChangeListener>,
    ) -> Result<WatcherTask> {
        let (parent, target) = split_target(path.as_ref())?;
        let filter = SinglePathListener {
            target,
            delegate: listener,
        };
        self.create(&parent, false, Arc::new(filter))
    }

    /// Watch a single path on a dedicated thread, without lifecycle
    /// notifications.
    pub fn single_path_watcher(
        path: impl AsRef<Path>,
        listener: Arc<dyn PathChangeListener>,
    ) -> Result<WatcherTask> {
        Self::single_path_watcher_with(
            path,
            listener,
            Arc::new(ThreadScheduler::default()),
            Arc::new(NoopLifecycleListener),
        )
    }

    /// Like [`single_path_watcher`](Self::single_path_watcher), with an
    /// explicit scheduler and lifecycle listener.
    pub fn single_path_watcher_with(
        path: impl AsRef<Path>,
        listener: Arc<dyn PathChangeListener>,
        scheduler: Arc<dyn TaskScheduler>,
        lifecycle: Arc<dyn LifecycleListener>,
    ) -> Result<WatcherTask> {
        Self::new(scheduler)?
            .with_lifecycle_listener(lifecycle)
            .create_single_path_watcher(path, listener)
    }
}

impl fmt::Debug for WatcherFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherFactory")
            .field("scheduler", &self.scheduler)
            .field("provider", &self.provider)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Parent directory to watch and the exact path events are compared with.
fn split_target(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let invalid = || WatcherError::InvalidPath(path.display().to_string());
    let name = path.file_name().ok_or_else(invalid)?;
    let parent = match path.parent().ok_or_else(invalid)? {
        p if p.as_os_str().is_empty() => Path::new("."),
        p => p,
    };
    Ok((parent.to_path_buf(), parent.join(name)))
}

/// Forwards only the events for one path.
struct SinglePathListener {
    target: PathBuf,
    delegate: Arc<dyn PathChangeListener>,
}

impl PathChangeListener for SinglePathListener {
    fn on_path_changed(&self, kind: EventKind, path: &Path) -> anyhow::Result<()> {
        if path == self.target {
            self.delegate.on_path_changed(kind, path)
        } else {
            Ok(())
        }
    }
}
