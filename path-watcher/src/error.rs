//! Error types for the path watcher.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur while creating, starting, running or stopping a watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Directory not found.
    #[error("directory not found: {0}")]
    DirectoryNotFound(String),

    /// Path exists but is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A path argument cannot be used (e.g. it has no parent directory).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Watcher already started.
    #[error("watcher already started for: {0}")]
    AlreadyStarted(String),

    /// Watcher was never started (or its run was already stopped).
    #[error("watcher not started for: {0}")]
    NotStarted(String),

    /// The task scheduler no longer accepts work.
    #[error("task scheduler has been shut down")]
    SchedulerShutDown,

    /// The task scheduler refused or failed to run a job.
    #[error("failed to schedule watcher: {0}")]
    Schedule(String),

    /// The watch primitive could not be opened or the root could not be registered.
    #[error("failed to set up watching for {root}: {source}")]
    Setup {
        root: PathBuf,
        #[source]
        source: Box<WatcherError>,
    },

    /// The watch primitive was already closed.
    #[error("watch primitive is closed")]
    PrimitiveClosed,

    /// A raw event kind that has no path-change counterpart.
    #[error("unrecognized event kind: {0}")]
    UnknownEventKind(String),

    /// A path change listener returned an error.
    #[error("listener failed for {path}: {source}")]
    Listener {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// A path change listener panicked.
    #[error("listener panicked for {path}: {message}")]
    ListenerPanicked { path: PathBuf, message: String },

    /// The watch loop panicked outside of a listener call.
    #[error("watcher panicked: {0}")]
    Panicked(String),

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// Directory walk error.
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl WatcherError {
    /// Whether this error reports a caller precondition violation.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::DirectoryNotFound(_)
                | Self::NotADirectory(_)
                | Self::PermissionDenied(_)
                | Self::InvalidPath(_)
                | Self::AlreadyStarted(_)
                | Self::NotStarted(_)
                | Self::SchedulerShutDown
        )
    }

    pub(crate) fn setup(root: impl Into<PathBuf>, source: WatcherError) -> Self {
        Self::Setup {
            root: root.into(),
            source: Box::new(source),
        }
    }
}

/// Extracts a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
