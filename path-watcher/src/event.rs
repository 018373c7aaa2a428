//! Path change events.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WatcherError;
use crate::primitive::RawEventKind;

/// Kind of change observed on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Path was created.
    Created,

    /// Path was modified.
    Modified,

    /// Path was deleted.
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Created => "created",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

impl TryFrom<RawEventKind> for EventKind {
    type Error = WatcherError;

    fn try_from(kind: RawEventKind) -> Result<Self, Self::Error> {
        match kind {
            RawEventKind::Create => Ok(Self::Created),
            RawEventKind::Modify => Ok(Self::Modified),
            RawEventKind::Delete => Ok(Self::Deleted),
            RawEventKind::Overflow => Err(WatcherError::UnknownEventKind(format!("{kind:?}"))),
        }
    }
}

/// A path change, as delivered to channel consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEvent {
    /// The kind of change.
    pub kind: EventKind,

    /// Full path of the changed entry.
    pub path: PathBuf,

    /// When the watcher dispatched the change.
    pub timestamp: DateTime<Utc>,
}

impl PathEvent {
    /// Create a new path event stamped with the current time.
    pub fn new(kind: EventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            timestamp: Utc::now(),
        }
    }
}
