//! Mapping from watch handles to the directories they were registered for.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::primitive::WatchHandle;

/// Directories registered with a watch primitive, keyed by handle.
///
/// Owned by a single event loop; not shared between threads.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    dirs: HashMap<WatchHandle, PathBuf>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `dir` under `handle`, replacing any previous directory.
    pub fn insert(&mut self, handle: WatchHandle, dir: PathBuf) {
        match self.dirs.get(&handle) {
            Some(previous) if previous != &dir => {
                trace!("Updating {handle}: {} -> {}", previous.display(), dir.display());
            }
            Some(_) => {}
            None => trace!("Registering {handle}: {}", dir.display()),
        }
        self.dirs.insert(handle, dir);
    }

    /// Directory registered for `handle`.
    pub fn resolve(&self, handle: WatchHandle) -> Option<&Path> {
        self.dirs.get(&handle).map(PathBuf::as_path)
    }

    pub fn remove(&mut self, handle: WatchHandle) -> Option<PathBuf> {
        let removed = self.dirs.remove(&handle);
        if let Some(dir) = &removed {
            trace!("Unregistering {handle}: {}", dir.display());
        }
        removed
    }

    pub fn clear(&mut self) {
        self.dirs.clear();
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Registered directories, sorted.
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.dirs.values().cloned().collect();
        dirs.sort();
        dirs
    }
}
