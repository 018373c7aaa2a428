//! In-memory primitive driven by tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use super::{
    PrimitiveCloser, PrimitiveProvider, RawBatch, RawEvent, Recursion, Wait, WatchHandle,
    WatchPrimitive,
};
use crate::error::{Result, WatcherError};

#[derive(Default)]
struct Shared {
    registered: Vec<(PathBuf, Recursion)>,
    handles: HashMap<PathBuf, WatchHandle>,
    failing: HashSet<PathBuf>,
    invalid: HashSet<WatchHandle>,
    closed: bool,
    fail_open: bool,
}

/// Test handle for feeding and inspecting a [`ScriptedProvider`].
#[derive(Clone)]
pub(crate) struct Script {
    shared: Arc<Mutex<Shared>>,
    tx: Sender<Option<RawBatch>>,
    rx: Receiver<Option<RawBatch>>,
}

impl Script {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            shared: Arc::default(),
            tx,
            rx,
        }
    }

    pub(crate) fn provider(&self, native_recursion: bool) -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider {
            script: self.clone(),
            native_recursion,
        })
    }

    /// Queue a batch for the registration of `dir`.
    pub(crate) fn emit(&self, dir: &Path, events: Vec<RawEvent>) {
        let handle = self.handle_of(dir).unwrap_or(WatchHandle::new(u64::MAX));
        let _ = self.tx.send(Some(RawBatch { handle, events }));
    }

    /// Queue a batch for an arbitrary handle.
    pub(crate) fn emit_for(&self, handle: WatchHandle, events: Vec<RawEvent>) {
        let _ = self.tx.send(Some(RawBatch { handle, events }));
    }

    /// Make the next wait report the primitive as closed.
    pub(crate) fn close(&self) {
        let _ = self.tx.send(None);
    }

    pub(crate) fn fail_registration(&self, dir: &Path) {
        self.shared.lock().failing.insert(dir.to_path_buf());
    }

    pub(crate) fn fail_open(&self) {
        self.shared.lock().fail_open = true;
    }

    /// Make `rearm` report the registration of `dir` as invalid.
    pub(crate) fn invalidate(&self, dir: &Path) {
        if let Some(handle) = self.handle_of(dir) {
            self.shared.lock().invalid.insert(handle);
        }
    }

    pub(crate) fn handle_of(&self, dir: &Path) -> Option<WatchHandle> {
        self.shared.lock().handles.get(dir).copied()
    }

    pub(crate) fn registered(&self) -> Vec<(PathBuf, Recursion)> {
        self.shared.lock().registered.clone()
    }

    pub(crate) fn registered_dirs(&self) -> Vec<PathBuf> {
        self.registered().into_iter().map(|(dir, _)| dir).collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

#[derive(Clone)]
pub(crate) struct ScriptedProvider {
    script: Script,
    native_recursion: bool,
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProvider")
            .field("native_recursion", &self.native_recursion)
            .finish()
    }
}

impl PrimitiveProvider for ScriptedProvider {
    fn open(&self, _root: &Path) -> Result<Box<dyn WatchPrimitive>> {
        let mut shared = self.script.shared.lock();
        if shared.fail_open {
            return Err(WatcherError::Io(std::io::Error::other("scripted open failure")));
        }
        shared.closed = false;
        Ok(Box::new(ScriptedPrimitive {
            script: self.script.clone(),
            next_handle: 1,
        }))
    }

    fn supports_native_recursion(&self) -> bool {
        self.native_recursion
    }
}

struct ScriptedPrimitive {
    script: Script,
    next_handle: u64,
}

impl WatchPrimitive for ScriptedPrimitive {
    fn register(&mut self, dir: &Path, recursion: Recursion) -> Result<WatchHandle> {
        let mut shared = self.script.shared.lock();
        if shared.failing.contains(dir) {
            return Err(WatcherError::PermissionDenied(dir.display().to_string()));
        }
        if let Some(&handle) = shared.handles.get(dir) {
            return Ok(handle);
        }
        let handle = WatchHandle::new(self.next_handle);
        self.next_handle += 1;
        shared.handles.insert(dir.to_path_buf(), handle);
        shared.registered.push((dir.to_path_buf(), recursion));
        Ok(handle)
    }

    fn wait(&mut self) -> Result<Wait> {
        if self.script.shared.lock().closed {
            return Ok(Wait::Closed);
        }
        match self.script.rx.recv() {
            Ok(Some(batch)) => Ok(Wait::Batch(batch)),
            Ok(None) | Err(_) => Ok(Wait::Closed),
        }
    }

    fn rearm(&mut self, handle: WatchHandle) -> bool {
        let mut shared = self.script.shared.lock();
        if shared.invalid.contains(&handle) {
            shared.handles.retain(|_, h| *h != handle);
            return false;
        }
        shared.handles.values().any(|h| *h == handle)
    }

    fn close(&mut self) -> Result<()> {
        let mut shared = self.script.shared.lock();
        shared.closed = true;
        shared.handles.clear();
        Ok(())
    }

    fn closer(&self) -> PrimitiveCloser {
        let tx = self.script.tx.clone();
        PrimitiveCloser::new(move || {
            let _ = tx.send(None);
        })
    }
}
