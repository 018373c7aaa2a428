//! Boundary to the OS-level change notification primitive.
//!
//! A primitive hands out one [`WatchHandle`] per registered directory and
//! reports raw events in batches, each batch belonging to one handle. Entry
//! names in a batch are relative to the directory the handle was registered
//! for. [`backend`] provides the implementation backed by the `notify`
//! crate; engines accept any [`PrimitiveProvider`].

pub mod backend;

#[cfg(test)]
pub(crate) mod scripted;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;

/// Opaque token identifying one registered directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(u64);

impl WatchHandle {
    /// Wrap a primitive-specific identifier.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The primitive-specific identifier.
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How far a registration reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recursion {
    /// Only entries directly inside the directory.
    Directory,
    /// Entries anywhere below the directory.
    Subtree,
}

/// Kind of a raw notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Create,
    Modify,
    Delete,
    /// Too many changes happened to report them individually.
    Overflow,
}

/// One raw notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    /// Changed entry, relative to the registered directory. Empty for
    /// [`RawEventKind::Overflow`].
    pub name: PathBuf,
}

impl RawEvent {
    pub fn new(kind: RawEventKind, name: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn overflow() -> Self {
        Self::new(RawEventKind::Overflow, PathBuf::new())
    }

    pub fn is_overflow(&self) -> bool {
        self.kind == RawEventKind::Overflow
    }
}

/// Raw notifications for a single handle.
///
/// An empty batch is legal; primitives use it to make the consumer re-arm a
/// handle that became invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBatch {
    pub handle: WatchHandle,
    pub events: Vec<RawEvent>,
}

/// Outcome of waiting on a primitive.
#[derive(Debug)]
pub enum Wait {
    /// The next batch of events.
    Batch(RawBatch),
    /// The primitive was closed; no further batches will arrive.
    Closed,
}

/// Closes a primitive from any thread, unblocking a pending [`WatchPrimitive::wait`].
#[derive(Clone)]
pub struct PrimitiveCloser(Arc<dyn Fn() + Send + Sync>);

impl PrimitiveCloser {
    pub fn new(close: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(close))
    }

    pub fn close(&self) {
        (self.0)();
    }
}

impl fmt::Debug for PrimitiveCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimitiveCloser").finish_non_exhaustive()
    }
}

/// An open set of directory registrations.
///
/// Used by exactly one thread at a time; only [`PrimitiveCloser`] crosses
/// threads.
pub trait WatchPrimitive: Send {
    /// Register `dir`, returning its handle. Registering a directory again
    /// returns the handle it already has.
    fn register(&mut self, dir: &Path, recursion: Recursion) -> Result<WatchHandle>;

    /// Block until the next batch is available or the primitive is closed.
    fn wait(&mut self) -> Result<Wait>;

    /// Re-arm `handle` after its batch was consumed. Returns `false` once the
    /// handle is permanently invalid; the primitive forgets it at that point.
    fn rearm(&mut self, handle: WatchHandle) -> bool;

    /// Release every registration. Subsequent waits return [`Wait::Closed`].
    fn close(&mut self) -> Result<()>;

    /// A thread-safe handle that closes this primitive.
    fn closer(&self) -> PrimitiveCloser;
}

/// Opens primitives for watch roots.
pub trait PrimitiveProvider: Send + Sync + fmt::Debug {
    /// Open a fresh primitive suitable for the file system `root` lives on.
    fn open(&self, root: &Path) -> Result<Box<dyn WatchPrimitive>>;

    /// Whether [`Recursion::Subtree`] registrations are honored natively.
    fn supports_native_recursion(&self) -> bool;
}
