//! Watch primitive backed by the `notify` crate.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender, unbounded};
use notify::event::{ModifyKind, RenameMode};
use notify::{
    Config, Event, EventKind as NotifyKind, PollWatcher, RecommendedWatcher, RecursiveMode,
    Watcher,
};
use tracing::{debug, trace, warn};

use super::{
    PrimitiveCloser, PrimitiveProvider, RawBatch, RawEvent, RawEventKind, Recursion, Wait,
    WatchHandle, WatchPrimitive,
};
use crate::config::{Backend, WatcherConfig};
use crate::error::{Result, WatcherError};

/// Opens [`NotifyPrimitive`]s configured from a [`WatcherConfig`].
#[derive(Debug, Clone, Default)]
pub struct NotifyProvider {
    config: WatcherConfig,
}

impl NotifyProvider {
    /// Create a provider for the given configuration.
    pub fn new(config: WatcherConfig) -> Self {
        Self { config }
    }

    /// The configuration primitives are opened with.
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }
}

impl PrimitiveProvider for NotifyProvider {
    fn open(&self, root: &Path) -> Result<Box<dyn WatchPrimitive>> {
        debug!(
            "Opening {:?} watch primitive for {}",
            self.config.backend,
            root.display()
        );
        Ok(Box::new(NotifyPrimitive::open(&self.config)?))
    }

    fn supports_native_recursion(&self) -> bool {
        self.config.prefer_native_recursion && self.config.backend.supports_native_recursion()
    }
}

enum Signal {
    Event(notify::Result<Event>),
    Close,
}

struct Registration {
    dir: PathBuf,
    /// Canonical form of `dir` when it differs; some backends report events
    /// under the canonical path.
    alias: Option<PathBuf>,
    recursion: Recursion,
}

impl Registration {
    fn relative(&self, path: &Path) -> Option<PathBuf> {
        let rel = path
            .strip_prefix(&self.dir)
            .ok()
            .or_else(|| self.alias.as_deref().and_then(|a| path.strip_prefix(a).ok()))?;
        (!rel.as_os_str().is_empty()).then(|| rel.to_path_buf())
    }
}

/// Upper bound on remembered removed directories.
const RETIRED_CAPACITY: usize = 256;

/// A directory whose registration was dropped after it disappeared.
struct Retired {
    dir: PathBuf,
    /// Whether its removal reached a batch already.
    reported: bool,
}

/// A translated event waiting for its group to be ordered.
struct Staged {
    handle: WatchHandle,
    event: RawEvent,
    depth: usize,
}

/// A set of directory registrations on one notify watcher.
pub struct NotifyPrimitive {
    watcher: Option<Box<dyn Watcher + Send>>,
    tx: Sender<Signal>,
    rx: Receiver<Signal>,
    registrations: HashMap<WatchHandle, Registration>,
    by_dir: HashMap<PathBuf, WatchHandle>,
    /// Handles whose directory was removed but which were not re-armed yet.
    invalid: HashSet<WatchHandle>,
    /// Oldest first, at most [`RETIRED_CAPACITY`] entries.
    retired: VecDeque<Retired>,
    pending: VecDeque<RawBatch>,
    next_handle: u64,
}

impl NotifyPrimitive {
    /// Open a primitive with the configured backend.
    pub fn open(config: &WatcherConfig) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = unbounded();
        let event_tx = tx.clone();
        let handler = move |res: notify::Result<Event>| {
            let _ = event_tx.send(Signal::Event(res));
        };

        let watcher: Box<dyn Watcher + Send> = match config.backend {
            Backend::Native => Box::new(RecommendedWatcher::new(handler, Config::default())?),
            Backend::Poll => Box::new(PollWatcher::new(
                handler,
                Config::default().with_poll_interval(config.poll_interval()),
            )?),
        };

        Ok(Self {
            watcher: Some(watcher),
            tx,
            rx,
            registrations: HashMap::new(),
            by_dir: HashMap::new(),
            invalid: HashSet::new(),
            retired: VecDeque::new(),
            pending: VecDeque::new(),
            next_handle: 1,
        })
    }

    /// Number of live registrations.
    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    /// Translate a group of notify events that arrived together.
    fn ingest(&mut self, events: impl IntoIterator<Item = Event>) {
        let mut staged = Vec::new();
        let mut invalidated = Vec::new();
        for event in events {
            self.translate(event, &mut staged, &mut invalidated);
        }

        order_runs(&mut staged);
        for Staged { handle, event, .. } in staged {
            self.push(handle, event);
        }
        // Handles with a batch in this group are dropped when that batch is
        // re-armed.
        for handle in invalidated {
            if !self.pending.iter().any(|batch| batch.handle == handle) {
                self.pending.push_back(RawBatch {
                    handle,
                    events: Vec::new(),
                });
            }
        }
    }

    fn translate(
        &mut self,
        event: Event,
        staged: &mut Vec<Staged>,
        invalidated: &mut Vec<WatchHandle>,
    ) {
        if event.need_rescan() {
            let handle = event
                .paths
                .first()
                .and_then(|p| self.owner_of(p))
                .map(|(handle, _)| handle)
                .or_else(|| self.registrations.keys().min().copied());
            if let Some(handle) = handle {
                staged.push(Staged {
                    handle,
                    event: RawEvent::overflow(),
                    depth: 0,
                });
            }
            return;
        }

        for (path, kind) in classify(&event) {
            match kind {
                RawEventKind::Delete => {
                    if let Some(&handle) = self.by_dir.get(&path) {
                        if !self.invalid.insert(handle) {
                            trace!("Removal of {} already reported", path.display());
                            continue;
                        }
                        invalidated.push(handle);
                    } else if let Some(retired) =
                        self.retired.iter_mut().find(|r| r.dir == path)
                    {
                        if retired.reported {
                            trace!("Removal of {} already reported", path.display());
                            continue;
                        }
                        retired.reported = true;
                    }
                }
                RawEventKind::Create => self.retired.retain(|r| r.dir != path),
                RawEventKind::Modify | RawEventKind::Overflow => {}
            }

            match self.owner_of(&path) {
                Some((handle, name)) => staged.push(Staged {
                    handle,
                    event: RawEvent::new(kind, name),
                    depth: path.components().count(),
                }),
                None => trace!("Ignoring {kind:?} for unwatched path {}", path.display()),
            }
        }
    }

    fn owner_of(&self, path: &Path) -> Option<(WatchHandle, PathBuf)> {
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
            if let Some(&handle) = self.by_dir.get(parent) {
                return Some((handle, PathBuf::from(name)));
            }
        }

        self.registrations
            .iter()
            .filter(|(_, reg)| reg.recursion == Recursion::Subtree)
            .filter_map(|(handle, reg)| reg.relative(path).map(|rel| (*handle, rel)))
            .min_by_key(|(_, rel)| rel.components().count())
    }

    fn push(&mut self, handle: WatchHandle, event: RawEvent) {
        match self.pending.back_mut() {
            Some(batch) if batch.handle == handle => batch.events.push(event),
            _ => self.pending.push_back(RawBatch {
                handle,
                events: vec![event],
            }),
        }
    }

    fn forget(&mut self, handle: WatchHandle) {
        let reported = self.invalid.remove(&handle);
        let Some(reg) = self.registrations.remove(&handle) else {
            return;
        };
        self.by_dir.retain(|_, h| *h != handle);
        if reported || !reg.dir.is_dir() {
            if let Some(alias) = &reg.alias {
                self.retire(alias.clone(), reported);
            }
            self.retire(reg.dir.clone(), reported);
        }
        if let Some(watcher) = self.watcher.as_mut() {
            if let Err(e) = watcher.unwatch(&reg.dir) {
                trace!("Unwatch of {} failed: {e}", reg.dir.display());
            }
        }
        debug!("Dropped registration {handle} for {}", reg.dir.display());
    }

    /// Remember a vanished directory so later removal events for it are
    /// reported at most once in total.
    fn retire(&mut self, dir: PathBuf, reported: bool) {
        self.retired.retain(|r| r.dir != dir);
        if self.retired.len() == RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back(Retired { dir, reported });
    }
}

impl WatchPrimitive for NotifyPrimitive {
    fn register(&mut self, dir: &Path, recursion: Recursion) -> Result<WatchHandle> {
        let existing = self.by_dir.get(dir).copied();
        if let Some(handle) = existing {
            if self.invalid.contains(&handle) {
                self.forget(handle);
            } else if self
                .registrations
                .get(&handle)
                .is_some_and(|reg| reg.recursion == recursion)
            {
                return Ok(handle);
            }
        }

        let watcher = self.watcher.as_mut().ok_or(WatcherError::PrimitiveClosed)?;
        let mode = match recursion {
            Recursion::Directory => RecursiveMode::NonRecursive,
            Recursion::Subtree => RecursiveMode::Recursive,
        };
        watcher.watch(dir, mode)?;

        let handle = match self.by_dir.get(dir) {
            Some(&handle) => handle,
            None => {
                let handle = WatchHandle::new(self.next_handle);
                self.next_handle += 1;
                handle
            }
        };
        let alias = dir.canonicalize().ok().filter(|c| c != dir);
        self.by_dir.insert(dir.to_path_buf(), handle);
        if let Some(alias) = &alias {
            self.by_dir.insert(alias.clone(), handle);
        }
        self.retired.retain(|r| r.dir != dir);
        self.registrations.insert(
            handle,
            Registration {
                dir: dir.to_path_buf(),
                alias,
                recursion,
            },
        );
        trace!("Registered {} as {handle} ({recursion:?})", dir.display());
        Ok(handle)
    }

    fn wait(&mut self) -> Result<Wait> {
        loop {
            if self.watcher.is_none() {
                return Ok(Wait::Closed);
            }
            if let Some(batch) = self.pending.pop_front() {
                return Ok(Wait::Batch(batch));
            }
            let Ok(first) = self.rx.recv() else {
                return Ok(Wait::Closed);
            };

            // Whatever is already queued belongs to the same scan or burst.
            let mut group = Vec::new();
            for signal in std::iter::once(first).chain(self.rx.try_iter()) {
                match signal {
                    Signal::Event(Ok(event)) => {
                        trace!("Received {:?} for {:?}", event.kind, event.paths);
                        group.push(event);
                    }
                    Signal::Event(Err(e)) => warn!("Watch error: {e}"),
                    Signal::Close => return Ok(Wait::Closed),
                }
            }
            self.ingest(group);
        }
    }

    fn rearm(&mut self, handle: WatchHandle) -> bool {
        let valid = !self.invalid.contains(&handle)
            && self
                .registrations
                .get(&handle)
                .is_some_and(|reg| reg.dir.is_dir());
        if !valid {
            self.forget(handle);
        }
        valid
    }

    fn close(&mut self) -> Result<()> {
        self.pending.clear();
        self.registrations.clear();
        self.by_dir.clear();
        self.invalid.clear();
        self.retired.clear();
        if self.watcher.take().is_some() {
            debug!("Closed watch primitive");
        }
        Ok(())
    }

    fn closer(&self) -> PrimitiveCloser {
        let tx = self.tx.clone();
        PrimitiveCloser::new(move || {
            let _ = tx.send(Signal::Close);
        })
    }
}

/// Within each run of consecutive removals deeper paths go first, and within
/// each run of creations shallower paths go first. Runs never cross another
/// kind, so a path's own creation and removal keep their relative order.
fn order_runs(staged: &mut [Staged]) {
    for run in staged.chunk_by_mut(|a, b| a.event.kind == b.event.kind) {
        match run[0].event.kind {
            RawEventKind::Delete => run.sort_by_key(|s| Reverse(s.depth)),
            RawEventKind::Create => run.sort_by_key(|s| s.depth),
            RawEventKind::Modify | RawEventKind::Overflow => {}
        }
    }
}

/// Decode a notify event into per-path raw kinds.
fn classify(event: &Event) -> Vec<(PathBuf, RawEventKind)> {
    let uniform = |kind: RawEventKind| -> Vec<(PathBuf, RawEventKind)> {
        event.paths.iter().map(|p| (p.clone(), kind)).collect()
    };

    match event.kind {
        NotifyKind::Create(_) => uniform(RawEventKind::Create),
        NotifyKind::Remove(_) => uniform(RawEventKind::Delete),
        NotifyKind::Modify(ModifyKind::Name(RenameMode::From)) => uniform(RawEventKind::Delete),
        NotifyKind::Modify(ModifyKind::Name(RenameMode::To)) => uniform(RawEventKind::Create),
        // Backends that pair renames also report both halves on their own.
        NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)) => Vec::new(),
        NotifyKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                let kind = if p.exists() {
                    RawEventKind::Create
                } else {
                    RawEventKind::Delete
                };
                (p.clone(), kind)
            })
            .collect(),
        NotifyKind::Modify(_) | NotifyKind::Any => uniform(RawEventKind::Modify),
        NotifyKind::Access(_) | NotifyKind::Other => Vec::new(),
    }
}
