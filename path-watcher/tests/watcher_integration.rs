//! End-to-end tests against the real file system.
//!
//! Most of these use the poll backend so they behave the same on every
//! platform; one scenario runs on the platform's native backend.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use codex_path_watcher::{
    Backend, ChannelListener, EventKind, LifecycleListener, NoopLifecycleListener, PathEvent,
    RegistrationStrategy, TaskScheduler, ThreadScheduler, TokioScheduler, WatcherConfig,
    WatcherError, WatcherFactory, WatcherId,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, timeout};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TIMEOUT: Duration = Duration::from_secs(10);
/// Long enough for several scans to happen.
const SETTLE: Duration = Duration::from_millis(400);

#[derive(Debug, PartialEq, Eq)]
enum Transition {
    Start,
    Exception { rogue: bool },
    Stop,
}

#[derive(Debug, thiserror::Error)]
#[error("rogue listener refused {0}")]
struct RogueError(PathBuf);

struct Recorder {
    tx: UnboundedSender<Transition>,
}

impl LifecycleListener for Recorder {
    fn on_start(&self, _watcher: WatcherId) -> anyhow::Result<()> {
        self.tx.send(Transition::Start)?;
        Ok(())
    }

    fn on_exception(&self, _watcher: WatcherId, error: &WatcherError) -> anyhow::Result<()> {
        let rogue = match error {
            WatcherError::Listener { source, .. } => source.downcast_ref::<RogueError>().is_some(),
            _ => false,
        };
        self.tx.send(Transition::Exception { rogue })?;
        Ok(())
    }

    fn on_stop(&self, _watcher: WatcherId) -> anyhow::Result<()> {
        self.tx.send(Transition::Stop)?;
        Ok(())
    }
}

fn recorder() -> (Arc<dyn LifecycleListener>, UnboundedReceiver<Transition>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { tx }), rx)
}

fn poll_config() -> WatcherConfig {
    WatcherConfig::new()
        .with_backend(Backend::Poll)
        .with_poll_interval(POLL_INTERVAL)
}

fn factory(config: WatcherConfig, lifecycle: Arc<dyn LifecycleListener>) -> WatcherFactory {
    factory_on(Arc::new(ThreadScheduler::new("it-watcher")), config, lifecycle)
}

fn factory_on(
    scheduler: Arc<dyn TaskScheduler>,
    config: WatcherConfig,
    lifecycle: Arc<dyn LifecycleListener>,
) -> WatcherFactory {
    WatcherFactory::new(scheduler)
        .unwrap()
        .with_config(config)
        .unwrap()
        .with_lifecycle_listener(lifecycle)
}

/// Receive events until every expected one has been seen. Returns all
/// events received on the way.
async fn wait_for_all(
    rx: &mut UnboundedReceiver<PathEvent>,
    expected: &[(EventKind, PathBuf)],
) -> Vec<PathEvent> {
    let deadline = Instant::now() + TIMEOUT;
    let mut seen: Vec<PathEvent> = Vec::new();
    while !expected
        .iter()
        .all(|(kind, path)| seen.iter().any(|e| e.kind == *kind && e.path == *path))
    {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, rx.recv()).await {
            Ok(Some(event)) => seen.push(event),
            Ok(None) => panic!("event channel closed; seen {seen:?}"),
            Err(_) => panic!("timed out waiting for {expected:?}; seen {seen:?}"),
        }
    }
    seen
}

async fn wait_for(rx: &mut UnboundedReceiver<PathEvent>, kind: EventKind, path: &Path) {
    wait_for_all(rx, &[(kind, path.to_path_buf())]).await;
}

/// Everything received within `period`.
async fn collect_for<T>(rx: &mut UnboundedReceiver<T>, period: Duration) -> Vec<T> {
    let deadline = Instant::now() + period;
    let mut items = Vec::new();
    while let Ok(Some(item)) = timeout(deadline.saturating_duration_since(Instant::now()), rx.recv()).await {
        items.push(item);
    }
    items
}

async fn next_transition(rx: &mut UnboundedReceiver<Transition>) -> Transition {
    match timeout(TIMEOUT, rx.recv()).await {
        Ok(Some(transition)) => transition,
        Ok(None) => panic!("lifecycle channel closed"),
        Err(_) => panic!("timed out waiting for a lifecycle transition"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_non_recursive_watcher_reports_direct_children_only() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    fs::create_dir(root.join("sub")).unwrap();

    let (listener, mut events) = ChannelListener::new();
    let task = factory(poll_config(), Arc::new(NoopLifecycleListener))
        .create_non_recursive_watcher(root, Arc::new(listener))
        .unwrap();
    assert_eq!(task.strategy(), RegistrationStrategy::NonRecursive);
    task.start().unwrap();

    fs::write(root.join("a.txt"), "a").unwrap();
    wait_for(&mut events, EventKind::Created, &root.join("a.txt")).await;

    fs::write(root.join("sub").join("deep.txt"), "deep").unwrap();
    fs::create_dir(root.join("sub").join("nested")).unwrap();
    fs::write(root.join("sub").join("nested").join("deeper.txt"), "deeper").unwrap();
    fs::write(root.join("b.txt"), "b").unwrap();

    let mut seen = wait_for_all(&mut events, &[(EventKind::Created, root.join("b.txt"))]).await;
    seen.extend(collect_for(&mut events, SETTLE).await);

    for event in &seen {
        assert_eq!(event.path.parent(), Some(root), "unexpected event {event:?}");
    }
    task.stop().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recursive_watcher_reports_populated_directories() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let dir0 = root.join("dir0");
    let dir1 = dir0.join("dir1");
    let file = dir1.join("file.txt");

    let (listener, mut events) = ChannelListener::new();
    let task = factory(poll_config(), Arc::new(NoopLifecycleListener))
        .create_recursive_watcher(root, Arc::new(listener))
        .unwrap();
    assert_eq!(task.strategy(), RegistrationStrategy::NativeRecursive);
    task.start().unwrap();

    fs::create_dir_all(&dir1).unwrap();
    fs::write(&file, "content").unwrap();

    let created = wait_for_all(
        &mut events,
        &[
            (EventKind::Created, dir0.clone()),
            (EventKind::Created, dir1.clone()),
            (EventKind::Created, file.clone()),
        ],
    )
    .await;
    assert!(created.iter().all(|e| e.kind != EventKind::Deleted));

    fs::remove_file(&file).unwrap();
    fs::remove_dir(&dir1).unwrap();
    fs::remove_dir(&dir0).unwrap();

    wait_for_all(
        &mut events,
        &[
            (EventKind::Deleted, file),
            (EventKind::Deleted, dir1),
            (EventKind::Deleted, dir0),
        ],
    )
    .await;
    task.stop().unwrap();
}

/// Creations and deletions in arrival order, without modifications.
fn structural(events: &[PathEvent]) -> Vec<(EventKind, PathBuf)> {
    events
        .iter()
        .filter(|e| e.kind != EventKind::Modified)
        .map(|e| (e.kind, e.path.clone()))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_child_is_deleted_before_its_parent() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let dir0 = root.join("dir0");
    let dir1 = dir0.join("dir1");

    let (listener, mut events) = ChannelListener::new();
    let task = factory(poll_config(), Arc::new(NoopLifecycleListener))
        .create_recursive_watcher(root, Arc::new(listener))
        .unwrap();
    task.start().unwrap();

    fs::create_dir_all(&dir1).unwrap();
    let mut seen = wait_for_all(
        &mut events,
        &[
            (EventKind::Created, dir0.clone()),
            (EventKind::Created, dir1.clone()),
        ],
    )
    .await;

    fs::remove_dir(&dir1).unwrap();
    tokio::time::sleep(SETTLE).await;
    fs::remove_dir(&dir0).unwrap();
    seen.extend(wait_for_all(&mut events, &[(EventKind::Deleted, dir0.clone())]).await);
    task.stop().unwrap();

    let order = structural(&seen);
    let position = |kind: EventKind, path: &Path| {
        order
            .iter()
            .position(|(k, p)| *k == kind && p == path)
            .unwrap_or_else(|| panic!("no {kind:?} for {}; seen {order:?}", path.display()))
    };
    assert!(position(EventKind::Created, &dir0) < position(EventKind::Created, &dir1));
    assert!(position(EventKind::Created, &dir1) < position(EventKind::Deleted, &dir1));
    assert!(position(EventKind::Deleted, &dir1) < position(EventKind::Deleted, &dir0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_native_backend_reports_each_change_once() {
    let temp = TempDir::new().unwrap();
    // Some platforms report events under the canonical path.
    let root = temp.path().canonicalize().unwrap();
    let dir0 = root.join("dir0");
    let dir1 = dir0.join("dir1");
    let file = dir1.join("file.txt");

    let (listener, mut events) = ChannelListener::new();
    let task = factory(WatcherConfig::default(), Arc::new(NoopLifecycleListener))
        .create_recursive_watcher(&root, Arc::new(listener))
        .unwrap();
    task.start().unwrap();

    // New directories are registered right after their callback.
    let mut seen = Vec::new();
    fs::create_dir(&dir0).unwrap();
    seen.extend(wait_for_all(&mut events, &[(EventKind::Created, dir0.clone())]).await);
    tokio::time::sleep(SETTLE).await;
    fs::create_dir(&dir1).unwrap();
    seen.extend(wait_for_all(&mut events, &[(EventKind::Created, dir1.clone())]).await);
    tokio::time::sleep(SETTLE).await;
    fs::write(&file, "content").unwrap();
    seen.extend(wait_for_all(&mut events, &[(EventKind::Created, file.clone())]).await);
    tokio::time::sleep(SETTLE).await;

    fs::remove_file(&file).unwrap();
    tokio::time::sleep(SETTLE).await;
    fs::remove_dir(&dir1).unwrap();
    tokio::time::sleep(SETTLE).await;
    fs::remove_dir(&dir0).unwrap();
    seen.extend(wait_for_all(&mut events, &[(EventKind::Deleted, dir0.clone())]).await);
    // Late duplicates would show up here.
    seen.extend(collect_for(&mut events, SETTLE).await);
    task.stop().unwrap();

    assert_eq!(
        structural(&seen),
        vec![
            (EventKind::Created, dir0.clone()),
            (EventKind::Created, dir1.clone()),
            (EventKind::Created, file.clone()),
            (EventKind::Deleted, file),
            (EventKind::Deleted, dir1),
            (EventKind::Deleted, dir0),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tree_walking_watcher_follows_new_directories() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let existing = root.join("existing");
    fs::create_dir(&existing).unwrap();

    let (listener, mut events) = ChannelListener::new();
    let task = factory(
        poll_config().without_native_recursion(),
        Arc::new(NoopLifecycleListener),
    )
    .create_recursive_watcher(root, Arc::new(listener))
    .unwrap();
    assert_eq!(task.strategy(), RegistrationStrategy::TreeWalking);
    task.start().unwrap();

    fs::write(existing.join("a.txt"), "a").unwrap();
    wait_for(&mut events, EventKind::Created, &existing.join("a.txt")).await;

    // Each new directory gets registered right after its callback; give the
    // registration a few scans before populating it.
    let dir0 = root.join("dir0");
    fs::create_dir(&dir0).unwrap();
    wait_for(&mut events, EventKind::Created, &dir0).await;
    tokio::time::sleep(SETTLE).await;

    let dir1 = dir0.join("dir1");
    fs::create_dir(&dir1).unwrap();
    wait_for(&mut events, EventKind::Created, &dir1).await;
    tokio::time::sleep(SETTLE).await;

    let file = dir1.join("file.txt");
    fs::write(&file, "deep").unwrap();
    wait_for(&mut events, EventKind::Created, &file).await;

    task.stop().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopped_watcher_stays_silent() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let (lifecycle, mut transitions) = recorder();
    let (listener, mut events) = ChannelListener::new();

    let scheduler = Arc::new(TokioScheduler::current().unwrap());
    let task = factory_on(scheduler, poll_config(), lifecycle)
        .create_recursive_watcher(root, Arc::new(listener))
        .unwrap();
    assert!(task.start().unwrap().is_running());
    assert_eq!(next_transition(&mut transitions).await, Transition::Start);

    task.stop().unwrap();
    assert_eq!(next_transition(&mut transitions).await, Transition::Stop);
    assert!(!task.is_running());

    fs::write(root.join("late.txt"), "late").unwrap();
    fs::create_dir(root.join("late")).unwrap();

    assert!(collect_for(&mut events, SETTLE).await.is_empty());
    assert!(collect_for(&mut transitions, Duration::from_millis(50)).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rogue_listener_stops_only_its_watcher() {
    let rogue_root = TempDir::new().unwrap();
    let healthy_root = TempDir::new().unwrap();
    let (lifecycle, mut transitions) = recorder();
    let factory = factory(poll_config(), lifecycle);

    let rogue = |kind: EventKind, path: &Path| -> anyhow::Result<()> {
        if kind == EventKind::Created {
            return Err(RogueError(path.to_path_buf()).into());
        }
        Ok(())
    };
    let rogue_task = factory
        .create_non_recursive_watcher(rogue_root.path(), Arc::new(rogue))
        .unwrap();

    let (listener, mut events) = ChannelListener::new();
    let healthy_task = factory
        .create_non_recursive_watcher(healthy_root.path(), Arc::new(listener))
        .unwrap();

    rogue_task.start().unwrap();
    assert_eq!(next_transition(&mut transitions).await, Transition::Start);

    fs::write(rogue_root.path().join("a.txt"), "a").unwrap();
    assert_eq!(
        next_transition(&mut transitions).await,
        Transition::Exception { rogue: true }
    );
    assert_eq!(next_transition(&mut transitions).await, Transition::Stop);
    assert!(!rogue_task.is_running());
    assert!(collect_for(&mut transitions, SETTLE).await.is_empty());
    assert!(matches!(rogue_task.stop(), Err(WatcherError::NotStarted(_))));

    healthy_task.start().unwrap();
    fs::write(healthy_root.path().join("b.txt"), "b").unwrap();
    wait_for(&mut events, EventKind::Created, &healthy_root.path().join("b.txt")).await;
    assert!(healthy_task.is_running());
    healthy_task.stop().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_path_watcher_ignores_siblings() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("target.txt");
    let sibling = temp.path().join("sibling.txt");

    let (listener, mut events) = ChannelListener::new();
    let task = factory(poll_config(), Arc::new(NoopLifecycleListener))
        .create_single_path_watcher(&target, Arc::new(listener))
        .unwrap();
    assert_eq!(task.root(), temp.path());
    task.start().unwrap();

    fs::write(&sibling, "sibling").unwrap();
    fs::write(&target, "target").unwrap();
    let mut seen = wait_for_all(&mut events, &[(EventKind::Created, target.clone())]).await;

    fs::remove_file(&sibling).unwrap();
    fs::remove_file(&target).unwrap();
    seen.extend(wait_for_all(&mut events, &[(EventKind::Deleted, target.clone())]).await);
    seen.extend(collect_for(&mut events, SETTLE).await);

    assert!(seen.iter().all(|e| e.path == target), "unexpected events {seen:?}");
    task.stop().unwrap();
}

#[test]
fn test_watchers_reject_invalid_roots() {
    let temp = TempDir::new().unwrap();
    let factory = factory(poll_config(), Arc::new(NoopLifecycleListener));
    let (listener, _events) = ChannelListener::new();

    let error = factory
        .create_recursive_watcher(temp.path().join("missing"), Arc::new(listener))
        .unwrap_err();
    assert!(error.is_usage_error());
}
