//! External edit detection for layout files.
//!
//! Change notifications for a layout URI are debounced, then handed to a
//! per-URI worker through a single-slot queue: a notification arriving while a
//! reload runs fills the slot and causes exactly one more reload afterwards;
//! further notifications while the slot is full are already covered by it.

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{DebounceEventResult, new_debouncer};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::persistence::{FingerprintLedger, content_hash};
use crate::registry::Registry;

/// Applies the text of an externally edited layout to the rest of the system.
/// Called on a blocking thread, one call at a time per layout URI.
pub trait LayoutReconciler: Send + Sync {
    fn reconcile(&self, layout_uri: &str, text: &str) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The file could not be read; nothing was touched.
    Unreadable(String),
    /// Content equals what was last applied.
    AlreadyCurrent,
    /// Content is the echo of the program's own last write.
    SelfWrite,
    Applied,
    /// Reconciliation rejected the content; previous state stays.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub layout_uri: String,
    pub outcome: ReloadOutcome,
}

struct ReloadWorker {
    slot: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

struct WatchSubscription {
    refs: usize,
    _debouncer: Option<notify_debouncer_mini::Debouncer<RecommendedWatcher>>,
    forward_task: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherTimings {
    pub debounce: Duration,
    pub event_window: Duration,
    pub os_events: bool,
}

pub struct ExternalEditWatcher {
    timings: WatcherTimings,
    ledger: Arc<FingerprintLedger>,
    reconciler: Arc<dyn LayoutReconciler>,
    events: mpsc::UnboundedSender<WatcherEvent>,
    applied_hashes: Registry<String, String>,
    debounce_generation: AtomicU64,
    debounce_pending: Registry<String, u64>,
    workers: Registry<String, ReloadWorker>,
    subscriptions: Registry<String, WatchSubscription>,
}

impl ExternalEditWatcher {
    pub fn new(
        timings: WatcherTimings,
        ledger: Arc<FingerprintLedger>,
        reconciler: Arc<dyn LayoutReconciler>,
        events: mpsc::UnboundedSender<WatcherEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            timings,
            ledger,
            reconciler,
            events,
            applied_hashes: Registry::new("applied layout hashes"),
            debounce_generation: AtomicU64::new(0),
            debounce_pending: Registry::new("watcher debounce"),
            workers: Registry::new("reload workers"),
            subscriptions: Registry::new("layout watches"),
        })
    }

    // ===== SUBSCRIPTIONS =====

    /// Adds one reference to the watch on `layout_uri`, subscribing to file
    /// events on first use.
    pub fn watch_layout(self: &Arc<Self>, layout_uri: &str) -> Result<(), SyncError> {
        let existing = self.subscriptions.with(|subscriptions| {
            subscriptions.get_mut(layout_uri).map(|subscription| {
                subscription.refs += 1;
                subscription.refs
            })
        });
        if let Some(refs) = existing {
            log::debug!("layout '{}' watched by {} subscribers", layout_uri, refs);
            return Ok(());
        }

        let subscription = if self.timings.os_events {
            self.subscribe_os_events(layout_uri)?
        } else {
            WatchSubscription {
                refs: 1,
                _debouncer: None,
                forward_task: None,
            }
        };

        let raced = self.subscriptions.with(|subscriptions| match subscriptions.get_mut(layout_uri) {
            Some(current) => {
                current.refs += 1;
                Some(subscription)
            }
            None => {
                subscriptions.insert(layout_uri.to_string(), subscription);
                None
            }
        });
        if let Some(duplicate) = raced {
            if let Some(task) = duplicate.forward_task {
                task.abort();
            }
        } else {
            log::info!("watching layout '{}'", layout_uri);
        }
        Ok(())
    }

    /// Drops one reference; the last one tears the subscription down.
    pub fn unwatch_layout(&self, layout_uri: &str) {
        let removed = self.subscriptions.with(|subscriptions| {
            let subscription = subscriptions.get_mut(layout_uri)?;
            subscription.refs = subscription.refs.saturating_sub(1);
            if subscription.refs == 0 {
                subscriptions.remove(layout_uri)
            } else {
                None
            }
        });
        let Some(subscription) = removed else {
            return;
        };
        if let Some(task) = subscription.forward_task {
            task.abort();
        }
        self.debounce_pending.remove(&layout_uri.to_string());
        self.applied_hashes.remove(&layout_uri.to_string());
        self.ledger.forget(layout_uri);
        if let Some(worker) = self.workers.remove(&layout_uri.to_string()) {
            // An in-flight reload finishes; the worker then sees the closed slot.
            drop(worker.slot);
            drop(worker.task);
        }
        log::info!("stopped watching layout '{}'", layout_uri);
    }

    pub fn watch_count(&self, layout_uri: &str) -> usize {
        self.subscriptions
            .with(|subscriptions| subscriptions.get(layout_uri).map_or(0, |subscription| subscription.refs))
    }

    fn subscribe_os_events(self: &Arc<Self>, layout_uri: &str) -> Result<WatchSubscription, SyncError> {
        let layout_path = PathBuf::from(layout_uri);
        // Atomic writes replace the file, so watch the directory and filter.
        let directory = layout_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = layout_path.file_name().map(|name| name.to_os_string());
        let label = layout_uri.to_string();

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut debouncer = new_debouncer(self.timings.event_window, move |result: DebounceEventResult| match result {
            Ok(events) => {
                let touched = events
                    .iter()
                    .any(|event| event.path.file_name().map(|name| name.to_os_string()) == file_name);
                if touched {
                    let _ = tx.send(());
                }
            }
            Err(err) => {
                log::warn!("file watcher error for '{}': {}", label, err);
            }
        })
        .map_err(|err| SyncError::io(layout_uri, std::io::Error::other(err.to_string())))?;

        debouncer
            .watcher()
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|err| SyncError::io(directory.display().to_string(), std::io::Error::other(err.to_string())))?;

        let weak = Arc::downgrade(self);
        let uri = layout_uri.to_string();
        let forward_task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let Some(watcher) = weak.upgrade() else {
                    break;
                };
                watcher.on_raw_change(&uri);
            }
        });

        Ok(WatchSubscription {
            refs: 1,
            _debouncer: Some(debouncer),
            forward_task: Some(forward_task),
        })
    }

    // ===== CHANGE HANDLING =====

    /// Entry point for a raw change notification. With a zero debounce the
    /// reload is queued immediately.
    pub fn on_raw_change(self: &Arc<Self>, layout_uri: &str) {
        if self.timings.debounce.is_zero() {
            self.enqueue_reload(layout_uri);
            return;
        }

        let generation = self.debounce_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.debounce_pending.insert(layout_uri.to_string(), generation);
        let weak = Arc::downgrade(self);
        let uri = layout_uri.to_string();
        let delay = self.timings.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(watcher) = weak.upgrade() else {
                return;
            };
            let due = watcher.debounce_pending.with(|pending| {
                if pending.get(&uri) == Some(&generation) {
                    pending.remove(&uri);
                    true
                } else {
                    false
                }
            });
            if due {
                watcher.enqueue_reload(&uri);
            }
        });
    }

    /// Marks `hash` as the content currently reflected in memory, e.g. after
    /// the host loaded the layout itself.
    pub fn record_applied(&self, layout_uri: &str, hash: String) {
        self.applied_hashes.insert(layout_uri.to_string(), hash);
    }

    pub fn applied_hash(&self, layout_uri: &str) -> Option<String> {
        self.applied_hashes.get(&layout_uri.to_string())
    }

    fn enqueue_reload(self: &Arc<Self>, layout_uri: &str) {
        self.workers.with(|workers| {
            if let Some(worker) = workers.get(layout_uri) {
                match worker.slot.try_send(()) {
                    Ok(()) => return,
                    Err(TrySendError::Full(())) => {
                        log::debug!("reload of '{}' already pending", layout_uri);
                        return;
                    }
                    Err(TrySendError::Closed(())) => {}
                }
            }
            let worker = self.spawn_worker(layout_uri);
            let _ = worker.slot.try_send(());
            workers.insert(layout_uri.to_string(), worker);
        });
    }

    fn spawn_worker(self: &Arc<Self>, layout_uri: &str) -> ReloadWorker {
        let (slot, mut queue) = mpsc::channel::<()>(1);
        let weak: Weak<Self> = Arc::downgrade(self);
        let uri = layout_uri.to_string();
        let task = tokio::spawn(async move {
            while queue.recv().await.is_some() {
                let Some(watcher) = weak.upgrade() else {
                    break;
                };
                let outcome = watcher.reload(&uri).await;
                let _ = watcher.events.send(WatcherEvent {
                    layout_uri: uri.clone(),
                    outcome,
                });
            }
        });
        ReloadWorker { slot, task }
    }

    async fn reload(&self, layout_uri: &str) -> ReloadOutcome {
        let bytes = match tokio::fs::read(layout_uri).await {
            Ok(bytes) => bytes,
            Err(err) => {
                log::error!("cannot read layout '{}': {}", layout_uri, err);
                return ReloadOutcome::Unreadable(err.to_string());
            }
        };
        let hash = content_hash(&bytes);
        if self.applied_hash(layout_uri).as_deref() == Some(hash.as_str()) {
            log::debug!("layout '{}' unchanged since last apply", layout_uri);
            return ReloadOutcome::AlreadyCurrent;
        }

        let metadata = tokio::fs::metadata(layout_uri).await.ok();
        let size = metadata.as_ref().map_or(bytes.len() as u64, |meta| meta.len());
        let mtime = metadata.and_then(|meta| meta.modified().ok());
        if self.ledger.is_self_write(layout_uri, &hash, size, mtime) {
            log::debug!("layout '{}' change is our own write", layout_uri);
            self.record_applied(layout_uri, hash);
            return ReloadOutcome::SelfWrite;
        }

        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => {
                log::error!("layout '{}' is not UTF-8: {}", layout_uri, err);
                return ReloadOutcome::Failed(format!("layout is not valid UTF-8: {err}"));
            }
        };
        let reconciler = Arc::clone(&self.reconciler);
        let uri = layout_uri.to_string();
        let result = tokio::task::spawn_blocking(move || reconciler.reconcile(&uri, &text)).await;
        match result {
            Ok(Ok(())) => {
                log::info!("applied external edit of '{}'", layout_uri);
                self.record_applied(layout_uri, hash);
                ReloadOutcome::Applied
            }
            Ok(Err(err)) => {
                log::error!("external edit of '{}' rejected: {}", layout_uri, err);
                ReloadOutcome::Failed(err.to_string())
            }
            Err(join_err) => {
                log::error!("reconciliation of '{}' panicked: {}", layout_uri, join_err);
                ReloadOutcome::Failed(join_err.to_string())
            }
        }
    }

    /// Stops every subscription and worker.
    pub fn shutdown(&self) {
        for (_, subscription) in self.subscriptions.drain() {
            if let Some(task) = subscription.forward_task {
                task.abort();
            }
        }
        for (_, worker) in self.workers.drain() {
            worker.task.abort();
        }
        self.debounce_pending.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::write_atomic;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingReconciler {
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        started: AtomicUsize,
        // The first call blocks until this receiver yields.
        gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
        reject: Option<String>,
    }

    impl LayoutReconciler for RecordingReconciler {
        fn reconcile(&self, _layout_uri: &str, text: &str) -> Result<(), SyncError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.started.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.recv();
            }
            self.calls.lock().unwrap().push(text.to_string());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match &self.reject {
                Some(message) => Err(SyncError::Config(message.clone())),
                None => Ok(()),
            }
        }
    }

    fn timings(debounce_ms: u64, os_events: bool) -> WatcherTimings {
        WatcherTimings {
            debounce: Duration::from_millis(debounce_ms),
            event_window: Duration::from_millis(20),
            os_events,
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        uri: String,
        ledger: Arc<FingerprintLedger>,
        reconciler: Arc<RecordingReconciler>,
        watcher: Arc<ExternalEditWatcher>,
        events: mpsc::UnboundedReceiver<WatcherEvent>,
    }

    fn fixture(reconciler: RecordingReconciler, timings: WatcherTimings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().join("run.csv.layout.yaml").display().to_string();
        let ledger = Arc::new(FingerprintLedger::new(Duration::from_secs(1)));
        let reconciler = Arc::new(reconciler);
        let (tx, events) = mpsc::unbounded_channel();
        let watcher = ExternalEditWatcher::new(timings, Arc::clone(&ledger), reconciler.clone(), tx);
        Fixture {
            dir,
            uri,
            ledger,
            reconciler,
            watcher,
            events,
        }
    }

    async fn next_outcome(events: &mut mpsc::UnboundedReceiver<WatcherEvent>) -> ReloadOutcome {
        tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timed out waiting for watcher event")
            .expect("event channel closed")
            .outcome
    }

    async fn assert_quiet(events: &mut mpsc::UnboundedReceiver<WatcherEvent>) {
        let extra = tokio::time::timeout(Duration::from_millis(250), events.recv()).await;
        assert!(extra.is_err(), "unexpected watcher event: {extra:?}");
    }

    #[tokio::test]
    async fn own_write_is_not_reloaded() {
        let mut fx = fixture(RecordingReconciler::default(), timings(0, false));
        let fingerprint = write_atomic(Path::new(&fx.uri), b"version: 1\n", 4).await.unwrap();
        fx.ledger.record(fingerprint);

        fx.watcher.on_raw_change(&fx.uri);
        assert_eq!(next_outcome(&mut fx.events).await, ReloadOutcome::SelfWrite);
        fx.watcher.on_raw_change(&fx.uri);
        assert_eq!(next_outcome(&mut fx.events).await, ReloadOutcome::AlreadyCurrent);
        assert!(fx.reconciler.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn external_edit_is_reconciled_once() {
        let mut fx = fixture(RecordingReconciler::default(), timings(0, false));
        let fingerprint = write_atomic(Path::new(&fx.uri), b"ours\n", 1).await.unwrap();
        fx.ledger.record(fingerprint);
        std::fs::write(&fx.uri, "theirs\n").unwrap();

        fx.watcher.on_raw_change(&fx.uri);
        assert_eq!(next_outcome(&mut fx.events).await, ReloadOutcome::Applied);
        assert_eq!(*fx.reconciler.calls.lock().unwrap(), vec!["theirs\n".to_string()]);
        assert_eq!(fx.watcher.applied_hash(&fx.uri), Some(content_hash(b"theirs\n")));

        fx.watcher.on_raw_change(&fx.uri);
        assert_eq!(next_outcome(&mut fx.events).await, ReloadOutcome::AlreadyCurrent);
    }

    #[tokio::test]
    async fn unreadable_and_rejected_content_leave_hash_alone() {
        let reconciler = RecordingReconciler {
            reject: Some("bad layout".to_string()),
            ..RecordingReconciler::default()
        };
        let mut fx = fixture(reconciler, timings(0, false));

        fx.watcher.on_raw_change(&fx.uri);
        assert!(matches!(next_outcome(&mut fx.events).await, ReloadOutcome::Unreadable(_)));

        std::fs::write(&fx.uri, "garbage").unwrap();
        fx.watcher.on_raw_change(&fx.uri);
        assert_eq!(
            next_outcome(&mut fx.events).await,
            ReloadOutcome::Failed("configuration error: bad layout".to_string())
        );
        assert_eq!(fx.watcher.applied_hash(&fx.uri), None);
    }

    #[tokio::test]
    async fn burst_of_notifications_is_debounced() {
        let mut fx = fixture(RecordingReconciler::default(), timings(40, false));
        std::fs::write(&fx.uri, "edited").unwrap();
        for _ in 0..5 {
            fx.watcher.on_raw_change(&fx.uri);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(next_outcome(&mut fx.events).await, ReloadOutcome::Applied);
        assert_quiet(&mut fx.events).await;
        assert_eq!(fx.reconciler.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn notifications_during_reload_cause_exactly_one_rerun() {
        let (release, gate) = std::sync::mpsc::channel();
        let reconciler = RecordingReconciler {
            gate: Mutex::new(Some(gate)),
            ..RecordingReconciler::default()
        };
        let mut fx = fixture(reconciler, timings(0, false));
        std::fs::write(&fx.uri, "first").unwrap();
        fx.watcher.on_raw_change(&fx.uri);

        while fx.reconciler.started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        std::fs::write(&fx.uri, "second").unwrap();
        fx.watcher.on_raw_change(&fx.uri);
        fx.watcher.on_raw_change(&fx.uri);
        fx.watcher.on_raw_change(&fx.uri);
        release.send(()).unwrap();

        assert_eq!(next_outcome(&mut fx.events).await, ReloadOutcome::Applied);
        assert_eq!(next_outcome(&mut fx.events).await, ReloadOutcome::Applied);
        assert_quiet(&mut fx.events).await;
        assert_eq!(
            *fx.reconciler.calls.lock().unwrap(),
            vec!["first".to_string(), "second".to_string()]
        );
        assert_eq!(fx.reconciler.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn watch_subscriptions_are_reference_counted() {
        let fx = fixture(RecordingReconciler::default(), timings(0, false));
        fx.watcher.watch_layout(&fx.uri).unwrap();
        fx.watcher.watch_layout(&fx.uri).unwrap();
        assert_eq!(fx.watcher.watch_count(&fx.uri), 2);
        fx.watcher.unwatch_layout(&fx.uri);
        assert_eq!(fx.watcher.watch_count(&fx.uri), 1);
        fx.watcher.unwatch_layout(&fx.uri);
        assert_eq!(fx.watcher.watch_count(&fx.uri), 0);
        fx.watcher.unwatch_layout(&fx.uri);
        assert_eq!(fx.watcher.watch_count(&fx.uri), 0);
    }

    #[tokio::test]
    async fn last_unwatch_forgets_layout_bookkeeping() {
        let fx = fixture(RecordingReconciler::default(), timings(0, false));
        let fingerprint = write_atomic(Path::new(&fx.uri), b"ours\n", 1).await.unwrap();
        fx.ledger.record(fingerprint);
        fx.watcher.record_applied(&fx.uri, content_hash(b"ours\n"));
        fx.watcher.watch_layout(&fx.uri).unwrap();
        fx.watcher.watch_layout(&fx.uri).unwrap();

        fx.watcher.unwatch_layout(&fx.uri);
        assert!(fx.ledger.latest(&fx.uri).is_some());
        assert!(fx.watcher.applied_hash(&fx.uri).is_some());

        fx.watcher.unwatch_layout(&fx.uri);
        assert!(fx.ledger.latest(&fx.uri).is_none());
        assert_eq!(fx.watcher.applied_hash(&fx.uri), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn os_file_events_trigger_reconciliation() {
        let mut fx = fixture(RecordingReconciler::default(), timings(50, true));
        std::fs::write(&fx.uri, "initial").unwrap();
        fx.watcher.record_applied(&fx.uri, content_hash(b"initial"));
        fx.watcher.watch_layout(&fx.uri).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        std::fs::write(fx.dir.path().join("unrelated.txt"), "noise").unwrap();
        std::fs::write(&fx.uri, "edited elsewhere").unwrap();
        assert_eq!(next_outcome(&mut fx.events).await, ReloadOutcome::Applied);
        assert_eq!(*fx.reconciler.calls.lock().unwrap(), vec!["edited elsewhere".to_string()]);
        fx.watcher.unwatch_layout(&fx.uri);
    }
}
