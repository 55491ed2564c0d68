//! The sync host: one process-wide owner of viewer sessions, per-dataset
//! state, autosave and external edit watching.
//!
//! Viewers talk to the host through [`HostMessage`] outboxes and JSON
//! envelopes. Every accepted mutation is committed to the state store,
//! scheduled for autosave, and broadcast as a `statePatch` to the viewers bound
//! to the dataset.

use shared::protocol::{HostError, HostMessage, IntentMeta, StatePatch, StateSnapshot, ViewerIntent, ViewerMessage};
use shared::{import_spec, peek_dataset_path};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::autosave::{AutosaveDebouncer, AutosaveEvent, LayoutResolver};
use crate::config::SyncConfig;
use crate::dataset::{DatasetLoader, LoadedDataset};
use crate::error::SyncError;
use crate::intents::{dropped_signal, intent_transaction};
use crate::persistence::{FingerprintLedger, content_hash, resolve_dataset_path, sidecar_path};
use crate::registry::{Registry, lock_or_recover};
use crate::sessions::ViewerSessionRegistry;
use crate::state_store::{CommitOutcome, RevisionedSnapshot, StateStore, Transaction};
use crate::watcher::{ExternalEditWatcher, LayoutReconciler, ReloadOutcome, WatcherEvent, WatcherTimings};

pub type ViewerOutbox = mpsc::UnboundedSender<HostMessage>;

/// Reason attached to patches produced by reconciling an edited layout file.
pub const EXTERNAL_EDIT_REASON: &str = "external edit";
const LAYOUT_LOAD_REASON: &str = "layout load";

/// Canonical string key for a dataset or layout path. Files that do not
/// exist yet are keyed by their canonical parent directory.
pub fn normalize_path(path: &Path) -> String {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical.display().to_string();
    }
    let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());
    if let (Some(parent), Some(name)) = (parent, path.file_name()) {
        if let Ok(dir) = std::fs::canonicalize(parent) {
            return dir.join(name).display().to_string();
        }
    }
    path.display().to_string()
}

// ===== SHARED CORE =====

/// State reachable from both the host surface and the watcher's reconciler.
struct HostCore {
    store: StateStore,
    sessions: Arc<ViewerSessionRegistry>,
    outboxes: Registry<String, ViewerOutbox>,
    loader: Arc<dyn DatasetLoader>,
    signals: Registry<String, Arc<Vec<String>>>,
    autosave: Arc<AutosaveDebouncer>,
}

impl HostCore {
    fn send(&self, viewer_id: &str, message: HostMessage) {
        if let Some(outbox) = self.outboxes.get(&viewer_id.to_string()) {
            if outbox.send(message).is_err() {
                log::debug!("viewer '{}' outbox closed; message dropped", viewer_id);
            }
        }
    }

    fn broadcast_patch(&self, viewer_ids: &[String], dataset_key: &str, outcome: &CommitOutcome) {
        let message = HostMessage::StatePatch(StatePatch {
            dataset_path: dataset_key.to_string(),
            revision: outcome.next.revision,
            workspace: outcome.next.workspace.clone(),
            viewer_state: outcome.next.viewer_state.clone(),
            reason: outcome.reason.clone(),
        });
        for viewer_id in viewer_ids {
            self.send(viewer_id, message.clone());
        }
    }

    fn report_error(&self, viewer_ids: &[String], message: &str, request_id: Option<&str>) {
        let error = HostMessage::HostError(HostError {
            message: message.to_string(),
            request_id: request_id.map(str::to_string),
        });
        for viewer_id in viewer_ids {
            self.send(viewer_id, error.clone());
        }
    }

    fn load_dataset(&self, dataset_key: &str, path: &Path) -> Result<LoadedDataset, SyncError> {
        let loaded = self.loader.load_dataset(path)?;
        self.signals
            .insert(dataset_key.to_string(), Arc::new(loaded.dataset.signal_names()));
        Ok(loaded)
    }

    fn check_signal(&self, dataset_key: &str, intent: &ViewerIntent) -> Result<(), SyncError> {
        let (Some(signal), Some(signals)) = (dropped_signal(intent), self.signals.get(&dataset_key.to_string())) else {
            return Ok(());
        };
        if signals.iter().any(|known| known == signal) {
            Ok(())
        } else {
            Err(SyncError::UnknownSignal {
                dataset: dataset_key.to_string(),
                signal: signal.to_string(),
            })
        }
    }

    /// Applies an edited layout document to the dataset it references and
    /// pushes the result to every viewer of the layout or the dataset.
    fn reconcile_layout(&self, layout_uri: &str, text: &str) -> Result<CommitOutcome, SyncError> {
        let referenced = peek_dataset_path(text)?;
        let dataset_path = resolve_dataset_path(Path::new(layout_uri), &referenced);
        let dataset_key = normalize_path(&dataset_path);

        let layout_viewers = self.sessions.viewers_for_layout(layout_uri);
        for viewer_id in &layout_viewers {
            let bound = self.sessions.session(viewer_id).and_then(|session| session.dataset_path);
            if let Some(bound) = bound.filter(|bound| *bound != dataset_key) {
                return Err(SyncError::ReconciliationConflict {
                    layout: layout_uri.to_string(),
                    referenced: dataset_key,
                    viewer_id: viewer_id.clone(),
                    bound,
                });
            }
        }

        let loaded = self.load_dataset(&dataset_key, &dataset_path)?;
        let imported = import_spec(text, &loaded.dataset.signal_names())?;
        let outcome = self.store.commit_transaction(
            Transaction::replace(dataset_key.clone(), EXTERNAL_EDIT_REASON, imported.workspace)
                .with_default_x_signal(loaded.default_x_signal),
        )?;
        // The file already holds this state; pending writes of older state
        // must not land on top of it.
        self.autosave.supersede(&dataset_key, outcome.next.revision);

        let mut targets: BTreeSet<String> = layout_viewers.into_iter().collect();
        targets.extend(self.sessions.viewers_for_dataset(&dataset_key));
        let targets: Vec<String> = targets.into_iter().collect();
        self.broadcast_patch(&targets, &dataset_key, &outcome);
        log::info!(
            "reconciled '{}' into '{}' at revision {} ({} viewers)",
            layout_uri,
            dataset_key,
            outcome.next.revision,
            targets.len()
        );
        Ok(outcome)
    }
}

impl LayoutReconciler for HostCore {
    fn reconcile(&self, layout_uri: &str, text: &str) -> Result<(), SyncError> {
        self.reconcile_layout(layout_uri, text).map(|_| ())
    }
}

fn spawn_autosave_reporter(core: Arc<HostCore>, mut events: mpsc::UnboundedReceiver<AutosaveEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let AutosaveEvent::Failed {
                dataset_path,
                layout_path,
                message,
            } = event
            {
                let viewers = core.sessions.viewers_for_dataset(&dataset_path);
                core.report_error(&viewers, &format!("failed to save layout '{layout_path}': {message}"), None);
            }
        }
    })
}

fn spawn_reload_reporter(core: Arc<HostCore>, mut events: mpsc::UnboundedReceiver<WatcherEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(WatcherEvent { layout_uri, outcome }) = events.recv().await {
            let message = match outcome {
                ReloadOutcome::Unreadable(reason) => format!("cannot read layout '{layout_uri}': {reason}"),
                ReloadOutcome::Failed(reason) => format!("cannot apply layout '{layout_uri}': {reason}"),
                ReloadOutcome::AlreadyCurrent | ReloadOutcome::SelfWrite | ReloadOutcome::Applied => continue,
            };
            let viewers = core.sessions.viewers_for_layout(&layout_uri);
            core.report_error(&viewers, &message, None);
        }
    })
}

// ===== HOST SURFACE =====

pub struct SyncHost {
    config: SyncConfig,
    core: Arc<HostCore>,
    watcher: Arc<ExternalEditWatcher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncHost {
    /// Must be called from within a tokio runtime.
    pub fn new(config: SyncConfig, loader: Arc<dyn DatasetLoader>) -> Self {
        let sessions = Arc::new(ViewerSessionRegistry::new());
        let ledger = Arc::new(FingerprintLedger::new(config.mtime_tolerance()));
        let (autosave_tx, autosave_rx) = mpsc::unbounded_channel();
        let autosave = AutosaveDebouncer::new(
            config.autosave_quiet(),
            Arc::clone(&sessions) as Arc<dyn LayoutResolver>,
            Arc::clone(&ledger),
            autosave_tx,
        );
        let core = Arc::new(HostCore {
            store: StateStore::new(),
            sessions,
            outboxes: Registry::new("viewer outboxes"),
            loader,
            signals: Registry::new("dataset signals"),
            autosave,
        });

        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        let timings = WatcherTimings {
            debounce: config.watcher_debounce(),
            event_window: config.watcher_event_window(),
            os_events: config.watcher.os_events,
        };
        let reconciler: Arc<dyn LayoutReconciler> = core.clone();
        let watcher = ExternalEditWatcher::new(timings, ledger, reconciler, reload_tx);

        let tasks = vec![
            spawn_autosave_reporter(Arc::clone(&core), autosave_rx),
            spawn_reload_reporter(Arc::clone(&core), reload_rx),
        ];
        Self {
            config,
            core,
            watcher,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn sessions(&self) -> &ViewerSessionRegistry {
        &self.core.sessions
    }

    pub fn snapshot(&self, dataset_path: &Path) -> Option<Arc<RevisionedSnapshot>> {
        self.core.store.snapshot(&normalize_path(dataset_path))
    }

    /// Default layout path for a dataset.
    pub fn sidecar_for(&self, dataset_path: &Path) -> PathBuf {
        sidecar_path(Path::new(&normalize_path(dataset_path)), &self.config.layout.suffix)
    }

    // ----- viewer lifecycle -----

    /// Registers a new viewer window; it starts out focused.
    pub fn open_viewer(&self, outbox: ViewerOutbox) -> String {
        let viewer_id = self.core.sessions.open_viewer();
        self.core.outboxes.insert(viewer_id.clone(), outbox);
        if let Err(err) = self.core.sessions.focus_viewer(&viewer_id) {
            log::warn!("cannot focus new viewer: {}", err);
        }
        log::info!("viewer '{}' opened", viewer_id);
        viewer_id
    }

    pub fn close_viewer(&self, viewer_id: &str) -> Result<(), SyncError> {
        let session = self
            .core
            .sessions
            .remove_viewer(viewer_id)
            .ok_or_else(|| SyncError::UnknownViewer(viewer_id.to_string()))?;
        self.core.outboxes.remove(&viewer_id.to_string());
        if let Some(layout) = &session.layout_path {
            self.watcher.unwatch_layout(layout);
        }
        log::info!("viewer '{}' closed", viewer_id);
        Ok(())
    }

    pub fn focus_viewer(&self, viewer_id: &str) -> Result<(), SyncError> {
        self.core.sessions.focus_viewer(viewer_id)
    }

    pub fn blur_viewer(&self, viewer_id: &str) {
        self.core.sessions.blur_viewer(viewer_id);
    }

    /// Binds a viewer to a dataset and its layout file (the sidecar when
    /// `layout_path` is `None`), loading the layout on first use, and sends
    /// the viewer a `stateSnapshot`.
    pub fn open_dataset(
        &self,
        viewer_id: &str,
        dataset_path: &Path,
        layout_path: Option<&Path>,
    ) -> Result<Arc<RevisionedSnapshot>, SyncError> {
        let result = self.bind_dataset(viewer_id, dataset_path, layout_path);
        if let Err(err) = &result {
            log::error!("viewer '{}' cannot open '{}': {}", viewer_id, dataset_path.display(), err);
            self.core.report_error(&[viewer_id.to_string()], &err.to_string(), None);
        }
        result
    }

    fn bind_dataset(
        &self,
        viewer_id: &str,
        dataset_path: &Path,
        layout_path: Option<&Path>,
    ) -> Result<Arc<RevisionedSnapshot>, SyncError> {
        if self.core.sessions.session(viewer_id).is_none() {
            return Err(SyncError::UnknownViewer(viewer_id.to_string()));
        }
        let dataset_key = normalize_path(dataset_path);
        let loaded = self.core.load_dataset(&dataset_key, dataset_path)?;
        let layout_key = match layout_path {
            Some(path) => normalize_path(path),
            None => self.sidecar_for(dataset_path).display().to_string(),
        };

        let snapshot = match self.core.store.snapshot(&dataset_key) {
            Some(existing) => existing,
            None => self.load_initial(viewer_id, &dataset_key, &layout_key, &loaded)?,
        };

        self.core.sessions.bind_viewer_to_dataset(viewer_id, &dataset_key)?;
        let previous_layout = self.core.sessions.bind_viewer_to_layout(viewer_id, Some(&layout_key))?;
        if previous_layout.as_deref() != Some(layout_key.as_str()) {
            if let Some(old) = previous_layout {
                self.watcher.unwatch_layout(&old);
            }
            if let Err(err) = self.watcher.watch_layout(&layout_key) {
                log::warn!("cannot watch '{}': {}", layout_key, err);
                self.core
                    .report_error(&[viewer_id.to_string()], &format!("external edits will not be seen: {err}"), None);
            }
        }

        self.core.send(
            viewer_id,
            HostMessage::StateSnapshot(StateSnapshot {
                dataset_path: dataset_key.clone(),
                revision: snapshot.revision,
                workspace: snapshot.workspace.clone(),
                viewer_state: snapshot.viewer_state.clone(),
            }),
        );
        log::info!(
            "viewer '{}' bound to '{}' (layout '{}', revision {})",
            viewer_id,
            dataset_key,
            layout_key,
            snapshot.revision
        );
        Ok(snapshot)
    }

    /// First load of a dataset: the layout file if one exists, else the
    /// default workspace.
    fn load_initial(
        &self,
        viewer_id: &str,
        dataset_key: &str,
        layout_key: &str,
        loaded: &LoadedDataset,
    ) -> Result<Arc<RevisionedSnapshot>, SyncError> {
        let text = match std::fs::read_to_string(layout_key) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(self.core.store.ensure_snapshot(dataset_key, &loaded.default_x_signal));
            }
            Err(err) => return Err(SyncError::io(layout_key, err)),
        };

        let imported = import_spec(&text, &loaded.dataset.signal_names())?;
        let referenced = normalize_path(&resolve_dataset_path(Path::new(layout_key), &imported.dataset_path));
        if referenced != dataset_key {
            return Err(SyncError::ReconciliationConflict {
                layout: layout_key.to_string(),
                referenced,
                viewer_id: viewer_id.to_string(),
                bound: dataset_key.to_string(),
            });
        }
        let outcome = self.core.store.commit_transaction(
            Transaction::replace(dataset_key, LAYOUT_LOAD_REASON, imported.workspace)
                .with_default_x_signal(loaded.default_x_signal.clone()),
        )?;
        self.watcher.record_applied(layout_key, content_hash(text.as_bytes()));
        log::info!("loaded layout '{}' for '{}'", layout_key, dataset_key);
        Ok(outcome.next)
    }

    // ----- mutations -----

    /// Decodes a viewer envelope and handles its intent. Malformed messages
    /// are dropped. Returns the committed revision.
    pub fn handle_viewer_message(&self, text: &str) -> Option<u64> {
        let message = match ViewerMessage::decode(text) {
            Ok(message) => message,
            Err(err) => {
                log::debug!("dropping viewer message: {}", err);
                return None;
            }
        };
        self.handle_intent(&message.meta, message.intent)
            .ok()
            .map(|outcome| outcome.next.revision)
    }

    /// Commits an intent against the requesting viewer's dataset. Failures are
    /// sent back to that viewer as a `hostError` carrying the request id.
    pub fn handle_intent(&self, meta: &IntentMeta, intent: ViewerIntent) -> Result<CommitOutcome, SyncError> {
        let result = self.apply_intent(meta, intent);
        match &result {
            Ok(outcome) => log::debug!(
                "viewer '{}' request '{}' committed revision {}",
                meta.viewer_id,
                meta.request_id,
                outcome.next.revision
            ),
            Err(err) => {
                log::warn!("viewer '{}' request '{}' rejected: {}", meta.viewer_id, meta.request_id, err);
                self.core
                    .report_error(&[meta.viewer_id.clone()], &err.to_string(), Some(&meta.request_id));
            }
        }
        result
    }

    fn apply_intent(&self, meta: &IntentMeta, intent: ViewerIntent) -> Result<CommitOutcome, SyncError> {
        let session = self
            .core
            .sessions
            .session(&meta.viewer_id)
            .ok_or_else(|| SyncError::UnknownViewer(meta.viewer_id.clone()))?;
        let dataset_key = session
            .dataset_path
            .ok_or_else(|| SyncError::UnboundViewer(meta.viewer_id.clone()))?;
        self.commit_intent(&dataset_key, intent)
    }

    /// Applies an action coming from outside any viewer (e.g. a side panel) to
    /// the viewer the user is most likely looking at. A focused blank viewer
    /// is bound to the dataset first.
    pub fn apply_side_action(&self, dataset_path: &Path, intent: ViewerIntent) -> Result<CommitOutcome, SyncError> {
        let dataset_key = normalize_path(dataset_path);
        let target = self
            .core
            .sessions
            .resolve_target_viewer_session(&dataset_key)
            .ok_or_else(|| SyncError::NoTargetViewer(dataset_key.clone()))?;
        if target.dataset_path.as_deref() != Some(dataset_key.as_str()) {
            self.open_dataset(&target.id, dataset_path, None)?;
        }

        let result = self.commit_intent(&dataset_key, intent);
        if let Err(err) = &result {
            log::warn!("side action on '{}' rejected: {}", dataset_key, err);
            self.core.report_error(&[target.id.clone()], &err.to_string(), None);
        }
        result
    }

    fn commit_intent(&self, dataset_key: &str, intent: ViewerIntent) -> Result<CommitOutcome, SyncError> {
        self.core.check_signal(dataset_key, &intent)?;
        let outcome = self.core.store.commit_transaction(intent_transaction(dataset_key, intent))?;
        self.core.autosave.schedule(dataset_key, Arc::clone(&outcome.next));
        let viewers = self.core.sessions.viewers_for_dataset(dataset_key);
        self.core.broadcast_patch(&viewers, dataset_key, &outcome);
        Ok(outcome)
    }

    // ----- files -----

    /// Change notification for hosts that observe layout files themselves.
    pub fn notify_layout_changed(&self, layout_path: &Path) {
        self.watcher.on_raw_change(&normalize_path(layout_path));
    }

    /// Writes pending autosaves now, for one dataset or all of them.
    pub async fn flush(&self, dataset_path: Option<&Path>) -> Vec<AutosaveEvent> {
        let key = dataset_path.map(normalize_path);
        self.core.autosave.flush(key.as_deref()).await
    }

    /// Flushes pending autosaves and stops watching.
    pub async fn shutdown(&self) -> Vec<AutosaveEvent> {
        let events = self.core.autosave.flush(None).await;
        self.watcher.shutdown();
        for task in lock_or_recover(&self.tasks, "host tasks").drain(..) {
            task.abort();
        }
        log::info!("sync host stopped ({} layouts flushed)", events.len());
        events
    }
}
