//! Authoritative per-dataset state.
//!
//! Every mutation goes through [`StateStore::commit_transaction`], which stamps
//! the next revision and re-derives the viewer interaction state. Commits for
//! one dataset path are serialized, so revisions are gapless and applied in
//! submission order.

use shared::workspace::{Plot, ViewerInteractionState, Workspace};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::SyncError;
use crate::reducer::{ValidationError, WorkspaceAction, reduce};
use crate::registry::Registry;

#[derive(Debug, Clone, PartialEq)]
pub struct RevisionedSnapshot {
    pub workspace: Workspace,
    pub viewer_state: ViewerInteractionState,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveAxisSelection {
    pub plot_id: String,
    pub axis_id: String,
}

type Mutator = Box<dyn FnOnce(&Workspace, &ViewerInteractionState) -> Result<Workspace, ValidationError> + Send>;
type AxisSelector = Box<dyn FnOnce(&Workspace, &ViewerInteractionState) -> Option<ActiveAxisSelection> + Send>;

pub struct Transaction {
    dataset_path: String,
    reason: String,
    default_x_signal: Option<String>,
    mutate: Mutator,
    select_active_axis: Option<AxisSelector>,
}

impl Transaction {
    pub fn new(
        dataset_path: impl Into<String>,
        reason: impl Into<String>,
        mutate: impl FnOnce(&Workspace, &ViewerInteractionState) -> Result<Workspace, ValidationError> + Send + 'static,
    ) -> Self {
        Self {
            dataset_path: dataset_path.into(),
            reason: reason.into(),
            default_x_signal: None,
            mutate: Box::new(mutate),
            select_active_axis: None,
        }
    }

    /// A transaction applying one reducer action, named after the action.
    pub fn from_action(dataset_path: impl Into<String>, action: WorkspaceAction) -> Self {
        let reason = action.name();
        Self::new(dataset_path, reason, move |workspace, _| reduce(workspace, &action))
    }

    /// A transaction replacing the whole workspace, e.g. with a reconciled
    /// layout.
    pub fn replace(dataset_path: impl Into<String>, reason: impl Into<String>, workspace: Workspace) -> Self {
        Self::new(dataset_path, reason, move |_, _| Ok(workspace))
    }

    /// Lets the transaction create the snapshot when the path is not tracked yet.
    pub fn with_default_x_signal(mut self, x_signal: impl Into<String>) -> Self {
        self.default_x_signal = Some(x_signal.into());
        self
    }

    /// Explicit active-axis override, applied after derivation when the named
    /// axis exists in the new workspace.
    pub fn with_active_axis(
        mut self,
        select: impl FnOnce(&Workspace, &ViewerInteractionState) -> Option<ActiveAxisSelection> + Send + 'static,
    ) -> Self {
        self.select_active_axis = Some(Box::new(select));
        self
    }

    pub fn dataset_path(&self) -> &str {
        &self.dataset_path
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("dataset_path", &self.dataset_path)
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub reason: String,
    pub previous: Arc<RevisionedSnapshot>,
    pub next: Arc<RevisionedSnapshot>,
}

pub struct StateStore {
    snapshots: Registry<String, Arc<RevisionedSnapshot>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            snapshots: Registry::new("state store"),
        }
    }

    /// Returns the tracked snapshot, creating the default workspace at
    /// revision 0 on first use.
    pub fn ensure_snapshot(&self, dataset_path: &str, default_x_signal: &str) -> Arc<RevisionedSnapshot> {
        self.snapshots.with(|snapshots| {
            Arc::clone(
                snapshots
                    .entry(dataset_path.to_string())
                    .or_insert_with(|| Arc::new(initial_snapshot(default_x_signal))),
            )
        })
    }

    pub fn snapshot(&self, dataset_path: &str) -> Option<Arc<RevisionedSnapshot>> {
        self.snapshots.get(&dataset_path.to_string())
    }

    /// Fails with [`SyncError::UntrackedDataset`] when the dataset has no
    /// snapshot and the transaction carries no default X signal, or with
    /// [`SyncError::Validation`] when the mutation is rejected.
    pub fn commit_transaction(&self, transaction: Transaction) -> Result<CommitOutcome, SyncError> {
        let Transaction {
            dataset_path,
            reason,
            default_x_signal,
            mutate,
            select_active_axis,
        } = transaction;

        self.snapshots.with(|snapshots| {
            let previous = match (snapshots.get(&dataset_path), default_x_signal) {
                (Some(existing), _) => Arc::clone(existing),
                (None, Some(x_signal)) => Arc::new(initial_snapshot(&x_signal)),
                (None, None) => return Err(SyncError::UntrackedDataset(dataset_path.clone())),
            };

            let workspace = mutate(&previous.workspace, &previous.viewer_state)?;
            // Reducer actions cannot fail this; free-form mutators can.
            shared::validate_workspace(&workspace).map_err(ValidationError::InvalidWorkspace)?;
            let mut viewer_state = derive_viewer_state(&previous.workspace, &previous.viewer_state, &workspace);
            if let Some(select) = select_active_axis {
                if let Some(selection) = select(&workspace, &viewer_state) {
                    apply_selection(&workspace, &mut viewer_state, selection);
                }
            }

            let next = Arc::new(RevisionedSnapshot {
                workspace,
                viewer_state,
                revision: previous.revision + 1,
            });
            snapshots.insert(dataset_path.clone(), Arc::clone(&next));
            log::debug!("'{}' committed '{}' at revision {}", dataset_path, reason, next.revision);
            Ok(CommitOutcome { reason, previous, next })
        })
    }
}

fn initial_snapshot(default_x_signal: &str) -> RevisionedSnapshot {
    let workspace = Workspace::new_default(default_x_signal);
    let viewer_state = derive_viewer_state(&workspace, &ViewerInteractionState::default(), &workspace);
    RevisionedSnapshot {
        workspace,
        viewer_state,
        revision: 0,
    }
}

fn apply_selection(workspace: &Workspace, viewer_state: &mut ViewerInteractionState, selection: ActiveAxisSelection) {
    let exists = workspace
        .plot(&selection.plot_id)
        .is_some_and(|plot| plot.has_axis(&selection.axis_id));
    if exists {
        viewer_state.active_axis_by_plot.insert(selection.plot_id, selection.axis_id);
    } else {
        log::debug!(
            "ignoring active axis override '{}' in plot '{}': axis no longer exists",
            selection.axis_id,
            selection.plot_id
        );
    }
}

/// Recomputes which lane is active in every plot of `next`.
///
/// A plot keeps its previously active axis while that axis exists. When it
/// was removed, the axis now holding most of the traces that used to sit on
/// it wins, ties going to the earliest lane. Otherwise the first lane is used.
pub fn derive_viewer_state(
    previous: &Workspace,
    previous_state: &ViewerInteractionState,
    next: &Workspace,
) -> ViewerInteractionState {
    let mut active_axis_by_plot = BTreeMap::new();
    for plot in &next.plots {
        let kept = previous_state.active_axis(&plot.id).filter(|axis_id| plot.has_axis(axis_id));
        let chosen = kept
            .map(str::to_string)
            .or_else(|| {
                let removed = previous_state.active_axis(&plot.id)?;
                majority_axis(previous.plot(&plot.id)?, removed, plot)
            })
            .or_else(|| plot.axes.first().map(|axis| axis.id.clone()));
        if let Some(axis_id) = chosen {
            active_axis_by_plot.insert(plot.id.clone(), axis_id);
        }
    }
    ViewerInteractionState {
        active_plot_id: next.active_plot_id.clone(),
        active_axis_by_plot,
    }
}

fn majority_axis(previous: &Plot, removed_axis: &str, next: &Plot) -> Option<String> {
    let mut votes: BTreeMap<&str, usize> = BTreeMap::new();
    for trace in previous.traces_on_axis(removed_axis) {
        if let Some(moved) = next.trace(&trace.id) {
            *votes.entry(moved.axis_id.as_str()).or_insert(0) += 1;
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for axis in &next.axes {
        let count = votes.get(axis.id.as_str()).copied().unwrap_or(0);
        if count > 0 && best.is_none_or(|(_, top)| count > top) {
            best = Some((axis.id.as_str(), count));
        }
    }
    best.map(|(axis_id, _)| axis_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::WorkspaceAction;

    const DATASET: &str = "/data/run.csv";

    fn action(store: &StateStore, action: WorkspaceAction) -> CommitOutcome {
        store.commit_transaction(Transaction::from_action(DATASET, action)).unwrap()
    }

    fn add_axis() -> WorkspaceAction {
        WorkspaceAction::AxisAdd {
            plot_id: "plot-1".to_string(),
            after_axis_id: None,
        }
    }

    fn add_trace(signal: &str, axis_id: &str) -> WorkspaceAction {
        WorkspaceAction::TraceAdd {
            plot_id: "plot-1".to_string(),
            signal: signal.to_string(),
            axis_id: axis_id.to_string(),
            source_id: None,
        }
    }

    fn select(
        axis_id: &'static str,
    ) -> impl FnOnce(&Workspace, &ViewerInteractionState) -> Option<ActiveAxisSelection> + Send + 'static {
        move |_, _| {
            Some(ActiveAxisSelection {
                plot_id: "plot-1".to_string(),
                axis_id: axis_id.to_string(),
            })
        }
    }

    #[test]
    fn ensure_snapshot_creates_revision_zero_once() {
        let store = StateStore::new();
        let first = store.ensure_snapshot(DATASET, "time");
        assert_eq!(first.revision, 0);
        assert_eq!(first.viewer_state.active_axis("plot-1"), Some("y1"));
        let again = store.ensure_snapshot(DATASET, "other");
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn commits_are_gapless_and_failed_ones_leave_state_alone() {
        let store = StateStore::new();
        store.ensure_snapshot(DATASET, "time");
        let one = action(&store, add_axis());
        let two = action(&store, add_trace("vin", "y2"));
        assert_eq!((one.previous.revision, one.next.revision), (0, 1));
        assert_eq!(two.next.revision, 2);
        assert_eq!(two.reason, "trace/add");

        let failed = store.commit_transaction(Transaction::from_action(DATASET, add_trace("vout", "y9")));
        assert!(failed.is_err());
        let current = store.snapshot(DATASET).unwrap();
        assert_eq!(current.revision, 2);
        assert!(Arc::ptr_eq(&current, &two.next));
    }

    #[test]
    fn untracked_path_needs_default_x_signal() {
        let store = StateStore::new();
        let err = store
            .commit_transaction(Transaction::from_action("/other.csv", add_axis()))
            .unwrap_err();
        assert!(matches!(&err, SyncError::UntrackedDataset(path) if path == "/other.csv"), "{err}");

        let outcome = store
            .commit_transaction(Transaction::from_action("/other.csv", add_axis()).with_default_x_signal("t"))
            .unwrap();
        assert_eq!(outcome.previous.revision, 0);
        assert_eq!(outcome.next.revision, 1);
        assert_eq!(outcome.next.workspace.plots[0].x_signal, "t");
    }

    #[test]
    fn active_axis_survives_unrelated_changes_and_override_applies() {
        let store = StateStore::new();
        store.ensure_snapshot(DATASET, "time");
        let outcome = store
            .commit_transaction(Transaction::from_action(DATASET, add_axis()).with_active_axis(select("y2")))
            .unwrap();
        assert_eq!(outcome.next.viewer_state.active_axis("plot-1"), Some("y2"));

        let outcome = action(&store, add_trace("vin", "y1"));
        assert_eq!(outcome.next.viewer_state.active_axis("plot-1"), Some("y2"));

        let outcome = store
            .commit_transaction(Transaction::from_action(DATASET, add_axis()).with_active_axis(select("y42")))
            .unwrap();
        assert_eq!(outcome.next.viewer_state.active_axis("plot-1"), Some("y2"));
    }

    #[test]
    fn removed_active_axis_follows_majority_of_its_traces() {
        let store = StateStore::new();
        store.ensure_snapshot(DATASET, "time");
        action(&store, add_axis());
        action(&store, add_axis());
        action(&store, add_trace("a", "y3"));
        action(&store, add_trace("b", "y3"));
        action(&store, add_trace("c", "y3"));
        let outcome = store
            .commit_transaction(Transaction::from_action(DATASET, add_trace("d", "y1")).with_active_axis(select("y3")))
            .unwrap();
        assert_eq!(outcome.next.viewer_state.active_axis("plot-1"), Some("y3"));

        // Two of y3's traces go to y2, one to y1, then y3 is removed.
        let outcome = store
            .commit_transaction(Transaction::new(DATASET, "move and remove", |workspace, _| {
                let mut next = workspace.clone();
                let plot = Arc::make_mut(&mut next.plots[0]);
                for (trace_id, axis_id) in [("trace-1", "y2"), ("trace-2", "y1"), ("trace-3", "y2")] {
                    if let Some(trace) = plot.traces.iter_mut().find(|t| t.id == trace_id) {
                        trace.axis_id = axis_id.to_string();
                    }
                }
                plot.axes.retain(|axis| axis.id != "y3");
                Ok(next)
            }))
            .unwrap();
        assert_eq!(outcome.next.viewer_state.active_axis("plot-1"), Some("y2"));
    }

    #[test]
    fn majority_tie_goes_to_earliest_lane() {
        let store = StateStore::new();
        store.ensure_snapshot(DATASET, "time");
        action(&store, add_axis());
        action(&store, add_axis());
        action(&store, add_trace("a", "y2"));
        store
            .commit_transaction(Transaction::from_action(DATASET, add_trace("b", "y2")).with_active_axis(select("y2")))
            .unwrap();
        action(
            &store,
            WorkspaceAction::AxisReorder {
                plot_id: "plot-1".to_string(),
                axis_id: "y3".to_string(),
                to_index: 0,
            },
        );

        let outcome = store
            .commit_transaction(Transaction::new(DATASET, "split and remove", |workspace, _| {
                let mut next = workspace.clone();
                let plot = Arc::make_mut(&mut next.plots[0]);
                plot.traces[0].axis_id = "y1".to_string();
                plot.traces[1].axis_id = "y3".to_string();
                plot.axes.retain(|axis| axis.id != "y2");
                Ok(next)
            }))
            .unwrap();
        // Lane order is now y3, y1.
        assert_eq!(outcome.next.viewer_state.active_axis("plot-1"), Some("y3"));
    }

    #[test]
    fn removed_active_axis_without_traces_falls_back_to_first_lane() {
        let store = StateStore::new();
        store.ensure_snapshot(DATASET, "time");
        store
            .commit_transaction(Transaction::from_action(DATASET, add_axis()).with_active_axis(select("y2")))
            .unwrap();
        let outcome = action(
            &store,
            WorkspaceAction::AxisRemove {
                plot_id: "plot-1".to_string(),
                axis_id: "y2".to_string(),
                reassign_to: None,
            },
        );
        assert_eq!(outcome.next.viewer_state.active_axis("plot-1"), Some("y1"));
    }

    #[test]
    fn free_form_mutator_cannot_commit_invalid_workspace() {
        let store = StateStore::new();
        store.ensure_snapshot(DATASET, "time");
        let result = store.commit_transaction(Transaction::new(DATASET, "break", |workspace, _| {
            let mut next = workspace.clone();
            Arc::make_mut(&mut next.plots[0]).axes.clear();
            Ok(next)
        }));
        assert!(matches!(
            result,
            Err(SyncError::Validation(ValidationError::InvalidWorkspace(_)))
        ));
        assert_eq!(store.snapshot(DATASET).unwrap().revision, 0);
    }

    #[test]
    fn concurrent_commits_stay_gapless() {
        let store = Arc::new(StateStore::new());
        store.ensure_snapshot(DATASET, "time");
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| action(&store, add_trace(&format!("s{n}"), "y1")).next.revision)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut revisions: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        revisions.sort_unstable();
        assert_eq!(revisions, (1..=200).collect::<Vec<_>>());
        assert_eq!(store.snapshot(DATASET).unwrap().workspace.plots[0].traces.len(), 200);
    }
}
