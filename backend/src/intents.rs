//! Translation of viewer intents into state store transactions.

use shared::protocol::{DropTarget, ViewerIntent};
use shared::workspace::{Plot, ViewerInteractionState, Workspace};

use crate::reducer::{ValidationError, WorkspaceAction, reduce, reduce_all};
use crate::state_store::{ActiveAxisSelection, Transaction};

/// Builds the transaction for `intent` against `dataset_path`. The
/// transaction's reason is the intent's wire type.
pub fn intent_transaction(dataset_path: &str, intent: ViewerIntent) -> Transaction {
    let reason = intent.message_type();
    match intent {
        ViewerIntent::DropSignal {
            plot_id,
            signal,
            target,
        } => drop_signal(dataset_path, reason, plot_id, signal, target),
        ViewerIntent::SetActiveAxis { plot_id, axis_id } => {
            let check_plot = plot_id.clone();
            let check_axis = axis_id.clone();
            Transaction::new(dataset_path, reason, move |workspace, _| {
                lookup_axis(workspace, &check_plot, &check_axis)?;
                Ok(workspace.clone())
            })
            .with_active_axis(move |_, _| Some(ActiveAxisSelection { plot_id, axis_id }))
        }
        ViewerIntent::AddAxis { plot_id } => {
            let select_plot = plot_id.clone();
            action_transaction(
                dataset_path,
                reason,
                WorkspaceAction::AxisAdd {
                    plot_id,
                    after_axis_id: None,
                },
            )
            .with_active_axis(move |workspace, _| {
                let axis = workspace.plot(&select_plot)?.axes.last()?;
                Some(ActiveAxisSelection {
                    plot_id: select_plot.clone(),
                    axis_id: axis.id.clone(),
                })
            })
        }
        ViewerIntent::ReorderAxis {
            plot_id,
            axis_id,
            to_index,
        } => action_transaction(
            dataset_path,
            reason,
            WorkspaceAction::AxisReorder {
                plot_id,
                axis_id,
                to_index,
            },
        ),
        ViewerIntent::RemoveAxisAndTraces { plot_id, axis_id } => {
            Transaction::new(dataset_path, reason, move |workspace, _| {
                let plot = lookup_plot(workspace, &plot_id)?;
                lookup_axis(workspace, &plot_id, &axis_id)?;
                let mut actions: Vec<WorkspaceAction> = plot
                    .traces_on_axis(&axis_id)
                    .map(|trace| WorkspaceAction::TraceRemove {
                        plot_id: plot_id.clone(),
                        trace_id: trace.id.clone(),
                    })
                    .collect();
                actions.push(WorkspaceAction::AxisRemove {
                    plot_id: plot_id.clone(),
                    axis_id: axis_id.clone(),
                    reassign_to: None,
                });
                reduce_all(workspace, &actions)
            })
        }
        ViewerIntent::SetTraceVisible {
            plot_id,
            trace_id,
            visible,
        } => action_transaction(
            dataset_path,
            reason,
            WorkspaceAction::TraceSetVisible {
                plot_id,
                trace_id,
                visible,
            },
        ),
        ViewerIntent::RemoveTrace { plot_id, trace_id } => {
            action_transaction(dataset_path, reason, WorkspaceAction::TraceRemove { plot_id, trace_id })
        }
        ViewerIntent::SetActivePlot { plot_id } => {
            action_transaction(dataset_path, reason, WorkspaceAction::PlotSetActive { plot_id })
        }
        ViewerIntent::AddPlot { name } => {
            action_transaction(dataset_path, reason, WorkspaceAction::PlotAdd { name, x_signal: None })
        }
        ViewerIntent::RemovePlot { plot_id } => {
            action_transaction(dataset_path, reason, WorkspaceAction::PlotRemove { plot_id })
        }
        ViewerIntent::RenamePlot { plot_id, name } => {
            action_transaction(dataset_path, reason, WorkspaceAction::PlotRename { plot_id, name })
        }
        ViewerIntent::ClearPlot { plot_id } => {
            action_transaction(dataset_path, reason, WorkspaceAction::PlotClear { plot_id })
        }
    }
}

/// The signal a drop intent adds, if any.
pub fn dropped_signal(intent: &ViewerIntent) -> Option<&str> {
    match intent {
        ViewerIntent::DropSignal { signal, .. } => Some(signal),
        _ => None,
    }
}

fn action_transaction(dataset_path: &str, reason: &str, action: WorkspaceAction) -> Transaction {
    Transaction::new(dataset_path, reason, move |workspace, _| reduce(workspace, &action))
}

/// Adds `signal` as a trace on the resolved target lane and makes that lane
/// active. Without an explicit plot the active plot is used.
fn drop_signal(
    dataset_path: &str,
    reason: &str,
    plot_id: Option<String>,
    signal: String,
    target: DropTarget,
) -> Transaction {
    let selected_plot = plot_id.clone();
    Transaction::new(dataset_path, reason, move |workspace, viewer_state| {
        let plot_id = plot_id.unwrap_or_else(|| workspace.active_plot_id.clone());
        let plot = lookup_plot(workspace, &plot_id)?;
        let (workspace, axis_id) = match target {
            DropTarget::ActiveAxis => (workspace.clone(), active_axis(plot, viewer_state)),
            DropTarget::Axis { axis_id } => {
                lookup_axis(workspace, &plot_id, &axis_id)?;
                (workspace.clone(), axis_id)
            }
            DropTarget::NewAxis => {
                let axis_id = plot.next_axis_id();
                let after_axis_id = plot.axes.last().map(|axis| axis.id.clone());
                let with_axis = reduce(
                    workspace,
                    &WorkspaceAction::AxisAdd {
                        plot_id: plot_id.clone(),
                        after_axis_id,
                    },
                )?;
                (with_axis, axis_id)
            }
        };
        reduce(
            &workspace,
            &WorkspaceAction::TraceAdd {
                plot_id,
                signal,
                axis_id,
                source_id: None,
            },
        )
    })
    .with_active_axis(move |workspace, _| {
        // The lane holding the newest trace is the one the signal landed on.
        let plot_id = selected_plot.unwrap_or_else(|| workspace.active_plot_id.clone());
        let newest = workspace
            .plot(&plot_id)?
            .traces
            .iter()
            .max_by_key(|trace| trace_number(&trace.id))?;
        Some(ActiveAxisSelection {
            axis_id: newest.axis_id.clone(),
            plot_id,
        })
    })
}

fn trace_number(trace_id: &str) -> u32 {
    shared::workspace::parse_id_number(trace_id, shared::workspace::TRACE_ID_PREFIX).unwrap_or(0)
}

fn active_axis(plot: &Plot, viewer_state: &ViewerInteractionState) -> String {
    viewer_state
        .active_axis(&plot.id)
        .filter(|axis_id| plot.has_axis(axis_id))
        .map(str::to_string)
        .or_else(|| plot.axes.first().map(|axis| axis.id.clone()))
        .unwrap_or_default()
}

fn lookup_plot<'a>(workspace: &'a Workspace, plot_id: &str) -> Result<&'a Plot, ValidationError> {
    workspace
        .plot(plot_id)
        .ok_or_else(|| ValidationError::UnknownPlot(plot_id.to_string()))
}

fn lookup_axis(workspace: &Workspace, plot_id: &str, axis_id: &str) -> Result<(), ValidationError> {
    let plot = lookup_plot(workspace, plot_id)?;
    if plot.has_axis(axis_id) {
        Ok(())
    } else {
        Err(ValidationError::UnknownAxis {
            plot_id: plot_id.to_string(),
            axis_id: axis_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::state_store::{CommitOutcome, StateStore};

    const DATASET: &str = "/data/run.csv";

    fn commit(store: &StateStore, intent: ViewerIntent) -> Result<CommitOutcome, SyncError> {
        store.commit_transaction(intent_transaction(DATASET, intent))
    }

    fn drop_intent(signal: &str, target: DropTarget) -> ViewerIntent {
        ViewerIntent::DropSignal {
            plot_id: None,
            signal: signal.to_string(),
            target,
        }
    }

    fn store() -> StateStore {
        let store = StateStore::new();
        store.ensure_snapshot(DATASET, "time");
        store
    }

    #[test]
    fn drop_onto_new_axis_creates_lane_and_activates_it() {
        let store = store();
        let outcome = commit(&store, drop_intent("vin", DropTarget::NewAxis)).unwrap();
        assert_eq!(outcome.reason, "intent/dropSignal");
        let plot = &outcome.next.workspace.plots[0];
        assert_eq!(plot.axes.len(), 2);
        assert_eq!(plot.traces[0].axis_id, "y2");
        assert_eq!(outcome.next.viewer_state.active_axis("plot-1"), Some("y2"));

        // Follow-up drops land on the now-active lane.
        let outcome = commit(&store, drop_intent("vout", DropTarget::ActiveAxis)).unwrap();
        assert_eq!(outcome.next.workspace.plots[0].traces[1].axis_id, "y2");
    }

    #[test]
    fn drop_onto_explicit_axis_activates_it() {
        let store = store();
        commit(&store, ViewerIntent::AddAxis { plot_id: "plot-1".to_string() }).unwrap();
        let outcome = commit(
            &store,
            drop_intent(
                "iout",
                DropTarget::Axis {
                    axis_id: "y1".to_string(),
                },
            ),
        )
        .unwrap();
        assert_eq!(outcome.next.viewer_state.active_axis("plot-1"), Some("y1"));

        let err = commit(
            &store,
            drop_intent(
                "iout",
                DropTarget::Axis {
                    axis_id: "y9".to_string(),
                },
            ),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Validation(ValidationError::UnknownAxis { .. })));
    }

    #[test]
    fn add_axis_selects_the_new_lane() {
        let store = store();
        let outcome = commit(&store, ViewerIntent::AddAxis { plot_id: "plot-1".to_string() }).unwrap();
        assert_eq!(outcome.next.viewer_state.active_axis("plot-1"), Some("y2"));
    }

    #[test]
    fn set_active_axis_bumps_revision_without_changing_workspace() {
        let store = store();
        commit(&store, ViewerIntent::AddAxis { plot_id: "plot-1".to_string() }).unwrap();
        let outcome = commit(
            &store,
            ViewerIntent::SetActiveAxis {
                plot_id: "plot-1".to_string(),
                axis_id: "y1".to_string(),
            },
        )
        .unwrap();
        assert_eq!(outcome.next.revision, 2);
        assert_eq!(outcome.next.workspace, outcome.previous.workspace);
        assert_eq!(outcome.next.viewer_state.active_axis("plot-1"), Some("y1"));

        assert!(
            commit(
                &store,
                ViewerIntent::SetActiveAxis {
                    plot_id: "plot-1".to_string(),
                    axis_id: "y7".to_string(),
                },
            )
            .is_err()
        );
    }

    #[test]
    fn remove_axis_and_traces_drops_its_traces_only() {
        let store = store();
        commit(&store, drop_intent("a", DropTarget::ActiveAxis)).unwrap();
        commit(&store, drop_intent("b", DropTarget::NewAxis)).unwrap();
        commit(&store, drop_intent("c", DropTarget::ActiveAxis)).unwrap();
        let outcome = commit(
            &store,
            ViewerIntent::RemoveAxisAndTraces {
                plot_id: "plot-1".to_string(),
                axis_id: "y2".to_string(),
            },
        )
        .unwrap();
        let plot = &outcome.next.workspace.plots[0];
        assert_eq!(plot.axes.len(), 1);
        let signals: Vec<_> = plot.traces.iter().map(|t| t.signal.as_str()).collect();
        assert_eq!(signals, vec!["a"]);
        assert_eq!(outcome.next.viewer_state.active_axis("plot-1"), Some("y1"));
    }

    #[test]
    fn plot_intents_map_onto_reducer_actions() {
        let store = store();
        commit(&store, ViewerIntent::AddPlot { name: Some("Spectrum".to_string()) }).unwrap();
        commit(
            &store,
            ViewerIntent::RenamePlot {
                plot_id: "plot-1".to_string(),
                name: "Supply".to_string(),
            },
        )
        .unwrap();
        let outcome = commit(&store, ViewerIntent::SetActivePlot { plot_id: "plot-1".to_string() }).unwrap();
        let workspace = &outcome.next.workspace;
        assert_eq!(workspace.active_plot_id, "plot-1");
        assert_eq!(workspace.plots[0].name, "Supply");
        assert_eq!(workspace.plots[1].name, "Spectrum");
        assert_eq!(outcome.next.viewer_state.active_plot_id, "plot-1");

        let outcome = commit(&store, ViewerIntent::RemovePlot { plot_id: "plot-2".to_string() }).unwrap();
        assert_eq!(outcome.next.workspace.plots.len(), 1);
        assert_eq!(dropped_signal(&drop_intent("vin", DropTarget::NewAxis)), Some("vin"));
    }
}
