//! Workspace reducer: the closed set of mutations on a [`Workspace`].
//!
//! Every action takes the current workspace by reference and returns a new
//! one, or a [`ValidationError`] naming the violated invariant. Only the plot
//! an action touches is cloned; sibling plots stay shared behind their `Arc`.

use shared::workspace::{Axis, AxisRange, AxisScale, Plot, PLOT_ID_PREFIX, Trace, Workspace, parse_id_number};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown plot id '{0}'")]
    UnknownPlot(String),
    #[error("unknown axis id '{axis_id}' in plot '{plot_id}'")]
    UnknownAxis { plot_id: String, axis_id: String },
    #[error("unknown trace id '{trace_id}' in plot '{plot_id}'")]
    UnknownTrace { plot_id: String, trace_id: String },
    #[error("cannot remove the only plot")]
    OnlyPlot,
    #[error("cannot remove the only axis of plot '{0}'")]
    OnlyAxis(String),
    #[error("traces still assigned to axis '{axis_id}' ({count}); a reassignment target is required")]
    TracesStillAssigned { axis_id: String, count: usize },
    #[error("axis reassignment target must differ from removed axis '{0}'")]
    ReassignToSelf(String),
    #[error("invalid range [{min}, {max}]: bounds must be finite with min < max")]
    InvalidRange { min: f64, max: f64 },
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("workspace invariant violated: {0}")]
    InvalidWorkspace(String),
}

/// Changes applied by `axis/update`. The outer `Option` selects whether a
/// field is touched; the inner one sets or clears it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AxisPatch {
    pub title: Option<Option<String>>,
    pub range: Option<Option<AxisRange>>,
    pub scale: Option<Option<AxisScale>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkspaceAction {
    PlotAdd {
        name: Option<String>,
        x_signal: Option<String>,
    },
    PlotRemove {
        plot_id: String,
    },
    PlotSetActive {
        plot_id: String,
    },
    PlotRename {
        plot_id: String,
        name: String,
    },
    PlotSetXSignal {
        plot_id: String,
        x_signal: String,
    },
    PlotSetXRange {
        plot_id: String,
        range: Option<AxisRange>,
    },
    AxisAdd {
        plot_id: String,
        /// Insert below this lane; appended when `None`.
        after_axis_id: Option<String>,
    },
    AxisReorder {
        plot_id: String,
        axis_id: String,
        to_index: usize,
    },
    AxisRemove {
        plot_id: String,
        axis_id: String,
        reassign_to: Option<String>,
    },
    AxisReassignTraces {
        plot_id: String,
        from_axis_id: String,
        to_axis_id: String,
    },
    AxisUpdate {
        plot_id: String,
        axis_id: String,
        patch: AxisPatch,
    },
    TraceAdd {
        plot_id: String,
        signal: String,
        axis_id: String,
        source_id: Option<String>,
    },
    TraceSetAxis {
        plot_id: String,
        trace_id: String,
        axis_id: String,
    },
    TraceSetVisible {
        plot_id: String,
        trace_id: String,
        visible: bool,
    },
    TraceRemove {
        plot_id: String,
        trace_id: String,
    },
    WorkspaceClearLayout {
        x_signal: String,
    },
    PlotClear {
        plot_id: String,
    },
}

impl WorkspaceAction {
    pub fn name(&self) -> &'static str {
        match self {
            WorkspaceAction::PlotAdd { .. } => "plot/add",
            WorkspaceAction::PlotRemove { .. } => "plot/remove",
            WorkspaceAction::PlotSetActive { .. } => "plot/setActive",
            WorkspaceAction::PlotRename { .. } => "plot/rename",
            WorkspaceAction::PlotSetXSignal { .. } => "plot/setXSignal",
            WorkspaceAction::PlotSetXRange { .. } => "plot/setXRange",
            WorkspaceAction::AxisAdd { .. } => "axis/add",
            WorkspaceAction::AxisReorder { .. } => "axis/reorder",
            WorkspaceAction::AxisRemove { .. } => "axis/remove",
            WorkspaceAction::AxisReassignTraces { .. } => "axis/reassignTraces",
            WorkspaceAction::AxisUpdate { .. } => "axis/update",
            WorkspaceAction::TraceAdd { .. } => "trace/add",
            WorkspaceAction::TraceSetAxis { .. } => "trace/setAxis",
            WorkspaceAction::TraceSetVisible { .. } => "trace/setVisible",
            WorkspaceAction::TraceRemove { .. } => "trace/remove",
            WorkspaceAction::WorkspaceClearLayout { .. } => "workspace/clearLayout",
            WorkspaceAction::PlotClear { .. } => "plot/clear",
        }
    }
}

/// Applies one action, returning the next workspace.
pub fn reduce(workspace: &Workspace, action: &WorkspaceAction) -> Result<Workspace, ValidationError> {
    match action {
        WorkspaceAction::PlotAdd { name, x_signal } => add_plot(workspace, name.as_deref(), x_signal.as_deref()),
        WorkspaceAction::PlotRemove { plot_id } => remove_plot(workspace, plot_id),
        WorkspaceAction::PlotSetActive { plot_id } => {
            plot_index(workspace, plot_id)?;
            Ok(Workspace {
                active_plot_id: plot_id.clone(),
                plots: workspace.plots.clone(),
            })
        }
        WorkspaceAction::PlotRename { plot_id, name } => {
            let name = name.trim();
            if name.is_empty() {
                return Err(ValidationError::Empty("plot name"));
            }
            update_plot(workspace, plot_id, |plot| {
                plot.name = name.to_string();
                Ok(())
            })
        }
        WorkspaceAction::PlotSetXSignal { plot_id, x_signal } => {
            if x_signal.trim().is_empty() {
                return Err(ValidationError::Empty("X signal"));
            }
            update_plot(workspace, plot_id, |plot| {
                if plot.x_signal != *x_signal {
                    plot.x_signal = x_signal.clone();
                    // A range in the old signal's units means nothing for the new one.
                    plot.x_range = None;
                }
                Ok(())
            })
        }
        WorkspaceAction::PlotSetXRange { plot_id, range } => {
            check_range(range.as_ref())?;
            update_plot(workspace, plot_id, |plot| {
                plot.x_range = *range;
                Ok(())
            })
        }
        WorkspaceAction::AxisAdd { plot_id, after_axis_id } => update_plot(workspace, plot_id, |plot| {
            let number = plot.next_axis_number();
            let axis = Axis::new(plot.next_axis_id());
            let position = match after_axis_id {
                Some(after) => axis_index(plot, after)? + 1,
                None => plot.axes.len(),
            };
            plot.axes.insert(position, axis);
            plot.next_axis_number = number + 1;
            Ok(())
        }),
        WorkspaceAction::AxisReorder {
            plot_id,
            axis_id,
            to_index,
        } => update_plot(workspace, plot_id, |plot| {
            let from = axis_index(plot, axis_id)?;
            let axis = plot.axes.remove(from);
            let to = (*to_index).min(plot.axes.len());
            plot.axes.insert(to, axis);
            Ok(())
        }),
        WorkspaceAction::AxisRemove {
            plot_id,
            axis_id,
            reassign_to,
        } => update_plot(workspace, plot_id, |plot| remove_axis(plot, axis_id, reassign_to.as_deref())),
        WorkspaceAction::AxisReassignTraces {
            plot_id,
            from_axis_id,
            to_axis_id,
        } => update_plot(workspace, plot_id, |plot| {
            axis_index(plot, from_axis_id)?;
            axis_index(plot, to_axis_id)?;
            if from_axis_id == to_axis_id {
                return Err(ValidationError::ReassignToSelf(from_axis_id.clone()));
            }
            reassign_traces(plot, from_axis_id, to_axis_id);
            Ok(())
        }),
        WorkspaceAction::AxisUpdate {
            plot_id,
            axis_id,
            patch,
        } => {
            if let Some(range) = &patch.range {
                check_range(range.as_ref())?;
            }
            update_plot(workspace, plot_id, |plot| {
                let index = axis_index(plot, axis_id)?;
                let axis = &mut plot.axes[index];
                if let Some(title) = &patch.title {
                    axis.title = title.clone().filter(|t| !t.trim().is_empty());
                }
                if let Some(range) = patch.range {
                    axis.range = range;
                }
                if let Some(scale) = patch.scale {
                    axis.scale = scale;
                }
                Ok(())
            })
        }
        WorkspaceAction::TraceAdd {
            plot_id,
            signal,
            axis_id,
            source_id,
        } => {
            if signal.trim().is_empty() {
                return Err(ValidationError::Empty("trace signal"));
            }
            update_plot(workspace, plot_id, |plot| {
                axis_index(plot, axis_id)?;
                let number = plot.next_trace_number();
                plot.traces.push(Trace {
                    id: plot.next_trace_id(),
                    signal: signal.clone(),
                    axis_id: axis_id.clone(),
                    visible: true,
                    source_id: source_id.clone(),
                    color: None,
                    line_width: None,
                });
                plot.next_trace_number = number + 1;
                Ok(())
            })
        }
        WorkspaceAction::TraceSetAxis {
            plot_id,
            trace_id,
            axis_id,
        } => update_plot(workspace, plot_id, |plot| {
            axis_index(plot, axis_id)?;
            let index = trace_index(plot, trace_id)?;
            plot.traces[index].axis_id = axis_id.clone();
            Ok(())
        }),
        WorkspaceAction::TraceSetVisible {
            plot_id,
            trace_id,
            visible,
        } => update_plot(workspace, plot_id, |plot| {
            let index = trace_index(plot, trace_id)?;
            plot.traces[index].visible = *visible;
            Ok(())
        }),
        WorkspaceAction::TraceRemove { plot_id, trace_id } => update_plot(workspace, plot_id, |plot| {
            let index = trace_index(plot, trace_id)?;
            plot.traces.remove(index);
            Ok(())
        }),
        WorkspaceAction::WorkspaceClearLayout { x_signal } => {
            if x_signal.trim().is_empty() {
                return Err(ValidationError::Empty("X signal"));
            }
            Ok(Workspace::new_default(x_signal))
        }
        WorkspaceAction::PlotClear { plot_id } => update_plot(workspace, plot_id, |plot| {
            plot.traces.clear();
            plot.axes.truncate(1);
            let first = Axis::new(plot.axes[0].id.clone());
            plot.axes[0] = first;
            Ok(())
        }),
    }
}

/// Applies actions in order, failing on the first rejected one.
pub fn reduce_all<'a>(
    workspace: &Workspace,
    actions: impl IntoIterator<Item = &'a WorkspaceAction>,
) -> Result<Workspace, ValidationError> {
    let mut current = workspace.clone();
    for action in actions {
        current = reduce(&current, action)?;
    }
    Ok(current)
}

fn add_plot(workspace: &Workspace, name: Option<&str>, x_signal: Option<&str>) -> Result<Workspace, ValidationError> {
    let id = workspace.next_plot_id();
    let number = parse_id_number(&id, PLOT_ID_PREFIX).unwrap_or(1);
    let name = match name.map(str::trim) {
        Some("") => return Err(ValidationError::Empty("plot name")),
        Some(name) => name.to_string(),
        None => format!("Plot {number}"),
    };
    let x_signal = x_signal
        .map(str::to_string)
        .or_else(|| workspace.active_plot().map(|plot| plot.x_signal.clone()))
        .ok_or(ValidationError::Empty("X signal"))?;

    let mut plots = workspace.plots.clone();
    plots.push(Arc::new(Plot::new(id.clone(), name, x_signal)));
    Ok(Workspace {
        active_plot_id: id,
        plots,
    })
}

fn remove_plot(workspace: &Workspace, plot_id: &str) -> Result<Workspace, ValidationError> {
    let index = plot_index(workspace, plot_id)?;
    if workspace.plots.len() == 1 {
        return Err(ValidationError::OnlyPlot);
    }
    let mut plots = workspace.plots.clone();
    plots.remove(index);
    let active_plot_id = if workspace.active_plot_id == plot_id {
        plots[index.min(plots.len() - 1)].id.clone()
    } else {
        workspace.active_plot_id.clone()
    };
    Ok(Workspace { active_plot_id, plots })
}

fn remove_axis(plot: &mut Plot, axis_id: &str, reassign_to: Option<&str>) -> Result<(), ValidationError> {
    let index = axis_index(plot, axis_id)?;
    if plot.axes.len() == 1 {
        return Err(ValidationError::OnlyAxis(plot.id.clone()));
    }
    match reassign_to {
        Some(target) if target == axis_id => return Err(ValidationError::ReassignToSelf(axis_id.to_string())),
        Some(target) => {
            axis_index(plot, target)?;
            reassign_traces(plot, axis_id, target);
        }
        None => {
            let count = plot.traces_on_axis(axis_id).count();
            if count > 0 {
                return Err(ValidationError::TracesStillAssigned {
                    axis_id: axis_id.to_string(),
                    count,
                });
            }
        }
    }
    plot.axes.remove(index);
    Ok(())
}

fn reassign_traces(plot: &mut Plot, from: &str, to: &str) {
    for trace in plot.traces.iter_mut().filter(|trace| trace.axis_id == from) {
        trace.axis_id = to.to_string();
    }
}

/// Clones the addressed plot, lets `change` edit the copy, and swaps it in.
fn update_plot(
    workspace: &Workspace,
    plot_id: &str,
    change: impl FnOnce(&mut Plot) -> Result<(), ValidationError>,
) -> Result<Workspace, ValidationError> {
    let index = plot_index(workspace, plot_id)?;
    let mut plot = Plot::clone(&workspace.plots[index]);
    change(&mut plot)?;
    let mut plots = workspace.plots.clone();
    plots[index] = Arc::new(plot);
    Ok(Workspace {
        active_plot_id: workspace.active_plot_id.clone(),
        plots,
    })
}

fn plot_index(workspace: &Workspace, plot_id: &str) -> Result<usize, ValidationError> {
    workspace
        .plot_index(plot_id)
        .ok_or_else(|| ValidationError::UnknownPlot(plot_id.to_string()))
}

fn axis_index(plot: &Plot, axis_id: &str) -> Result<usize, ValidationError> {
    plot.axis_index(axis_id).ok_or_else(|| ValidationError::UnknownAxis {
        plot_id: plot.id.clone(),
        axis_id: axis_id.to_string(),
    })
}

fn trace_index(plot: &Plot, trace_id: &str) -> Result<usize, ValidationError> {
    plot.traces
        .iter()
        .position(|trace| trace.id == trace_id)
        .ok_or_else(|| ValidationError::UnknownTrace {
            plot_id: plot.id.clone(),
            trace_id: trace_id.to_string(),
        })
}

fn check_range(range: Option<&AxisRange>) -> Result<(), ValidationError> {
    match range {
        Some(range) if !range.is_valid() => Err(ValidationError::InvalidRange {
            min: range.min,
            max: range.max,
        }),
        _ => Ok(()),
    }
}
