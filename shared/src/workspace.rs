use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

pub const PLOT_ID_PREFIX: &str = "plot-";
pub const AXIS_ID_PREFIX: &str = "y";
pub const TRACE_ID_PREFIX: &str = "trace-";

// ===== WORKSPACE AGGREGATE =====

/// Plot configuration for one dataset.
///
/// Plots are held behind `Arc` so that a mutation of one plot leaves its
/// siblings shared between the previous and the next workspace.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub active_plot_id: String,
    pub plots: Vec<Arc<Plot>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Plot {
    pub id: String,
    pub name: String,
    pub x_signal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_range: Option<AxisRange>,
    /// Lanes, top to bottom.
    pub axes: Vec<Axis>,
    pub traces: Vec<Trace>,
    pub next_axis_number: u32,
    #[serde(default = "first_id_number")]
    pub next_trace_number: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Axis {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<AxisRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<AxisScale>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
}

impl AxisRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min < self.max
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AxisScale {
    Linear,
    Log,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub id: String,
    pub signal: String,
    pub axis_id: String,
    pub visible: bool,
    /// Opaque key tying the trace to a dataset and signal when it was injected
    /// outside the normal load path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_width: Option<f64>,
}

fn first_id_number() -> u32 {
    1
}

// ===== VIEWER INTERACTION STATE =====

/// Ephemeral per-viewer focus state derived alongside every revision.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ViewerInteractionState {
    pub active_plot_id: String,
    pub active_axis_by_plot: BTreeMap<String, String>,
}

impl ViewerInteractionState {
    pub fn active_axis(&self, plot_id: &str) -> Option<&str> {
        self.active_axis_by_plot.get(plot_id).map(String::as_str)
    }
}

// ===== CONSTRUCTION & LOOKUP =====

impl Workspace {
    /// The workspace created on first load of a dataset: one plot with one axis.
    pub fn new_default(x_signal: &str) -> Self {
        let plot = Plot::new(format!("{PLOT_ID_PREFIX}1"), "Plot 1".to_string(), x_signal.to_string());
        Self {
            active_plot_id: plot.id.clone(),
            plots: vec![Arc::new(plot)],
        }
    }

    pub fn plot(&self, plot_id: &str) -> Option<&Plot> {
        self.plots.iter().find(|plot| plot.id == plot_id).map(Arc::as_ref)
    }

    pub fn plot_index(&self, plot_id: &str) -> Option<usize> {
        self.plots.iter().position(|plot| plot.id == plot_id)
    }

    pub fn active_plot(&self) -> Option<&Plot> {
        self.plot(&self.active_plot_id)
    }

    /// Every signal referenced by a plot X axis or a trace, in first-seen order.
    pub fn referenced_signals(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut signals = Vec::new();
        for plot in &self.plots {
            let names = std::iter::once(&plot.x_signal).chain(plot.traces.iter().map(|t| &t.signal));
            for name in names {
                if seen.insert(name.clone()) {
                    signals.push(name.clone());
                }
            }
        }
        signals
    }

    /// Next plot id, never colliding with a live plot.
    pub fn next_plot_id(&self) -> String {
        let next = next_id_number(self.plots.iter().map(|plot| plot.id.as_str()), PLOT_ID_PREFIX, 1);
        format!("{PLOT_ID_PREFIX}{next}")
    }
}

impl Plot {
    pub fn new(id: String, name: String, x_signal: String) -> Self {
        Self {
            id,
            name,
            x_signal,
            x_range: None,
            axes: vec![Axis::new(format!("{AXIS_ID_PREFIX}1"))],
            traces: Vec::new(),
            next_axis_number: 2,
            next_trace_number: 1,
        }
    }

    pub fn axis(&self, axis_id: &str) -> Option<&Axis> {
        self.axes.iter().find(|axis| axis.id == axis_id)
    }

    pub fn axis_index(&self, axis_id: &str) -> Option<usize> {
        self.axes.iter().position(|axis| axis.id == axis_id)
    }

    pub fn has_axis(&self, axis_id: &str) -> bool {
        self.axis(axis_id).is_some()
    }

    pub fn trace(&self, trace_id: &str) -> Option<&Trace> {
        self.traces.iter().find(|trace| trace.id == trace_id)
    }

    pub fn traces_on_axis<'a>(&'a self, axis_id: &'a str) -> impl Iterator<Item = &'a Trace> + 'a {
        self.traces.iter().filter(move |trace| trace.axis_id == axis_id)
    }

    /// Number backing the next axis id: the counter, bumped past any id seen in
    /// the plot so a hand-edited layout cannot cause reuse.
    pub fn next_axis_number(&self) -> u32 {
        next_id_number(self.axes.iter().map(|axis| axis.id.as_str()), AXIS_ID_PREFIX, self.next_axis_number)
    }

    pub fn next_axis_id(&self) -> String {
        format!("{AXIS_ID_PREFIX}{}", self.next_axis_number())
    }

    pub fn next_trace_number(&self) -> u32 {
        next_id_number(self.traces.iter().map(|trace| trace.id.as_str()), TRACE_ID_PREFIX, self.next_trace_number)
    }

    pub fn next_trace_id(&self) -> String {
        format!("{TRACE_ID_PREFIX}{}", self.next_trace_number())
    }
}

impl Axis {
    pub fn new(id: String) -> Self {
        Self {
            id,
            title: None,
            range: None,
            scale: None,
        }
    }
}

/// Parses `<prefix><n>` ids, returning `n`.
pub fn parse_id_number(id: &str, prefix: &str) -> Option<u32> {
    id.strip_prefix(prefix)?.parse::<u32>().ok()
}

/// `max(floor, max(n)+1)` over the ids matching `<prefix><n>`.
pub fn next_id_number<'a>(ids: impl Iterator<Item = &'a str>, prefix: &str, floor: u32) -> u32 {
    ids.filter_map(|id| parse_id_number(id, prefix))
        .map(|n| n.saturating_add(1))
        .fold(floor.max(1), u32::max)
}

// ===== STRUCTURAL VALIDATION =====

/// Checks every structural invariant of a workspace, returning the first
/// violation found.
pub fn validate_workspace(workspace: &Workspace) -> Result<(), String> {
    if workspace.plots.is_empty() {
        return Err("workspace has no plots".to_string());
    }
    if workspace.plot(&workspace.active_plot_id).is_none() {
        return Err(format!("active plot '{}' does not exist", workspace.active_plot_id));
    }

    let mut plot_ids = HashSet::new();
    for plot in &workspace.plots {
        if !plot_ids.insert(plot.id.as_str()) {
            return Err(format!("duplicate plot id '{}'", plot.id));
        }
        validate_plot(plot)?;
    }
    Ok(())
}

fn validate_plot(plot: &Plot) -> Result<(), String> {
    if plot.axes.is_empty() {
        return Err(format!("plot '{}' has no axes", plot.id));
    }
    if let Some(range) = &plot.x_range {
        if !range.is_valid() {
            return Err(format!("plot '{}' has an invalid X range", plot.id));
        }
    }

    let mut axis_ids = HashSet::new();
    for axis in &plot.axes {
        if !axis_ids.insert(axis.id.as_str()) {
            return Err(format!("duplicate axis id '{}' in plot '{}'", axis.id, plot.id));
        }
        if axis.range.as_ref().is_some_and(|range| !range.is_valid()) {
            return Err(format!("axis '{}' in plot '{}' has an invalid range", axis.id, plot.id));
        }
    }

    let mut trace_ids = HashSet::new();
    for trace in &plot.traces {
        if !trace_ids.insert(trace.id.as_str()) {
            return Err(format!("duplicate trace id '{}' in plot '{}'", trace.id, plot.id));
        }
        if !axis_ids.contains(trace.axis_id.as_str()) {
            return Err(format!(
                "trace '{}' references unknown axis '{}' in plot '{}'",
                trace.id, trace.axis_id, plot.id
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_workspace_has_one_plot_and_one_axis() {
        let workspace = Workspace::new_default("time");
        assert_eq!(workspace.plots.len(), 1);
        let plot = workspace.active_plot().unwrap();
        assert_eq!(plot.id, "plot-1");
        assert_eq!(plot.x_signal, "time");
        assert_eq!(plot.axes.len(), 1);
        assert_eq!(plot.axes[0].id, "y1");
        assert_eq!(plot.next_axis_id(), "y2");
        assert!(validate_workspace(&workspace).is_ok());
    }

    #[test]
    fn id_allocation_skips_past_counter_and_existing_ids() {
        let ids = ["y1", "y7", "other", "y3"];
        assert_eq!(next_id_number(ids.iter().copied(), "y", 2), 8);
        assert_eq!(next_id_number(ids.iter().copied(), "y", 12), 12);
        assert_eq!(next_id_number(std::iter::empty(), "trace-", 0), 1);
    }

    #[test]
    fn validation_rejects_dangling_trace_axis() {
        let mut workspace = Workspace::new_default("time");
        let plot = Arc::make_mut(&mut workspace.plots[0]);
        plot.traces.push(Trace {
            id: "trace-1".to_string(),
            signal: "vin".to_string(),
            axis_id: "y9".to_string(),
            visible: true,
            source_id: None,
            color: None,
            line_width: None,
        });
        let err = validate_workspace(&workspace).unwrap_err();
        assert!(err.contains("unknown axis 'y9'"));
    }

    #[test]
    fn referenced_signals_are_deduplicated() {
        let mut workspace = Workspace::new_default("time");
        let plot = Arc::make_mut(&mut workspace.plots[0]);
        for (n, signal) in ["vin", "time", "vin"].iter().enumerate() {
            plot.traces.push(Trace {
                id: format!("trace-{}", n + 1),
                signal: signal.to_string(),
                axis_id: "y1".to_string(),
                visible: true,
                source_id: None,
                color: None,
                line_width: None,
            });
        }
        assert_eq!(workspace.referenced_signals(), vec!["time".to_string(), "vin".to_string()]);
    }
}
