//! Layout sidecar documents: the on-disk form of a dataset's workspace.
//!
//! The document is YAML so it stays pleasant to edit by hand or by external
//! tools. Exported text fed back through [`import_spec`] reproduces an equal
//! workspace.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::workspace::{Workspace, validate_workspace};

/// Current layout document schema version.
pub const LAYOUT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("unsupported layout schema version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("layout references signals missing from the dataset: {}", .0.join(", "))]
    MissingSignals(Vec<String>),
    #[error("malformed layout document: {0}")]
    Malformed(String),
    #[error("invalid workspace in layout document: {0}")]
    InvalidWorkspace(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
struct LayoutDocument {
    version: u32,
    dataset: String,
    workspace: Workspace,
}

#[derive(Deserialize)]
struct LayoutHeader {
    version: u32,
    dataset: String,
}

/// Result of a successful import.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedLayout {
    pub dataset_path: String,
    pub workspace: Workspace,
}

pub fn is_supported_version(version: u32) -> bool {
    version == LAYOUT_SCHEMA_VERSION
}

/// Serializes a workspace together with the dataset it belongs to.
pub fn export_spec(dataset_path: &str, workspace: &Workspace) -> Result<String, SpecError> {
    let document = LayoutDocument {
        version: LAYOUT_SCHEMA_VERSION,
        dataset: dataset_path.to_string(),
        workspace: workspace.clone(),
    };
    serde_yaml::to_string(&document).map_err(|e| SpecError::Malformed(e.to_string()))
}

/// Reads only the schema version and dataset path, so the caller can load the
/// dataset before a full import.
pub fn peek_dataset_path(text: &str) -> Result<String, SpecError> {
    let header: LayoutHeader =
        serde_yaml::from_str(text).map_err(|e| SpecError::Malformed(e.to_string()))?;
    check_version(header.version)?;
    Ok(header.dataset)
}

/// Parses a layout document and checks it against the signals the dataset
/// actually provides.
pub fn import_spec<S: AsRef<str>>(text: &str, available_signals: &[S]) -> Result<ImportedLayout, SpecError> {
    let header: LayoutHeader =
        serde_yaml::from_str(text).map_err(|e| SpecError::Malformed(e.to_string()))?;
    check_version(header.version)?;

    let document: LayoutDocument =
        serde_yaml::from_str(text).map_err(|e| SpecError::Malformed(e.to_string()))?;
    validate_workspace(&document.workspace).map_err(SpecError::InvalidWorkspace)?;

    let available: HashSet<&str> = available_signals.iter().map(|s| s.as_ref()).collect();
    let missing: Vec<String> = document
        .workspace
        .referenced_signals()
        .into_iter()
        .filter(|signal| !available.contains(signal.as_str()))
        .collect();
    if !missing.is_empty() {
        return Err(SpecError::MissingSignals(missing));
    }

    Ok(ImportedLayout {
        dataset_path: document.dataset,
        workspace: document.workspace,
    })
}

fn check_version(version: u32) -> Result<(), SpecError> {
    if is_supported_version(version) {
        Ok(())
    } else {
        Err(SpecError::UnsupportedVersion {
            found: version,
            supported: LAYOUT_SCHEMA_VERSION,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{Axis, AxisRange, AxisScale, Plot, Trace};
    use std::sync::Arc;

    fn sample_workspace() -> Workspace {
        let mut plot = Plot::new("plot-1".to_string(), "Supply".to_string(), "time".to_string());
        plot.x_range = Some(AxisRange::new(0.0, 1.5e-3));
        plot.axes.push(Axis {
            id: "y2".to_string(),
            title: Some("Current".to_string()),
            range: Some(AxisRange::new(-0.25, 0.125)),
            scale: Some(AxisScale::Log),
        });
        plot.next_axis_number = 3;
        plot.traces.push(Trace {
            id: "trace-1".to_string(),
            signal: "vin".to_string(),
            axis_id: "y1".to_string(),
            visible: true,
            source_id: Some("sim.csv::vin".to_string()),
            color: Some("#ff8800".to_string()),
            line_width: Some(1.5),
        });
        plot.traces.push(Trace {
            id: "trace-2".to_string(),
            signal: "iout".to_string(),
            axis_id: "y2".to_string(),
            visible: false,
            source_id: None,
            color: None,
            line_width: None,
        });
        plot.next_trace_number = 3;
        let second = Plot::new("plot-2".to_string(), "Empty".to_string(), "time".to_string());
        Workspace {
            active_plot_id: "plot-2".to_string(),
            plots: vec![Arc::new(plot), Arc::new(second)],
        }
    }

    #[test]
    fn export_then_import_reproduces_workspace() {
        let workspace = sample_workspace();
        let text = export_spec("runs/sim.csv", &workspace).unwrap();
        let imported = import_spec(&text, &["time", "vin", "iout"]).unwrap();
        assert_eq!(imported.dataset_path, "runs/sim.csv");
        assert_eq!(imported.workspace, workspace);
    }

    #[test]
    fn import_reports_missing_signals() {
        let text = export_spec("sim.csv", &sample_workspace()).unwrap();
        match import_spec(&text, &["time", "vin"]) {
            Err(SpecError::MissingSignals(missing)) => assert_eq!(missing, vec!["iout".to_string()]),
            other => panic!("expected missing signals, got {other:?}"),
        }
    }

    #[test]
    fn import_rejects_unknown_schema_version() {
        let text = export_spec("sim.csv", &sample_workspace())
            .unwrap()
            .replacen("version: 1", "version: 7", 1);
        assert!(matches!(
            import_spec(&text, &["time", "vin", "iout"]),
            Err(SpecError::UnsupportedVersion { found: 7, .. })
        ));
        assert!(peek_dataset_path(&text).is_err());
    }

    #[test]
    fn import_rejects_structurally_invalid_workspace() {
        let text = "version: 1\ndataset: sim.csv\nworkspace:\n  activePlotId: plot-9\n  plots: []\n";
        assert!(matches!(import_spec(text, &["time"]), Err(SpecError::InvalidWorkspace(_))));
    }

    #[test]
    fn peek_reads_dataset_without_signal_check() {
        let text = export_spec("../data/run.csv", &sample_workspace()).unwrap();
        assert_eq!(peek_dataset_path(&text).unwrap(), "../data/run.csv");
    }

    #[test]
    fn hand_written_layout_defaults_trace_counter() {
        let text = r#"
version: 1
dataset: sim.csv
workspace:
  activePlotId: plot-1
  plots:
    - id: plot-1
      name: Plot 1
      xSignal: time
      axes:
        - id: y1
      traces:
        - id: trace-4
          signal: vin
          axisId: y1
          visible: true
      nextAxisNumber: 2
"#;
        let imported = import_spec(text, &["time", "vin"]).unwrap();
        let plot = imported.workspace.active_plot().unwrap();
        assert_eq!(plot.next_trace_number, 1);
        assert_eq!(plot.next_trace_id(), "trace-5");
    }
}
