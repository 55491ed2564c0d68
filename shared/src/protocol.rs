//! Host↔viewer message protocol.
//!
//! Every message on the wire is an envelope `{version, type, payload}`.
//! Decoding is strict: an unknown version or type, or a payload that fails its
//! shape check, yields a [`ProtocolError`] which receivers log at debug level
//! and drop.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workspace::{ViewerInteractionState, Workspace};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("payload of '{message_type}' failed shape check: {reason}")]
    InvalidPayload { message_type: String, reason: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub version: u32,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(message_type: &str, payload: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type: message_type.to_string(),
            payload,
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }

    pub fn to_json(&self) -> String {
        // An envelope is plain JSON values all the way down.
        serde_json::to_string(self).unwrap_or_default()
    }

    fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolError::InvalidPayload {
            message_type: self.message_type.clone(),
            reason: e.to_string(),
        })
    }
}

// ===== HOST → VIEWER =====

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatePatch {
    /// Dataset the revision counter belongs to.
    pub dataset_path: String,
    pub revision: u64,
    pub workspace: Workspace,
    pub viewer_state: ViewerInteractionState,
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub dataset_path: String,
    pub revision: u64,
    pub workspace: Workspace,
    pub viewer_state: ViewerInteractionState,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    StatePatch(StatePatch),
    StateSnapshot(StateSnapshot),
    HostError(HostError),
}

impl HostMessage {
    pub const STATE_PATCH: &'static str = "statePatch";
    pub const STATE_SNAPSHOT: &'static str = "stateSnapshot";
    pub const HOST_ERROR: &'static str = "hostError";

    pub fn revision(&self) -> Option<u64> {
        match self {
            HostMessage::StatePatch(patch) => Some(patch.revision),
            HostMessage::StateSnapshot(snapshot) => Some(snapshot.revision),
            HostMessage::HostError(_) => None,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let (message_type, payload) = match self {
            HostMessage::StatePatch(patch) => (Self::STATE_PATCH, serde_json::to_value(patch)),
            HostMessage::StateSnapshot(snapshot) => (Self::STATE_SNAPSHOT, serde_json::to_value(snapshot)),
            HostMessage::HostError(error) => (Self::HOST_ERROR, serde_json::to_value(error)),
        };
        Envelope::new(message_type, payload.unwrap_or(Value::Null))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Envelope::parse(text)?;
        match envelope.message_type.as_str() {
            Self::STATE_PATCH => Ok(HostMessage::StatePatch(envelope.payload_as()?)),
            Self::STATE_SNAPSHOT => Ok(HostMessage::StateSnapshot(envelope.payload_as()?)),
            Self::HOST_ERROR => Ok(HostMessage::HostError(envelope.payload_as()?)),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

// ===== VIEWER → HOST =====

/// Traceability fields carried by every intent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntentMeta {
    pub viewer_id: String,
    pub request_id: String,
}

/// Where a dropped signal should land.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "kind")]
pub enum DropTarget {
    /// The plot's active axis.
    #[default]
    ActiveAxis,
    Axis { axis_id: String },
    NewAxis,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ViewerIntent {
    DropSignal {
        #[serde(default)]
        plot_id: Option<String>,
        signal: String,
        #[serde(default)]
        target: DropTarget,
    },
    SetActiveAxis { plot_id: String, axis_id: String },
    AddAxis { plot_id: String },
    ReorderAxis { plot_id: String, axis_id: String, to_index: usize },
    RemoveAxisAndTraces { plot_id: String, axis_id: String },
    SetTraceVisible { plot_id: String, trace_id: String, visible: bool },
    RemoveTrace { plot_id: String, trace_id: String },
    SetActivePlot { plot_id: String },
    AddPlot {
        #[serde(default)]
        name: Option<String>,
    },
    RemovePlot { plot_id: String },
    RenamePlot { plot_id: String, name: String },
    ClearPlot { plot_id: String },
}

impl ViewerIntent {
    /// Wire type name, e.g. `intent/dropSignal`.
    pub fn message_type(&self) -> &'static str {
        match self {
            ViewerIntent::DropSignal { .. } => "intent/dropSignal",
            ViewerIntent::SetActiveAxis { .. } => "intent/setActiveAxis",
            ViewerIntent::AddAxis { .. } => "intent/addAxis",
            ViewerIntent::ReorderAxis { .. } => "intent/reorderAxis",
            ViewerIntent::RemoveAxisAndTraces { .. } => "intent/removeAxisAndTraces",
            ViewerIntent::SetTraceVisible { .. } => "intent/setTraceVisible",
            ViewerIntent::RemoveTrace { .. } => "intent/removeTrace",
            ViewerIntent::SetActivePlot { .. } => "intent/setActivePlot",
            ViewerIntent::AddPlot { .. } => "intent/addPlot",
            ViewerIntent::RemovePlot { .. } => "intent/removePlot",
            ViewerIntent::RenamePlot { .. } => "intent/renamePlot",
            ViewerIntent::ClearPlot { .. } => "intent/clearPlot",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewerMessage {
    pub meta: IntentMeta,
    pub intent: ViewerIntent,
}

impl ViewerMessage {
    pub fn to_envelope(&self) -> Envelope {
        let mut payload = match serde_json::to_value(&self.intent) {
            // Externally tagged: {"dropSignal": {...}}; unwrap the inner object.
            Ok(Value::Object(mut tagged)) => tagged
                .values_mut()
                .next()
                .map(Value::take)
                .unwrap_or(Value::Object(Default::default())),
            _ => Value::Object(Default::default()),
        };
        if let Value::Object(fields) = &mut payload {
            fields.insert("viewerId".to_string(), Value::String(self.meta.viewer_id.clone()));
            fields.insert("requestId".to_string(), Value::String(self.meta.request_id.clone()));
        }
        Envelope::new(self.intent.message_type(), payload)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Envelope::parse(text)?;
        let variant = envelope
            .message_type
            .strip_prefix("intent/")
            .ok_or_else(|| ProtocolError::UnknownType(envelope.message_type.clone()))?;
        if !INTENT_VARIANTS.contains(&variant) {
            return Err(ProtocolError::UnknownType(envelope.message_type.clone()));
        }

        let meta: IntentMeta = envelope.payload_as()?;
        let mut body = envelope.payload.clone();
        if let Value::Object(fields) = &mut body {
            fields.remove("viewerId");
            fields.remove("requestId");
        }
        let mut tagged = serde_json::Map::new();
        tagged.insert(variant.to_string(), body);
        let intent: ViewerIntent =
            serde_json::from_value(Value::Object(tagged)).map_err(|e| ProtocolError::InvalidPayload {
                message_type: envelope.message_type.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { meta, intent })
    }
}

const INTENT_VARIANTS: &[&str] = &[
    "dropSignal",
    "setActiveAxis",
    "addAxis",
    "reorderAxis",
    "removeAxisAndTraces",
    "setTraceVisible",
    "removeTrace",
    "setActivePlot",
    "addPlot",
    "removePlot",
    "renamePlot",
    "clearPlot",
];

// ===== VIEWER-SIDE ORDERING =====

/// Viewer-side copy of the authoritative state.
///
/// Applies `statePatch`/`stateSnapshot` messages only when their revision is
/// newer than the last one applied. Revisions count per dataset, so a snapshot
/// for a different dataset starts over, and patches still in flight for the
/// previous dataset are dropped.
#[derive(Debug, Clone, Default)]
pub struct ViewerStateMirror {
    dataset_path: Option<String>,
    last_revision: Option<u64>,
    workspace: Option<Workspace>,
    viewer_state: ViewerInteractionState,
}

impl ViewerStateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dataset_path(&self) -> Option<&str> {
        self.dataset_path.as_deref()
    }

    pub fn last_revision(&self) -> Option<u64> {
        self.last_revision
    }

    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspace.as_ref()
    }

    pub fn viewer_state(&self) -> &ViewerInteractionState {
        &self.viewer_state
    }

    /// Returns `true` when the message changed the mirror.
    pub fn apply(&mut self, message: &HostMessage) -> bool {
        let (dataset_path, revision, workspace, viewer_state) = match message {
            HostMessage::StatePatch(patch) => {
                (&patch.dataset_path, patch.revision, &patch.workspace, &patch.viewer_state)
            }
            HostMessage::StateSnapshot(snapshot) => {
                (&snapshot.dataset_path, snapshot.revision, &snapshot.workspace, &snapshot.viewer_state)
            }
            HostMessage::HostError(_) => return false,
        };

        let rebound = self.dataset_path.as_ref() != Some(dataset_path);
        if rebound {
            if self.dataset_path.is_some() && matches!(message, HostMessage::StatePatch(_)) {
                log::debug!(
                    "discarding patch for '{}' while showing {:?}",
                    dataset_path,
                    self.dataset_path
                );
                return false;
            }
        } else if self.last_revision.is_some_and(|last| revision <= last) {
            log::debug!(
                "discarding stale state revision {} (last applied {:?})",
                revision,
                self.last_revision
            );
            return false;
        }

        self.dataset_path = Some(dataset_path.clone());
        self.last_revision = Some(revision);
        self.workspace = Some(workspace.clone());
        self.viewer_state = viewer_state.clone();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_workspace(name: &str) -> Workspace {
        let mut workspace = Workspace::new_default("time");
        std::sync::Arc::make_mut(&mut workspace.plots[0]).name = name.to_string();
        workspace
    }

    fn patch(revision: u64, name: &str) -> HostMessage {
        patch_for("/data/a.csv", revision, name)
    }

    fn patch_for(dataset_path: &str, revision: u64, name: &str) -> HostMessage {
        let workspace = named_workspace(name);
        HostMessage::StatePatch(StatePatch {
            dataset_path: dataset_path.to_string(),
            revision,
            workspace,
            viewer_state: ViewerInteractionState::default(),
            reason: "test".to_string(),
        })
    }

    #[test]
    fn intent_envelope_round_trips() {
        let message = ViewerMessage {
            meta: IntentMeta {
                viewer_id: "viewer-a".to_string(),
                request_id: "req-1".to_string(),
            },
            intent: ViewerIntent::DropSignal {
                plot_id: Some("plot-1".to_string()),
                signal: "vin".to_string(),
                target: DropTarget::NewAxis,
            },
        };
        let text = message.to_envelope().to_json();
        assert!(text.contains("\"type\":\"intent/dropSignal\""));
        assert!(text.contains("\"viewerId\":\"viewer-a\""));
        assert_eq!(ViewerMessage::decode(&text).unwrap(), message);
    }

    #[test]
    fn hand_written_intent_decodes() {
        let text = r#"{"version":1,"type":"intent/reorderAxis","payload":{"viewerId":"v","requestId":"r","plotId":"plot-1","axisId":"y2","toIndex":0}}"#;
        let message = ViewerMessage::decode(text).unwrap();
        assert_eq!(
            message.intent,
            ViewerIntent::ReorderAxis {
                plot_id: "plot-1".to_string(),
                axis_id: "y2".to_string(),
                to_index: 0
            }
        );
    }

    #[test]
    fn unknown_version_type_or_shape_is_rejected() {
        let bad_version = r#"{"version":2,"type":"intent/addPlot","payload":{"viewerId":"v","requestId":"r"}}"#;
        assert!(matches!(ViewerMessage::decode(bad_version), Err(ProtocolError::UnsupportedVersion(2))));

        let bad_type = r#"{"version":1,"type":"intent/explode","payload":{"viewerId":"v","requestId":"r"}}"#;
        assert!(matches!(ViewerMessage::decode(bad_type), Err(ProtocolError::UnknownType(_))));

        let missing_meta = r#"{"version":1,"type":"intent/addPlot","payload":{}}"#;
        assert!(matches!(ViewerMessage::decode(missing_meta), Err(ProtocolError::InvalidPayload { .. })));

        let bad_shape = r#"{"version":1,"type":"intent/removePlot","payload":{"viewerId":"v","requestId":"r","plotId":7}}"#;
        assert!(matches!(ViewerMessage::decode(bad_shape), Err(ProtocolError::InvalidPayload { .. })));

        assert!(matches!(ViewerMessage::decode("not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn host_message_envelope_round_trips() {
        let message = patch(4, "Supply");
        let decoded = HostMessage::decode(&message.to_envelope().to_json()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.revision(), Some(4));
    }

    #[test]
    fn mirror_discards_stale_and_duplicate_revisions() {
        let mut mirror = ViewerStateMirror::new();
        assert!(mirror.apply(&patch(2, "second")));
        assert!(!mirror.apply(&patch(1, "first")));
        assert!(!mirror.apply(&patch(2, "again")));
        assert!(mirror.apply(&patch(3, "third")));
        assert_eq!(mirror.last_revision(), Some(3));
        assert_eq!(mirror.workspace().unwrap().plots[0].name, "third");
    }

    #[test]
    fn mirror_converges_under_delivery_jitter() {
        let mut in_order = ViewerStateMirror::new();
        let mut jittered = ViewerStateMirror::new();
        let patches: Vec<HostMessage> = (1..=5).map(|n| patch(n, &format!("rev{n}"))).collect();
        for message in &patches {
            in_order.apply(message);
        }
        for index in [1, 0, 3, 4, 2] {
            jittered.apply(&patches[index]);
        }
        assert_eq!(in_order.workspace(), jittered.workspace());
        assert_eq!(jittered.last_revision(), Some(5));
    }

    #[test]
    fn snapshot_for_another_dataset_restarts_revision_order() {
        let snapshot = |dataset_path: &str, revision: u64, name: &str| {
            HostMessage::StateSnapshot(StateSnapshot {
                dataset_path: dataset_path.to_string(),
                revision,
                workspace: named_workspace(name),
                viewer_state: ViewerInteractionState::default(),
            })
        };
        let mut mirror = ViewerStateMirror::new();
        assert!(mirror.apply(&snapshot("/data/a.csv", 0, "a0")));
        assert!(mirror.apply(&patch_for("/data/a.csv", 1, "a1")));

        assert!(mirror.apply(&snapshot("/data/b.csv", 0, "b0")));
        assert_eq!(mirror.dataset_path(), Some("/data/b.csv"));
        assert_eq!(mirror.last_revision(), Some(0));
        assert_eq!(mirror.workspace().unwrap().plots[0].name, "b0");

        // A late patch from the previous binding is ignored.
        assert!(!mirror.apply(&patch_for("/data/a.csv", 2, "a2")));
        assert!(mirror.apply(&patch_for("/data/b.csv", 1, "b1")));
        assert!(!mirror.apply(&snapshot("/data/b.csv", 1, "b1 again")));
        assert_eq!(mirror.workspace().unwrap().plots[0].name, "b1");
    }
}
