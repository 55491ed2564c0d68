//! Types shared between the sync host and its viewers: the plot workspace
//! model, the layout sidecar format, and the message protocol.

pub mod layout_spec;
pub mod protocol;
pub mod workspace;

pub use layout_spec::{ImportedLayout, SpecError, export_spec, import_spec, peek_dataset_path};
pub use protocol::{
    DropTarget, Envelope, HostError, HostMessage, IntentMeta, ProtocolError, StatePatch, StateSnapshot,
    ViewerIntent, ViewerMessage, ViewerStateMirror,
};
pub use workspace::{
    Axis, AxisRange, AxisScale, Plot, Trace, ViewerInteractionState, Workspace, validate_workspace,
};
