use shared::SpecError;
use std::io;

use crate::reducer::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("dataset '{0}' has no state and no default X signal to start from")]
    UntrackedDataset(String),
    #[error("failed to load dataset '{path}': {message}")]
    Dataset { path: String, message: String },
    #[error(
        "layout '{layout}' references dataset '{referenced}' but viewer '{viewer_id}' is bound to '{bound}'"
    )]
    ReconciliationConflict {
        layout: String,
        referenced: String,
        viewer_id: String,
        bound: String,
    },
    #[error("unknown viewer '{0}'")]
    UnknownViewer(String),
    #[error("viewer '{0}' has no dataset open")]
    UnboundViewer(String),
    #[error("no viewer available for dataset '{0}'")]
    NoTargetViewer(String),
    #[error("signal '{signal}' does not exist in dataset '{dataset}'")]
    UnknownSignal { dataset: String, signal: String },
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn dataset(path: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Dataset {
            path: path.into(),
            message: message.into(),
        }
    }
}
