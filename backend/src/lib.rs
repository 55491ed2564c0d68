//! Host side of plotsync: keeps every viewer of a dataset on one revisioned
//! plot workspace and keeps that workspace in step with its layout file.

pub mod autosave;
pub mod config;
pub mod dataset;
pub mod error;
pub mod host;
pub mod intents;
pub mod persistence;
pub mod reducer;
pub mod registry;
pub mod sessions;
pub mod state_store;
pub mod watcher;

pub use config::{SyncConfig, load_config, save_config_to_file};
pub use dataset::{CsvDatasetLoader, DatasetLoader, LoadedDataset};
pub use error::SyncError;
pub use host::{SyncHost, ViewerOutbox, normalize_path};
pub use reducer::{ValidationError, WorkspaceAction, reduce};
pub use state_store::{CommitOutcome, RevisionedSnapshot, StateStore, Transaction};
