//! Debounced persistence of state store snapshots to their layout files.
//!
//! Each dataset path has at most one pending write. Rescheduling bumps a
//! generation counter and the sleeping task of the older generation finds its
//! entry gone or replaced when it wakes, so no timer needs cancelling.
//! [`AutosaveDebouncer::supersede`] marks revisions the layout file already
//! reflects; writes of those revisions are dropped wherever they are.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::persistence::{FingerprintLedger, WriteFingerprint, persist_layout};
use crate::registry::Registry;
use crate::sessions::ViewerSessionRegistry;
use crate::state_store::RevisionedSnapshot;

/// Finds the layout file a dataset's state should be written to.
pub trait LayoutResolver: Send + Sync {
    fn layout_for_dataset(&self, dataset_path: &str) -> Option<String>;
}

impl LayoutResolver for ViewerSessionRegistry {
    fn layout_for_dataset(&self, dataset_path: &str) -> Option<String> {
        ViewerSessionRegistry::layout_for_dataset(self, dataset_path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutosaveEvent {
    Persisted {
        dataset_path: String,
        fingerprint: WriteFingerprint,
    },
    Failed {
        dataset_path: String,
        layout_path: String,
        message: String,
    },
}

struct PendingWrite {
    generation: u64,
    layout_path: String,
    snapshot: Arc<RevisionedSnapshot>,
}

pub struct AutosaveDebouncer {
    quiet: Duration,
    generation: AtomicU64,
    pending: Registry<String, PendingWrite>,
    // Per dataset, the highest revision the layout file already holds.
    superseded: Registry<String, u64>,
    resolver: Arc<dyn LayoutResolver>,
    ledger: Arc<FingerprintLedger>,
    events: mpsc::UnboundedSender<AutosaveEvent>,
    // Writes are taken in FIFO order so a later revision never lands first.
    write_order: tokio::sync::Mutex<()>,
}

impl AutosaveDebouncer {
    pub fn new(
        quiet: Duration,
        resolver: Arc<dyn LayoutResolver>,
        ledger: Arc<FingerprintLedger>,
        events: mpsc::UnboundedSender<AutosaveEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            quiet,
            generation: AtomicU64::new(0),
            pending: Registry::new("autosave"),
            superseded: Registry::new("autosave superseded revisions"),
            resolver,
            ledger,
            events,
            write_order: tokio::sync::Mutex::new(()),
        })
    }

    /// Arms (or re-arms) the quiet-period timer for `dataset_path`. Returns
    /// `false` when nothing was scheduled: the dataset has no bound layout, or
    /// the snapshot is older than what is pending or already on disk.
    /// Must be called from within a tokio runtime.
    pub fn schedule(self: &Arc<Self>, dataset_path: &str, snapshot: Arc<RevisionedSnapshot>) -> bool {
        let Some(layout_path) = self.resolver.layout_for_dataset(dataset_path) else {
            log::debug!("no layout bound to '{}'; autosave skipped", dataset_path);
            return false;
        };

        if self.is_superseded(dataset_path, snapshot.revision) {
            log::debug!(
                "'{}' revision {} is older than the layout file; autosave skipped",
                dataset_path,
                snapshot.revision
            );
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let revision = snapshot.revision;
        let replaced = self.pending.with(|pending| {
            if pending
                .get(dataset_path)
                .is_some_and(|current| current.snapshot.revision > revision)
            {
                return Err(());
            }
            Ok(pending.insert(
                dataset_path.to_string(),
                PendingWrite {
                    generation,
                    layout_path,
                    snapshot,
                },
            ))
        });
        match replaced {
            Err(()) => {
                log::debug!("'{}' already has a newer autosave pending", dataset_path);
                return false;
            }
            Ok(Some(old)) => log::debug!(
                "autosave of '{}' revision {} replaced by revision {}",
                dataset_path,
                old.snapshot.revision,
                revision
            ),
            Ok(None) => {}
        }

        let this = Arc::clone(self);
        let key = dataset_path.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(this.quiet).await;
            this.fire(&key, generation).await;
        });
        true
    }

    async fn fire(&self, dataset_path: &str, generation: u64) {
        let due = self.pending.with(|pending| {
            let current = pending.get(dataset_path).map(|write| write.generation);
            if current == Some(generation) {
                pending.remove(dataset_path)
            } else {
                None
            }
        });
        if let Some(write) = due {
            self.write(dataset_path.to_string(), write).await;
        }
    }

    /// Records that the layout file of `dataset_path` already holds
    /// `revision`, e.g. after an external edit was applied. Pending and
    /// later-scheduled writes of that revision or older are dropped. Returns
    /// `true` when a pending write was dropped.
    pub fn supersede(&self, dataset_path: &str, revision: u64) -> bool {
        self.superseded.with(|superseded| {
            let through = superseded.entry(dataset_path.to_string()).or_insert(0);
            *through = (*through).max(revision);
        });
        let dropped = self.pending.with(|pending| {
            let stale = pending
                .get(dataset_path)
                .is_some_and(|write| write.snapshot.revision <= revision);
            if stale {
                pending.remove(dataset_path)
            } else {
                None
            }
        });
        if let Some(write) = &dropped {
            log::debug!(
                "autosave of '{}' revision {} superseded by revision {}",
                dataset_path,
                write.snapshot.revision,
                revision
            );
        }
        dropped.is_some()
    }

    fn is_superseded(&self, dataset_path: &str, revision: u64) -> bool {
        self.superseded
            .get(&dataset_path.to_string())
            .is_some_and(|through| revision <= through)
    }

    /// Persists pending writes immediately, for one dataset path or for all.
    pub async fn flush(&self, dataset_path: Option<&str>) -> Vec<AutosaveEvent> {
        let due: Vec<(String, PendingWrite)> = match dataset_path {
            Some(path) => self
                .pending
                .remove(&path.to_string())
                .map(|write| (path.to_string(), write))
                .into_iter()
                .collect(),
            None => self.pending.drain(),
        };
        let mut events = Vec::with_capacity(due.len());
        for (path, write) in due {
            events.extend(self.write(path, write).await);
        }
        events
    }

    pub fn is_pending(&self, dataset_path: &str) -> bool {
        self.pending.contains(&dataset_path.to_string())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn write(&self, dataset_path: String, write: PendingWrite) -> Option<AutosaveEvent> {
        let _order = self.write_order.lock().await;
        if self.is_superseded(&dataset_path, write.snapshot.revision) {
            log::debug!(
                "skipping superseded autosave of '{}' revision {}",
                dataset_path,
                write.snapshot.revision
            );
            return None;
        }
        let result = persist_layout(Path::new(&write.layout_path), Path::new(&dataset_path), &write.snapshot).await;
        let event = match result {
            Ok(fingerprint) => {
                self.ledger.record(fingerprint.clone());
                AutosaveEvent::Persisted {
                    dataset_path,
                    fingerprint,
                }
            }
            Err(err) => {
                log::error!(
                    "autosave of '{}' to '{}' failed: {}",
                    dataset_path,
                    write.layout_path,
                    err
                );
                AutosaveEvent::Failed {
                    dataset_path,
                    layout_path: write.layout_path,
                    message: err.to_string(),
                }
            }
        };
        // Receiver gone means the host is shutting down.
        let _ = self.events.send(event.clone());
        Some(event)
    }
}
