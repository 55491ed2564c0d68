//! Atomic layout writes and the fingerprints used to recognize them later.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::SyncError;
use crate::registry::Registry;
use crate::state_store::RevisionedSnapshot;

/// What the program wrote to a layout file, recorded right after the write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteFingerprint {
    pub layout_uri: String,
    pub content_hash: String,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub revision: u64,
}

/// SHA-256 of `bytes`, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// Default sidecar location: the dataset path with `suffix` appended.
pub fn sidecar_path(dataset_path: &Path, suffix: &str) -> PathBuf {
    let mut name = dataset_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Resolves the dataset path stored in a layout document. Relative paths are
/// relative to the layout file's directory.
pub fn resolve_dataset_path(layout_path: &Path, referenced: &str) -> PathBuf {
    let referenced = Path::new(referenced);
    if referenced.is_absolute() {
        return referenced.to_path_buf();
    }
    layout_path
        .parent()
        .map(|dir| dir.join(referenced))
        .unwrap_or_else(|| referenced.to_path_buf())
}

/// Dataset path as written into a layout document: relative when the dataset
/// sits under the layout's directory, absolute otherwise.
pub fn dataset_reference(layout_path: &Path, dataset_path: &Path) -> String {
    layout_path
        .parent()
        .and_then(|dir| dataset_path.strip_prefix(dir).ok())
        .filter(|relative| !relative.as_os_str().is_empty())
        .unwrap_or(dataset_path)
        .to_string_lossy()
        .to_string()
}

/// Writes `contents` to a temporary file beside `target` and renames it over
/// the target. On failure the temporary file is removed and the error
/// returned; the target is never left half-written.
pub async fn write_atomic(target: &Path, contents: &[u8], revision: u64) -> Result<WriteFingerprint, SyncError> {
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "layout".to_string());
    let temp = target.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));
    let target_label = target.display().to_string();

    if let Err(err) = tokio::fs::write(&temp, contents).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(SyncError::io(target_label, err));
    }
    if let Err(err) = tokio::fs::rename(&temp, target).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(SyncError::io(target_label, err));
    }

    let metadata = tokio::fs::metadata(target)
        .await
        .map_err(|err| SyncError::io(target_label.clone(), err))?;
    Ok(WriteFingerprint {
        layout_uri: target_label,
        content_hash: content_hash(contents),
        size: metadata.len(),
        mtime: metadata.modified().ok(),
        revision,
    })
}

/// Exports `snapshot` as the layout document for `dataset_path` and writes it
/// atomically to `layout_path`.
pub async fn persist_layout(
    layout_path: &Path,
    dataset_path: &Path,
    snapshot: &RevisionedSnapshot,
) -> Result<WriteFingerprint, SyncError> {
    let reference = dataset_reference(layout_path, dataset_path);
    let text = shared::export_spec(&reference, &snapshot.workspace)?;
    let fingerprint = write_atomic(layout_path, text.as_bytes(), snapshot.revision).await?;
    log::info!(
        "persisted revision {} of '{}' to '{}'",
        snapshot.revision,
        dataset_path.display(),
        layout_path.display()
    );
    Ok(fingerprint)
}

/// Latest self-write fingerprint per layout URI.
pub struct FingerprintLedger {
    latest: Registry<String, WriteFingerprint>,
    mtime_tolerance: Duration,
}

impl FingerprintLedger {
    pub fn new(mtime_tolerance: Duration) -> Self {
        Self {
            latest: Registry::new("write fingerprints"),
            mtime_tolerance,
        }
    }

    pub fn record(&self, fingerprint: WriteFingerprint) {
        log::debug!(
            "recorded self-write of '{}' at revision {} ({} bytes)",
            fingerprint.layout_uri,
            fingerprint.revision,
            fingerprint.size
        );
        self.latest.insert(fingerprint.layout_uri.clone(), fingerprint);
    }

    pub fn latest(&self, layout_uri: &str) -> Option<WriteFingerprint> {
        self.latest.get(&layout_uri.to_string())
    }

    /// True when the observed file matches the last recorded write: same
    /// hash, same size, and an mtime within tolerance. A missing mtime on
    /// either side does not count against the match.
    pub fn is_self_write(&self, layout_uri: &str, hash: &str, size: u64, mtime: Option<SystemTime>) -> bool {
        let Some(fingerprint) = self.latest(layout_uri) else {
            return false;
        };
        if fingerprint.content_hash != hash || fingerprint.size != size {
            return false;
        }
        match (fingerprint.mtime, mtime) {
            (Some(recorded), Some(observed)) => {
                let drift = recorded
                    .duration_since(observed)
                    .or_else(|_| observed.duration_since(recorded))
                    .unwrap_or_default();
                drift <= self.mtime_tolerance
            }
            _ => true,
        }
    }

    pub fn forget(&self, layout_uri: &str) {
        self.latest.remove(&layout_uri.to_string());
    }
}
