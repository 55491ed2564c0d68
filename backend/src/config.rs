use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;

/// Project-local config file, checked before the per-user one.
pub const LOCAL_CONFIG_FILE: &str = ".plotsync.toml";

// ===== CONFIG TYPES =====

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub app: AppSection,
    pub autosave: AutosaveSection,
    pub watcher: WatcherSection,
    pub layout: LayoutSection,
}

// Config format metadata; the version gates migration when fields change.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppSection {
    pub version: String,
}

impl AppSection {
    pub const CURRENT_VERSION: &'static str = "1.0.0";

    pub fn is_supported_version(&self) -> bool {
        matches!(self.version.as_str(), "1.0.0")
    }
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AutosaveSection {
    /// Quiet period before a scheduled layout write fires.
    pub quiet_ms: u64,
}

impl Default for AutosaveSection {
    fn default() -> Self {
        Self { quiet_ms: 200 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WatcherSection {
    /// Debounce applied to change notifications before a reload; 0 reloads
    /// synchronously.
    pub debounce_ms: u64,
    /// Coalescing window of the OS file-event debouncer.
    pub event_window_ms: u64,
    pub mtime_tolerance_ms: u64,
    /// Subscribe to OS file events. Hosts that forward change notifications
    /// themselves can turn this off.
    pub os_events: bool,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            debounce_ms: 80,
            event_window_ms: 50,
            mtime_tolerance_ms: 1000,
            os_events: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LayoutSection {
    /// Appended to the dataset path to form the sidecar layout path.
    pub suffix: String,
}

impl Default for LayoutSection {
    fn default() -> Self {
        Self {
            suffix: ".layout.yaml".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn autosave_quiet(&self) -> Duration {
        Duration::from_millis(self.autosave.quiet_ms)
    }

    pub fn watcher_debounce(&self) -> Duration {
        Duration::from_millis(self.watcher.debounce_ms)
    }

    pub fn watcher_event_window(&self) -> Duration {
        Duration::from_millis(self.watcher.event_window_ms)
    }

    pub fn mtime_tolerance(&self) -> Duration {
        Duration::from_millis(self.watcher.mtime_tolerance_ms)
    }

    /// Repairs values the rest of the system cannot work with, returning a
    /// warning per repair.
    pub fn validate_and_fix(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.app.is_supported_version() {
            warnings.push(format!(
                "unsupported config version '{}'; using defaults",
                self.app.version
            ));
            *self = SyncConfig::default();
            return warnings;
        }
        if self.layout.suffix.trim().is_empty() {
            warnings.push("layout.suffix is empty; using default".to_string());
            self.layout.suffix = LayoutSection::default().suffix;
        }
        if self.watcher.event_window_ms == 0 {
            warnings.push("watcher.event_window_ms must be positive; using default".to_string());
            self.watcher.event_window_ms = WatcherSection::default().event_window_ms;
        }
        warnings
    }
}

// ===== LOADING & SAVING =====

/// Config file candidates in lookup order.
pub fn config_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    candidates.push(PathBuf::from(LOCAL_CONFIG_FILE));
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("plotsync").join("config.toml"));
    }
    candidates
}

/// Loads the first existing candidate, or defaults when none exists. An
/// explicit path that does not exist is an error.
pub fn load_config(explicit: Option<&Path>) -> Result<(SyncConfig, Option<PathBuf>), SyncError> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(SyncError::Config(format!("config file '{}' does not exist", path.display())));
        }
    }
    for candidate in config_candidates(explicit) {
        if !candidate.is_file() {
            continue;
        }
        let config = load_config_from_file(&candidate)?;
        return Ok((config, Some(candidate)));
    }
    log::debug!("no config file found; using defaults");
    Ok((SyncConfig::default(), None))
}

pub fn load_config_from_file(path: &Path) -> Result<SyncConfig, SyncError> {
    let content = std::fs::read_to_string(path).map_err(|err| SyncError::io(path.display().to_string(), err))?;
    let mut config: SyncConfig = toml::from_str(&content)
        .map_err(|err| SyncError::Config(format!("failed to parse '{}': {}", path.display(), err)))?;
    for warning in config.validate_and_fix() {
        log::warn!("{}: {}", path.display(), warning);
    }
    Ok(config)
}

pub fn save_config_to_file(config: &SyncConfig, path: &Path) -> Result<(), SyncError> {
    let toml_content = toml::to_string_pretty(config).map_err(|err| SyncError::Config(err.to_string()))?;

    let content_with_header = format!(
        "# plotsync configuration\n\
         # Timings are in milliseconds\n\
         \n\
         {}",
        toml_content
    );

    std::fs::write(path, content_with_header).map_err(|err| SyncError::io(path.display().to_string(), err))
}
