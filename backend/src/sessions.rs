//! Open viewer windows and what they are bound to.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::error::SyncError;
use crate::registry::lock_or_recover;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerSession {
    pub id: String,
    pub dataset_path: Option<String>,
    pub layout_path: Option<String>,
    /// Bumped from a registry-wide counter each time the viewer gains focus;
    /// zero means never focused.
    pub focus_order: u64,
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<String, ViewerSession>,
    focused: Option<String>,
    focus_counter: u64,
    by_dataset: HashMap<String, BTreeSet<String>>,
    by_layout: HashMap<String, BTreeSet<String>>,
}

impl SessionTable {
    fn session_mut(&mut self, viewer_id: &str) -> Result<&mut ViewerSession, SyncError> {
        self.sessions
            .get_mut(viewer_id)
            .ok_or_else(|| SyncError::UnknownViewer(viewer_id.to_string()))
    }

    fn most_recently_focused<'a>(&self, candidates: impl Iterator<Item = &'a String>) -> Option<&ViewerSession> {
        candidates
            .filter_map(|id| self.sessions.get(id))
            .max_by(|a, b| a.focus_order.cmp(&b.focus_order).then_with(|| b.id.cmp(&a.id)))
    }
}

fn unindex(index: &mut HashMap<String, BTreeSet<String>>, key: &str, viewer_id: &str) {
    if let Some(viewers) = index.get_mut(key) {
        viewers.remove(viewer_id);
        if viewers.is_empty() {
            index.remove(key);
        }
    }
}

/// Tracks viewer sessions, their focus order, and reverse indexes from
/// dataset and layout paths to the viewers bound to them.
pub struct ViewerSessionRegistry {
    table: Mutex<SessionTable>,
}

impl Default for ViewerSessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewerSessionRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(SessionTable::default()),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, SessionTable> {
        lock_or_recover(&self.table, "viewer sessions")
    }

    /// Registers a viewer under a fresh id.
    pub fn open_viewer(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.register_viewer(&id);
        id
    }

    /// Registers a viewer under a caller-chosen id. Returns `false` if the id
    /// is already taken.
    pub fn register_viewer(&self, viewer_id: &str) -> bool {
        let mut table = self.table();
        if table.sessions.contains_key(viewer_id) {
            return false;
        }
        table.sessions.insert(
            viewer_id.to_string(),
            ViewerSession {
                id: viewer_id.to_string(),
                dataset_path: None,
                layout_path: None,
                focus_order: 0,
            },
        );
        true
    }

    /// Destroys a session. If it was focused, focus moves to the remaining
    /// viewer with the highest focus order.
    pub fn remove_viewer(&self, viewer_id: &str) -> Option<ViewerSession> {
        let mut table = self.table();
        let session = table.sessions.remove(viewer_id)?;
        if let Some(dataset) = &session.dataset_path {
            unindex(&mut table.by_dataset, dataset, viewer_id);
        }
        if let Some(layout) = &session.layout_path {
            unindex(&mut table.by_layout, layout, viewer_id);
        }
        if table.focused.as_deref() == Some(viewer_id) {
            let next = table
                .most_recently_focused(table.sessions.keys())
                .filter(|candidate| candidate.focus_order > 0)
                .map(|candidate| candidate.id.clone());
            table.focused = next;
        }
        Some(session)
    }

    pub fn focus_viewer(&self, viewer_id: &str) -> Result<(), SyncError> {
        let mut table = self.table();
        table.focus_counter += 1;
        let order = table.focus_counter;
        table.session_mut(viewer_id)?.focus_order = order;
        table.focused = Some(viewer_id.to_string());
        Ok(())
    }

    /// Clears focus if `viewer_id` holds it; focus order is left alone.
    pub fn blur_viewer(&self, viewer_id: &str) {
        let mut table = self.table();
        if table.focused.as_deref() == Some(viewer_id) {
            table.focused = None;
        }
    }

    /// Binds a viewer to a dataset, returning the dataset it was bound to before.
    pub fn bind_viewer_to_dataset(&self, viewer_id: &str, dataset_path: &str) -> Result<Option<String>, SyncError> {
        let mut table = self.table();
        let previous = table.session_mut(viewer_id)?.dataset_path.replace(dataset_path.to_string());
        if let Some(old) = previous.as_deref().filter(|old| *old != dataset_path) {
            unindex(&mut table.by_dataset, old, viewer_id);
        }
        table
            .by_dataset
            .entry(dataset_path.to_string())
            .or_default()
            .insert(viewer_id.to_string());
        Ok(previous)
    }

    /// Binds (or with `None`, unbinds) a viewer's layout file, returning the
    /// previous one.
    pub fn bind_viewer_to_layout(&self, viewer_id: &str, layout_path: Option<&str>) -> Result<Option<String>, SyncError> {
        let mut table = self.table();
        let previous = {
            let session = table.session_mut(viewer_id)?;
            std::mem::replace(&mut session.layout_path, layout_path.map(str::to_string))
        };
        if let Some(old) = &previous {
            unindex(&mut table.by_layout, old, viewer_id);
        }
        if let Some(layout) = layout_path {
            table
                .by_layout
                .entry(layout.to_string())
                .or_default()
                .insert(viewer_id.to_string());
        }
        Ok(previous)
    }

    /// Picks the viewer a side action on `dataset_path` should land in:
    /// the focused viewer if it shows that dataset, else the focused viewer if
    /// it is blank, else the most recently focused viewer showing the dataset.
    pub fn resolve_target_viewer_session(&self, dataset_path: &str) -> Option<ViewerSession> {
        let table = self.table();
        if let Some(focused) = table.focused.as_ref().and_then(|id| table.sessions.get(id)) {
            match focused.dataset_path.as_deref() {
                Some(bound) if bound == dataset_path => return Some(focused.clone()),
                None => return Some(focused.clone()),
                Some(_) => {}
            }
        }
        let bound = table.by_dataset.get(dataset_path)?;
        table.most_recently_focused(bound.iter()).cloned()
    }

    pub fn viewers_for_dataset(&self, dataset_path: &str) -> Vec<String> {
        self.table()
            .by_dataset
            .get(dataset_path)
            .map(|viewers| viewers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn viewers_for_layout(&self, layout_path: &str) -> Vec<String> {
        self.table()
            .by_layout
            .get(layout_path)
            .map(|viewers| viewers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Layout file bound by the most recently focused viewer of a dataset.
    pub fn layout_for_dataset(&self, dataset_path: &str) -> Option<String> {
        let table = self.table();
        let bound = table.by_dataset.get(dataset_path)?;
        bound
            .iter()
            .filter_map(|id| table.sessions.get(id))
            .filter(|session| session.layout_path.is_some())
            .max_by(|a, b| a.focus_order.cmp(&b.focus_order).then_with(|| b.id.cmp(&a.id)))
            .and_then(|session| session.layout_path.clone())
    }

    pub fn session(&self, viewer_id: &str) -> Option<ViewerSession> {
        self.table().sessions.get(viewer_id).cloned()
    }

    pub fn focused_viewer(&self) -> Option<String> {
        self.table().focused.clone()
    }

    pub fn viewer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.table().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }
}
