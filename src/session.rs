//! Session persistence: one directory per session holding metadata, the
//! workspace tree and the pane cwd map as JSON. Pane ids are written as
//! strings; the layout reducer re-syncs its counter on load.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layout::{LayoutMode, LayoutState, PaneNode, Workspace};
use crate::types::{PaneId, SessionId, SplitDirection, WorkspaceId};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session already exists: {0}")]
    AlreadyExists(String),
    #[error("session file schema mismatch: {0}")]
    Schema(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMeta {
    pub id: SessionId,
    pub name: String,
    pub created_at: String,
    pub last_switched_at: String,
    /// True for generated names; renaming clears it.
    pub auto_named: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PaneNodeJson {
    #[serde(rename = "pane")]
    Pane {
        id: String,
        title: String,
    },
    #[serde(rename = "split")]
    Split {
        id: String,
        direction: String,
        first: Box<PaneNodeJson>,
        second: Box<PaneNodeJson>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceJson {
    pub id: WorkspaceId,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub main_pane: Option<PaneNodeJson>,
    #[serde(default)]
    pub stack_panes: Vec<PaneNodeJson>,
    #[serde(default)]
    pub focused_pane_id: Option<String>,
    #[serde(default)]
    pub active_stack_index: usize,
    pub layout_mode: String,
    #[serde(default)]
    pub zoomed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspacesFile {
    pub workspaces: Vec<WorkspaceJson>,
    pub active_workspace_id: WorkspaceId,
}

#[derive(Debug, Clone)]
pub struct SessionData {
    pub meta: SessionMeta,
    pub workspaces: Vec<Workspace>,
    pub active_workspace_id: WorkspaceId,
    pub cwd_map: HashMap<PaneId, PathBuf>,
}

// ─── Tree conversions ───────────────────────────────────────────────────────

fn node_to_json(node: &PaneNode) -> PaneNodeJson {
    match node {
        PaneNode::Pane { id, title, .. } => {
            PaneNodeJson::Pane { id: id.to_string(), title: title.clone() }
        }
        PaneNode::Split { id, direction, first, second, .. } => PaneNodeJson::Split {
            id: id.to_string(),
            direction: match direction {
                SplitDirection::Vertical => "vertical".to_string(),
                SplitDirection::Horizontal => "horizontal".to_string(),
            },
            first: Box::new(node_to_json(first)),
            second: Box::new(node_to_json(second)),
        },
    }
}

fn node_from_json(json: &PaneNodeJson) -> Option<PaneNode> {
    match json {
        PaneNodeJson::Pane { id, title } => Some(PaneNode::Pane {
            id: id.parse().ok()?,
            pty_id: None,
            title: title.clone(),
            rectangle: None,
        }),
        PaneNodeJson::Split { id, direction, first, second } => Some(PaneNode::Split {
            id: id.parse().ok()?,
            direction: match direction.as_str() {
                "horizontal" => SplitDirection::Horizontal,
                _ => SplitDirection::Vertical,
            },
            first: Box::new(node_from_json(first)?),
            second: Box::new(node_from_json(second)?),
            rectangle: None,
        }),
    }
}

fn mode_to_str(mode: LayoutMode) -> &'static str {
    match mode {
        LayoutMode::Vertical => "vertical",
        LayoutMode::Horizontal => "horizontal",
        LayoutMode::Stacked => "stacked",
    }
}

fn mode_from_str(s: &str) -> LayoutMode {
    match s {
        "horizontal" => LayoutMode::Horizontal,
        "stacked" => LayoutMode::Stacked,
        _ => LayoutMode::Vertical,
    }
}

pub fn workspace_to_json(ws: &Workspace) -> WorkspaceJson {
    WorkspaceJson {
        id: ws.id,
        label: ws.label.clone(),
        main_pane: ws.main_pane.as_ref().map(node_to_json),
        stack_panes: ws.stack_panes.iter().map(node_to_json).collect(),
        focused_pane_id: ws.focused_pane_id.map(|id| id.to_string()),
        active_stack_index: ws.active_stack_index,
        layout_mode: mode_to_str(ws.layout_mode).to_string(),
        zoomed: ws.zoomed,
    }
}

pub fn workspace_from_json(json: &WorkspaceJson) -> Workspace {
    let mut ws = Workspace::new(json.id);
    ws.label = json.label.clone();
    ws.main_pane = json.main_pane.as_ref().and_then(node_from_json);
    ws.stack_panes = json.stack_panes.iter().filter_map(node_from_json).collect();
    ws.focused_pane_id = json.focused_pane_id.as_ref().and_then(|s| s.parse().ok());
    ws.active_stack_index = json.active_stack_index;
    ws.layout_mode = mode_from_str(&json.layout_mode);
    ws.zoomed = json.zoomed;
    ws
}

/// Snapshot the layout state for saving.
pub fn snapshot_workspaces(layout: &LayoutState) -> WorkspacesFile {
    WorkspacesFile {
        workspaces: layout
            .workspaces
            .values()
            .filter(|ws| !ws.is_empty() || ws.label.is_some())
            .map(workspace_to_json)
            .collect(),
        active_workspace_id: layout.active_workspace_id,
    }
}

// ─── Store ──────────────────────────────────────────────────────────────────

const META_FILE: &str = "meta.json";
const WORKSPACES_FILE: &str = "workspaces.json";
const CWD_FILE: &str = "cwd.json";

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        SessionStore { dir }
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.session_dir(id).join(META_FILE).is_file()
    }

    pub fn list(&self) -> Vec<SessionMeta> {
        let mut sessions = Vec::new();
        let Ok(entries) = fs::read_dir(&self.dir) else { return sessions };
        for entry in entries.flatten() {
            let meta_path = entry.path().join(META_FILE);
            if let Ok(text) = fs::read_to_string(&meta_path) {
                match serde_json::from_str::<SessionMeta>(&text) {
                    Ok(meta) => sessions.push(meta),
                    Err(e) => log::error!("unreadable session meta {:?}: {}", meta_path, e),
                }
            }
        }
        sessions.sort_by(|a, b| b.last_switched_at.cmp(&a.last_switched_at));
        sessions
    }

    pub fn create(&self, name: &str, auto_named: bool) -> Result<SessionMeta, SessionError> {
        if self.exists(name) {
            return Err(SessionError::AlreadyExists(name.to_string()));
        }
        let now = Local::now().to_rfc3339();
        let meta = SessionMeta {
            id: name.to_string(),
            name: name.to_string(),
            created_at: now.clone(),
            last_switched_at: now,
            auto_named,
        };
        let dir = self.session_dir(name);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;
        Ok(meta)
    }

    /// Generated fallback name for `attach` without `--session`.
    pub fn generate_name(&self) -> String {
        let mut n = 0;
        loop {
            let candidate = if n == 0 { "main".to_string() } else { format!("main-{}", n) };
            if !self.exists(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn save(
        &self,
        meta: &SessionMeta,
        workspaces: &WorkspacesFile,
        cwd_map: &HashMap<PaneId, PathBuf>,
    ) -> Result<(), SessionError> {
        let dir = self.session_dir(&meta.id);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(META_FILE), serde_json::to_string_pretty(meta)?)?;
        fs::write(dir.join(WORKSPACES_FILE), serde_json::to_string_pretty(workspaces)?)?;
        let cwds: HashMap<String, &PathBuf> =
            cwd_map.iter().map(|(id, path)| (id.to_string(), path)).collect();
        fs::write(dir.join(CWD_FILE), serde_json::to_string_pretty(&cwds)?)?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<SessionData, SessionError> {
        let dir = self.session_dir(id);
        let meta: SessionMeta =
            serde_json::from_str(&fs::read_to_string(dir.join(META_FILE)).map_err(|_| {
                SessionError::NotFound(id.to_string())
            })?)?;
        let workspaces_file: WorkspacesFile = match fs::read_to_string(dir.join(WORKSPACES_FILE)) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(_) => WorkspacesFile { workspaces: Vec::new(), active_workspace_id: 1 },
        };
        let cwd_map = match fs::read_to_string(dir.join(CWD_FILE)) {
            Ok(text) => {
                let raw: HashMap<String, PathBuf> = serde_json::from_str(&text)?;
                raw.into_iter()
                    .filter_map(|(id, path)| id.parse::<PaneId>().ok().map(|id| (id, path)))
                    .collect()
            }
            Err(_) => HashMap::new(),
        };
        Ok(SessionData {
            meta,
            workspaces: workspaces_file.workspaces.iter().map(workspace_from_json).collect(),
            active_workspace_id: workspaces_file.active_workspace_id,
            cwd_map,
        })
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), SessionError> {
        if !self.exists(from) {
            return Err(SessionError::NotFound(from.to_string()));
        }
        if self.exists(to) {
            return Err(SessionError::AlreadyExists(to.to_string()));
        }
        fs::rename(self.session_dir(from), self.session_dir(to))?;
        // Rewrite the meta so id, name and the directory agree.
        let dir = self.session_dir(to);
        let mut meta: SessionMeta = serde_json::from_str(&fs::read_to_string(dir.join(META_FILE))?)?;
        meta.id = to.to_string();
        meta.name = to.to_string();
        meta.auto_named = false;
        fs::write(dir.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), SessionError> {
        if !self.exists(id) {
            return Err(SessionError::NotFound(id.to_string()));
        }
        fs::remove_dir_all(self.session_dir(id))?;
        Ok(())
    }
}

// ─── Manager ────────────────────────────────────────────────────────────────

/// Session bookkeeping for the running server. The switch choreography
/// (suspend PTYs, hydrate layout) lives in the app loop; this type owns
/// the disk side and the active/switching flags.
pub struct SessionManager {
    store: SessionStore,
    active: Option<SessionId>,
    /// Suppresses the empty-state UI between unload and hydrate.
    pub switching: bool,
}

pub struct DeleteOutcome {
    pub deleted_active: bool,
    /// Present when the last session was deleted and a fresh one was
    /// created to take its place.
    pub replacement: Option<SessionMeta>,
}

impl SessionManager {
    pub fn new(store: SessionStore) -> Self {
        SessionManager { store, active: None, switching: false }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn active(&self) -> Option<&SessionId> {
        self.active.as_ref()
    }

    pub fn set_active(&mut self, id: SessionId) {
        self.active = Some(id);
    }

    pub fn list(&self) -> Vec<SessionMeta> {
        self.store.list()
    }

    /// Open the named session, creating it on first use; generated names
    /// mark the session auto-named.
    pub fn open_or_create(&mut self, name: Option<&str>) -> Result<SessionMeta, SessionError> {
        let (name, auto_named) = match name {
            Some(n) => (n.to_string(), false),
            None => (self.store.generate_name(), true),
        };
        if self.store.exists(&name) {
            let data = self.store.load(&name)?;
            return Ok(data.meta);
        }
        self.store.create(&name, auto_named)
    }

    /// Persist the current layout under the active session.
    pub fn save_current(
        &self,
        layout: &LayoutState,
        cwd_map: &HashMap<PaneId, PathBuf>,
    ) -> Result<(), SessionError> {
        let Some(active) = &self.active else { return Ok(()) };
        let mut meta = match self.store.load(active) {
            Ok(data) => data.meta,
            Err(SessionError::NotFound(_)) => self.store.create(active, false)?,
            Err(e) => return Err(e),
        };
        meta.last_switched_at = Local::now().to_rfc3339();
        self.store.save(&meta, &snapshot_workspaces(layout), cwd_map)
    }

    pub fn load(&self, id: &str) -> Result<SessionData, SessionError> {
        self.store.load(id)
    }

    /// Delete a session. The deleted session is never saved; if it was
    /// the last one, a fresh empty session takes its place.
    pub fn delete(&mut self, id: &str) -> Result<DeleteOutcome, SessionError> {
        self.store.delete(id)?;
        let deleted_active = self.active.as_deref() == Some(id);
        if deleted_active {
            self.active = None;
        }
        let replacement = if self.store.list().is_empty() {
            let name = self.store.generate_name();
            Some(self.store.create(&name, true)?)
        } else {
            None
        };
        Ok(DeleteOutcome { deleted_active, replacement })
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), SessionError> {
        self.store.rename(from, to)?;
        if self.active.as_deref() == Some(from) {
            self.active = Some(to.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::layout::{Action, LayoutConfig};

    fn store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (SessionStore::new(dir.path().to_path_buf()), dir)
    }

    fn populated_layout() -> LayoutState {
        let mut layout = LayoutState::new(LayoutConfig::default());
        layout.set_viewport(Rect::new(0, 0, 120, 40));
        layout.new_pane(Some("editor".into()), None);
        layout.new_pane(Some("logs".into()), None);
        layout.split_pane(SplitDirection::Horizontal, Some("repl".into()));
        layout
    }

    #[test]
    fn save_load_roundtrip_preserves_tree() {
        let (store, _dir) = store();
        let layout = populated_layout();
        let meta = store.create("work", false).unwrap();
        let mut cwds = HashMap::new();
        cwds.insert(1u64, PathBuf::from("/tmp/project"));
        store.save(&meta, &snapshot_workspaces(&layout), &cwds).unwrap();

        let data = store.load("work").unwrap();
        assert_eq!(data.meta.name, "work");
        assert_eq!(data.workspaces.len(), 1);
        let ws = &data.workspaces[0];
        assert_eq!(ws.stack_panes.len(), 1);
        assert!(matches!(
            ws.stack_panes[0],
            PaneNode::Split { direction: SplitDirection::Horizontal, .. }
        ));
        assert_eq!(data.cwd_map.get(&1), Some(&PathBuf::from("/tmp/project")));
        // Focus survives the string round-trip.
        assert_eq!(ws.focused_pane_id, layout.active_workspace().unwrap().focused_pane_id);
    }

    #[test]
    fn loaded_ids_never_collide_with_fresh_ones() {
        let (store, _dir) = store();
        let layout = populated_layout();
        let max_id = {
            let mut panes = Vec::new();
            layout.active_workspace().unwrap().collect_all_panes(&mut panes);
            panes.iter().map(|p| p.id()).max().unwrap()
        };
        let meta = store.create("work", false).unwrap();
        store.save(&meta, &snapshot_workspaces(&layout), &HashMap::new()).unwrap();

        let data = store.load("work").unwrap();
        let mut fresh = LayoutState::new(LayoutConfig::default());
        fresh.set_viewport(Rect::new(0, 0, 120, 40));
        fresh.reduce(Action::LoadSession {
            workspaces: data.workspaces,
            active_workspace_id: data.active_workspace_id,
        });
        let new_pane = fresh.new_pane(None, None);
        assert!(new_pane > max_id);
    }

    #[test]
    fn create_twice_fails() {
        let (store, _dir) = store();
        store.create("dup", false).unwrap();
        assert!(matches!(store.create("dup", false), Err(SessionError::AlreadyExists(_))));
    }

    #[test]
    fn rename_moves_directory_and_rewrites_meta() {
        let (store, _dir) = store();
        store.create("old", true).unwrap();
        store.rename("old", "new").unwrap();
        assert!(!store.exists("old"));
        let data = store.load("new").unwrap();
        assert_eq!(data.meta.name, "new");
        assert!(!data.meta.auto_named, "explicit rename clears auto-naming");
    }

    #[test]
    fn delete_last_session_creates_replacement() {
        let (store, _dir) = store();
        let mut mgr = SessionManager::new(store);
        let meta = mgr.open_or_create(Some("solo")).unwrap();
        mgr.set_active(meta.id.clone());
        let outcome = mgr.delete("solo").unwrap();
        assert!(outcome.deleted_active);
        let replacement = outcome.replacement.expect("fresh session after deleting the last");
        assert!(replacement.auto_named);
        assert!(mgr.list().iter().any(|m| m.id == replacement.id));
    }

    #[test]
    fn delete_missing_session_reports_not_found() {
        let (store, _dir) = store();
        let mut mgr = SessionManager::new(store);
        assert!(matches!(mgr.delete("ghost"), Err(SessionError::NotFound(_))));
    }
}
