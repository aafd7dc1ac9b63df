//! Workspace/pane layout: a master-stack arrangement with nested binary
//! splits, driven by a reducer over [`LayoutState`]. The reducer owns all
//! structural change; rectangles are assigned by recalculation, never by
//! action handlers directly.

use std::collections::BTreeMap;

use crate::geometry::Rect;
use crate::types::{PaneId, PtyId, SplitDirection, WorkspaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMode {
    Vertical,
    Horizontal,
    Stacked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

/// A node of the pane tree: either a terminal pane or a binary split.
/// Splits nest without bound.
#[derive(Debug, Clone, PartialEq)]
pub enum PaneNode {
    Pane {
        id: PaneId,
        pty_id: Option<PtyId>,
        title: String,
        rectangle: Option<Rect>,
    },
    Split {
        id: PaneId,
        direction: SplitDirection,
        first: Box<PaneNode>,
        second: Box<PaneNode>,
        rectangle: Option<Rect>,
    },
}

impl PaneNode {
    pub fn pane(id: PaneId, title: impl Into<String>) -> Self {
        PaneNode::Pane { id, pty_id: None, title: title.into(), rectangle: None }
    }

    pub fn id(&self) -> PaneId {
        match self {
            PaneNode::Pane { id, .. } | PaneNode::Split { id, .. } => *id,
        }
    }

    pub fn rectangle(&self) -> Option<Rect> {
        match self {
            PaneNode::Pane { rectangle, .. } | PaneNode::Split { rectangle, .. } => *rectangle,
        }
    }

    pub fn is_pane(&self) -> bool {
        matches!(self, PaneNode::Pane { .. })
    }

    /// Depth-first pane leaves, first-child order.
    pub fn collect_panes<'a>(&'a self, out: &mut Vec<&'a PaneNode>) {
        match self {
            PaneNode::Pane { .. } => out.push(self),
            PaneNode::Split { first, second, .. } => {
                first.collect_panes(out);
                second.collect_panes(out);
            }
        }
    }

    pub fn contains(&self, pane_id: PaneId) -> bool {
        self.find_pane(pane_id).is_some()
    }

    pub fn find_pane(&self, pane_id: PaneId) -> Option<&PaneNode> {
        match self {
            PaneNode::Pane { id, .. } if *id == pane_id => Some(self),
            PaneNode::Pane { .. } => None,
            PaneNode::Split { first, second, .. } => {
                first.find_pane(pane_id).or_else(|| second.find_pane(pane_id))
            }
        }
    }

    pub fn find_pane_mut(&mut self, pane_id: PaneId) -> Option<&mut PaneNode> {
        match self {
            PaneNode::Pane { id, .. } if *id == pane_id => Some(self),
            PaneNode::Pane { .. } => None,
            PaneNode::Split { first, second, .. } => {
                if first.contains(pane_id) {
                    first.find_pane_mut(pane_id)
                } else {
                    second.find_pane_mut(pane_id)
                }
            }
        }
    }

    pub fn first_pane_id(&self) -> PaneId {
        match self {
            PaneNode::Pane { id, .. } => *id,
            PaneNode::Split { first, .. } => first.first_pane_id(),
        }
    }

    fn clear_rectangles(&mut self) {
        match self {
            PaneNode::Pane { rectangle, .. } => *rectangle = None,
            PaneNode::Split { rectangle, first, second, .. } => {
                *rectangle = None;
                first.clear_rectangles();
                second.clear_rectangles();
            }
        }
    }

    fn max_id(&self) -> PaneId {
        match self {
            PaneNode::Pane { id, .. } => *id,
            PaneNode::Split { id, first, second, .. } => {
                (*id).max(first.max_id()).max(second.max_id())
            }
        }
    }

    /// Assign `rect` to this subtree, partitioning splits 50/50 along their
    /// direction, depth-first, so every pane leaf ends with a concrete
    /// rectangle.
    fn assign_rectangles(&mut self, rect: Rect) {
        match self {
            PaneNode::Pane { rectangle, .. } => *rectangle = Some(rect),
            PaneNode::Split { direction, first, second, rectangle, .. } => {
                *rectangle = Some(rect);
                let (a, b) = match direction {
                    SplitDirection::Vertical => {
                        let left = rect.width / 2;
                        (
                            Rect::new(rect.x, rect.y, left, rect.height),
                            Rect::new(rect.x + left, rect.y, rect.width - left, rect.height),
                        )
                    }
                    SplitDirection::Horizontal => {
                        let top = rect.height / 2;
                        (
                            Rect::new(rect.x, rect.y, rect.width, top),
                            Rect::new(rect.x, rect.y + top, rect.width, rect.height - top),
                        )
                    }
                };
                first.assign_rectangles(a);
                second.assign_rectangles(b);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub label: Option<String>,
    pub main_pane: Option<PaneNode>,
    pub stack_panes: Vec<PaneNode>,
    pub focused_pane_id: Option<PaneId>,
    /// Remembers the last-focused stack entry even while focus sits on the
    /// main pane. Always within bounds when the stack is non-empty.
    pub active_stack_index: usize,
    pub layout_mode: LayoutMode,
    pub zoomed: bool,
}

impl Workspace {
    pub fn new(id: WorkspaceId) -> Self {
        Workspace {
            id,
            label: None,
            main_pane: None,
            stack_panes: Vec::new(),
            focused_pane_id: None,
            active_stack_index: 0,
            layout_mode: LayoutMode::Vertical,
            zoomed: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.main_pane.is_none() && self.stack_panes.is_empty()
    }

    pub fn pane_count(&self) -> usize {
        let mut panes = Vec::new();
        self.collect_all_panes(&mut panes);
        panes.len()
    }

    pub fn collect_all_panes<'a>(&'a self, out: &mut Vec<&'a PaneNode>) {
        if let Some(main) = &self.main_pane {
            main.collect_panes(out);
        }
        for node in &self.stack_panes {
            node.collect_panes(out);
        }
    }

    pub fn find_pane(&self, pane_id: PaneId) -> Option<&PaneNode> {
        if let Some(main) = &self.main_pane {
            if let Some(p) = main.find_pane(pane_id) {
                return Some(p);
            }
        }
        self.stack_panes.iter().find_map(|n| n.find_pane(pane_id))
    }

    pub fn find_pane_mut(&mut self, pane_id: PaneId) -> Option<&mut PaneNode> {
        if let Some(main) = &mut self.main_pane {
            if main.contains(pane_id) {
                return main.find_pane_mut(pane_id);
            }
        }
        self.stack_panes.iter_mut().find_map(|n| {
            if n.contains(pane_id) {
                n.find_pane_mut(pane_id)
            } else {
                None
            }
        })
    }

    fn in_main(&self, pane_id: PaneId) -> bool {
        self.main_pane.as_ref().map(|m| m.contains(pane_id)).unwrap_or(false)
    }

    fn stack_index_of(&self, pane_id: PaneId) -> Option<usize> {
        self.stack_panes.iter().position(|n| n.contains(pane_id))
    }

    fn clamp_stack_index(&mut self) {
        if self.stack_panes.is_empty() {
            self.active_stack_index = 0;
        } else if self.active_stack_index >= self.stack_panes.len() {
            self.active_stack_index = self.stack_panes.len() - 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayoutConfig {
    /// Main pane share of the viewport, per mille.
    pub main_ratio_permille: u16,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        LayoutConfig { main_ratio_permille: 550 }
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    FocusPane(PaneId),
    Navigate(Direction),
    NewPane { title: Option<String>, pty_id: Option<PtyId> },
    SplitPane { direction: SplitDirection, title: Option<String> },
    ClosePane,
    ClosePaneById(PaneId),
    SetViewport(Rect),
    SwitchWorkspace(WorkspaceId),
    SetLayoutMode(LayoutMode),
    SetWorkspaceLabel(WorkspaceId, Option<String>),
    SetPanePty(PaneId, Option<PtyId>),
    SetPaneTitle(PaneId, String),
    SwapMain,
    MovePane(Direction),
    ToggleZoom,
    LoadSession {
        workspaces: Vec<Workspace>,
        active_workspace_id: WorkspaceId,
    },
    SetAllowPrune(bool),
    ClearAll,
}

pub struct LayoutState {
    pub workspaces: BTreeMap<WorkspaceId, Workspace>,
    pub active_workspace_id: WorkspaceId,
    pub viewport: Rect,
    pub config: LayoutConfig,
    /// Bumped on changes worth persisting (structure, focus, labels, modes).
    pub layout_version: u64,
    /// Bumped whenever any rectangle changes.
    pub layout_geometry_version: u64,
    /// Suppresses empty-workspace pruning during session hydration.
    pub allow_prune: bool,
    next_id: u64,
}

impl Default for LayoutState {
    fn default() -> Self {
        Self::new(LayoutConfig::default())
    }
}

impl LayoutState {
    pub fn new(config: LayoutConfig) -> Self {
        let mut workspaces = BTreeMap::new();
        workspaces.insert(1, Workspace::new(1));
        LayoutState {
            workspaces,
            active_workspace_id: 1,
            viewport: Rect::new(0, 0, 0, 0),
            config,
            layout_version: 0,
            layout_geometry_version: 0,
            allow_prune: true,
            next_id: 1,
        }
    }

    fn generate_pane_id(&mut self) -> PaneId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn generate_split_id(&mut self) -> PaneId {
        // Same counter as panes: ids stay unique across both node kinds.
        self.generate_pane_id()
    }

    pub fn active_workspace(&self) -> Option<&Workspace> {
        self.workspaces.get(&self.active_workspace_id)
    }

    pub fn focused_pane_id(&self) -> Option<PaneId> {
        self.active_workspace().and_then(|ws| ws.focused_pane_id)
    }

    pub fn find_pane(&self, pane_id: PaneId) -> Option<(&Workspace, &PaneNode)> {
        self.workspaces.values().find_map(|ws| ws.find_pane(pane_id).map(|p| (ws, p)))
    }

    pub fn pty_of_pane(&self, pane_id: PaneId) -> Option<PtyId> {
        match self.find_pane(pane_id) {
            Some((_, PaneNode::Pane { pty_id, .. })) => *pty_id,
            _ => None,
        }
    }

    pub fn pane_of_pty(&self, pty: PtyId) -> Option<PaneId> {
        for ws in self.workspaces.values() {
            let mut panes = Vec::new();
            ws.collect_all_panes(&mut panes);
            for node in panes {
                if let PaneNode::Pane { id, pty_id: Some(p), .. } = node {
                    if *p == pty {
                        return Some(*id);
                    }
                }
            }
        }
        None
    }

    // ─── Reducer ───────────────────────────────────────────────────────────

    pub fn reduce(&mut self, action: Action) {
        match action {
            Action::FocusPane(id) => self.focus_pane(id),
            Action::Navigate(dir) => self.navigate(dir),
            Action::NewPane { title, pty_id } => {
                self.new_pane(title, pty_id);
            }
            Action::SplitPane { direction, title } => {
                self.split_pane(direction, title);
            }
            Action::ClosePane => {
                if let Some(focused) = self.focused_pane_id() {
                    self.close_pane_by_id(focused);
                }
            }
            Action::ClosePaneById(id) => self.close_pane_by_id(id),
            Action::SetViewport(rect) => self.set_viewport(rect),
            Action::SwitchWorkspace(id) => self.switch_workspace(id),
            Action::SetLayoutMode(mode) => self.set_layout_mode(mode),
            Action::SetWorkspaceLabel(id, label) => self.set_workspace_label(id, label),
            Action::SetPanePty(id, pty) => self.set_pane_pty(id, pty),
            Action::SetPaneTitle(id, title) => self.set_pane_title(id, title),
            Action::SwapMain => self.swap_main(),
            Action::MovePane(dir) => self.move_pane(dir),
            Action::ToggleZoom => self.toggle_zoom(),
            Action::LoadSession { workspaces, active_workspace_id } => {
                self.load_session(workspaces, active_workspace_id);
            }
            Action::SetAllowPrune(allow) => self.allow_prune = allow,
            Action::ClearAll => self.clear_all(),
        }
    }

    /// Coalesced dispatch for bursts of close actions arriving in one tick.
    pub fn reduce_batch(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.reduce(action);
        }
    }

    pub fn focus_pane(&mut self, id: PaneId) {
        let Some(ws) = self.workspaces.values_mut().find(|ws| ws.find_pane(id).is_some()) else {
            return;
        };
        let ws_id = ws.id;
        if ws.focused_pane_id == Some(id) && self.active_workspace_id == ws_id {
            return;
        }
        ws.focused_pane_id = Some(id);
        if let Some(idx) = ws.stack_index_of(id) {
            ws.active_stack_index = idx;
        }
        let zoomed = ws.zoomed;
        let stacked = ws.layout_mode == LayoutMode::Stacked;
        self.active_workspace_id = ws_id;
        self.layout_version += 1;
        if zoomed || stacked {
            self.recalculate_workspace(ws_id);
        }
    }

    /// Direct-mutation path for pane creation; skips the action plumbing so
    /// a burst of PTY attachments cannot stall a render tick.
    pub fn new_pane(&mut self, title: Option<String>, pty_id: Option<PtyId>) -> PaneId {
        let id = self.generate_pane_id();
        let title = title.unwrap_or_else(|| format!("pane-{}", id));
        let ws_id = self.active_workspace_id;
        let ws = self.workspaces.entry(ws_id).or_insert_with(|| Workspace::new(ws_id));
        let node = PaneNode::Pane { id, pty_id, title, rectangle: None };
        if ws.main_pane.is_none() {
            ws.main_pane = Some(node);
        } else {
            ws.stack_panes.push(node);
            ws.active_stack_index = ws.stack_panes.len() - 1;
        }
        ws.focused_pane_id = Some(id);
        self.layout_version += 1;
        self.recalculate_workspace(ws_id);
        id
    }

    pub fn split_pane(&mut self, direction: SplitDirection, title: Option<String>) -> Option<PaneId> {
        let ws_id = self.active_workspace_id;
        let focused = self.workspaces.get(&ws_id)?.focused_pane_id?;
        let split_id = self.generate_split_id();
        let new_id = self.generate_pane_id();
        let title = title.unwrap_or_else(|| format!("pane-{}", new_id));
        let ws = self.workspaces.get_mut(&ws_id)?;
        let target = ws.find_pane_mut(focused)?;
        let old = std::mem::replace(
            target,
            PaneNode::Pane { id: 0, pty_id: None, title: String::new(), rectangle: None },
        );
        *target = PaneNode::Split {
            id: split_id,
            direction,
            first: Box::new(old),
            second: Box::new(PaneNode::Pane { id: new_id, pty_id: None, title, rectangle: None }),
            rectangle: None,
        };
        ws.focused_pane_id = Some(new_id);
        self.layout_version += 1;
        self.recalculate_workspace(ws_id);
        Some(new_id)
    }

    pub fn close_pane_by_id(&mut self, id: PaneId) {
        let Some(ws_id) = self
            .workspaces
            .values()
            .find(|ws| ws.find_pane(id).is_some())
            .map(|ws| ws.id)
        else {
            return;
        };

        // Geometric neighbours are resolved against the pre-close rectangles.
        let closed_rect = self
            .workspaces
            .get(&ws_id)
            .and_then(|ws| ws.find_pane(id))
            .and_then(|n| n.rectangle());

        let ws = self.workspaces.get_mut(&ws_id).unwrap();
        let was_focused = ws.focused_pane_id == Some(id);
        let mut sibling_focus: Option<PaneId> = None;

        if ws.in_main(id) {
            let main = ws.main_pane.take().unwrap();
            match remove_from_subtree(main, id) {
                RemoveOutcome::Removed(remaining) => {
                    sibling_focus = remaining.as_ref().map(|n| n.first_pane_id());
                    ws.main_pane = remaining;
                }
                RemoveOutcome::NotFound(tree) => {
                    ws.main_pane = Some(tree);
                    return;
                }
            }
            if ws.main_pane.is_none() && !ws.stack_panes.is_empty() {
                // First stack entry is promoted, keeping its whole subtree.
                let promoted = ws.stack_panes.remove(0);
                sibling_focus = sibling_focus.or(Some(promoted.first_pane_id()));
                ws.main_pane = Some(promoted);
            }
        } else if let Some(idx) = ws.stack_index_of(id) {
            let entry = ws.stack_panes.remove(idx);
            match remove_from_subtree(entry, id) {
                RemoveOutcome::Removed(Some(remaining)) => {
                    sibling_focus = Some(remaining.first_pane_id());
                    ws.stack_panes.insert(idx, remaining);
                }
                RemoveOutcome::Removed(None) => {}
                RemoveOutcome::NotFound(tree) => {
                    ws.stack_panes.insert(idx, tree);
                    return;
                }
            }
        } else {
            return;
        }
        ws.clamp_stack_index();

        if was_focused {
            // Prefer the same-split sibling, then the best geometric
            // neighbour, then the main pane.
            let next = sibling_focus
                .or_else(|| {
                    closed_rect.and_then(|rect| nearest_pane(ws, rect, None))
                })
                .or_else(|| ws.main_pane.as_ref().map(|m| m.first_pane_id()));
            ws.focused_pane_id = next;
            if let Some(next) = next {
                if let Some(idx) = ws.stack_index_of(next) {
                    ws.active_stack_index = idx;
                }
            }
        }

        let empty_unlabeled = ws.is_empty() && ws.label.is_none();
        if empty_unlabeled && self.allow_prune && self.workspaces.len() > 1 {
            self.workspaces.remove(&ws_id);
            if self.active_workspace_id == ws_id {
                self.active_workspace_id =
                    self.workspaces.keys().next().copied().unwrap_or(1);
            }
        }
        self.layout_version += 1;
        self.recalculate_workspace(ws_id);
    }

    pub fn set_viewport(&mut self, rect: Rect) {
        if self.viewport == rect {
            return;
        }
        self.viewport = rect;
        let ids: Vec<WorkspaceId> = self
            .workspaces
            .values()
            .filter(|ws| !ws.is_empty())
            .map(|ws| ws.id)
            .collect();
        for id in ids {
            self.recalculate_workspace(id);
        }
    }

    pub fn switch_workspace(&mut self, id: WorkspaceId) {
        if self.active_workspace_id == id && self.workspaces.contains_key(&id) {
            return;
        }
        self.workspaces.entry(id).or_insert_with(|| Workspace::new(id));
        self.active_workspace_id = id;
        self.layout_version += 1;
        self.recalculate_workspace(id);
    }

    pub fn set_layout_mode(&mut self, mode: LayoutMode) {
        let ws_id = self.active_workspace_id;
        let Some(ws) = self.workspaces.get_mut(&ws_id) else { return };
        if ws.layout_mode == mode {
            return;
        }
        ws.layout_mode = mode;
        self.layout_version += 1;
        self.recalculate_workspace(ws_id);
    }

    pub fn set_workspace_label(&mut self, id: WorkspaceId, label: Option<String>) {
        let ws = self.workspaces.entry(id).or_insert_with(|| Workspace::new(id));
        if ws.label == label {
            return;
        }
        ws.label = label;
        self.layout_version += 1;
    }

    /// Fast path used while wiring a freshly spawned PTY to its pane.
    pub fn set_pane_pty(&mut self, pane_id: PaneId, pty: Option<PtyId>) {
        for ws in self.workspaces.values_mut() {
            if let Some(PaneNode::Pane { pty_id, .. }) = ws.find_pane_mut(pane_id) {
                if *pty_id != pty {
                    *pty_id = pty;
                    self.layout_version += 1;
                }
                return;
            }
        }
    }

    pub fn set_pane_title(&mut self, pane_id: PaneId, title: String) {
        for ws in self.workspaces.values_mut() {
            if let Some(PaneNode::Pane { title: t, .. }) = ws.find_pane_mut(pane_id) {
                if *t != title {
                    *t = title;
                    self.layout_version += 1;
                }
                return;
            }
        }
    }

    /// Swap the focused stack entry's whole subtree with the main subtree.
    pub fn swap_main(&mut self) {
        let ws_id = self.active_workspace_id;
        let Some(ws) = self.workspaces.get_mut(&ws_id) else { return };
        let Some(focused) = ws.focused_pane_id else { return };
        if ws.in_main(focused) {
            return;
        }
        let Some(idx) = ws.stack_index_of(focused) else { return };
        let Some(main) = ws.main_pane.take() else { return };
        let entry = std::mem::replace(&mut ws.stack_panes[idx], main);
        ws.main_pane = Some(entry);
        self.layout_version += 1;
        self.recalculate_workspace(ws_id);
    }

    pub fn toggle_zoom(&mut self) {
        let ws_id = self.active_workspace_id;
        let Some(ws) = self.workspaces.get_mut(&ws_id) else { return };
        ws.zoomed = !ws.zoomed;
        self.layout_version += 1;
        self.recalculate_workspace(ws_id);
    }

    pub fn load_session(&mut self, workspaces: Vec<Workspace>, active_workspace_id: WorkspaceId) {
        self.workspaces.clear();
        let mut max_id = 0;
        for mut ws in workspaces {
            if let Some(main) = &ws.main_pane {
                max_id = max_id.max(main.max_id());
            }
            for node in &ws.stack_panes {
                max_id = max_id.max(node.max_id());
            }
            ws.clamp_stack_index();
            self.workspaces.insert(ws.id, ws);
        }
        if self.workspaces.is_empty() {
            self.workspaces.insert(1, Workspace::new(1));
        }
        self.active_workspace_id = if self.workspaces.contains_key(&active_workspace_id) {
            active_workspace_id
        } else {
            *self.workspaces.keys().next().unwrap()
        };
        // Freshly generated ids must never collide with loaded ones.
        self.next_id = self.next_id.max(max_id + 1);
        self.layout_version += 1;
        let ids: Vec<WorkspaceId> = self.workspaces.keys().copied().collect();
        for id in ids {
            self.recalculate_workspace(id);
        }
    }

    pub fn clear_all(&mut self) {
        self.workspaces.clear();
        self.workspaces.insert(1, Workspace::new(1));
        self.active_workspace_id = 1;
        self.layout_version += 1;
        self.layout_geometry_version += 1;
    }

    // ─── Navigation ────────────────────────────────────────────────────────

    pub fn navigate(&mut self, dir: Direction) {
        let Some(target) = self.navigation_target(dir) else { return };
        self.focus_pane(target);
    }

    /// Resolve the pane focus would land on, without moving it. `None`
    /// means the move is a silent no-op.
    pub fn navigation_target(&self, dir: Direction) -> Option<PaneId> {
        let ws = self.active_workspace()?;
        let focused = ws.focused_pane_id?;

        // A sibling inside the enclosing split tree wins over a
        // main/stack crossing.
        if let Some(id) = split_step(ws, focused, dir) {
            return Some(id);
        }

        let in_main = ws.in_main(focused);
        let stack_idx = ws.stack_index_of(focused);
        let (cross_in, cross_out, along) = match ws.layout_mode {
            // Main sits left of the stack: east/west crosses.
            LayoutMode::Vertical | LayoutMode::Stacked => {
                (Direction::East, Direction::West, [Direction::North, Direction::South])
            }
            // Main sits above the stack: north/south crosses.
            LayoutMode::Horizontal => {
                (Direction::South, Direction::North, [Direction::West, Direction::East])
            }
        };

        if in_main && dir == cross_in && !ws.stack_panes.is_empty() {
            let entry = ws.stack_panes.get(ws.active_stack_index)?;
            return Some(self.enter_subtree(ws, entry, dir, focused));
        }
        if stack_idx.is_some() && dir == cross_out {
            let main = ws.main_pane.as_ref()?;
            return Some(self.enter_subtree(ws, main, dir, focused));
        }
        if let Some(idx) = stack_idx {
            if dir == along[0] && idx > 0 {
                let entry = &ws.stack_panes[idx - 1];
                return Some(self.enter_subtree(ws, entry, dir, focused));
            }
            if dir == along[1] && idx + 1 < ws.stack_panes.len() {
                let entry = &ws.stack_panes[idx + 1];
                return Some(self.enter_subtree(ws, entry, dir, focused));
            }
        }
        None
    }

    /// Pick the leaf inside `subtree` nearest to the pane we came from;
    /// equidistant candidates resolve to the earlier-inserted one.
    fn enter_subtree(&self, ws: &Workspace, subtree: &PaneNode, _dir: Direction, from: PaneId) -> PaneId {
        let from_rect = ws.find_pane(from).and_then(|n| n.rectangle());
        let mut leaves = Vec::new();
        subtree.collect_panes(&mut leaves);
        let Some(from_rect) = from_rect else {
            return subtree.first_pane_id();
        };
        let (fx, fy) = from_rect.center();
        leaves
            .iter()
            .filter_map(|leaf| leaf.rectangle().map(|r| (leaf.id(), r)))
            .min_by_key(|(_, r)| {
                let (cx, cy) = r.center();
                (fx - cx).abs() + (fy - cy).abs()
            })
            .map(|(id, _)| id)
            .unwrap_or_else(|| subtree.first_pane_id())
    }

    /// Swap the focused pane with its geometric neighbour. When the move
    /// runs along the stack with no in-direction sibling, the stack entries
    /// are reordered instead.
    pub fn move_pane(&mut self, dir: Direction) {
        let ws_id = self.active_workspace_id;
        let (focused, layout_mode, stack_idx, stack_len) = {
            let Some(ws) = self.active_workspace() else { return };
            let Some(focused) = ws.focused_pane_id else { return };
            (focused, ws.layout_mode, ws.stack_index_of(focused), ws.stack_panes.len())
        };

        if let Some(target) = self.navigation_target(dir) {
            let ws = self.workspaces.get_mut(&ws_id).unwrap();
            swap_panes(ws, focused, target);
            if let Some(idx) = ws.stack_index_of(focused) {
                ws.active_stack_index = idx;
            }
            self.layout_version += 1;
            self.recalculate_workspace(ws_id);
            return;
        }

        // No target: reorder top-level stack entries along the stack axis.
        let along = match layout_mode {
            LayoutMode::Vertical | LayoutMode::Stacked => [Direction::North, Direction::South],
            LayoutMode::Horizontal => [Direction::West, Direction::East],
        };
        let Some(idx) = stack_idx else { return };
        let new_idx = if dir == along[0] && idx > 0 {
            idx - 1
        } else if dir == along[1] && idx + 1 < stack_len {
            idx + 1
        } else {
            return;
        };
        let ws = self.workspaces.get_mut(&ws_id).unwrap();
        ws.stack_panes.swap(idx, new_idx);
        ws.active_stack_index = new_idx;
        self.layout_version += 1;
        self.recalculate_workspace(ws_id);
    }

    // ─── Rectangle calculation ─────────────────────────────────────────────

    pub fn recalculate_workspace(&mut self, ws_id: WorkspaceId) {
        let viewport = self.viewport;
        let ratio = self.config.main_ratio_permille;
        let Some(ws) = self.workspaces.get_mut(&ws_id) else { return };
        let before = collect_rects(ws);
        recalculate(ws, viewport, ratio);
        if collect_rects(ws) != before {
            self.layout_geometry_version += 1;
        }
    }
}

fn collect_rects(ws: &Workspace) -> Vec<(PaneId, Option<Rect>)> {
    let mut panes = Vec::new();
    ws.collect_all_panes(&mut panes);
    panes.iter().map(|n| (n.id(), n.rectangle())).collect()
}

fn recalculate(ws: &mut Workspace, viewport: Rect, ratio_permille: u16) {
    if let Some(main) = &mut ws.main_pane {
        main.clear_rectangles();
    }
    for node in &mut ws.stack_panes {
        node.clear_rectangles();
    }
    if viewport.width == 0 || viewport.height == 0 {
        return;
    }

    if ws.zoomed {
        if let Some(focused) = ws.focused_pane_id {
            if let Some(node) = ws.find_pane_mut(focused) {
                if let PaneNode::Pane { rectangle, .. } = node {
                    *rectangle = Some(viewport);
                }
            }
        }
        return;
    }

    let Some(main) = &mut ws.main_pane else { return };
    if ws.stack_panes.is_empty() {
        main.assign_rectangles(viewport);
        return;
    }

    match ws.layout_mode {
        LayoutMode::Vertical => {
            let main_w = (viewport.width as u32 * ratio_permille as u32 / 1000) as u16;
            main.assign_rectangles(Rect::new(viewport.x, viewport.y, main_w, viewport.height));
            let strip = Rect::new(
                viewport.x + main_w,
                viewport.y,
                viewport.width - main_w,
                viewport.height,
            );
            let n = ws.stack_panes.len() as u16;
            let slice_h = strip.height / n;
            for (i, node) in ws.stack_panes.iter_mut().enumerate() {
                let y = strip.y + slice_h * i as u16;
                let h = if i as u16 == n - 1 { strip.height - slice_h * (n - 1) } else { slice_h };
                node.assign_rectangles(Rect::new(strip.x, y, strip.width, h));
            }
        }
        LayoutMode::Horizontal => {
            let main_h = (viewport.height as u32 * ratio_permille as u32 / 1000) as u16;
            main.assign_rectangles(Rect::new(viewport.x, viewport.y, viewport.width, main_h));
            let strip = Rect::new(
                viewport.x,
                viewport.y + main_h,
                viewport.width,
                viewport.height - main_h,
            );
            let n = ws.stack_panes.len() as u16;
            let slice_w = strip.width / n;
            for (i, node) in ws.stack_panes.iter_mut().enumerate() {
                let x = strip.x + slice_w * i as u16;
                let w = if i as u16 == n - 1 { strip.width - slice_w * (n - 1) } else { slice_w };
                node.assign_rectangles(Rect::new(x, strip.y, w, strip.height));
            }
        }
        LayoutMode::Stacked => {
            let main_w = (viewport.width as u32 * ratio_permille as u32 / 1000) as u16;
            main.assign_rectangles(Rect::new(viewport.x, viewport.y, main_w, viewport.height));
            let strip = Rect::new(
                viewport.x + main_w,
                viewport.y,
                viewport.width - main_w,
                viewport.height,
            );
            // Only the active stack entry is visible in stacked mode.
            let active = ws.active_stack_index.min(ws.stack_panes.len() - 1);
            ws.stack_panes[active].assign_rectangles(strip);
        }
    }
}

enum RemoveOutcome {
    /// The pane was removed; the remaining subtree (if any) takes its slot.
    Removed(Option<PaneNode>),
    NotFound(PaneNode),
}

/// Remove the pane leaf with `id` from a subtree; a split whose leaf is
/// removed collapses to its sibling.
fn remove_from_subtree(node: PaneNode, id: PaneId) -> RemoveOutcome {
    match node {
        PaneNode::Pane { id: pid, .. } if pid == id => RemoveOutcome::Removed(None),
        PaneNode::Pane { .. } => RemoveOutcome::NotFound(node),
        PaneNode::Split { id: sid, direction, first, second, rectangle } => {
            match remove_from_subtree(*first, id) {
                RemoveOutcome::Removed(None) => RemoveOutcome::Removed(Some(*second)),
                RemoveOutcome::Removed(Some(rest)) => RemoveOutcome::Removed(Some(PaneNode::Split {
                    id: sid,
                    direction,
                    first: Box::new(rest),
                    second,
                    rectangle,
                })),
                RemoveOutcome::NotFound(first) => match remove_from_subtree(*second, id) {
                    RemoveOutcome::Removed(None) => RemoveOutcome::Removed(Some(first)),
                    RemoveOutcome::Removed(Some(rest)) => {
                        RemoveOutcome::Removed(Some(PaneNode::Split {
                            id: sid,
                            direction,
                            first: Box::new(first),
                            second: Box::new(rest),
                            rectangle,
                        }))
                    }
                    RemoveOutcome::NotFound(second) => RemoveOutcome::NotFound(PaneNode::Split {
                        id: sid,
                        direction,
                        first: Box::new(first),
                        second: Box::new(second),
                        rectangle,
                    }),
                },
            }
        }
    }
}

/// Step to the geometrically adjacent sibling within the enclosing split
/// tree, if the direction lines up with a split the focused pane sits in.
fn split_step(ws: &Workspace, focused: PaneId, dir: Direction) -> Option<PaneId> {
    let root: &PaneNode = if ws.in_main(focused) {
        ws.main_pane.as_ref()?
    } else {
        let idx = ws.stack_index_of(focused)?;
        &ws.stack_panes[idx]
    };

    // Walk down, remembering the deepest split that can serve the move.
    let mut best: Option<&PaneNode> = None;
    let mut node = root;
    loop {
        match node {
            PaneNode::Pane { .. } => break,
            PaneNode::Split { direction, first, second, .. } => {
                let axis_ok = matches!(
                    (*direction, dir),
                    (SplitDirection::Vertical, Direction::East)
                        | (SplitDirection::Vertical, Direction::West)
                        | (SplitDirection::Horizontal, Direction::North)
                        | (SplitDirection::Horizontal, Direction::South)
                );
                let in_first = first.contains(focused);
                let forward = matches!(dir, Direction::East | Direction::South);
                if axis_ok && ((in_first && forward) || (!in_first && !forward)) {
                    let sibling: &PaneNode = if in_first { second } else { first };
                    best = Some(sibling);
                }
                node = if in_first { first } else { second };
            }
        }
    }

    let sibling = best?;
    // Nearest leaf of the sibling subtree, earlier-inserted on ties.
    let from_rect = ws.find_pane(focused).and_then(|n| n.rectangle());
    let mut leaves = Vec::new();
    sibling.collect_panes(&mut leaves);
    if let Some(from_rect) = from_rect {
        let (fx, fy) = from_rect.center();
        leaves
            .iter()
            .filter_map(|leaf| leaf.rectangle().map(|r| (leaf.id(), r)))
            .min_by_key(|(_, r)| {
                let (cx, cy) = r.center();
                (fx - cx).abs() + (fy - cy).abs()
            })
            .map(|(id, _)| id)
            .or_else(|| Some(sibling.first_pane_id()))
    } else {
        Some(sibling.first_pane_id())
    }
}

/// Nearest pane to `rect` by center distance, skipping `exclude`.
fn nearest_pane(ws: &Workspace, rect: Rect, exclude: Option<PaneId>) -> Option<PaneId> {
    let (fx, fy) = rect.center();
    let mut panes = Vec::new();
    ws.collect_all_panes(&mut panes);
    panes
        .iter()
        .filter(|n| Some(n.id()) != exclude)
        .filter_map(|n| n.rectangle().map(|r| (n.id(), r)))
        .min_by_key(|(_, r)| {
            let (cx, cy) = r.center();
            (fx - cx).abs() + (fy - cy).abs()
        })
        .map(|(id, _)| id)
}

/// Swap two pane leaves in place, keeping tree shape. Ids, PTYs and titles
/// travel together; rectangles stay with the positions. The first leaf is
/// parked on a sentinel id mid-swap so lookups stay unambiguous.
fn swap_panes(ws: &mut Workspace, a: PaneId, b: PaneId) {
    if a == b {
        return;
    }
    let va = match ws.find_pane_mut(a) {
        Some(PaneNode::Pane { id, pty_id, title, .. }) => {
            let v = (*id, *pty_id, title.clone());
            *id = 0;
            v
        }
        _ => return,
    };
    let vb = match ws.find_pane_mut(b) {
        Some(PaneNode::Pane { id, pty_id, title, .. }) => {
            let vb = (*id, *pty_id, title.clone());
            *id = va.0;
            *pty_id = va.1;
            *title = va.2.clone();
            Some(vb)
        }
        _ => None,
    };
    if let Some(PaneNode::Pane { id, pty_id, title, .. }) = ws.find_pane_mut(0) {
        match vb {
            Some(vb) => {
                *id = vb.0;
                *pty_id = vb.1;
                *title = vb.2;
            }
            None => *id = va.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(width: u16, height: u16) -> LayoutState {
        let mut st = LayoutState::default();
        st.set_viewport(Rect::new(0, 0, width, height));
        st
    }

    fn pane_ids(ws: &Workspace) -> Vec<PaneId> {
        let mut panes = Vec::new();
        ws.collect_all_panes(&mut panes);
        panes.iter().map(|n| n.id()).collect()
    }

    #[test]
    fn split_chain_builds_nested_tree() {
        let mut st = state(120, 40);
        let p1 = st.new_pane(None, None);
        st.reduce(Action::SplitPane { direction: SplitDirection::Vertical, title: None });
        let p3 = st.split_pane(SplitDirection::Horizontal, None).unwrap();

        let ws = st.active_workspace().unwrap();
        let main = ws.main_pane.as_ref().unwrap();
        match main {
            PaneNode::Split { direction: SplitDirection::Vertical, first, second, .. } => {
                assert_eq!(first.id(), p1);
                assert!(matches!(
                    &**second,
                    PaneNode::Split { direction: SplitDirection::Horizontal, .. }
                ));
            }
            other => panic!("expected vertical split at root, got {:?}", other),
        }
        let mut panes = Vec::new();
        main.collect_panes(&mut panes);
        assert_eq!(panes.len(), 3);
        for leaf in &panes {
            let rect = leaf.rectangle().expect("every leaf has a rectangle");
            assert!(rect.width + rect.height > 0);
        }
        assert_eq!(ws.focused_pane_id, Some(p3));
    }

    #[test]
    fn navigation_moves_through_stack_without_wrapping() {
        let mut st = state(120, 40);
        let p1 = st.new_pane(None, None);
        let p2 = st.new_pane(None, None);
        let p3 = st.new_pane(None, None);
        let p4 = st.new_pane(None, None);
        st.focus_pane(p3);
        assert_eq!(st.active_workspace().unwrap().active_stack_index, 1);

        st.navigate(Direction::North);
        assert_eq!(st.focused_pane_id(), Some(p2));
        st.navigate(Direction::South);
        st.navigate(Direction::South);
        assert_eq!(st.focused_pane_id(), Some(p4));
        st.navigate(Direction::South);
        assert_eq!(st.focused_pane_id(), Some(p4), "no wrap past the stack end");
        st.navigate(Direction::West);
        assert_eq!(st.focused_pane_id(), Some(p1));
    }

    #[test]
    fn east_from_main_targets_active_stack_entry() {
        let mut st = state(120, 40);
        let p1 = st.new_pane(None, None);
        let _p2 = st.new_pane(None, None);
        let p3 = st.new_pane(None, None);
        st.focus_pane(p3);
        st.focus_pane(p1);
        // active_stack_index still remembers p3.
        st.navigate(Direction::East);
        assert_eq!(st.focused_pane_id(), Some(p3));
    }

    #[test]
    fn close_main_promotes_first_stack_entry() {
        let mut st = state(120, 40);
        let p1 = st.new_pane(None, None);
        let p2 = st.new_pane(None, None);
        let p3 = st.new_pane(None, None);
        st.focus_pane(p1);
        st.reduce(Action::ClosePane);

        let ws = st.active_workspace().unwrap();
        assert_eq!(ws.main_pane.as_ref().map(|m| m.id()), Some(p2));
        assert_eq!(pane_ids(ws), vec![p2, p3]);
        assert_eq!(ws.focused_pane_id, Some(p2));
    }

    #[test]
    fn close_split_leaf_collapses_to_sibling() {
        let mut st = state(120, 40);
        let p1 = st.new_pane(None, None);
        let p2 = st.split_pane(SplitDirection::Vertical, None).unwrap();
        st.close_pane_by_id(p2);
        let ws = st.active_workspace().unwrap();
        assert!(matches!(ws.main_pane.as_ref().unwrap(), PaneNode::Pane { id, .. } if *id == p1));
        assert_eq!(ws.focused_pane_id, Some(p1));
    }

    #[test]
    fn close_last_pane_prunes_unlabeled_workspace() {
        let mut st = state(120, 40);
        st.switch_workspace(2);
        let p = st.new_pane(None, None);
        st.close_pane_by_id(p);
        assert!(!st.workspaces.contains_key(&2));
        assert!(st.workspaces.contains_key(&1));
    }

    #[test]
    fn labeled_workspace_survives_emptying() {
        let mut st = state(120, 40);
        st.switch_workspace(2);
        st.set_workspace_label(2, Some("logs".into()));
        let p = st.new_pane(None, None);
        st.close_pane_by_id(p);
        assert!(st.workspaces.contains_key(&2));
    }

    #[test]
    fn vertical_layout_rectangles() {
        let mut st = state(100, 40);
        let p1 = st.new_pane(None, None);
        let p2 = st.new_pane(None, None);
        let p3 = st.new_pane(None, None);
        let ws = st.active_workspace().unwrap();
        let main_rect = ws.find_pane(p1).unwrap().rectangle().unwrap();
        assert_eq!(main_rect, Rect::new(0, 0, 55, 40));
        let r2 = ws.find_pane(p2).unwrap().rectangle().unwrap();
        let r3 = ws.find_pane(p3).unwrap().rectangle().unwrap();
        assert_eq!(r2, Rect::new(55, 0, 45, 20));
        // Last slice absorbs the remainder.
        assert_eq!(r3, Rect::new(55, 20, 45, 20));
    }

    #[test]
    fn stacked_layout_shows_only_active_entry() {
        let mut st = state(100, 40);
        let _p1 = st.new_pane(None, None);
        let p2 = st.new_pane(None, None);
        let p3 = st.new_pane(None, None);
        st.set_layout_mode(LayoutMode::Stacked);
        st.focus_pane(p2);
        let ws = st.active_workspace().unwrap();
        assert!(ws.find_pane(p2).unwrap().rectangle().is_some());
        assert!(ws.find_pane(p3).unwrap().rectangle().is_none());
    }

    #[test]
    fn zoom_gives_focused_pane_the_viewport() {
        let mut st = state(100, 40);
        let _p1 = st.new_pane(None, None);
        let p2 = st.new_pane(None, None);
        st.focus_pane(p2);
        st.toggle_zoom();
        let ws = st.active_workspace().unwrap();
        let mut panes = Vec::new();
        ws.collect_all_panes(&mut panes);
        let with_rect: Vec<_> = panes.iter().filter(|n| n.rectangle().is_some()).collect();
        assert_eq!(with_rect.len(), 1);
        assert_eq!(with_rect[0].rectangle().unwrap(), st.viewport);
        st.toggle_zoom();
        let ws = st.active_workspace().unwrap();
        let mut panes = Vec::new();
        ws.collect_all_panes(&mut panes);
        assert!(panes.iter().all(|n| n.rectangle().is_some()));
    }

    #[test]
    fn swap_main_exchanges_subtrees() {
        let mut st = state(100, 40);
        let p1 = st.new_pane(None, None);
        let p2 = st.new_pane(None, None);
        st.focus_pane(p2);
        st.swap_main();
        let ws = st.active_workspace().unwrap();
        assert_eq!(ws.main_pane.as_ref().map(|m| m.id()), Some(p2));
        assert_eq!(ws.stack_panes[0].id(), p1);
        // Focused pane is now in main; SwapMain again is a no-op.
        let version = st.layout_version;
        st.swap_main();
        assert_eq!(st.layout_version, version);
    }

    #[test]
    fn move_pane_reorders_stack() {
        let mut st = state(100, 40);
        let _p1 = st.new_pane(None, None);
        let p2 = st.new_pane(None, None);
        let p3 = st.new_pane(None, None);
        st.focus_pane(p3);
        st.move_pane(Direction::North);
        let ws = st.active_workspace().unwrap();
        assert_eq!(ws.stack_panes[0].id(), p3);
        assert_eq!(ws.stack_panes[1].id(), p2);
        assert_eq!(ws.focused_pane_id, Some(p3));
    }

    #[test]
    fn load_session_syncs_id_counter() {
        let mut st = state(100, 40);
        let mut ws = Workspace::new(1);
        ws.main_pane = Some(PaneNode::pane(41, "old"));
        ws.focused_pane_id = Some(41);
        st.reduce(Action::LoadSession { workspaces: vec![ws], active_workspace_id: 1 });
        let fresh = st.new_pane(None, None);
        assert!(fresh > 41, "fresh id {} must not collide with loaded ids", fresh);
    }

    #[test]
    fn layout_version_monotonic_and_strict_only_on_change() {
        let mut st = state(100, 40);
        let p1 = st.new_pane(None, None);
        let v = st.layout_version;
        // Focusing the already-focused pane changes nothing.
        st.focus_pane(p1);
        assert_eq!(st.layout_version, v);
        st.set_pane_title(p1, "pane-1".to_string());
        let v2 = st.layout_version;
        st.set_pane_title(p1, "pane-1".to_string());
        assert_eq!(st.layout_version, v2);
        st.set_pane_title(p1, "shell".to_string());
        assert!(st.layout_version > v2);
    }

    #[test]
    fn geometry_version_bumps_on_viewport_change() {
        let mut st = state(100, 40);
        st.new_pane(None, None);
        let g = st.layout_geometry_version;
        st.set_viewport(Rect::new(0, 0, 80, 24));
        assert!(st.layout_geometry_version > g);
        let g2 = st.layout_geometry_version;
        st.set_viewport(Rect::new(0, 0, 80, 24));
        assert_eq!(st.layout_geometry_version, g2);
    }

    #[test]
    fn every_leaf_has_rect_after_reduce() {
        let mut st = state(120, 40);
        st.new_pane(None, None);
        st.new_pane(None, None);
        st.split_pane(SplitDirection::Horizontal, None);
        st.split_pane(SplitDirection::Vertical, None);
        for ws in st.workspaces.values() {
            if ws.main_pane.is_none() {
                continue;
            }
            let mut panes = Vec::new();
            ws.collect_all_panes(&mut panes);
            for pane in panes {
                assert!(pane.rectangle().is_some(), "pane {} missing rect", pane.id());
            }
        }
    }

    #[test]
    fn focus_follows_invariant() {
        let mut st = state(120, 40);
        let _p1 = st.new_pane(None, None);
        let p2 = st.new_pane(None, None);
        st.focus_pane(p2);
        let ws = st.active_workspace().unwrap();
        let focused = ws.focused_pane_id.unwrap();
        let in_main = ws.in_main(focused);
        let in_active_stack = ws
            .stack_panes
            .get(ws.active_stack_index)
            .map(|n| n.contains(focused))
            .unwrap_or(false);
        assert!(in_main || in_active_stack);
    }

    #[test]
    fn prune_suppressed_while_loading() {
        let mut st = state(120, 40);
        st.reduce(Action::SetAllowPrune(false));
        st.switch_workspace(2);
        let p = st.new_pane(None, None);
        st.close_pane_by_id(p);
        assert!(st.workspaces.contains_key(&2));
        st.reduce(Action::SetAllowPrune(true));
    }
}
