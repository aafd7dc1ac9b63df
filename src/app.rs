//! The UI task: single owner of layout, views, visibility, PTYs, the
//! Kitty pipeline and session state. Worker threads and control-socket
//! connections only ever talk to it through channels.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use chrono::Local;
use crossterm::event::{self, Event, KeyEvent, KeyEventKind, MouseEvent, MouseEventKind};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;

use crate::config::Config;
use crate::geometry::Rect;
use crate::input::{self, PrefixAction};
use crate::kitty_broker::TransmitBroker;
use crate::kitty_images::{GraphicsRenderer, PaneGeometry};
use crate::layout::{Action, LayoutConfig, LayoutMode, LayoutState};
use crate::pty::{PtyEvent, PtyManager};
use crate::rendering::{self, BufferSurface};
use crate::session::{SessionError, SessionManager, SessionStore};
use crate::types::*;
use crate::view::{RenderOverlays, ViewSet};
use crate::visibility::VisibilityRegistry;

const ESCAPE_TIME: Duration = Duration::from_millis(500);

pub struct App {
    pub config: Config,
    pub layout: LayoutState,
    pub views: ViewSet,
    pub visibility: VisibilityRegistry,
    pub ptys: PtyManager,
    pub broker: TransmitBroker,
    pub graphics: GraphicsRenderer,
    pub sessions: SessionManager,
    pty_rx: mpsc::Receiver<PtyEvent>,
    control_rx: Option<mpsc::Receiver<ControlRequest>>,
    /// Consecutive close dispatches coalesce until the next tick.
    pending_closes: Vec<Action>,
    prefix_armed: Option<Instant>,
    /// Pane whose viewport is being scrolled via the keyboard.
    scroll_pane: Option<PaneId>,
    /// Host accepts Kitty graphics commands (capability hint env vars).
    kitty_passthrough: bool,
    /// Versions the last frame was drawn at; the loop skips frames when
    /// nothing moved.
    last_rendered: (u64, u64),
    force_render: bool,
    last_frame: Instant,
    quit: bool,
    detach: bool,
}

impl App {
    pub fn new(config: Config, session_name: Option<&str>) -> io::Result<Self> {
        let (pty_tx, pty_rx) = mpsc::channel();
        let store = SessionStore::new(config.sessions_dir.clone());
        let mut sessions = SessionManager::new(store);
        let meta = sessions
            .open_or_create(session_name)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        sessions.set_active(meta.id.clone());
        let mut ptys = PtyManager::new(pty_tx, config.clone());
        ptys.set_session(&meta.id);

        let layout_config = LayoutConfig { main_ratio_permille: config.main_ratio_permille };
        Ok(App {
            layout: LayoutState::new(layout_config),
            views: ViewSet::new(),
            visibility: VisibilityRegistry::new(),
            ptys,
            broker: TransmitBroker::new(config.clone()),
            graphics: GraphicsRenderer::new(config.kitty_quiet),
            sessions,
            pty_rx,
            control_rx: None,
            pending_closes: Vec::new(),
            prefix_armed: None,
            scroll_pane: None,
            kitty_passthrough: crate::config::host_supports_kitty_graphics(),
            last_rendered: (u64::MAX, u64::MAX),
            force_render: true,
            last_frame: Instant::now(),
            quit: false,
            detach: false,
            config,
        })
    }

    pub fn set_control_rx(&mut self, rx: mpsc::Receiver<ControlRequest>) {
        self.control_rx = Some(rx);
    }

    pub fn active_session_id(&self) -> SessionId {
        self.sessions.active().cloned().unwrap_or_default()
    }

    // ─── Pane/PTY wiring ───────────────────────────────────────────────────

    fn pane_rect(&self, pane: PaneId) -> Option<Rect> {
        self.layout.find_pane(pane).and_then(|(_, node)| node.rectangle())
    }

    /// Create a pane and its PTY atomically; layout mutation takes the
    /// fast path so a burst of creations cannot stall a frame.
    pub fn new_pane_with_pty(&mut self, cwd: Option<PathBuf>) -> io::Result<PaneId> {
        let pane = self.layout.new_pane(None, None);
        self.spawn_pty_for(pane, cwd)?;
        Ok(pane)
    }

    fn spawn_pty_for(&mut self, pane: PaneId, cwd: Option<PathBuf>) -> io::Result<PtyId> {
        let rect = self.pane_rect(pane).unwrap_or(Rect::new(0, 0, 80, 24));
        let pty = self.ptys.spawn(pane, rect.height, rect.width, cwd, None)?;
        self.layout.set_pane_pty(pane, Some(pty));
        Ok(pty)
    }

    pub fn split_focused(&mut self, direction: SplitDirection) -> io::Result<Option<PaneId>> {
        let Some(pane) = self.layout.split_pane(direction, None) else {
            return Ok(None);
        };
        self.spawn_pty_for(pane, None)?;
        Ok(Some(pane))
    }

    /// User-initiated close: kill the child and let the exit event drive
    /// the pane removal, never the other way round.
    pub fn request_close_focused(&mut self) {
        if let Some(pane) = self.layout.focused_pane_id() {
            match self.layout.pty_of_pane(pane) {
                Some(pty) => self.ptys.kill_child(pty),
                None => self.pending_closes.push(Action::ClosePaneById(pane)),
            }
        }
    }

    fn on_pty_exit(&mut self, pty: PtyId) {
        let pane = self.ptys.handle_exit(pty).or_else(|| self.layout.pane_of_pty(pty));
        // No disable-write may race the teardown.
        self.visibility.clear_visible(pty);
        self.graphics.queue_pty_delete(pty);
        if let Some(pane) = pane {
            self.views.unmount(pane, &mut self.visibility);
            self.pending_closes.push(Action::ClosePaneById(pane));
        }
    }

    fn drain_pty_events(&mut self) {
        // Bounded per tick so a chatty child cannot starve input handling.
        for _ in 0..256 {
            match self.pty_rx.try_recv() {
                Ok(PtyEvent::Output(pty)) => {
                    if let Some(pane) = self.ptys.pane_of(pty) {
                        let update = self
                            .ptys
                            .emulator(pty)
                            .and_then(|emu| emu.lock().ok().and_then(|mut e| e.take_update()));
                        if let (Some(view), Some(update)) = (self.views.get_mut(pane), update) {
                            view.apply_update(update);
                        }
                    }
                }
                Ok(PtyEvent::Forward(pty, bytes)) => {
                    if self.kitty_passthrough {
                        self.broker.send(pty, bytes);
                    }
                }
                Ok(PtyEvent::Exited(pty)) => self.on_pty_exit(pty),
                Err(_) => break,
            }
        }
    }

    /// Mount views for visible panes with PTYs, unmount the rest, and
    /// keep the graphics renderer's pane table in sync.
    fn sync_views(&mut self) {
        let visible = rendering::visible_panes(&self.layout);
        let mut keep: Vec<PaneId> = Vec::new();
        for (pane, pty, rect) in &visible {
            let Some(pty) = *pty else { continue };
            let Some(emulator) = self.ptys.emulator(pty) else { continue };
            keep.push(*pane);
            self.ptys.resize(pty, rect.height, rect.width);
            let view = self.views.mount(*pane, pty, emulator.clone(), &mut self.visibility);
            let scroll = view.scroll_state();
            self.graphics.sync_pane(
                *pane,
                PaneGeometry {
                    pty,
                    emulator,
                    offset_x: rect.x,
                    offset_y: rect.y,
                    cols: rect.width,
                    rows: rect.height,
                    viewport_offset: scroll.viewport_offset,
                    scrollback_length: scroll.scrollback_length,
                    layer: PaneLayer::Base,
                    hidden: false,
                },
            );
        }
        for pane in self.views.panes() {
            if !keep.contains(&pane) {
                self.views.unmount(pane, &mut self.visibility);
                self.graphics.remove_pane(pane);
            }
        }
    }

    // ─── Session orchestration ─────────────────────────────────────────────

    fn should_persist_session(&self) -> bool {
        self.layout.workspaces.values().any(|ws| !ws.is_empty() || ws.label.is_some())
    }

    /// Suspend the active session's PTYs and detach its views. The PTYs
    /// stay alive for a later switch back.
    fn before_switch(&mut self, session: &SessionId) {
        for pane in self.views.panes() {
            self.views.unmount(pane, &mut self.visibility);
            self.graphics.remove_pane(pane);
        }
        self.ptys.suspend_session(session);
    }

    pub fn switch_session(&mut self, id: &str) -> Result<(), SessionError> {
        if self.sessions.active().map(|a| a.as_str()) == Some(id) {
            return Ok(());
        }
        self.sessions.switching = true;
        if let Some(current) = self.sessions.active().cloned() {
            if self.should_persist_session() {
                if let Err(e) = self.sessions.save_current(&self.layout, &self.ptys.capture_cwds()) {
                    log::warn!("session save before switch failed: {}", e);
                }
            }
            self.before_switch(&current);
        }
        let data = if self.sessions.store().exists(id) {
            self.sessions.load(id)?
        } else {
            let meta = self.sessions.store().create(id, false)?;
            crate::session::SessionData {
                meta,
                workspaces: Vec::new(),
                active_workspace_id: 1,
                cwd_map: Default::default(),
            }
        };
        self.sessions.set_active(data.meta.id.clone());
        let result = self.load_session_data(data, true);
        self.sessions.switching = false;
        result
    }

    fn load_session_data(
        &mut self,
        data: crate::session::SessionData,
        allow_prune: bool,
    ) -> Result<(), SessionError> {
        self.layout.reduce(Action::SetAllowPrune(false));
        self.layout.reduce(Action::LoadSession {
            workspaces: data.workspaces,
            active_workspace_id: data.active_workspace_id,
        });

        // Re-attach suspended PTYs by pane id; anything else respawns a
        // shell in the saved cwd.
        let restored = self.ptys.resume_session(&data.meta.id);
        let mut all_panes: Vec<PaneId> = Vec::new();
        for ws in self.layout.workspaces.values() {
            let mut nodes = Vec::new();
            ws.collect_all_panes(&mut nodes);
            all_panes.extend(nodes.iter().map(|n| n.id()));
        }
        for pane in all_panes {
            let attached = restored.get(&pane).copied().filter(|pty| self.ptys.get(*pty).is_some());
            match attached {
                Some(pty) => self.layout.set_pane_pty(pane, Some(pty)),
                None => {
                    let cwd = data.cwd_map.get(&pane).cloned();
                    if let Err(e) = self.spawn_pty_for(pane, cwd) {
                        log::warn!("respawn for pane {} failed: {}", pane, e);
                        self.pending_closes.push(Action::ClosePaneById(pane));
                    }
                }
            }
        }
        self.layout.reduce(Action::SetAllowPrune(allow_prune));
        if self.layout.workspaces.values().all(|ws| ws.is_empty()) {
            // A fresh or fully empty session still gets a shell.
            if let Err(e) = self.new_pane_with_pty(None) {
                log::warn!("initial pane for session failed: {}", e);
            }
        }
        self.sync_views();
        Ok(())
    }

    /// The deleted session is never saved; its PTYs die with it. Deleting
    /// the last session replaces it with a fresh empty one, hydrated with
    /// pruning off.
    pub fn delete_session(&mut self, id: &str) -> Result<(), SessionError> {
        let was_active = self.sessions.active().map(|a| a.as_str()) == Some(id);
        if was_active {
            let current = id.to_string();
            self.before_switch(&current);
        }
        let outcome = self.sessions.delete(id)?;
        self.ptys.destroy_session_ptys(&id.to_string());
        if outcome.deleted_active {
            let next = match outcome.replacement {
                Some(meta) => meta.id,
                None => match self.sessions.list().first() {
                    Some(meta) => meta.id.clone(),
                    None => return Ok(()),
                },
            };
            self.sessions.switching = true;
            let data = self.sessions.load(&next)?;
            self.sessions.set_active(next);
            self.layout.reduce(Action::ClearAll);
            let result = self.load_session_data(data, false);
            self.sessions.switching = false;
            result?;
        }
        Ok(())
    }

    pub fn save_active_session(&mut self) {
        if !self.should_persist_session() {
            return;
        }
        if let Err(e) = self.sessions.save_current(&self.layout, &self.ptys.capture_cwds()) {
            log::warn!("session save failed: {}", e);
        }
    }

    // ─── Control surface ───────────────────────────────────────────────────

    fn resolve_selector(&self, selector: Option<&PaneSelector>) -> Option<PaneId> {
        let ws = self.layout.active_workspace()?;
        match selector.unwrap_or(&PaneSelector::Focused) {
            PaneSelector::Focused => ws.focused_pane_id,
            PaneSelector::Main => ws.main_pane.as_ref().map(|m| m.first_pane_id()),
            PaneSelector::Stack(n) => {
                ws.stack_panes.get(n.checked_sub(1)?).map(|e| e.first_pane_id())
            }
            PaneSelector::ById(id) => self.layout.find_pane(*id).map(|_| *id),
            PaneSelector::ByPty(pty) => self.layout.pane_of_pty(*pty),
        }
    }

    fn capture_pane_text(&mut self, pane: PaneId, lines: Option<usize>, raw: bool) -> Option<String> {
        let pty = self.layout.pty_of_pane(pane)?;
        let emulator = self.ptys.emulator(pty)?;
        let mut out = Vec::new();
        let mut emu = emulator.lock().ok()?;
        if let Some(n) = lines {
            let total = emu.scroll_state().scrollback_length;
            let start = total.saturating_sub(n);
            emu.prefetch_scrollback_lines(start, total - start);
            for abs in start..total {
                if let Some(row) = emu.get_scrollback_line(abs) {
                    out.push(row_text(&row, raw));
                }
            }
        }
        let state = emu.snapshot();
        for row in &state.cells {
            out.push(row_text(row, raw));
        }
        Some(out.join("\n"))
    }

    fn drain_control_requests(&mut self) {
        let Some(rx) = self.control_rx.take() else { return };
        while let Ok(req) = rx.try_recv() {
            match req {
                ControlRequest::SessionList(resp) => {
                    let active = self.active_session_id();
                    let list: Vec<serde_json::Value> = self
                        .sessions
                        .list()
                        .into_iter()
                        .map(|m| {
                            serde_json::json!({
                                "name": m.name,
                                "created_at": m.created_at,
                                "last_switched_at": m.last_switched_at,
                                "attached": m.id == active,
                            })
                        })
                        .collect();
                    let _ = resp.send(serde_json::Value::Array(list).to_string());
                }
                ControlRequest::SessionCreate(name, resp) => {
                    let result = self
                        .sessions
                        .store()
                        .create(&name, false)
                        .map(|_| ())
                        .map_err(|e| e.to_string());
                    let _ = resp.send(result);
                }
                ControlRequest::SessionRename(from, to, resp) => {
                    let _ = resp.send(self.sessions.rename(&from, &to).map_err(|e| e.to_string()));
                }
                ControlRequest::SessionDelete(name, resp) => {
                    let _ = resp.send(self.delete_session(&name).map_err(|e| e.to_string()));
                }
                ControlRequest::SessionSwitch(name, resp) => {
                    let _ = resp.send(self.switch_session(&name).map_err(|e| e.to_string()));
                }
                ControlRequest::PaneSplit { direction, workspace, selector, resp } => {
                    if let Some(ws) = workspace {
                        self.layout.reduce(Action::SwitchWorkspace(ws));
                    }
                    if let Some(pane) = self.resolve_selector(selector.as_ref()) {
                        self.layout.focus_pane(pane);
                        let result = match self.split_focused(direction) {
                            Ok(Some(new_pane)) => Ok(new_pane),
                            Ok(None) => Err("not_found".to_string()),
                            Err(e) => Err(e.to_string()),
                        };
                        let _ = resp.send(result);
                    } else {
                        let _ = resp.send(Err("not_found".to_string()));
                    }
                }
                ControlRequest::PaneSend { text, selector, resp } => {
                    let result = match self.resolve_selector(selector.as_ref()) {
                        Some(pane) => match self.layout.pty_of_pane(pane) {
                            Some(pty) => {
                                let bytes = crate::util::unescape_text(&text).into_bytes();
                                self.ptys.write_input(pty, &bytes).map_err(|e| e.to_string())
                            }
                            None => Err("not_found".to_string()),
                        },
                        None => Err("not_found".to_string()),
                    };
                    let _ = resp.send(result);
                }
                ControlRequest::PaneCapture { lines, raw, selector, resp } => {
                    let result = match self.resolve_selector(selector.as_ref()) {
                        Some(pane) => self
                            .capture_pane_text(pane, lines, raw)
                            .ok_or("not_found".to_string()),
                        None => Err("not_found".to_string()),
                    };
                    let _ = resp.send(result);
                }
                ControlRequest::Detach => {
                    self.detach = true;
                }
            }
        }
        self.control_rx = Some(rx);
    }

    // ─── Input ─────────────────────────────────────────────────────────────

    fn scroll_focused(&mut self, delta: i64) {
        let Some(pane) = self.layout.focused_pane_id() else { return };
        let Some(pty) = self.layout.pty_of_pane(pane) else { return };
        let Some(emulator) = self.ptys.emulator(pty) else { return };
        let Ok(mut emu) = emulator.lock() else { return };
        let scroll = emu.scroll_state();
        let next = (scroll.viewport_offset as i64 + delta)
            .clamp(0, scroll.scrollback_length as i64) as usize;
        emu.set_viewport_offset(next);
        drop(emu);
        if let Some(view) = self.views.get_mut(pane) {
            view.mark_dirty();
        }
    }

    fn apply_prefix_action(&mut self, action: PrefixAction) -> io::Result<()> {
        match action {
            PrefixAction::NewPane => {
                self.new_pane_with_pty(None)?;
            }
            PrefixAction::Split(direction) => {
                self.split_focused(direction)?;
            }
            PrefixAction::ClosePane => self.request_close_focused(),
            PrefixAction::Navigate(dir) => self.layout.reduce(Action::Navigate(dir)),
            PrefixAction::SwapMain => self.layout.reduce(Action::SwapMain),
            PrefixAction::MovePane(dir) => self.layout.reduce(Action::MovePane(dir)),
            PrefixAction::ToggleZoom => self.layout.reduce(Action::ToggleZoom),
            PrefixAction::CycleLayoutMode => {
                let next = match self.layout.active_workspace().map(|ws| ws.layout_mode) {
                    Some(LayoutMode::Vertical) => LayoutMode::Horizontal,
                    Some(LayoutMode::Horizontal) => LayoutMode::Stacked,
                    _ => LayoutMode::Vertical,
                };
                self.layout.reduce(Action::SetLayoutMode(next));
            }
            PrefixAction::SwitchWorkspace(id) => {
                self.layout.reduce(Action::SwitchWorkspace(id));
            }
            PrefixAction::EnterScrollback => {
                self.scroll_pane = self.layout.focused_pane_id();
                self.scroll_focused(1);
            }
            PrefixAction::Detach => self.detach = true,
        }
        Ok(())
    }

    fn handle_key(&mut self, key: KeyEvent) -> io::Result<()> {
        use crossterm::event::KeyCode;

        // Scrollback browsing swallows navigation keys until dismissed.
        if let Some(pane) = self.scroll_pane {
            match key.code {
                KeyCode::Up | KeyCode::Char('k') => {
                    self.scroll_focused(1);
                    return Ok(());
                }
                KeyCode::Down | KeyCode::Char('j') => {
                    self.scroll_focused(-1);
                    return Ok(());
                }
                KeyCode::PageUp => {
                    self.scroll_focused(20);
                    return Ok(());
                }
                KeyCode::PageDown => {
                    self.scroll_focused(-20);
                    return Ok(());
                }
                KeyCode::Esc | KeyCode::Char('q') => {
                    if let Some(pty) = self.layout.pty_of_pane(pane) {
                        if let Some(emulator) = self.ptys.emulator(pty) {
                            if let Ok(mut emu) = emulator.lock() {
                                emu.set_viewport_offset(0);
                            }
                        }
                    }
                    if let Some(view) = self.views.get_mut(pane) {
                        view.mark_dirty();
                    }
                    self.scroll_pane = None;
                    return Ok(());
                }
                _ => {}
            }
        }

        if let Some(armed) = self.prefix_armed.take() {
            if armed.elapsed() < ESCAPE_TIME {
                if (key.code, key.modifiers) == input::PREFIX_KEY {
                    // Double prefix sends the literal key through.
                    return self.send_key_to_focused(&key);
                }
                if let Some(action) = input::prefix_action(&key) {
                    return self.apply_prefix_action(action);
                }
                return Ok(());
            }
        }
        if (key.code, key.modifiers) == input::PREFIX_KEY {
            self.prefix_armed = Some(Instant::now());
            return Ok(());
        }
        self.send_key_to_focused(&key)
    }

    fn send_key_to_focused(&mut self, key: &KeyEvent) -> io::Result<()> {
        let Some(pane) = self.layout.focused_pane_id() else { return Ok(()) };
        let Some(pty) = self.layout.pty_of_pane(pane) else { return Ok(()) };
        let mode = self
            .ptys
            .emulator(pty)
            .and_then(|emu| emu.lock().ok().map(|e| e.cursor_key_mode()))
            .unwrap_or_default();
        let bytes = input::encode_key(key, mode);
        if !bytes.is_empty() {
            self.ptys.write_input(pty, &bytes)?;
        }
        Ok(())
    }

    fn handle_mouse(&mut self, mouse: MouseEvent) -> io::Result<()> {
        let panes = rendering::visible_panes(&self.layout);
        let hit = panes
            .iter()
            .find(|(_, _, rect)| rect.contains(mouse.column, mouse.row))
            .cloned();
        let Some((pane, pty, rect)) = hit else { return Ok(()) };

        if matches!(mouse.kind, MouseEventKind::Down(_)) {
            self.layout.focus_pane(pane);
        }
        let Some(pty) = pty else { return Ok(()) };
        let (tracking, at_bottom) = self
            .ptys
            .emulator(pty)
            .and_then(|emu| {
                emu.lock()
                    .ok()
                    .map(|e| (e.get_mode(1000), e.scroll_state().is_at_bottom))
            })
            .unwrap_or((false, true));

        match mouse.kind {
            MouseEventKind::ScrollUp if !tracking => {
                self.layout.focus_pane(pane);
                self.scroll_focused(3);
            }
            MouseEventKind::ScrollDown if !tracking => {
                self.layout.focus_pane(pane);
                self.scroll_focused(-3);
            }
            _ if tracking && at_bottom => {
                let local_x = mouse.column - rect.x;
                let local_y = mouse.row - rect.y;
                if let Some(bytes) = input::encode_mouse_sgr(&mouse, local_x, local_y) {
                    self.ptys.write_input(pty, &bytes)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ─── Frame ─────────────────────────────────────────────────────────────

    fn render(&mut self, terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> io::Result<()> {
        let size = terminal.size()?;
        let content = Rect::new(0, 0, size.width, size.height.saturating_sub(1));
        self.layout.reduce(Action::SetViewport(content));
        self.sync_views();

        let session = self.active_session_id();
        let switching = self.sessions.switching;
        let clock = Local::now().format("%H:%M").to_string();
        let panes = rendering::visible_panes(&self.layout);
        let focused = self.layout.focused_pane_id();

        let mut cursor: Option<(u16, u16)> = None;
        let config = self.config.clone();
        let layout = &self.layout;
        let views = &mut self.views;
        terminal.draw(|f| {
            let buf = f.buffer_mut();
            let mut surface = BufferSurface { buf };
            if panes.is_empty() {
                rendering::draw_empty_state(&mut surface, content, switching);
            }
            for (pane, _pty, rect) in &panes {
                let Some(view) = views.get_mut(*pane) else {
                    rendering::fill_background(&mut surface, *rect);
                    continue;
                };
                let overlays = RenderOverlays {
                    focused: Some(*pane) == focused,
                    ..Default::default()
                };
                view.render(&mut surface, *rect, &overlays, &config);
                if Some(*pane) == focused {
                    if let Some(state) = view.terminal_state() {
                        cursor = rendering::cursor_position(state, view.scroll_state(), *rect);
                    }
                }
            }
            rendering::draw_status_line(
                &mut surface,
                Rect::new(0, size.height.saturating_sub(1), size.width, 1),
                layout,
                &session,
                &clock,
            );
            if let Some((x, y)) = cursor {
                f.set_cursor(x, y);
            }
        })?;

        // Prefetches queued during the draw run now; completion re-renders.
        for pane in self.views.panes() {
            let req = self.views.get_mut(pane).and_then(|v| v.take_prefetch_request());
            if let Some(req) = req {
                if let Some(emulator) = self.ptys.emulator(req.pty) {
                    if let Ok(mut emu) = emulator.lock() {
                        emu.prefetch_scrollback_lines(req.start, req.count);
                    }
                }
                if let Some(view) = self.views.get_mut(pane) {
                    view.prefetch_completed();
                }
            }
        }

        // Kitty frame: reconcile and drain through the single host sink.
        // Hosts without graphics support are spared the APC traffic.
        if self.kitty_passthrough {
            self.graphics.flush(&mut self.broker);
            self.broker.flush_pending(None);
        }
        self.last_rendered = (self.layout.layout_version, self.layout.layout_geometry_version);
        self.last_frame = Instant::now();
        self.force_render = false;
        Ok(())
    }

    // ─── Main loop ─────────────────────────────────────────────────────────

    /// Returns true when the loop ended in a detach (session saved, server
    /// exits cleanly) rather than the last pane closing.
    pub fn run(&mut self, terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> io::Result<bool> {
        // The broker owns the only path to the host TTY for graphics.
        self.broker.set_writer(Box::new(|bytes: &[u8]| {
            let mut stdout = io::stdout().lock();
            stdout.write_all(bytes)?;
            stdout.flush()
        }));

        if self.layout.active_workspace().map(|ws| ws.is_empty()).unwrap_or(true) {
            // First attach of this session: hydrate from disk or open a
            // fresh shell.
            let size = terminal.size()?;
            self.layout.reduce(Action::SetViewport(Rect::new(
                0,
                0,
                size.width,
                size.height.saturating_sub(1),
            )));
            let active = self.active_session_id();
            match self.sessions.load(&active) {
                Ok(data) if !data.workspaces.is_empty() => {
                    self.sessions.switching = true;
                    let _ = self.load_session_data(data, true);
                    self.sessions.switching = false;
                }
                _ => {
                    self.new_pane_with_pty(None)?;
                }
            }
        }

        while !self.quit && !self.detach {
            // Bursty updates coalesce: one frame per tick, and only when
            // a view, the layout, or the clock actually moved.
            let views_dirty = self.views.any_render_pending();
            let versions = (self.layout.layout_version, self.layout.layout_geometry_version);
            if self.force_render
                || views_dirty
                || versions != self.last_rendered
                || self.last_frame.elapsed() >= Duration::from_secs(1)
            {
                self.render(terminal)?;
            }

            if event::poll(Duration::from_millis(20))? {
                match event::read()? {
                    Event::Key(key)
                        if key.kind == KeyEventKind::Press || key.kind == KeyEventKind::Repeat =>
                    {
                        self.handle_key(key)?;
                    }
                    Event::Mouse(mouse) => self.handle_mouse(mouse)?,
                    Event::Resize(..) => self.force_render = true,
                    _ => {}
                }
            }

            self.drain_control_requests();
            self.drain_pty_events();

            // Close actions coalesce into one batched reduce per tick.
            if !self.pending_closes.is_empty() {
                let batch = std::mem::take(&mut self.pending_closes);
                self.layout.reduce_batch(batch);
                self.sync_views();
            }

            if self.layout.workspaces.values().all(|ws| ws.is_empty()) && !self.sessions.switching
            {
                self.quit = true;
            }
        }

        self.save_active_session();
        self.ptys.shutdown();
        Ok(self.detach)
    }
}

fn row_text(row: &[Cell], raw: bool) -> String {
    let mut text: String = row.iter().filter(|c| c.ch != '\0').map(|c| c.ch).collect();
    if !raw {
        while text.ends_with(' ') {
            text.pop();
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_text_trims_unless_raw() {
        let mut row = vec![Cell::default(); 6];
        row[0].ch = 'h';
        row[1].ch = 'i';
        assert_eq!(row_text(&row, false), "hi");
        assert_eq!(row_text(&row, true), "hi    ");
    }
}
