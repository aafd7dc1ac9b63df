//! Per-pane terminal rendering: reconciles emulator updates and scrollback
//! prefetches with a direct cell-buffer draw. The scrollback render guard
//! substitutes the last-stable snapshot whenever the desired frame would
//! flash missing rows mid-scroll.

use std::collections::HashMap;

use crate::config::Config;
use crate::emulator::SharedEmulator;
use crate::geometry::Rect;
use crate::types::*;
use crate::visibility::VisibilityRegistry;

/// The single drawing primitive the renderer needs from the UI toolkit.
pub trait CellSurface {
    fn set_cell(&mut self, x: u16, y: u16, ch: char, fg: Rgb, bg: Rgb, attrs: u8);
}

pub const FALLBACK_BG: Rgb = Rgb::new(24, 26, 27);
const CURSOR_FG: Rgb = Rgb::new(20, 20, 20);
const CURSOR_BG: Rgb = Rgb::new(220, 220, 210);
const SELECTION_BG: Rgb = Rgb::new(60, 80, 120);
const MOUSE_SELECTION_BG: Rgb = Rgb::new(70, 70, 95);
const MATCH_BG: Rgb = Rgb::new(120, 100, 30);
const CURRENT_MATCH_BG: Rgb = Rgb::new(190, 150, 40);
const SCROLLBAR_TINT: Rgb = Rgb::new(90, 95, 100);
const SCROLLBAR_TINT_SELECTED: Rgb = Rgb::new(110, 115, 140);
const MIN_THUMB: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchRequest {
    pub pty: PtyId,
    pub start: usize,
    pub count: usize,
}

/// Overlay state supplied by the caller per frame. Coordinates are
/// viewport-relative, inclusive.
#[derive(Default, Clone, Copy)]
pub struct RenderOverlays<'a> {
    pub focused: bool,
    pub copy_selection: Option<((u16, u16), (u16, u16))>,
    pub mouse_selection: Option<((u16, u16), (u16, u16))>,
    /// (row, col_start, col_end) spans.
    pub search_matches: &'a [(u16, u16, u16)],
    pub current_search: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOutcome {
    /// True when the guard substituted the last-stable snapshot.
    pub deferred: bool,
}

#[derive(Default)]
struct StableSnapshot {
    viewport_offset: usize,
    scrollback_length: usize,
    rows: Vec<Option<Vec<Cell>>>,
}

struct RowFetch {
    rows: Vec<Option<Vec<Cell>>>,
    first_missing: Option<usize>,
    last_missing: Option<usize>,
}

/// Render state for one visible pane.
pub struct TerminalView {
    pty: PtyId,
    emulator: Option<SharedEmulator>,
    terminal_state: Option<TerminalState>,
    scroll_state: ScrollState,
    last_stable: StableSnapshot,
    last_observed_viewport_offset: usize,
    last_observed_scrollback_length: usize,
    pending_prefetch: Option<PrefetchRequest>,
    prefetch_in_progress: bool,
    last_seq: u64,
    version: u64,
    render_pending: bool,
    mounted: bool,
}

impl TerminalView {
    pub fn new(pty: PtyId) -> Self {
        TerminalView {
            pty,
            emulator: None,
            terminal_state: None,
            scroll_state: ScrollState::default(),
            last_stable: StableSnapshot::default(),
            last_observed_viewport_offset: 0,
            last_observed_scrollback_length: 0,
            pending_prefetch: None,
            prefetch_in_progress: false,
            last_seq: 0,
            version: 0,
            render_pending: false,
            mounted: false,
        }
    }

    pub fn pty(&self) -> PtyId {
        self.pty
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn terminal_state(&self) -> Option<&TerminalState> {
        self.terminal_state.as_ref()
    }

    pub fn scroll_state(&self) -> ScrollState {
        self.scroll_state
    }

    /// Pane mount: become visible, remember the emulator, take the initial
    /// snapshot. The content subscription itself is the caller's loop
    /// draining `take_update`.
    pub fn mount(&mut self, emulator: SharedEmulator, registry: &mut VisibilityRegistry) {
        registry.register_visible(self.pty, Some(&emulator));
        if let Ok(emu) = emulator.lock() {
            self.terminal_state = Some(emu.snapshot());
            self.scroll_state = emu.scroll_state();
        }
        self.emulator = Some(emulator);
        self.mounted = true;
        self.render_pending = true;
    }

    pub fn unmount(&mut self, registry: &mut VisibilityRegistry) {
        if self.mounted {
            registry.unregister_visible(self.pty, self.emulator.as_ref());
        }
        self.mounted = false;
        self.pending_prefetch = None;
        self.prefetch_in_progress = false;
    }

    /// Apply one unified update. Stale updates (callbacks raced a full
    /// refresh) are dropped by sequence number.
    pub fn apply_update(&mut self, update: UnifiedUpdate) {
        if !self.mounted {
            return;
        }
        if update.seq <= self.last_seq && self.last_seq != 0 {
            return;
        }
        self.last_seq = update.seq;
        match update.update {
            TerminalUpdate::Full(state) => {
                self.terminal_state = Some(state);
            }
            TerminalUpdate::Delta { rows, cursor, alternate_screen, mouse_tracking, cursor_key_mode } => {
                if let Some(state) = self.terminal_state.as_mut() {
                    for (idx, cells) in rows {
                        if let Some(slot) = state.cells.get_mut(idx as usize) {
                            *slot = cells;
                        }
                    }
                    state.cursor = cursor;
                    state.alternate_screen = alternate_screen;
                    state.mouse_tracking = mouse_tracking;
                    state.cursor_key_mode = cursor_key_mode;
                }
            }
        }
        // The scroll state travels with the update; never mix in a cached one.
        self.scroll_state = update.scroll;
        self.version += 1;
        self.render_pending = true;
    }

    /// Selection/search changes re-render without a content version bump.
    pub fn mark_dirty(&mut self) {
        self.render_pending = true;
    }

    pub fn take_render_pending(&mut self) -> bool {
        std::mem::take(&mut self.render_pending)
    }

    // ─── Prefetch bookkeeping ──────────────────────────────────────────────

    /// The freshest request wins the pending slot; an in-flight prefetch is
    /// never interrupted, its completion re-runs the latest request.
    fn queue_prefetch(&mut self, req: PrefetchRequest) {
        self.pending_prefetch = Some(req);
    }

    /// Next request to hand to the emulator. At most one is in flight.
    pub fn take_prefetch_request(&mut self) -> Option<PrefetchRequest> {
        if !self.mounted {
            self.pending_prefetch = None;
            return None;
        }
        if self.prefetch_in_progress {
            return None;
        }
        let req = self.pending_prefetch.take()?;
        self.prefetch_in_progress = true;
        Some(req)
    }

    pub fn prefetch_completed(&mut self) {
        self.prefetch_in_progress = false;
        self.render_pending = true;
    }

    // ─── Row fetch ─────────────────────────────────────────────────────────

    fn fetch_rows(&self, viewport_offset: usize, scrollback_length: usize, rows: usize) -> RowFetch {
        let mut out = Vec::with_capacity(rows);
        let mut first_missing = None;
        let mut last_missing = None;
        let state = self.terminal_state.as_ref();
        for y in 0..rows {
            let row = if viewport_offset == 0 {
                state.and_then(|s| s.cells.get(y).cloned())
            } else {
                let absolute_y = scrollback_length as i64 - viewport_offset as i64 + y as i64;
                if absolute_y < 0 {
                    None
                } else if (absolute_y as usize) < scrollback_length {
                    let fetched = self
                        .emulator
                        .as_ref()
                        .and_then(|e| e.lock().ok())
                        .and_then(|e| e.get_scrollback_line(absolute_y as usize));
                    if fetched.is_none() {
                        let abs = absolute_y as usize;
                        first_missing.get_or_insert(abs);
                        last_missing = Some(abs);
                    }
                    fetched
                } else {
                    state.and_then(|s| s.cells.get(absolute_y as usize - scrollback_length).cloned())
                }
            };
            out.push(row);
        }
        RowFetch { rows: out, first_missing, last_missing }
    }

    // ─── Render ────────────────────────────────────────────────────────────

    pub fn render(
        &mut self,
        surface: &mut dyn CellSurface,
        region: Rect,
        overlays: &RenderOverlays,
        config: &Config,
    ) -> RenderOutcome {
        let rows = region.height as usize;
        let desired_offset = self.scroll_state.viewport_offset;
        let desired_len = self.scroll_state.scrollback_length;

        // Scrollback guard: predict where the viewport should be if only
        // emulator growth moved it, and treat any divergence as the user
        // actively scrolling.
        let scrollback_delta = desired_len as i64 - self.last_observed_scrollback_length as i64;
        let expected_offset = if self.last_observed_viewport_offset > 0 {
            (self.last_observed_viewport_offset as i64 + scrollback_delta)
                .clamp(0, desired_len as i64) as usize
        } else {
            0
        };
        let is_user_scroll = desired_offset != expected_offset;

        let fetch = self.fetch_rows(desired_offset, desired_len, rows);
        let has_missing = fetch.first_missing.is_some();

        if has_missing {
            if let (Some(first), Some(last)) = (fetch.first_missing, fetch.last_missing) {
                let window = config.prefetch_window;
                let start = first.saturating_sub(window);
                let count = (last + window + 1).min(desired_len).saturating_sub(start);
                self.queue_prefetch(PrefetchRequest { pty: self.pty, start, count });
            }
        }

        let defer = (is_user_scroll || desired_offset > 0) && has_missing;
        self.last_observed_viewport_offset = desired_offset;
        self.last_observed_scrollback_length = desired_len;

        let (offset, len, row_slice): (usize, usize, &[Option<Vec<Cell>>]) = if defer {
            (
                self.last_stable.viewport_offset,
                self.last_stable.scrollback_length,
                &self.last_stable.rows,
            )
        } else {
            self.last_stable = StableSnapshot {
                viewport_offset: desired_offset,
                scrollback_length: desired_len,
                rows: fetch.rows,
            };
            (desired_offset, desired_len, &self.last_stable.rows)
        };

        self.draw_rows(surface, region, row_slice, offset, overlays);
        if offset > 0 && len > 0 {
            self.draw_scrollbar(surface, region, offset, len, overlays);
        }
        RenderOutcome { deferred: defer }
    }

    fn draw_rows(
        &self,
        surface: &mut dyn CellSurface,
        region: Rect,
        rows: &[Option<Vec<Cell>>],
        viewport_offset: usize,
        overlays: &RenderOverlays,
    ) {
        let state = self.terminal_state.as_ref();
        let cursor = state.map(|s| s.cursor).unwrap_or_default();
        let at_bottom = viewport_offset == 0;

        for y in 0..region.height {
            let row = rows.get(y as usize).and_then(|r| r.as_ref());
            for x in 0..region.width {
                let cell = row.and_then(|r| r.get(x as usize));
                let Some(cell) = cell else {
                    surface.set_cell(region.x + x, region.y + y, ' ', FALLBACK_BG, FALLBACK_BG, 0);
                    continue;
                };
                if cell.ch == '\0' {
                    // Continuation of the wide glyph to the left; keep the
                    // buffer from rewriting it.
                    surface.set_cell(region.x + x, region.y + y, '\0', cell.fg, cell.bg, 0);
                    continue;
                }
                let (mut fg, mut bg) = (cell.fg, cell.bg);
                if cell.attrs & ATTR_INVERSE != 0 {
                    std::mem::swap(&mut fg, &mut bg);
                }
                if cell.attrs & ATTR_DIM != 0 {
                    fg = Rgb::new(fg.r / 2, fg.g / 2, fg.b / 2);
                }

                // Override priority: cursor, then copy selection, mouse
                // selection, current match, any other match.
                let is_cursor = at_bottom
                    && overlays.focused
                    && cursor.visible
                    && cursor.x == x
                    && cursor.y == y;
                if is_cursor {
                    fg = CURSOR_FG;
                    bg = CURSOR_BG;
                } else if span_contains(overlays.copy_selection, y, x) {
                    bg = SELECTION_BG;
                } else if span_contains(overlays.mouse_selection, y, x) {
                    bg = MOUSE_SELECTION_BG;
                } else if let Some(idx) = match_at(overlays.search_matches, y, x) {
                    bg = if overlays.current_search == Some(idx) {
                        CURRENT_MATCH_BG
                    } else {
                        MATCH_BG
                    };
                }
                surface.set_cell(region.x + x, region.y + y, cell.ch, fg, bg, cell.attrs);
                if cell.width == 2 && x + 1 < region.width {
                    surface.set_cell(region.x + x + 1, region.y + y, '\0', fg, bg, 0);
                }
            }
        }
    }

    fn draw_scrollbar(
        &self,
        surface: &mut dyn CellSurface,
        region: Rect,
        viewport_offset: usize,
        scrollback_length: usize,
        overlays: &RenderOverlays,
    ) {
        if region.width == 0 || region.height == 0 {
            return;
        }
        let rows = region.height as usize;
        let (thumb_height, thumb_top) = scrollbar_geometry(rows, viewport_offset, scrollback_length);
        let x = region.x + region.width - 1;
        for i in 0..thumb_height {
            let y = region.y + (thumb_top + i) as u16;
            let local_y = (thumb_top + i) as u16;
            let in_selection = span_contains(overlays.copy_selection, local_y, region.width - 1);
            let tint = if in_selection { SCROLLBAR_TINT_SELECTED } else { SCROLLBAR_TINT };
            // Re-tint the background only; the glyph under the thumb stays.
            let ch = self
                .last_stable
                .rows
                .get(thumb_top + i)
                .and_then(|r| r.as_ref())
                .and_then(|r| r.get(region.width as usize - 1))
                .map(|c| c.ch)
                .unwrap_or(' ');
            let fg = self
                .last_stable
                .rows
                .get(thumb_top + i)
                .and_then(|r| r.as_ref())
                .and_then(|r| r.get(region.width as usize - 1))
                .map(|c| c.fg)
                .unwrap_or(FALLBACK_BG);
            surface.set_cell(x, y, ch, fg, tint, 0);
        }

        // Floating position label one row above the pane, space permitting.
        if region.y > 0 {
            let label = format!(
                " {}/{} ",
                crate::util::human_count(viewport_offset),
                crate::util::human_count(scrollback_length)
            );
            if (label.len() as u16) <= region.width {
                let start = region.x + region.width - label.len() as u16;
                for (i, ch) in label.chars().enumerate() {
                    surface.set_cell(start + i as u16, region.y - 1, ch, CURSOR_FG, SCROLLBAR_TINT, 0);
                }
            }
        }
    }
}

fn scrollbar_geometry(rows: usize, viewport_offset: usize, scrollback_length: usize) -> (usize, usize) {
    let thumb_height = MIN_THUMB.max(rows * rows / (scrollback_length + rows));
    let thumb_height = thumb_height.min(rows);
    let fraction = 1.0 - viewport_offset as f64 / scrollback_length as f64;
    let thumb_top = (fraction * (rows - thumb_height) as f64).floor() as usize;
    (thumb_height, thumb_top.min(rows - thumb_height))
}

fn span_contains(span: Option<((u16, u16), (u16, u16))>, row: u16, col: u16) -> bool {
    let Some(((r0, c0), (r1, c1))) = span else { return false };
    if row < r0 || row > r1 {
        return false;
    }
    if r0 == r1 {
        return col >= c0 && col <= c1;
    }
    if row == r0 {
        col >= c0
    } else if row == r1 {
        col <= c1
    } else {
        true
    }
}

fn match_at(matches: &[(u16, u16, u16)], row: u16, col: u16) -> Option<usize> {
    matches
        .iter()
        .position(|&(r, c0, c1)| r == row && col >= c0 && col <= c1)
}

// ─── Views collection ───────────────────────────────────────────────────────

/// All mounted views, keyed by pane. Owned by the UI task.
#[derive(Default)]
pub struct ViewSet {
    views: HashMap<PaneId, TerminalView>,
}

impl ViewSet {
    pub fn new() -> Self {
        ViewSet::default()
    }

    pub fn get(&self, pane: PaneId) -> Option<&TerminalView> {
        self.views.get(&pane)
    }

    pub fn get_mut(&mut self, pane: PaneId) -> Option<&mut TerminalView> {
        self.views.get_mut(&pane)
    }

    pub fn mount(
        &mut self,
        pane: PaneId,
        pty: PtyId,
        emulator: SharedEmulator,
        registry: &mut VisibilityRegistry,
    ) -> &mut TerminalView {
        let view = self.views.entry(pane).or_insert_with(|| TerminalView::new(pty));
        if !view.is_mounted() {
            view.mount(emulator, registry);
        } else {
            // Re-sync after a late emulator attach; idempotent.
            registry.attach_visible_emulator(pty, Some(&emulator));
        }
        view
    }

    pub fn unmount(&mut self, pane: PaneId, registry: &mut VisibilityRegistry) {
        if let Some(mut view) = self.views.remove(&pane) {
            view.unmount(registry);
        }
    }

    /// Drain the render-pending flags; true when any view wants a frame.
    pub fn any_render_pending(&mut self) -> bool {
        let mut pending = false;
        for view in self.views.values_mut() {
            pending |= view.take_render_pending();
        }
        pending
    }

    pub fn panes(&self) -> Vec<PaneId> {
        self.views.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::fake::FakeEmulator;
    use std::sync::{Arc, Mutex};

    struct TestSurface {
        width: u16,
        height: u16,
        cells: Vec<(char, Rgb, Rgb, u8)>,
    }

    impl TestSurface {
        fn new(width: u16, height: u16) -> Self {
            TestSurface {
                width,
                height,
                cells: vec![(' ', Rgb::default(), Rgb::default(), 0); (width * height) as usize],
            }
        }

        fn at(&self, x: u16, y: u16) -> &(char, Rgb, Rgb, u8) {
            &self.cells[(y * self.width + x) as usize]
        }

        fn row_text(&self, y: u16) -> String {
            (0..self.width).map(|x| self.at(x, y).0).collect()
        }
    }

    impl CellSurface for TestSurface {
        fn set_cell(&mut self, x: u16, y: u16, ch: char, fg: Rgb, bg: Rgb, attrs: u8) {
            if x < self.width && y < self.height {
                self.cells[(y * self.width + x) as usize] = (ch, fg, bg, attrs);
            }
        }
    }

    fn row_of(text: &str, cols: usize) -> Vec<Cell> {
        let mut row: Vec<Cell> = text.chars().map(|ch| Cell { ch, ..Default::default() }).collect();
        row.resize(cols, Cell::default());
        row
    }

    fn mounted_view(rows: u16, cols: u16) -> (TerminalView, SharedEmulator, VisibilityRegistry) {
        mounted_view_with(rows, cols, 0)
    }

    fn mounted_view_with(
        rows: u16,
        cols: u16,
        scrollback_rows: usize,
    ) -> (TerminalView, SharedEmulator, VisibilityRegistry) {
        let mut fake = FakeEmulator::sized(rows, cols);
        for y in 0..rows as usize {
            fake.state.cells[y] = row_of(&format!("live{}", y), cols as usize);
        }
        for abs in 0..scrollback_rows {
            fake.scrollback_rows.insert(abs, row_of(&format!("sb{}", abs), cols as usize));
        }
        let emu: SharedEmulator = Arc::new(Mutex::new(fake));
        let mut registry = VisibilityRegistry::new();
        let mut view = TerminalView::new(7);
        view.mount(emu.clone(), &mut registry);
        (view, emu, registry)
    }

    #[test]
    fn mount_registers_visibility_and_snapshots() {
        let (view, _emu, registry) = mounted_view(4, 10);
        assert_eq!(registry.count(7), 1);
        assert!(view.terminal_state().is_some());
    }

    #[test]
    fn renders_live_screen_at_bottom() {
        let (mut view, _emu, _reg) = mounted_view(4, 10);
        let mut surface = TestSurface::new(10, 4);
        let out = view.render(
            &mut surface,
            Rect::new(0, 0, 10, 4),
            &RenderOverlays::default(),
            &Config::default(),
        );
        assert!(!out.deferred);
        assert!(surface.row_text(0).starts_with("live0"));
        assert!(surface.row_text(3).starts_with("live3"));
    }

    #[test]
    fn delta_update_patches_cached_rows() {
        let (mut view, _emu, _reg) = mounted_view(4, 10);
        view.apply_update(UnifiedUpdate {
            seq: 1,
            update: TerminalUpdate::Delta {
                rows: vec![(2, row_of("patched", 10))],
                cursor: CursorState::default(),
                alternate_screen: false,
                mouse_tracking: false,
                cursor_key_mode: CursorKeyMode::Normal,
            },
            scroll: ScrollState { is_at_bottom: true, ..Default::default() },
        });
        let mut surface = TestSurface::new(10, 4);
        view.render(
            &mut surface,
            Rect::new(0, 0, 10, 4),
            &RenderOverlays::default(),
            &Config::default(),
        );
        assert!(surface.row_text(2).starts_with("patched"));
        assert!(surface.row_text(0).starts_with("live0"));
    }

    #[test]
    fn stale_updates_are_dropped() {
        let (mut view, _emu, _reg) = mounted_view(4, 10);
        view.apply_update(UnifiedUpdate {
            seq: 5,
            update: TerminalUpdate::Delta {
                rows: vec![(0, row_of("fresh", 10))],
                cursor: CursorState::default(),
                alternate_screen: false,
                mouse_tracking: false,
                cursor_key_mode: CursorKeyMode::Normal,
            },
            scroll: ScrollState { is_at_bottom: true, ..Default::default() },
        });
        view.apply_update(UnifiedUpdate {
            seq: 3,
            update: TerminalUpdate::Delta {
                rows: vec![(0, row_of("stale", 10))],
                cursor: CursorState::default(),
                alternate_screen: false,
                mouse_tracking: false,
                cursor_key_mode: CursorKeyMode::Normal,
            },
            scroll: ScrollState { is_at_bottom: true, ..Default::default() },
        });
        let state = view.terminal_state().unwrap();
        assert_eq!(state.cells[0][0].ch, 'f');
    }

    #[test]
    fn scrolled_view_mixes_scrollback_and_live_rows() {
        let (mut view, _emu, _reg) = mounted_view_with(4, 10, 20);
        view.apply_update(UnifiedUpdate {
            seq: 1,
            update: TerminalUpdate::Delta {
                rows: vec![],
                cursor: CursorState::default(),
                alternate_screen: false,
                mouse_tracking: false,
                cursor_key_mode: CursorKeyMode::Normal,
            },
            scroll: ScrollState { viewport_offset: 2, scrollback_length: 20, ..Default::default() },
        });
        let mut surface = TestSurface::new(10, 4);
        let out = view.render(
            &mut surface,
            Rect::new(0, 0, 10, 4),
            &RenderOverlays::default(),
            &Config::default(),
        );
        assert!(!out.deferred);
        // offset 2 into 20 rows of scrollback: rows 18,19 then live rows 0,1.
        assert!(surface.row_text(0).starts_with("sb18"));
        assert!(surface.row_text(1).starts_with("sb19"));
        assert!(surface.row_text(2).starts_with("live0"));
    }

    #[test]
    fn guard_defers_on_missing_rows_and_requests_prefetch() {
        let (mut view, _emu, _reg) = mounted_view(4, 10);
        // Establish a stable at-bottom frame first.
        let mut surface = TestSurface::new(10, 4);
        view.render(&mut surface, Rect::new(0, 0, 10, 4), &RenderOverlays::default(), &Config::default());

        // User scrolls back but no scrollback rows are cached yet.
        view.apply_update(UnifiedUpdate {
            seq: 1,
            update: TerminalUpdate::Delta {
                rows: vec![],
                cursor: CursorState::default(),
                alternate_screen: false,
                mouse_tracking: false,
                cursor_key_mode: CursorKeyMode::Normal,
            },
            scroll: ScrollState { viewport_offset: 5, scrollback_length: 40, ..Default::default() },
        });
        let mut surface = TestSurface::new(10, 4);
        let out = view.render(
            &mut surface,
            Rect::new(0, 0, 10, 4),
            &RenderOverlays::default(),
            &Config::default(),
        );
        assert!(out.deferred, "missing scrollback during user scroll must defer");
        // The deferred frame re-renders the last-stable (at-bottom) rows.
        assert!(surface.row_text(0).starts_with("live0"));
        let req = view.take_prefetch_request().expect("prefetch queued");
        assert_eq!(req.pty, 7);
        assert!(req.start <= 35 && req.count >= 4);
    }

    #[test]
    fn guard_allows_growth_while_scrolled_back() {
        let (mut view, _emu, _reg) = mounted_view_with(4, 10, 60);
        // Scrolled back at offset 5 of 40.
        view.apply_update(UnifiedUpdate {
            seq: 1,
            update: TerminalUpdate::Delta {
                rows: vec![],
                cursor: CursorState::default(),
                alternate_screen: false,
                mouse_tracking: false,
                cursor_key_mode: CursorKeyMode::Normal,
            },
            scroll: ScrollState { viewport_offset: 5, scrollback_length: 40, ..Default::default() },
        });
        let mut surface = TestSurface::new(10, 4);
        assert!(!view
            .render(&mut surface, Rect::new(0, 0, 10, 4), &RenderOverlays::default(), &Config::default())
            .deferred);

        // Emulator emits 10 more rows; the viewport is expected to drift by
        // the same amount. Not a user scroll, rows present: no defer.
        view.apply_update(UnifiedUpdate {
            seq: 2,
            update: TerminalUpdate::Delta {
                rows: vec![],
                cursor: CursorState::default(),
                alternate_screen: false,
                mouse_tracking: false,
                cursor_key_mode: CursorKeyMode::Normal,
            },
            scroll: ScrollState { viewport_offset: 15, scrollback_length: 50, ..Default::default() },
        });
        let mut surface = TestSurface::new(10, 4);
        let out = view.render(
            &mut surface,
            Rect::new(0, 0, 10, 4),
            &RenderOverlays::default(),
            &Config::default(),
        );
        assert!(!out.deferred);
        assert!(surface.row_text(0).starts_with("sb35"));
    }

    #[test]
    fn cursor_override_wins_over_selection() {
        let (mut view, _emu, _reg) = mounted_view(4, 10);
        if let Some(state) = view.terminal_state.as_mut() {
            state.cursor = CursorState { x: 1, y: 1, visible: true };
        }
        let mut surface = TestSurface::new(10, 4);
        let overlays = RenderOverlays {
            focused: true,
            copy_selection: Some(((0, 0), (3, 9))),
            ..Default::default()
        };
        view.render(&mut surface, Rect::new(0, 0, 10, 4), &overlays, &Config::default());
        assert_eq!(surface.at(1, 1).2, CURSOR_BG);
        assert_eq!(surface.at(2, 1).2, SELECTION_BG);
    }

    #[test]
    fn wide_cell_writes_continuation_marker() {
        let (mut view, _emu, _reg) = mounted_view(2, 10);
        if let Some(state) = view.terminal_state.as_mut() {
            state.cells[0][0] = Cell { ch: '漢', width: 2, ..Default::default() };
            state.cells[0][1] = Cell { ch: '\0', ..Default::default() };
        }
        let mut surface = TestSurface::new(10, 2);
        view.render(&mut surface, Rect::new(0, 0, 10, 2), &RenderOverlays::default(), &Config::default());
        assert_eq!(surface.at(0, 0).0, '漢');
        assert_eq!(surface.at(1, 0).0, '\0');
    }

    #[test]
    fn unused_area_gets_fallback_background() {
        let (mut view, _emu, _reg) = mounted_view(2, 4);
        let mut surface = TestSurface::new(10, 4);
        view.render(&mut surface, Rect::new(0, 0, 10, 4), &RenderOverlays::default(), &Config::default());
        // Terminal is 4 cols / 2 rows; the rest of the pane box is filler.
        assert_eq!(surface.at(6, 0).2, FALLBACK_BG);
        assert_eq!(surface.at(0, 3).2, FALLBACK_BG);
    }

    #[test]
    fn scrollbar_geometry_bounds() {
        let (h, top) = scrollbar_geometry(40, 1, 1000);
        assert!(h >= MIN_THUMB);
        assert!(top + h <= 40);
        let (h, top) = scrollbar_geometry(40, 1000, 1000);
        assert_eq!(top, 0);
        assert!(h >= MIN_THUMB);
        // Near the bottom the thumb sits low.
        let (h2, top2) = scrollbar_geometry(40, 1, 100);
        assert!(top2 + h2 >= 39 - h2);
    }

    #[test]
    fn single_prefetch_in_flight() {
        let (mut view, _emu, _reg) = mounted_view(4, 10);
        view.queue_prefetch(PrefetchRequest { pty: 7, start: 0, count: 8 });
        let first = view.take_prefetch_request().unwrap();
        assert_eq!(first.start, 0);
        // A second request while one is in flight parks in the pending slot.
        view.queue_prefetch(PrefetchRequest { pty: 7, start: 10, count: 8 });
        assert!(view.take_prefetch_request().is_none());
        view.prefetch_completed();
        let second = view.take_prefetch_request().unwrap();
        assert_eq!(second.start, 10);
    }

    #[test]
    fn unmount_releases_visibility() {
        let (mut view, _emu, mut registry) = mounted_view(4, 10);
        assert_eq!(registry.count(7), 1);
        view.unmount(&mut registry);
        assert_eq!(registry.count(7), 0);
        assert!(view.take_prefetch_request().is_none());
    }
}
