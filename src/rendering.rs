//! Frame composition: walks the active workspace's pane rectangles, hands
//! each visible pane to its terminal view, and draws the status line.
//! Cell writes go straight into the ratatui buffer.

use ratatui::buffer::Buffer;
use ratatui::style::{Color, Modifier, Style};

use crate::geometry::Rect;
use crate::layout::{LayoutState, PaneNode};
use crate::types::*;
use crate::view::{CellSurface, FALLBACK_BG};

pub const STATUS_BG: Rgb = Rgb::new(40, 44, 48);
pub const STATUS_FG: Rgb = Rgb::new(200, 204, 200);
pub const STATUS_ACTIVE_FG: Rgb = Rgb::new(255, 220, 120);

/// Adapter turning the ratatui buffer into the renderer's cell sink.
pub struct BufferSurface<'a> {
    pub buf: &'a mut Buffer,
}

impl CellSurface for BufferSurface<'_> {
    fn set_cell(&mut self, x: u16, y: u16, ch: char, fg: Rgb, bg: Rgb, attrs: u8) {
        let area = self.buf.area;
        if x < area.x || y < area.y || x >= area.x + area.width || y >= area.y + area.height {
            return;
        }
        let idx = (y - area.y) as usize * area.width as usize + (x - area.x) as usize;
        if idx >= self.buf.content.len() {
            return;
        }
        let cell = &mut self.buf.content[idx];
        if ch == '\0' {
            // Continuation of a wide glyph: skip the cell in diffing so
            // the glyph to its left is not clobbered.
            cell.set_symbol(" ");
            cell.set_bg(Color::Rgb(bg.r, bg.g, bg.b));
            cell.set_skip(true);
            return;
        }
        cell.set_skip(false);
        let mut style = Style::default()
            .fg(Color::Rgb(fg.r, fg.g, fg.b))
            .bg(Color::Rgb(bg.r, bg.g, bg.b));
        if attrs & ATTR_BOLD != 0 {
            style = style.add_modifier(Modifier::BOLD);
        }
        if attrs & ATTR_ITALIC != 0 {
            style = style.add_modifier(Modifier::ITALIC);
        }
        if attrs & ATTR_UNDERLINE != 0 {
            style = style.add_modifier(Modifier::UNDERLINED);
        }
        if attrs & ATTR_STRIKETHROUGH != 0 {
            style = style.add_modifier(Modifier::CROSSED_OUT);
        }
        let mut tmp = [0u8; 4];
        cell.set_symbol(ch.encode_utf8(&mut tmp));
        cell.set_style(style);
    }
}

/// Pane rectangles of the active workspace, in drawing order.
pub fn visible_panes(layout: &LayoutState) -> Vec<(PaneId, Option<PtyId>, Rect)> {
    let mut out = Vec::new();
    let Some(ws) = layout.active_workspace() else { return out };
    let mut panes = Vec::new();
    ws.collect_all_panes(&mut panes);
    for node in panes {
        if let PaneNode::Pane { id, pty_id, rectangle: Some(rect), .. } = node {
            if rect.width > 0 && rect.height > 0 {
                out.push((*id, *pty_id, *rect));
            }
        }
    }
    out
}

/// Fill a region with the fallback background (empty workspace, gaps).
pub fn fill_background(surface: &mut dyn CellSurface, region: Rect) {
    for y in region.y..region.y + region.height {
        for x in region.x..region.x + region.width {
            surface.set_cell(x, y, ' ', FALLBACK_BG, FALLBACK_BG, 0);
        }
    }
}

/// Centered notice for the pane-less workspace. Suppressed mid-switch so
/// hydration doesn't flash it.
pub fn draw_empty_state(surface: &mut dyn CellSurface, region: Rect, switching: bool) {
    fill_background(surface, region);
    if switching || region.height == 0 {
        return;
    }
    let msg = "No panes - prefix c to open one";
    if (msg.len() as u16) > region.width {
        return;
    }
    let x = region.x + (region.width - msg.len() as u16) / 2;
    let y = region.y + region.height / 2;
    for (i, ch) in msg.chars().enumerate() {
        surface.set_cell(x + i as u16, y, ch, STATUS_FG, FALLBACK_BG, 0);
    }
}

/// One-line status: session, workspaces (active starred), focused pane
/// title, clock.
pub fn status_line(layout: &LayoutState, session: &str, clock: &str, width: u16) -> String {
    let mut left = format!(" {} ", session);
    let mut ids: Vec<WorkspaceId> = layout.workspaces.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        let marker = if id == layout.active_workspace_id { "*" } else { "" };
        left.push_str(&format!("[{}{}]", id, marker));
    }
    if let Some(ws) = layout.active_workspace() {
        if let Some(focused) = ws.focused_pane_id {
            if let Some(PaneNode::Pane { title, .. }) = ws.find_pane(focused) {
                left.push_str(&format!(" {} ", title));
            }
        }
    }
    let right = format!(" {} ", clock);
    let width = width as usize;
    if left.len() + right.len() >= width {
        left.truncate(width.saturating_sub(right.len()));
    }
    let pad = width.saturating_sub(left.len() + right.len());
    format!("{}{}{}", left, " ".repeat(pad), right)
}

pub fn draw_status_line(surface: &mut dyn CellSurface, region: Rect, layout: &LayoutState, session: &str, clock: &str) {
    if region.height == 0 {
        return;
    }
    let text = status_line(layout, session, clock, region.width);
    for (i, ch) in text.chars().take(region.width as usize).enumerate() {
        let fg = if ch == '*' { STATUS_ACTIVE_FG } else { STATUS_FG };
        surface.set_cell(region.x + i as u16, region.y, ch, fg, STATUS_BG, 0);
    }
}

/// The host-cell cursor position for the focused pane, if it should be
/// shown (at bottom, visible, inside the pane box).
pub fn cursor_position(
    state: &TerminalState,
    scroll: ScrollState,
    pane_rect: Rect,
) -> Option<(u16, u16)> {
    if scroll.viewport_offset != 0 || !state.cursor.visible {
        return None;
    }
    let x = pane_rect.x + state.cursor.x;
    let y = pane_rect.y + state.cursor.y;
    if pane_rect.contains(x, y) {
        Some((x, y))
    } else {
        None
    }
}
