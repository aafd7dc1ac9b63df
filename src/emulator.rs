//! The emulator seam. The rendering core depends only on the [`Emulator`]
//! trait; `Vt100Emulator` backs it with a `vt100::Parser` plus a Kitty
//! image/placement tracker fed by the stub sequences the transmit relay
//! produces. Tests substitute in-memory fakes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use unicode_width::UnicodeWidthStr;

use crate::sequences::{
    self, Base64Stream, KittyAction, ScanItem, SequenceScanner, TransmitParams,
};
use crate::types::*;

pub trait Emulator: Send {
    fn is_disposed(&self) -> bool;
    fn dispose(&mut self);
    /// Gate for delta computation. A disabled emulator still consumes raw
    /// bytes; it just stops producing updates.
    fn set_update_enabled(&mut self, enabled: bool);
    fn is_alternate_screen(&self) -> bool;
    fn get_mode(&self, mode: u16) -> bool;
    fn cursor_key_mode(&self) -> CursorKeyMode;
    fn kitty_keyboard_flags(&self) -> u32;

    fn process(&mut self, bytes: &[u8]);
    fn resize(&mut self, rows: u16, cols: u16);
    fn snapshot(&self) -> TerminalState;
    fn scroll_state(&self) -> ScrollState;
    fn set_viewport_offset(&mut self, offset: usize);
    /// Drain the pending update, if any. Full updates supersede deltas;
    /// the scroll state is captured in the same call.
    fn take_update(&mut self) -> Option<UnifiedUpdate>;

    /// Cached scrollback read; `None` until a prefetch has filled the row.
    fn get_scrollback_line(&self, absolute_y: usize) -> Option<Vec<Cell>>;
    fn prefetch_scrollback_lines(&mut self, start: usize, count: usize);

    fn get_kitty_image_ids(&self) -> Vec<u32>;
    fn get_kitty_image_info(&self, id: u32) -> Option<KittyImageInfo>;
    fn get_kitty_image_data(&self, id: u32) -> Option<Vec<u8>>;
    fn get_kitty_placements(&self) -> Vec<KittyPlacement>;
    fn get_kitty_images_dirty(&self) -> bool;
    fn clear_kitty_images_dirty(&mut self);
}

pub type SharedEmulator = Arc<Mutex<dyn Emulator>>;

// ─── Color mapping ──────────────────────────────────────────────────────────

const DEFAULT_FG: Rgb = Rgb::new(197, 200, 198);
const DEFAULT_BG: Rgb = Rgb::new(29, 31, 33);

const ANSI16: [Rgb; 16] = [
    Rgb::new(0, 0, 0),
    Rgb::new(205, 49, 49),
    Rgb::new(13, 188, 121),
    Rgb::new(229, 229, 16),
    Rgb::new(36, 114, 200),
    Rgb::new(188, 63, 188),
    Rgb::new(17, 168, 205),
    Rgb::new(229, 229, 229),
    Rgb::new(102, 102, 102),
    Rgb::new(241, 76, 76),
    Rgb::new(35, 209, 139),
    Rgb::new(245, 245, 67),
    Rgb::new(59, 142, 234),
    Rgb::new(214, 112, 214),
    Rgb::new(41, 184, 219),
    Rgb::new(255, 255, 255),
];

pub fn indexed_color(i: u8) -> Rgb {
    match i {
        0..=15 => ANSI16[i as usize],
        16..=231 => {
            let i = i - 16;
            let steps = [0u8, 95, 135, 175, 215, 255];
            Rgb::new(
                steps[(i / 36) as usize],
                steps[((i / 6) % 6) as usize],
                steps[(i % 6) as usize],
            )
        }
        _ => {
            let v = 8 + 10 * (i - 232);
            Rgb::new(v, v, v)
        }
    }
}

fn vt_color(c: vt100::Color, default: Rgb) -> Rgb {
    match c {
        vt100::Color::Default => default,
        vt100::Color::Idx(i) => indexed_color(i),
        vt100::Color::Rgb(r, g, b) => Rgb::new(r, g, b),
    }
}

fn convert_cell(cell: &vt100::Cell) -> Cell {
    let contents = cell.contents();
    let ch = contents.chars().next().unwrap_or(' ');
    let width = UnicodeWidthStr::width(contents).clamp(1, 2) as u8;
    let mut attrs = 0u8;
    if cell.bold() {
        attrs |= ATTR_BOLD;
    }
    if cell.dim() {
        attrs |= ATTR_DIM;
    }
    if cell.italic() {
        attrs |= ATTR_ITALIC;
    }
    if cell.underline() {
        attrs |= ATTR_UNDERLINE;
    }
    if cell.inverse() {
        attrs |= ATTR_INVERSE;
    }
    Cell {
        ch,
        fg: vt_color(cell.fgcolor(), DEFAULT_FG),
        bg: vt_color(cell.bgcolor(), DEFAULT_BG),
        width,
        attrs,
    }
}

// ─── Kitty image tracker ────────────────────────────────────────────────────

/// Stub image/placement state accumulated from the sequences the relay
/// lets through to the emulator.
#[derive(Default)]
struct KittyTracker {
    images: HashMap<u32, KittyImageInfo>,
    data: HashMap<u32, Vec<u8>>,
    main_placements: HashMap<(u32, u32), KittyPlacement>,
    alt_placements: HashMap<(u32, u32), KittyPlacement>,
    pending: Option<PendingTransmit>,
    dirty: bool,
}

struct PendingTransmit {
    guest_id: u32,
    info: KittyImageInfo,
    display_on_finish: bool,
    decoder: Base64Stream,
    buffer: Vec<u8>,
}

fn extra_u32(params: &TransmitParams, key: &str) -> Option<u32> {
    params.extra.iter().find(|(k, _)| k == key).and_then(|(_, v)| v.parse().ok())
}

fn extra_i32(params: &TransmitParams, key: &str) -> Option<i32> {
    params.extra.iter().find(|(k, _)| k == key).and_then(|(_, v)| v.parse().ok())
}

fn parse_format(f: Option<u32>) -> ImageFormat {
    match f {
        Some(24) => ImageFormat::Rgb,
        Some(8) => ImageFormat::Gray,
        Some(16) => ImageFormat::GrayAlpha,
        Some(100) | None => ImageFormat::Png,
        Some(_) => ImageFormat::Rgba,
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl KittyTracker {
    fn placements_mut(&mut self, alt: bool) -> &mut HashMap<(u32, u32), KittyPlacement> {
        if alt {
            &mut self.alt_placements
        } else {
            &mut self.main_placements
        }
    }

    fn handle(&mut self, body: &[u8], cursor: (u16, u16), absolute_base: i64, alt: bool) {
        let (control, data) = sequences::split_control_data(body);
        let Some(mut params) = TransmitParams::parse(control) else {
            // Continuation chunk with no keys at all.
            if let Some(pending) = self.pending.as_mut() {
                let _ = pending.decoder.push(data, &mut pending.buffer);
            }
            return;
        };
        if let Some(pending) = self.pending.as_ref() {
            params.inherit_from(&pending.info_params());
        }
        match params.action {
            Some(KittyAction::Transmit) | Some(KittyAction::TransmitAndDisplay) | None
                if params.is_transmit() =>
            {
                self.handle_transmit(&params, data, cursor, absolute_base, alt);
            }
            Some(KittyAction::Display) => {
                self.handle_display(&params, cursor, absolute_base, alt);
            }
            Some(KittyAction::Delete) => {
                self.handle_delete(&params, alt);
            }
            _ => {}
        }
    }

    fn handle_transmit(
        &mut self,
        params: &TransmitParams,
        data: &[u8],
        cursor: (u16, u16),
        absolute_base: i64,
        alt: bool,
    ) {
        let display = matches!(params.action, Some(KittyAction::TransmitAndDisplay));
        let more = params.more == Some(true);
        let guest_id = match params.image_id.filter(|&i| i > 0) {
            Some(id) => id,
            None => self.pending.as_ref().map(|p| p.guest_id).unwrap_or(0),
        };
        if guest_id == 0 {
            return;
        }

        let mut pending = match self.pending.take() {
            Some(p) if p.guest_id == guest_id => p,
            _ => PendingTransmit {
                guest_id,
                info: KittyImageInfo {
                    id: guest_id,
                    number: params.image_number.unwrap_or(0),
                    width: params.width.unwrap_or(0),
                    height: params.height.unwrap_or(0),
                    data_length: 0,
                    format: parse_format(params.format),
                    compression: if params.compressed { Compression::Zlib } else { Compression::None },
                    implicit_id: guest_id >= sequences::SYNTHETIC_GUEST_ID_MIN,
                    transmit_time: now_millis(),
                },
                display_on_finish: display,
                decoder: Base64Stream::new(),
                buffer: Vec::new(),
            },
        };
        if params.width.is_some() {
            pending.info.width = params.width.unwrap_or(0);
        }
        if params.height.is_some() {
            pending.info.height = params.height.unwrap_or(0);
        }
        pending.display_on_finish |= display;
        let _ = pending.decoder.push(data, &mut pending.buffer);

        if more {
            self.pending = Some(pending);
            return;
        }

        let _ = pending.decoder.finish(&mut pending.buffer);
        let mut info = pending.info;
        info.data_length = pending.buffer.len();
        if info.width == 0 || info.height == 0 {
            if let Some((w, h)) = sequences::png_dimensions(&pending.buffer) {
                info.width = w;
                info.height = h;
            }
        }
        if !pending.buffer.is_empty() {
            self.data.insert(guest_id, pending.buffer);
        }
        self.images.insert(guest_id, info);
        self.dirty = true;
        if pending.display_on_finish {
            self.place(params, guest_id, cursor, absolute_base, alt);
        }
    }

    fn handle_display(
        &mut self,
        params: &TransmitParams,
        cursor: (u16, u16),
        absolute_base: i64,
        alt: bool,
    ) {
        let guest_id = match params.image_id.filter(|&i| i > 0) {
            Some(id) => id,
            None => match params.image_number.filter(|&n| n > 0) {
                Some(n) => match self.images.values().find(|i| i.number == n) {
                    Some(i) => i.id,
                    None => return,
                },
                None => return,
            },
        };
        if self.images.contains_key(&guest_id) {
            self.place(params, guest_id, cursor, absolute_base, alt);
        }
    }

    fn place(
        &mut self,
        params: &TransmitParams,
        guest_id: u32,
        cursor: (u16, u16),
        absolute_base: i64,
        alt: bool,
    ) {
        let placement = KittyPlacement {
            image_id: guest_id,
            placement_id: params.placement_id.unwrap_or(0),
            placement_tag: if params.placement_id.is_some() {
                PlacementTag::Explicit
            } else {
                PlacementTag::Internal
            },
            screen_x: cursor.1 as i32,
            screen_y: absolute_base + cursor.0 as i64,
            x_offset: extra_u32(params, "X").unwrap_or(0),
            y_offset: extra_u32(params, "Y").unwrap_or(0),
            source_x: extra_u32(params, "x").unwrap_or(0),
            source_y: extra_u32(params, "y").unwrap_or(0),
            source_width: extra_u32(params, "w").unwrap_or(0),
            source_height: extra_u32(params, "h").unwrap_or(0),
            columns: extra_u32(params, "c").unwrap_or(0),
            rows: extra_u32(params, "r").unwrap_or(0),
            z: extra_i32(params, "z").unwrap_or(0),
        };
        let key = (placement.image_id, placement.placement_id);
        self.placements_mut(alt).insert(key, placement);
        self.dirty = true;
    }

    fn handle_delete(&mut self, params: &TransmitParams, alt: bool) {
        match params.delete_what {
            None | Some(b'a') => {
                self.placements_mut(alt).clear();
            }
            Some(b'A') => {
                self.placements_mut(alt).clear();
                self.images.clear();
                self.data.clear();
            }
            Some(b'i') | Some(b'I') => {
                let id = match params.delete_what {
                    Some(b'I') => params
                        .image_number
                        .and_then(|n| self.images.values().find(|i| i.number == n).map(|i| i.id))
                        .or(params.image_id),
                    _ => params.image_id,
                };
                let Some(id) = id else { return };
                match params.placement_id {
                    Some(pid) => {
                        self.placements_mut(alt).remove(&(id, pid));
                    }
                    None => {
                        self.placements_mut(alt).retain(|&(img, _), _| img != id);
                        if params.delete_what == Some(b'I') {
                            self.images.remove(&id);
                            self.data.remove(&id);
                        }
                    }
                }
            }
            _ => {}
        }
        self.dirty = true;
    }
}

// Small helper so a chunk's inherited params come from the pending state.
impl PendingTransmit {
    fn info_params(&self) -> TransmitParams {
        TransmitParams {
            action: Some(KittyAction::Transmit),
            image_id: Some(self.guest_id),
            image_number: Some(self.info.number),
            width: Some(self.info.width),
            height: Some(self.info.height),
            compressed: self.info.compression == Compression::Zlib,
            ..Default::default()
        }
    }
}

// ─── vt100-backed implementation ────────────────────────────────────────────

pub struct Vt100Emulator {
    parser: vt100::Parser,
    rows: u16,
    cols: u16,
    update_enabled: bool,
    disposed: bool,
    pending_output: bool,
    force_full: bool,
    seq: u64,
    last_cells: Vec<Vec<Cell>>,
    last_alt: bool,
    viewport_offset: usize,
    scrollback_len: usize,
    history_limit: usize,
    scrollback_cache: HashMap<usize, Vec<Cell>>,
    scanner: SequenceScanner,
    kitty: KittyTracker,
}

const SCROLLBACK_CACHE_CAP: usize = 8192;

impl Vt100Emulator {
    pub fn new(rows: u16, cols: u16, history_limit: usize) -> Self {
        Vt100Emulator {
            parser: vt100::Parser::new(rows, cols, history_limit),
            rows,
            cols,
            update_enabled: true,
            disposed: false,
            pending_output: false,
            force_full: true,
            seq: 0,
            last_cells: Vec::new(),
            last_alt: false,
            viewport_offset: 0,
            scrollback_len: 0,
            history_limit,
            scrollback_cache: HashMap::new(),
            scanner: SequenceScanner::new(),
            kitty: KittyTracker::default(),
        }
    }

    fn current_cells(&self) -> Vec<Vec<Cell>> {
        let screen = self.parser.screen();
        let mut rows = Vec::with_capacity(self.rows as usize);
        for r in 0..self.rows {
            let mut row = Vec::with_capacity(self.cols as usize);
            let mut c = 0;
            while c < self.cols {
                if let Some(cell) = screen.cell(r, c) {
                    let converted = convert_cell(cell);
                    let w = converted.width.max(1) as u16;
                    row.push(converted);
                    // vt100 reports the spacer column as an empty cell; skip it.
                    for _ in 1..w {
                        if row.len() < self.cols as usize {
                            row.push(Cell { ch: '\0', ..Default::default() });
                        }
                    }
                    c += w;
                } else {
                    row.push(Cell::default());
                    c += 1;
                }
            }
            row.truncate(self.cols as usize);
            rows.push(row);
        }
        rows
    }

    fn refresh_scrollback_len(&mut self) {
        let screen = self.parser.screen_mut();
        let cur = screen.scrollback();
        screen.set_scrollback(usize::MAX);
        self.scrollback_len = screen.scrollback();
        screen.set_scrollback(cur);
    }

    fn cursor(&self) -> CursorState {
        let screen = self.parser.screen();
        let (y, x) = screen.cursor_position();
        CursorState { x, y, visible: !screen.hide_cursor() }
    }

    fn modes(&self) -> (bool, CursorKeyMode) {
        let screen = self.parser.screen();
        let mouse = screen.mouse_protocol_mode() != vt100::MouseProtocolMode::None;
        let keys = if screen.application_cursor() {
            CursorKeyMode::Application
        } else {
            CursorKeyMode::Normal
        };
        (mouse, keys)
    }
}

impl Emulator for Vt100Emulator {
    fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn dispose(&mut self) {
        self.disposed = true;
    }

    fn set_update_enabled(&mut self, enabled: bool) {
        if enabled && !self.update_enabled {
            // Everything accumulated while gated must land in one full update.
            self.force_full = true;
            self.pending_output = true;
        }
        self.update_enabled = enabled;
    }

    fn is_alternate_screen(&self) -> bool {
        self.parser.screen().alternate_screen()
    }

    fn get_mode(&self, mode: u16) -> bool {
        let screen = self.parser.screen();
        match mode {
            1 => screen.application_cursor(),
            25 => !screen.hide_cursor(),
            1000 | 1002 | 1003 => screen.mouse_protocol_mode() != vt100::MouseProtocolMode::None,
            1049 => screen.alternate_screen(),
            2004 => screen.bracketed_paste(),
            _ => false,
        }
    }

    fn cursor_key_mode(&self) -> CursorKeyMode {
        self.modes().1
    }

    fn kitty_keyboard_flags(&self) -> u32 {
        0
    }

    fn process(&mut self, bytes: &[u8]) {
        if self.disposed {
            return;
        }
        for item in self.scanner.scan(bytes) {
            match item {
                ScanItem::Text(text) => {
                    self.parser.process(&text);
                    self.pending_output = true;
                }
                ScanItem::Kitty { body, .. } => {
                    let alt = self.parser.screen().alternate_screen();
                    let cursor = self.parser.screen().cursor_position();
                    self.refresh_scrollback_len();
                    self.kitty.handle(&body, cursor, self.scrollback_len as i64, alt);
                }
            }
        }
        self.refresh_scrollback_len();
    }

    fn resize(&mut self, rows: u16, cols: u16) {
        if rows == self.rows && cols == self.cols {
            return;
        }
        self.rows = rows;
        self.cols = cols;
        self.parser.screen_mut().set_size(rows, cols);
        self.scrollback_cache.clear();
        self.force_full = true;
        self.pending_output = true;
    }

    fn snapshot(&self) -> TerminalState {
        let (mouse_tracking, cursor_key_mode) = self.modes();
        TerminalState {
            cols: self.cols,
            rows: self.rows,
            cursor: self.cursor(),
            cells: self.current_cells(),
            alternate_screen: self.parser.screen().alternate_screen(),
            mouse_tracking,
            cursor_key_mode,
        }
    }

    fn scroll_state(&self) -> ScrollState {
        ScrollState {
            viewport_offset: self.viewport_offset,
            scrollback_length: self.scrollback_len,
            is_at_bottom: self.viewport_offset == 0,
            is_at_scrollback_limit: self.scrollback_len >= self.history_limit,
        }
    }

    fn set_viewport_offset(&mut self, offset: usize) {
        let clamped = offset.min(self.scrollback_len);
        if clamped != self.viewport_offset {
            self.viewport_offset = clamped;
            self.pending_output = true;
        }
    }

    fn take_update(&mut self) -> Option<UnifiedUpdate> {
        if !self.update_enabled || !self.pending_output || self.disposed {
            return None;
        }
        self.pending_output = false;
        self.seq += 1;
        let alt = self.parser.screen().alternate_screen();
        let scroll = self.scroll_state();

        if self.force_full || alt != self.last_alt || self.last_cells.len() != self.rows as usize {
            self.force_full = false;
            self.last_alt = alt;
            let state = self.snapshot();
            self.last_cells = state.cells.clone();
            return Some(UnifiedUpdate { seq: self.seq, update: TerminalUpdate::Full(state), scroll });
        }

        let current = self.current_cells();
        let mut changed = Vec::new();
        for (idx, row) in current.iter().enumerate() {
            if self.last_cells.get(idx) != Some(row) {
                changed.push((idx as u16, row.clone()));
            }
        }
        self.last_cells = current;
        let (mouse_tracking, cursor_key_mode) = self.modes();
        Some(UnifiedUpdate {
            seq: self.seq,
            update: TerminalUpdate::Delta {
                rows: changed,
                cursor: self.cursor(),
                alternate_screen: alt,
                mouse_tracking,
                cursor_key_mode,
            },
            scroll,
        })
    }

    fn get_scrollback_line(&self, absolute_y: usize) -> Option<Vec<Cell>> {
        self.scrollback_cache.get(&absolute_y).cloned()
    }

    fn prefetch_scrollback_lines(&mut self, start: usize, count: usize) {
        self.refresh_scrollback_len();
        let total = self.scrollback_len;
        if self.scrollback_cache.len() + count > SCROLLBACK_CACHE_CAP {
            self.scrollback_cache.clear();
        }
        let cols = self.cols;
        let saved = self.parser.screen().scrollback();
        for abs_y in start..(start + count).min(total) {
            if self.scrollback_cache.contains_key(&abs_y) {
                continue;
            }
            self.parser.screen_mut().set_scrollback(total - abs_y);
            let screen = self.parser.screen();
            let mut row = Vec::with_capacity(cols as usize);
            let mut c = 0;
            while c < cols {
                if let Some(cell) = screen.cell(0, c) {
                    let converted = convert_cell(cell);
                    let w = converted.width.max(1) as u16;
                    row.push(converted);
                    for _ in 1..w {
                        if row.len() < cols as usize {
                            row.push(Cell { ch: '\0', ..Default::default() });
                        }
                    }
                    c += w;
                } else {
                    row.push(Cell::default());
                    c += 1;
                }
            }
            row.truncate(cols as usize);
            self.scrollback_cache.insert(abs_y, row);
        }
        self.parser.screen_mut().set_scrollback(saved);
    }

    fn get_kitty_image_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.kitty.images.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn get_kitty_image_info(&self, id: u32) -> Option<KittyImageInfo> {
        self.kitty.images.get(&id).cloned()
    }

    fn get_kitty_image_data(&self, id: u32) -> Option<Vec<u8>> {
        self.kitty.data.get(&id).cloned()
    }

    fn get_kitty_placements(&self) -> Vec<KittyPlacement> {
        let alt = self.parser.screen().alternate_screen();
        let map = if alt { &self.kitty.alt_placements } else { &self.kitty.main_placements };
        let mut out: Vec<KittyPlacement> = map.values().cloned().collect();
        out.sort_by_key(|p| (p.image_id, p.placement_id));
        out
    }

    fn get_kitty_images_dirty(&self) -> bool {
        self.kitty.dirty
    }

    fn clear_kitty_images_dirty(&mut self) {
        self.kitty.dirty = false;
    }
}

// ─── Test double ────────────────────────────────────────────────────────────

/// In-memory emulator used by the renderer and graphics tests. Screen and
/// scrollback contents are set directly; the kitty state is a plain struct.
#[cfg(test)]
pub mod fake {
    use super::*;

    #[derive(Default)]
    pub struct FakeEmulator {
        pub disposed: bool,
        pub update_enabled: bool,
        pub alternate_screen: bool,
        pub state: TerminalState,
        pub scroll: ScrollState,
        pub scrollback_rows: HashMap<usize, Vec<Cell>>,
        pub prefetched: Vec<(usize, usize)>,
        pub updates: Vec<UnifiedUpdate>,
        pub images: Vec<KittyImageInfo>,
        pub image_data: HashMap<u32, Vec<u8>>,
        pub placements: Vec<KittyPlacement>,
        pub dirty: bool,
        /// Shared so tests can observe gate calls through `dyn Emulator`.
        pub enable_calls: Arc<Mutex<Vec<bool>>>,
    }

    impl FakeEmulator {
        pub fn sized(rows: u16, cols: u16) -> Self {
            let mut f = FakeEmulator::default();
            f.state.rows = rows;
            f.state.cols = cols;
            f.state.cells = vec![vec![Cell::default(); cols as usize]; rows as usize];
            f.update_enabled = true;
            f
        }
    }

    impl Emulator for FakeEmulator {
        fn is_disposed(&self) -> bool {
            self.disposed
        }
        fn dispose(&mut self) {
            self.disposed = true;
        }
        fn set_update_enabled(&mut self, enabled: bool) {
            self.update_enabled = enabled;
            self.enable_calls.lock().unwrap().push(enabled);
        }
        fn is_alternate_screen(&self) -> bool {
            self.alternate_screen
        }
        fn get_mode(&self, _mode: u16) -> bool {
            false
        }
        fn cursor_key_mode(&self) -> CursorKeyMode {
            self.state.cursor_key_mode
        }
        fn kitty_keyboard_flags(&self) -> u32 {
            0
        }
        fn process(&mut self, _bytes: &[u8]) {}
        fn resize(&mut self, rows: u16, cols: u16) {
            self.state.rows = rows;
            self.state.cols = cols;
        }
        fn snapshot(&self) -> TerminalState {
            self.state.clone()
        }
        fn scroll_state(&self) -> ScrollState {
            self.scroll
        }
        fn set_viewport_offset(&mut self, offset: usize) {
            self.scroll.viewport_offset = offset;
            self.scroll.is_at_bottom = offset == 0;
        }
        fn take_update(&mut self) -> Option<UnifiedUpdate> {
            if self.update_enabled {
                self.updates.pop()
            } else {
                None
            }
        }
        fn get_scrollback_line(&self, absolute_y: usize) -> Option<Vec<Cell>> {
            self.scrollback_rows.get(&absolute_y).cloned()
        }
        fn prefetch_scrollback_lines(&mut self, start: usize, count: usize) {
            self.prefetched.push((start, count));
        }
        fn get_kitty_image_ids(&self) -> Vec<u32> {
            self.images.iter().map(|i| i.id).collect()
        }
        fn get_kitty_image_info(&self, id: u32) -> Option<KittyImageInfo> {
            self.images.iter().find(|i| i.id == id).cloned()
        }
        fn get_kitty_image_data(&self, id: u32) -> Option<Vec<u8>> {
            self.image_data.get(&id).cloned()
        }
        fn get_kitty_placements(&self) -> Vec<KittyPlacement> {
            self.placements.clone()
        }
        fn get_kitty_images_dirty(&self) -> bool {
            self.dirty
        }
        fn clear_kitty_images_dirty(&mut self) {
            self.dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_then_full_update() {
        let mut emu = Vt100Emulator::new(4, 10, 100);
        emu.process(b"hi");
        let update = emu.take_update().expect("update after output");
        match update.update {
            TerminalUpdate::Full(state) => {
                assert_eq!(state.cells[0][0].ch, 'h');
                assert_eq!(state.cells[0][1].ch, 'i');
            }
            _ => panic!("first update must be full"),
        }
        // No further output, no further update.
        assert!(emu.take_update().is_none());
    }

    #[test]
    fn delta_covers_changed_rows_only() {
        let mut emu = Vt100Emulator::new(4, 10, 100);
        emu.process(b"aaaa\r\nbbbb");
        emu.take_update().unwrap();
        emu.process(b"\x1b[1;1Hzzzz");
        let update = emu.take_update().unwrap();
        match update.update {
            TerminalUpdate::Delta { rows, .. } => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].0, 0);
                assert_eq!(rows[0].1[0].ch, 'z');
            }
            _ => panic!("expected delta"),
        }
    }

    #[test]
    fn update_gate_suppresses_and_forces_full_on_reenable() {
        let mut emu = Vt100Emulator::new(4, 10, 100);
        emu.process(b"one");
        emu.take_update().unwrap();
        emu.set_update_enabled(false);
        emu.process(b"\r\ntwo");
        assert!(emu.take_update().is_none());
        emu.set_update_enabled(true);
        let update = emu.take_update().unwrap();
        assert!(matches!(update.update, TerminalUpdate::Full(_)));
    }

    #[test]
    fn scrollback_prefetch_fills_cache() {
        let mut emu = Vt100Emulator::new(2, 8, 100);
        // Ten lines through a two-row screen leaves eight in scrollback.
        for i in 0..10 {
            emu.process(format!("line{}\r\n", i).as_bytes());
        }
        let scroll = emu.scroll_state();
        assert!(scroll.scrollback_length >= 8);
        assert!(emu.get_scrollback_line(0).is_none());
        emu.prefetch_scrollback_lines(0, 2);
        let row = emu.get_scrollback_line(0).expect("prefetched row");
        let text: String = row.iter().map(|c| c.ch).collect();
        assert!(text.starts_with("line0"));
    }

    #[test]
    fn kitty_stub_transmit_records_image() {
        let mut emu = Vt100Emulator::new(4, 10, 100);
        emu.process(b"\x1b_Ga=t,f=100,s=3,v=2,i=7\x1b\\");
        assert!(emu.get_kitty_images_dirty());
        let info = emu.get_kitty_image_info(7).expect("image recorded");
        assert_eq!((info.width, info.height), (3, 2));
        assert_eq!(info.format, ImageFormat::Png);
        assert!(emu.get_kitty_image_data(7).is_none());
    }

    #[test]
    fn kitty_transmit_and_display_places_at_cursor() {
        let mut emu = Vt100Emulator::new(4, 10, 100);
        emu.process(b"\x1b[2;3H");
        emu.process(b"\x1b_Ga=T,f=100,s=1,v=1,i=9\x1b\\");
        let placements = emu.get_kitty_placements();
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].image_id, 9);
        assert_eq!(placements[0].screen_x, 2);
        assert_eq!(placements[0].screen_y, 1);
    }

    #[test]
    fn kitty_delete_image_removes_placements() {
        let mut emu = Vt100Emulator::new(4, 10, 100);
        emu.process(b"\x1b_Ga=T,f=100,s=1,v=1,i=9\x1b\\");
        emu.clear_kitty_images_dirty();
        emu.process(b"\x1b_Ga=d,d=I,i=9\x1b\\");
        assert!(emu.get_kitty_images_dirty());
        assert!(emu.get_kitty_placements().is_empty());
        assert!(emu.get_kitty_image_info(9).is_none());
    }

    #[test]
    fn alt_screen_placements_are_separate() {
        let mut emu = Vt100Emulator::new(4, 10, 100);
        emu.process(b"\x1b_Ga=T,f=100,s=1,v=1,i=5\x1b\\");
        assert_eq!(emu.get_kitty_placements().len(), 1);
        emu.process(b"\x1b[?1049h");
        assert!(emu.is_alternate_screen());
        assert!(emu.get_kitty_placements().is_empty());
        emu.process(b"\x1b[?1049l");
        assert_eq!(emu.get_kitty_placements().len(), 1);
    }
}
