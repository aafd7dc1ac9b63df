use std::sync::mpsc;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process-unique monotonic pane identifier. Stable across layout edits;
/// persisted as a string in session files.
pub type PaneId = u64;
/// Process-unique monotonic PTY identifier. A pane holds at most one.
pub type PtyId = u64;
/// Small positive workspace number, created lazily on first reference.
pub type WorkspaceId = u32;
/// Opaque session identifier (directory name under the sessions dir).
pub type SessionId = String;

// ─── Cell / terminal state ──────────────────────────────────────────────────

pub const ATTR_BOLD: u8 = 1;
pub const ATTR_DIM: u8 = 2;
pub const ATTR_ITALIC: u8 = 4;
pub const ATTR_UNDERLINE: u8 = 8;
pub const ATTR_STRIKETHROUGH: u8 = 16;
pub const ATTR_INVERSE: u8 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Rgb { r, g, b }
    }
}

/// One screen cell. `width` is 1 or 2; a wide cell owns the column to its
/// right, which carries a continuation marker when drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub ch: char,
    pub fg: Rgb,
    pub bg: Rgb,
    pub width: u8,
    pub attrs: u8,
}

impl Default for Cell {
    fn default() -> Self {
        Cell { ch: ' ', fg: Rgb::new(197, 200, 198), bg: Rgb::new(29, 31, 33), width: 1, attrs: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorState {
    pub x: u16,
    pub y: u16,
    pub visible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorKeyMode {
    #[default]
    Normal,
    Application,
}

/// Snapshot of a PTY's live screen as produced by the emulator.
#[derive(Debug, Clone, Default)]
pub struct TerminalState {
    pub cols: u16,
    pub rows: u16,
    pub cursor: CursorState,
    pub cells: Vec<Vec<Cell>>,
    pub alternate_screen: bool,
    pub mouse_tracking: bool,
    pub cursor_key_mode: CursorKeyMode,
}

/// Where the viewport sits relative to the scrollback. `viewport_offset == 0`
/// means the live screen; positive values count rows back from the bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScrollState {
    pub viewport_offset: usize,
    pub scrollback_length: usize,
    pub is_at_bottom: bool,
    pub is_at_scrollback_limit: bool,
}

/// A unified emulator update: either a full replacement state or a sparse
/// row delta. The scroll state is always the one consistent with the same
/// update, never a cached one from an earlier tick.
#[derive(Debug, Clone)]
pub enum TerminalUpdate {
    Full(TerminalState),
    Delta {
        rows: Vec<(u16, Vec<Cell>)>,
        cursor: CursorState,
        alternate_screen: bool,
        mouse_tracking: bool,
        cursor_key_mode: CursorKeyMode,
    },
}

#[derive(Debug, Clone)]
pub struct UnifiedUpdate {
    /// Monotonic per-PTY sequence number; a full update supersedes any
    /// buffered deltas with lower numbers.
    pub seq: u64,
    pub update: TerminalUpdate,
    pub scroll: ScrollState,
}

// ─── Kitty graphics ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Rgb,
    Rgba,
    Png,
    Gray,
    GrayAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Zlib,
}

/// Image metadata as the guest transmitted it. Identity for dedup is the
/// 6-tuple returned by `identity()`: two transmissions with equal tuples
/// are the same image to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct KittyImageInfo {
    pub id: u32,
    pub number: u32,
    pub width: u32,
    pub height: u32,
    pub data_length: usize,
    pub format: ImageFormat,
    pub compression: Compression,
    pub implicit_id: bool,
    pub transmit_time: u64,
}

pub type ImageIdentity = (u64, usize, u32, u32, ImageFormat, Compression);

impl KittyImageInfo {
    pub fn identity(&self) -> ImageIdentity {
        (self.transmit_time, self.data_length, self.width, self.height, self.format, self.compression)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlacementTag {
    Internal,
    Explicit,
}

/// One on-screen instance of an image. Coordinates are cell-grid units with
/// sub-cell pixel offsets; `screen_y` is absolute (scrollback included).
#[derive(Debug, Clone, PartialEq)]
pub struct KittyPlacement {
    pub image_id: u32,
    pub placement_id: u32,
    pub placement_tag: PlacementTag,
    pub screen_x: i32,
    pub screen_y: i64,
    pub x_offset: u32,
    pub y_offset: u32,
    pub source_x: u32,
    pub source_y: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub columns: u32,
    pub rows: u32,
    pub z: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScreenKind {
    Main,
    Alternate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaneLayer {
    Base,
    Overlay,
}

// ─── Control plane ──────────────────────────────────────────────────────────

/// Pane selector grammar accepted by the control surface.
#[derive(Debug, Clone, PartialEq)]
pub enum PaneSelector {
    Focused,
    Main,
    /// 1-based stack position.
    Stack(usize),
    ById(PaneId),
    ByPty(PtyId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitDirection {
    Vertical,
    Horizontal,
}

/// Requests from control-socket connections, marshalled onto the UI task
/// via a channel. Responses travel back over per-request senders.
pub enum ControlRequest {
    SessionList(mpsc::Sender<String>),
    SessionCreate(String, mpsc::Sender<Result<(), String>>),
    SessionRename(String, String, mpsc::Sender<Result<(), String>>),
    SessionDelete(String, mpsc::Sender<Result<(), String>>),
    SessionSwitch(String, mpsc::Sender<Result<(), String>>),
    PaneSplit {
        direction: SplitDirection,
        workspace: Option<WorkspaceId>,
        selector: Option<PaneSelector>,
        resp: mpsc::Sender<Result<PaneId, String>>,
    },
    PaneSend {
        text: String,
        selector: Option<PaneSelector>,
        resp: mpsc::Sender<Result<(), String>>,
    },
    PaneCapture {
        lines: Option<usize>,
        raw: bool,
        selector: Option<PaneSelector>,
        resp: mpsc::Sender<Result<String, String>>,
    },
    Detach,
}
