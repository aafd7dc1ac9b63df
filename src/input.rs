//! Keyboard and mouse encoding for the active pane, plus the prefix-key
//! binding table. Arrows honour the child's cursor key mode; the Kitty
//! keyboard protocol is deliberately not spoken here.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind};

use crate::layout::Direction;
use crate::types::{CursorKeyMode, SplitDirection, WorkspaceId};

/// Actions reachable through the prefix key (Ctrl-b by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixAction {
    NewPane,
    Split(SplitDirection),
    ClosePane,
    Navigate(Direction),
    SwapMain,
    MovePane(Direction),
    ToggleZoom,
    CycleLayoutMode,
    SwitchWorkspace(WorkspaceId),
    EnterScrollback,
    Detach,
}

pub const PREFIX_KEY: (KeyCode, KeyModifiers) = (KeyCode::Char('b'), KeyModifiers::CONTROL);

pub fn prefix_action(key: &KeyEvent) -> Option<PrefixAction> {
    let shift = key.modifiers.contains(KeyModifiers::SHIFT);
    match key.code {
        KeyCode::Char('c') => Some(PrefixAction::NewPane),
        KeyCode::Char('%') => Some(PrefixAction::Split(SplitDirection::Vertical)),
        KeyCode::Char('"') => Some(PrefixAction::Split(SplitDirection::Horizontal)),
        KeyCode::Char('x') => Some(PrefixAction::ClosePane),
        KeyCode::Char('h') | KeyCode::Left if shift => Some(PrefixAction::MovePane(Direction::West)),
        KeyCode::Char('j') | KeyCode::Down if shift => Some(PrefixAction::MovePane(Direction::South)),
        KeyCode::Char('k') | KeyCode::Up if shift => Some(PrefixAction::MovePane(Direction::North)),
        KeyCode::Char('l') | KeyCode::Right if shift => Some(PrefixAction::MovePane(Direction::East)),
        KeyCode::Char('h') | KeyCode::Left => Some(PrefixAction::Navigate(Direction::West)),
        KeyCode::Char('j') | KeyCode::Down => Some(PrefixAction::Navigate(Direction::South)),
        KeyCode::Char('k') | KeyCode::Up => Some(PrefixAction::Navigate(Direction::North)),
        KeyCode::Char('l') | KeyCode::Right => Some(PrefixAction::Navigate(Direction::East)),
        KeyCode::Enter => Some(PrefixAction::SwapMain),
        KeyCode::Char('z') => Some(PrefixAction::ToggleZoom),
        KeyCode::Char(' ') => Some(PrefixAction::CycleLayoutMode),
        KeyCode::Char('[') => Some(PrefixAction::EnterScrollback),
        KeyCode::Char('d') => Some(PrefixAction::Detach),
        KeyCode::Char(c @ '1'..='9') => {
            Some(PrefixAction::SwitchWorkspace(c.to_digit(10).unwrap() as WorkspaceId))
        }
        _ => None,
    }
}

/// Encode a key press into the byte sequence the child expects.
pub fn encode_key(key: &KeyEvent, cursor_keys: CursorKeyMode) -> Vec<u8> {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    let alt = key.modifiers.contains(KeyModifiers::ALT);
    let mut out = Vec::new();
    if alt {
        out.push(0x1b);
    }
    match key.code {
        KeyCode::Char(c) => {
            if ctrl {
                let upper = c.to_ascii_uppercase();
                if upper.is_ascii_uppercase() {
                    out.push(upper as u8 & 0x1f);
                } else {
                    match c {
                        ' ' | '@' => out.push(0x00),
                        '[' => out.push(0x1b),
                        '\\' => out.push(0x1c),
                        ']' => out.push(0x1d),
                        '^' => out.push(0x1e),
                        '_' | '/' => out.push(0x1f),
                        _ => out.extend_from_slice(c.to_string().as_bytes()),
                    }
                }
            } else {
                out.extend_from_slice(c.to_string().as_bytes());
            }
        }
        KeyCode::Enter => out.push(b'\r'),
        KeyCode::Tab => out.push(b'\t'),
        KeyCode::BackTab => out.extend_from_slice(b"\x1b[Z"),
        KeyCode::Backspace => out.push(0x7f),
        KeyCode::Esc => out.push(0x1b),
        KeyCode::Up | KeyCode::Down | KeyCode::Right | KeyCode::Left => {
            let letter = match key.code {
                KeyCode::Up => b'A',
                KeyCode::Down => b'B',
                KeyCode::Right => b'C',
                _ => b'D',
            };
            match cursor_keys {
                CursorKeyMode::Application if !ctrl && !key.modifiers.contains(KeyModifiers::SHIFT) => {
                    out.extend_from_slice(&[0x1b, b'O', letter]);
                }
                _ => {
                    if ctrl {
                        out.extend_from_slice(b"\x1b[1;5");
                        out.push(letter);
                    } else if key.modifiers.contains(KeyModifiers::SHIFT) {
                        out.extend_from_slice(b"\x1b[1;2");
                        out.push(letter);
                    } else {
                        out.extend_from_slice(&[0x1b, b'[', letter]);
                    }
                }
            }
        }
        KeyCode::Home => out.extend_from_slice(b"\x1b[H"),
        KeyCode::End => out.extend_from_slice(b"\x1b[F"),
        KeyCode::PageUp => out.extend_from_slice(b"\x1b[5~"),
        KeyCode::PageDown => out.extend_from_slice(b"\x1b[6~"),
        KeyCode::Insert => out.extend_from_slice(b"\x1b[2~"),
        KeyCode::Delete => out.extend_from_slice(b"\x1b[3~"),
        KeyCode::F(n) => {
            let seq: &[u8] = match n {
                1 => b"\x1bOP",
                2 => b"\x1bOQ",
                3 => b"\x1bOR",
                4 => b"\x1bOS",
                5 => b"\x1b[15~",
                6 => b"\x1b[17~",
                7 => b"\x1b[18~",
                8 => b"\x1b[19~",
                9 => b"\x1b[20~",
                10 => b"\x1b[21~",
                11 => b"\x1b[23~",
                12 => b"\x1b[24~",
                _ => b"",
            };
            out.extend_from_slice(seq);
        }
        _ => {}
    }
    out
}

/// SGR mouse encoding for passthrough when the child tracks the mouse.
/// Coordinates are pane-local, 0-based.
pub fn encode_mouse_sgr(event: &MouseEvent, local_x: u16, local_y: u16) -> Option<Vec<u8>> {
    let (button, press) = match event.kind {
        MouseEventKind::Down(MouseButton::Left) => (0u8, true),
        MouseEventKind::Down(MouseButton::Middle) => (1, true),
        MouseEventKind::Down(MouseButton::Right) => (2, true),
        MouseEventKind::Up(MouseButton::Left) => (0, false),
        MouseEventKind::Up(MouseButton::Middle) => (1, false),
        MouseEventKind::Up(MouseButton::Right) => (2, false),
        MouseEventKind::Drag(MouseButton::Left) => (32, true),
        MouseEventKind::Drag(MouseButton::Middle) => (33, true),
        MouseEventKind::Drag(MouseButton::Right) => (34, true),
        MouseEventKind::ScrollUp => (64, true),
        MouseEventKind::ScrollDown => (65, true),
        _ => return None,
    };
    let suffix = if press { 'M' } else { 'm' };
    Some(
        format!("\x1b[<{};{};{}{}", button, local_x + 1, local_y + 1, suffix)
            .into_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn plain_and_control_chars() {
        assert_eq!(encode_key(&key(KeyCode::Char('a'), KeyModifiers::NONE), CursorKeyMode::Normal), b"a");
        assert_eq!(
            encode_key(&key(KeyCode::Char('c'), KeyModifiers::CONTROL), CursorKeyMode::Normal),
            vec![0x03]
        );
        assert_eq!(
            encode_key(&key(KeyCode::Char('x'), KeyModifiers::ALT), CursorKeyMode::Normal),
            vec![0x1b, b'x']
        );
    }

    #[test]
    fn arrows_follow_cursor_key_mode() {
        let up = key(KeyCode::Up, KeyModifiers::NONE);
        assert_eq!(encode_key(&up, CursorKeyMode::Normal), b"\x1b[A");
        assert_eq!(encode_key(&up, CursorKeyMode::Application), b"\x1bOA");
        let ctrl_right = key(KeyCode::Right, KeyModifiers::CONTROL);
        assert_eq!(encode_key(&ctrl_right, CursorKeyMode::Application), b"\x1b[1;5C");
    }

    #[test]
    fn prefix_table_covers_core_actions() {
        assert_eq!(
            prefix_action(&key(KeyCode::Char('%'), KeyModifiers::NONE)),
            Some(PrefixAction::Split(SplitDirection::Vertical))
        );
        assert_eq!(
            prefix_action(&key(KeyCode::Char('3'), KeyModifiers::NONE)),
            Some(PrefixAction::SwitchWorkspace(3))
        );
        assert_eq!(
            prefix_action(&key(KeyCode::Char('h'), KeyModifiers::SHIFT)),
            Some(PrefixAction::MovePane(Direction::West))
        );
        assert_eq!(prefix_action(&key(KeyCode::Char('q'), KeyModifiers::NONE)), None);
    }

    #[test]
    fn sgr_mouse_encoding() {
        let event = MouseEvent {
            kind: MouseEventKind::Down(MouseButton::Left),
            column: 10,
            row: 5,
            modifiers: KeyModifiers::NONE,
        };
        assert_eq!(encode_mouse_sgr(&event, 3, 2), Some(b"\x1b[<0;4;3M".to_vec()));
        let release = MouseEvent { kind: MouseEventKind::Up(MouseButton::Left), ..event };
        assert_eq!(encode_mouse_sgr(&release, 3, 2), Some(b"\x1b[<0;4;3m".to_vec()));
    }
}
