//! Kitty APC sequence scanning and parsing, shared by the transmit relay,
//! the broker and the graphics renderer.
//!
//! A Kitty graphics command travels as an Application Program Command:
//! `ESC _ G <key=value,...> ; <payload> ESC \` (or the 8-bit APC/ST bytes).
//! The scanner splits a raw child-output stream into plain text spans and
//! complete Kitty sequences, holding partial sequences across reads.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

pub const ESC: u8 = 0x1b;
pub const APC_8BIT: u8 = 0x9f;
pub const ST_8BIT: u8 = 0x9c;

/// Synthetic guest-image ids injected by the relay live in the 31-bit high
/// range, allocated downward from `SYNTHETIC_GUEST_ID_MAX`. Real guests
/// picking ids up there would collide with kitty's own conventions anyway.
pub const SYNTHETIC_GUEST_ID_MAX: u32 = (1 << 31) - 1;
pub const SYNTHETIC_GUEST_ID_MIN: u32 = 1 << 30;

// ─── Stream scanner ─────────────────────────────────────────────────────────

/// One item produced by the scanner. `raw` always holds the exact original
/// bytes so pass-through and host forwarding are byte-identical.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanItem {
    /// Plain child output (may contain non-Kitty escape sequences).
    Text(Vec<u8>),
    /// A complete Kitty APC sequence. `body` is the payload between the
    /// `G` introducer and the terminator.
    Kitty { body: Vec<u8>, raw: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanState {
    Ground,
    Esc,
    Apc,
    ApcEsc,
}

/// Incremental APC scanner. Sequences may span arbitrarily many reads; the
/// pending buffer is bounded only by the child's own chunking.
pub struct SequenceScanner {
    state: ScanState,
    pending: Vec<u8>,
}

impl Default for SequenceScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceScanner {
    pub fn new() -> Self {
        SequenceScanner { state: ScanState::Ground, pending: Vec::new() }
    }

    pub fn scan(&mut self, input: &[u8]) -> Vec<ScanItem> {
        let mut out = Vec::new();
        let mut text = Vec::new();
        for &b in input {
            match self.state {
                ScanState::Ground => match b {
                    ESC => self.state = ScanState::Esc,
                    APC_8BIT => {
                        self.pending.clear();
                        self.pending.push(b);
                        self.state = ScanState::Apc;
                    }
                    _ => text.push(b),
                },
                ScanState::Esc => match b {
                    b'_' => {
                        self.pending.clear();
                        self.pending.push(ESC);
                        self.pending.push(b);
                        self.state = ScanState::Apc;
                    }
                    _ => {
                        text.push(ESC);
                        text.push(b);
                        self.state = ScanState::Ground;
                    }
                },
                ScanState::Apc => match b {
                    ESC => {
                        self.pending.push(b);
                        self.state = ScanState::ApcEsc;
                    }
                    ST_8BIT => {
                        self.pending.push(b);
                        self.finish_sequence(&mut out, &mut text);
                    }
                    _ => self.pending.push(b),
                },
                ScanState::ApcEsc => {
                    self.pending.push(b);
                    if b == b'\\' {
                        self.finish_sequence(&mut out, &mut text);
                    } else {
                        // ESC inside the payload that was not ST; stay in APC.
                        self.state = ScanState::Apc;
                    }
                }
            }
        }
        if !text.is_empty() {
            out.push(ScanItem::Text(text));
        }
        out
    }

    fn finish_sequence(&mut self, out: &mut Vec<ScanItem>, text: &mut Vec<u8>) {
        self.state = ScanState::Ground;
        let raw = std::mem::take(&mut self.pending);
        let intro_len = if raw[0] == ESC { 2 } else { 1 };
        let term_len = if raw.ends_with(&[ESC, b'\\']) { 2 } else { 1 };
        let inner = &raw[intro_len..raw.len() - term_len];
        if inner.first() == Some(&b'G') {
            if !text.is_empty() {
                out.push(ScanItem::Text(std::mem::take(text)));
            }
            out.push(ScanItem::Kitty { body: inner[1..].to_vec(), raw });
        } else {
            // Not a graphics command; hand it back untouched.
            text.extend_from_slice(&raw);
        }
    }
}

// ─── Transmit params ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KittyAction {
    Transmit,
    TransmitAndDisplay,
    Display,
    Delete,
    Query,
    Animate,
    Other(u8),
}

impl KittyAction {
    fn from_byte(b: u8) -> Self {
        match b {
            b't' => KittyAction::Transmit,
            b'T' => KittyAction::TransmitAndDisplay,
            b'p' => KittyAction::Display,
            b'd' => KittyAction::Delete,
            b'q' => KittyAction::Query,
            b'a' | b'f' => KittyAction::Animate,
            other => KittyAction::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Medium {
    Direct,
    File,
    TempFile,
    SharedMemory,
}

impl Medium {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'd' => Some(Medium::Direct),
            b'f' => Some(Medium::File),
            b't' => Some(Medium::TempFile),
            b's' => Some(Medium::SharedMemory),
            _ => None,
        }
    }
}

/// Parsed control keys of a graphics command. Keys the pipeline does not
/// interpret survive in `extra`, in arrival order, so rebuilt sequences
/// stay faithful.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransmitParams {
    pub action: Option<KittyAction>,
    pub format: Option<u32>,
    pub medium: Option<Medium>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub compressed: bool,
    pub more: Option<bool>,
    pub image_id: Option<u32>,
    pub image_number: Option<u32>,
    pub placement_id: Option<u32>,
    pub quiet: Option<u32>,
    pub delete_what: Option<u8>,
    pub extra: Vec<(String, String)>,
}

/// Split a sequence body into `(control, data)` at the first `;`. A body
/// with no separator is all control.
pub fn split_control_data(body: &[u8]) -> (&[u8], &[u8]) {
    match body.iter().position(|&b| b == b';') {
        Some(i) => (&body[..i], &body[i + 1..]),
        None => (body, &[]),
    }
}

impl TransmitParams {
    pub fn parse(control: &[u8]) -> Option<TransmitParams> {
        let control = std::str::from_utf8(control).ok()?;
        let mut params = TransmitParams::default();
        let mut any = false;
        for pair in control.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=')?;
            any = true;
            match key {
                "a" => params.action = value.bytes().next().map(KittyAction::from_byte),
                "f" => params.format = value.parse().ok(),
                "t" => params.medium = value.bytes().next().and_then(Medium::from_byte),
                "s" => params.width = value.parse().ok(),
                "v" => params.height = value.parse().ok(),
                "o" => params.compressed = value == "z",
                "m" => params.more = Some(value == "1"),
                "i" => params.image_id = value.parse().ok(),
                "I" => params.image_number = value.parse().ok(),
                "p" => params.placement_id = value.parse().ok(),
                "q" => params.quiet = value.parse().ok(),
                "d" => params.delete_what = value.bytes().next(),
                _ => params.extra.push((key.to_string(), value.to_string())),
            }
        }
        if any {
            Some(params)
        } else {
            None
        }
    }

    /// Fill unset fields from an earlier chunk's params. Kitty continuation
    /// chunks may carry only `m=`; everything else is inherited.
    pub fn inherit_from(&mut self, earlier: &TransmitParams) {
        if self.action.is_none() {
            self.action = earlier.action;
        }
        if self.format.is_none() {
            self.format = earlier.format;
        }
        if self.medium.is_none() {
            self.medium = earlier.medium;
        }
        if self.width.is_none() {
            self.width = earlier.width;
        }
        if self.height.is_none() {
            self.height = earlier.height;
        }
        if self.image_id.is_none() {
            self.image_id = earlier.image_id;
        }
        if self.image_number.is_none() {
            self.image_number = earlier.image_number;
        }
        self.compressed |= earlier.compressed;
    }

    pub fn is_transmit(&self) -> bool {
        matches!(
            self.action,
            Some(KittyAction::Transmit) | Some(KittyAction::TransmitAndDisplay) | None
        )
    }
}

/// Wrap a control string plus data payload into a complete 7-bit APC
/// sequence.
pub fn build_sequence(control: &str, data: &[u8]) -> Vec<u8> {
    let mut seq = Vec::with_capacity(control.len() + data.len() + 6);
    seq.extend_from_slice(b"\x1b_G");
    seq.extend_from_slice(control.as_bytes());
    if !data.is_empty() {
        seq.push(b';');
        seq.extend_from_slice(data);
    }
    seq.extend_from_slice(b"\x1b\\");
    seq
}

// ─── Streaming base64 ───────────────────────────────────────────────────────

/// Incremental base64 decoder. Kitty chunks split payloads at arbitrary
/// byte boundaries, so partial 4-character groups carry across `push`
/// calls.
#[derive(Default)]
pub struct Base64Stream {
    carry: Vec<u8>,
}

impl Base64Stream {
    pub fn new() -> Self {
        Base64Stream { carry: Vec::new() }
    }

    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<(), base64::DecodeError> {
        self.carry.extend(chunk.iter().copied().filter(|b| !b.is_ascii_whitespace()));
        let whole = self.carry.len() - self.carry.len() % 4;
        if whole == 0 {
            return Ok(());
        }
        let decoded = BASE64.decode(&self.carry[..whole])?;
        out.extend_from_slice(&decoded);
        self.carry.drain(..whole);
        Ok(())
    }

    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), base64::DecodeError> {
        if self.carry.is_empty() {
            return Ok(());
        }
        let rest = std::mem::take(&mut self.carry);
        let decoded = BASE64.decode(&rest)?;
        out.extend_from_slice(&decoded);
        Ok(())
    }
}

// ─── PNG dimensions ─────────────────────────────────────────────────────────

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Read width/height from a PNG IHDR. Needs only the first 24 decoded
/// bytes; anything shorter or non-PNG yields `None`.
pub fn png_dimensions(decoded: &[u8]) -> Option<(u32, u32)> {
    if decoded.len() < 24 || decoded[..8] != PNG_SIGNATURE {
        return None;
    }
    if &decoded[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(decoded[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(decoded[20..24].try_into().ok()?);
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kitty_seq(body: &str) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(b"\x1b_G");
        v.extend_from_slice(body.as_bytes());
        v.extend_from_slice(b"\x1b\\");
        v
    }

    #[test]
    fn scanner_passes_plain_text() {
        let mut sc = SequenceScanner::new();
        let items = sc.scan(b"hello \x1b[31mred\x1b[0m");
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], ScanItem::Text(t) if t.starts_with(b"hello")));
    }

    #[test]
    fn scanner_extracts_kitty_sequence() {
        let mut sc = SequenceScanner::new();
        let mut input = b"before".to_vec();
        input.extend_from_slice(&kitty_seq("a=t,f=100,i=7;QUJD"));
        input.extend_from_slice(b"after");
        let items = sc.scan(&input);
        assert_eq!(items.len(), 3);
        match &items[1] {
            ScanItem::Kitty { body, raw } => {
                assert_eq!(body, b"a=t,f=100,i=7;QUJD");
                assert_eq!(*raw, kitty_seq("a=t,f=100,i=7;QUJD"));
            }
            other => panic!("expected kitty item, got {:?}", other),
        }
    }

    #[test]
    fn scanner_holds_partial_sequence_across_reads() {
        let mut sc = SequenceScanner::new();
        let seq = kitty_seq("a=t,i=3;QUJD");
        let items = sc.scan(&seq[..7]);
        assert!(items.is_empty());
        let items = sc.scan(&seq[7..]);
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], ScanItem::Kitty { body, .. } if body == b"a=t,i=3;QUJD"));
    }

    #[test]
    fn scanner_returns_non_graphics_apc_as_text() {
        let mut sc = SequenceScanner::new();
        let items = sc.scan(b"\x1b_Xsomething\x1b\\tail");
        assert_eq!(items.len(), 1);
        match &items[0] {
            ScanItem::Text(t) => assert_eq!(t.as_slice(), b"\x1b_Xsomething\x1b\\tail"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn params_parse_and_inherit() {
        let (control, data) = split_control_data(b"a=t,f=32,t=d,s=10,v=12,m=1,i=5;AAAA");
        let p = TransmitParams::parse(control).unwrap();
        assert_eq!(p.action, Some(KittyAction::Transmit));
        assert_eq!(p.format, Some(32));
        assert_eq!(p.medium, Some(Medium::Direct));
        assert_eq!((p.width, p.height), (Some(10), Some(12)));
        assert_eq!(p.more, Some(true));
        assert_eq!(data, b"AAAA");

        let cont = TransmitParams::parse(b"m=0").unwrap();
        let mut cont2 = cont.clone();
        cont2.inherit_from(&p);
        assert_eq!(cont2.image_id, Some(5));
        assert_eq!(cont2.format, Some(32));
    }

    #[test]
    fn base64_stream_carries_partial_groups() {
        // "hello world!" split mid-group.
        let encoded = BASE64.encode(b"hello world!");
        let mut stream = Base64Stream::new();
        let mut out = Vec::new();
        stream.push(&encoded.as_bytes()[..5], &mut out).unwrap();
        stream.push(&encoded.as_bytes()[5..], &mut out).unwrap();
        stream.finish(&mut out).unwrap();
        assert_eq!(out, b"hello world!");
    }

    #[test]
    fn png_header_dimensions() {
        let mut png = PNG_SIGNATURE.to_vec();
        png.extend_from_slice(&13u32.to_be_bytes());
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&640u32.to_be_bytes());
        png.extend_from_slice(&480u32.to_be_bytes());
        assert_eq!(png_dimensions(&png), Some((640, 480)));
        assert_eq!(png_dimensions(b"notapng"), None);
    }
}
