//! Per-PTY Kitty transmit relay. Sits between the child process and the
//! in-process emulator: graphics transmissions are intercepted before the
//! emulator sees them, large direct payloads are offloaded to temp files,
//! and the emulator receives a lightweight dimension stub instead of the
//! pixel data. Everything else passes through untouched.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::config::Config;
use crate::sequences::{
    self, Base64Stream, KittyAction, Medium, ScanItem, SequenceScanner, TransmitParams,
    build_sequence, split_control_data,
};
use crate::types::PtyId;

/// Result of relaying one batch of child output. `emu_sequence` feeds the
/// in-process emulator; `forward_sequence` goes to the host TTY via the
/// broker (`None` means nothing to send this round).
#[derive(Debug, Default, PartialEq)]
pub struct RelayOutput {
    pub emu_sequence: Vec<u8>,
    pub forward_sequence: Option<Vec<u8>>,
}

struct OffloadState {
    file: File,
    path: PathBuf,
    written: usize,
}

struct PendingChunk {
    guest_key: String,
    params: TransmitParams,
    /// Raw sequences held back until the offload decision is made.
    /// Bounded: once `decoded_len` crosses the threshold these move into
    /// the temp file and the buffer empties.
    buffered_raw: Vec<Vec<u8>>,
    /// Decoded payload not yet written to a file. Never exceeds the
    /// offload threshold plus one chunk.
    spill: Vec<u8>,
    decoder: Base64Stream,
    decoded_len: usize,
    /// First decoded bytes, kept for PNG header sniffing.
    head: Vec<u8>,
    offload: Option<OffloadState>,
}

pub struct TransmitRelay {
    pty: PtyId,
    offload_threshold: usize,
    cleanup_delay: Duration,
    stub_all_formats: bool,
    scanner: SequenceScanner,
    pending_chunk: Option<PendingChunk>,
    /// Guest key → dimensions already stubbed to the emulator. Repeat
    /// transmissions with no new dimensions are dropped.
    stubbed_guest_keys: HashMap<String, (u32, u32)>,
    next_synthetic_guest_id: u32,
    offload_counter: u64,
    cleanup_queue: Vec<(PathBuf, Instant)>,
}

impl TransmitRelay {
    pub fn new(pty: PtyId, config: &Config) -> Self {
        TransmitRelay {
            pty,
            offload_threshold: config.kitty_offload_threshold,
            cleanup_delay: Duration::from_millis(config.kitty_offload_cleanup_ms),
            stub_all_formats: config.kitty_stub_all_formats,
            scanner: SequenceScanner::new(),
            pending_chunk: None,
            stubbed_guest_keys: HashMap::new(),
            next_synthetic_guest_id: sequences::SYNTHETIC_GUEST_ID_MAX,
            offload_counter: 0,
            cleanup_queue: Vec::new(),
        }
    }

    pub fn pty(&self) -> PtyId {
        self.pty
    }

    /// Relay one batch of child output.
    pub fn process(&mut self, input: &[u8]) -> RelayOutput {
        let mut out = RelayOutput::default();
        for item in self.scanner.scan(input) {
            match item {
                ScanItem::Text(text) => out.emu_sequence.extend_from_slice(&text),
                ScanItem::Kitty { body, raw } => self.handle_kitty(&body, raw, &mut out),
            }
        }
        out
    }

    fn handle_kitty(&mut self, body: &[u8], raw: Vec<u8>, out: &mut RelayOutput) {
        let (control, data) = split_control_data(body);
        let parsed = TransmitParams::parse(control);

        // Delete commands: the emulator keeps its tracking state current,
        // and targeted deletes also reach the host cache.
        if let Some(params) = &parsed {
            if params.action == Some(KittyAction::Delete) {
                out.emu_sequence.extend_from_slice(&raw);
                if matches!(params.delete_what, Some(b'i') | Some(b'I'))
                    && (params.image_id.is_some() || params.image_number.is_some())
                {
                    append_forward(out, &raw);
                }
                return;
            }
        }

        let is_transmit = parsed
            .as_ref()
            .map(|p| {
                matches!(
                    p.action,
                    Some(KittyAction::Transmit) | Some(KittyAction::TransmitAndDisplay)
                )
            })
            .unwrap_or(self.pending_chunk.is_some());
        if !is_transmit {
            // Display, query, animation, malformed: not ours to rewrite.
            out.emu_sequence.extend_from_slice(&raw);
            return;
        }

        let mut params = parsed.unwrap_or_default();
        if let Some(pending) = &self.pending_chunk {
            params.inherit_from(&pending.params);
        }

        // Guest key: explicit id, then number, then the pending chunk's,
        // else a synthetic id injected into the sequence.
        let mut injected_id = None;
        let guest_key = if let Some(id) = params.image_id.filter(|&i| i > 0) {
            format!("i:{}", id)
        } else if let Some(num) = params.image_number.filter(|&n| n > 0) {
            format!("I:{}", num)
        } else if let Some(pending) = &self.pending_chunk {
            pending.guest_key.clone()
        } else {
            let id = self.next_synthetic_guest_id;
            self.next_synthetic_guest_id = self.next_synthetic_guest_id.saturating_sub(1);
            params.image_id = Some(id);
            injected_id = Some(id);
            format!("i:{}", id)
        };

        let raw = match injected_id {
            Some(id) => inject_image_id(control, data, id),
            None => raw,
        };

        let more = params.more == Some(true);
        let mut pending = match self.pending_chunk.take() {
            Some(p) if p.guest_key == guest_key => p,
            _ => PendingChunk {
                guest_key: guest_key.clone(),
                params: params.clone(),
                buffered_raw: Vec::new(),
                spill: Vec::new(),
                decoder: Base64Stream::new(),
                decoded_len: 0,
                head: Vec::new(),
                offload: None,
            },
        };
        pending.params = params.clone();

        let direct = params.medium.unwrap_or(Medium::Direct) == Medium::Direct;
        let buffering = direct && self.offload_threshold > 0;

        if direct {
            self.consume_payload(&mut pending, data, buffering);
        }

        // Host-side routing for this chunk.
        if !direct {
            append_forward(out, &raw);
        } else if pending.offload.is_some() {
            // Payload already flowing into the temp file.
        } else if buffering {
            pending.buffered_raw.push(raw.clone());
            self.maybe_start_offload(&mut pending);
        } else {
            append_forward(out, &raw);
        }

        if more {
            // Interior chunk: the emulator sees nothing until m=0.
            self.pending_chunk = Some(pending);
            return;
        }

        // Final (or only) chunk.
        if pending.offload.is_some() {
            self.finish_offload(&mut pending, out);
        } else if buffering {
            for buffered in pending.buffered_raw.drain(..) {
                append_forward(out, &buffered);
            }
        }

        let format_is_png = params.format == Some(100) || params.format.is_none();
        let is_shm = params.medium == Some(Medium::SharedMemory);
        if format_is_png || is_shm || self.stub_all_formats {
            self.emit_stub(&pending, out);
        } else {
            // Small raw-format transmissions reach the emulator whole.
            out.emu_sequence.extend_from_slice(&raw);
        }
        self.pending_chunk = None;
    }

    /// Decode the chunk payload. Bytes land in the offload file when one
    /// is open, in the bounded spill buffer while the decision is pending,
    /// or are only counted when offloading is disabled.
    fn consume_payload(&mut self, pending: &mut PendingChunk, data: &[u8], buffering: bool) {
        let mut decoded = Vec::new();
        if pending.decoder.push(data, &mut decoded).is_err() {
            // Bad base64 in the payload: count nothing, forward untouched.
            return;
        }
        pending.decoded_len += decoded.len();
        if pending.head.len() < 64 {
            let take = (64 - pending.head.len()).min(decoded.len());
            pending.head.extend_from_slice(&decoded[..take]);
        }
        if let Some(offload) = pending.offload.as_mut() {
            if offload.file.write_all(&decoded).is_ok() {
                offload.written += decoded.len();
            }
        } else if buffering {
            pending.spill.extend_from_slice(&decoded);
        }
    }

    /// Cross the threshold: open the temp file and move the spill into it.
    fn maybe_start_offload(&mut self, pending: &mut PendingChunk) {
        if pending.offload.is_some()
            || self.offload_threshold == 0
            || pending.decoded_len < self.offload_threshold
        {
            return;
        }
        self.offload_counter += 1;
        let path = std::env::temp_dir().join(format!(
            "openmux-tty-graphics-protocol-{}-{}-{}.bin",
            crate::util::hex_timestamp(),
            self.offload_counter,
            crate::util::hex_token(),
        ));
        let mut file = match File::create(&path) {
            Ok(f) => f,
            Err(e) => {
                // Temp file unavailable: fall back to direct chunked
                // transmission for the rest of this process lifetime.
                log::warn!("kitty offload open failed, falling back to direct: {}", e);
                self.offload_threshold = 0;
                return;
            }
        };
        let written = pending.spill.len();
        let _ = file.write_all(&pending.spill);
        pending.spill.clear();
        pending.spill.shrink_to_fit();
        pending.buffered_raw.clear();
        pending.offload = Some(OffloadState { file, path, written });
    }

    /// Close the offload file and emit the host-facing file-transfer
    /// rewrite (`t=f` with the path base64-encoded).
    fn finish_offload(&mut self, pending: &mut PendingChunk, out: &mut RelayOutput) {
        let Some(mut offload) = pending.offload.take() else { return };
        let mut tail = Vec::new();
        let _ = pending.decoder.finish(&mut tail);
        if !tail.is_empty() {
            let _ = offload.file.write_all(&tail);
            offload.written += tail.len();
        }
        let _ = offload.file.flush();
        drop(offload.file);

        let control = file_transfer_control(&pending.params, &pending.head, offload.written);
        let encoded_path = BASE64.encode(offload.path.to_string_lossy().as_bytes());
        append_forward(out, &build_sequence(&control, encoded_path.as_bytes()));

        self.cleanup_queue.push((offload.path, Instant::now() + self.cleanup_delay));
    }

    /// Emit the dimension stub to the emulator, once per guest key; repeat
    /// transmissions with no new dimensions are dropped.
    fn emit_stub(&mut self, pending: &PendingChunk, out: &mut RelayOutput) {
        let params = &pending.params;
        let (mut width, mut height) = (params.width.unwrap_or(0), params.height.unwrap_or(0));
        if (width == 0 || height == 0) && !pending.head.is_empty() {
            if let Some((w, h)) = sequences::png_dimensions(&pending.head) {
                width = w;
                height = h;
            }
        }
        match self.stubbed_guest_keys.get(&pending.guest_key) {
            Some(&known) if known == (width, height) || (width, height) == (0, 0) => return,
            _ => {}
        }

        // Stub shape: PNG-direct with real dimensions, chunking and
        // compression stripped, payload dropped.
        let action = match params.action {
            Some(KittyAction::TransmitAndDisplay) => "T",
            _ => "t",
        };
        let mut control = format!("a={},f=100,t=d", action);
        if width > 0 {
            control.push_str(&format!(",s={}", width));
        }
        if height > 0 {
            control.push_str(&format!(",v={}", height));
        }
        if let Some(id) = params.image_id {
            control.push_str(&format!(",i={}", id));
        }
        if let Some(num) = params.image_number.filter(|&n| n > 0) {
            control.push_str(&format!(",I={}", num));
        }
        if let Some(p) = params.placement_id {
            control.push_str(&format!(",p={}", p));
        }
        out.emu_sequence.extend_from_slice(&build_sequence(&control, &[]));
        self.stubbed_guest_keys.insert(pending.guest_key.clone(), (width, height));
    }

    /// Delete expired offload temp files. Called from the UI tick.
    pub fn sweep_cleanup(&mut self) {
        let now = Instant::now();
        self.cleanup_queue.retain(|(path, deadline)| {
            if now >= *deadline {
                if let Err(e) = std::fs::remove_file(path) {
                    log::debug!("offload cleanup failed for {:?}: {}", path, e);
                }
                false
            } else {
                true
            }
        });
    }

    /// Abort any half-written offload and delete everything scheduled.
    /// Used on PTY destruction so no file descriptors leak.
    pub fn abort(&mut self) {
        if let Some(pending) = self.pending_chunk.take() {
            if let Some(offload) = pending.offload {
                drop(offload.file);
                let _ = std::fs::remove_file(&offload.path);
            }
        }
        for (path, _) in self.cleanup_queue.drain(..) {
            let _ = std::fs::remove_file(&path);
        }
    }
}

impl Drop for TransmitRelay {
    fn drop(&mut self) {
        self.abort();
    }
}

fn append_forward(out: &mut RelayOutput, bytes: &[u8]) {
    out.forward_sequence.get_or_insert_with(Vec::new).extend_from_slice(bytes);
}

/// Rebuild a sequence with an injected `i=` key, payload untouched.
fn inject_image_id(control: &[u8], data: &[u8], id: u32) -> Vec<u8> {
    let mut new_control = String::from_utf8_lossy(control).into_owned();
    if !new_control.is_empty() {
        new_control.push(',');
    }
    new_control.push_str(&format!("i={}", id));
    build_sequence(&new_control, data)
}

fn file_transfer_control(params: &TransmitParams, head: &[u8], written: usize) -> String {
    let action = match params.action {
        Some(KittyAction::TransmitAndDisplay) => "T",
        _ => "t",
    };
    let mut control = format!("a={}", action);
    if let Some(f) = params.format {
        control.push_str(&format!(",f={}", f));
    }
    control.push_str(",t=f");
    let (mut width, mut height) = (params.width.unwrap_or(0), params.height.unwrap_or(0));
    if (width == 0 || height == 0) && !head.is_empty() {
        if let Some((w, h)) = sequences::png_dimensions(head) {
            width = w;
            height = h;
        }
    }
    if width > 0 {
        control.push_str(&format!(",s={}", width));
    }
    if height > 0 {
        control.push_str(&format!(",v={}", height));
    }
    if params.compressed {
        control.push_str(",o=z");
    }
    control.push_str(&format!(",S={}", written));
    if let Some(id) = params.image_id {
        control.push_str(&format!(",i={}", id));
    }
    if let Some(num) = params.image_number.filter(|&n| n > 0) {
        control.push_str(&format!(",I={}", num));
    }
    control
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as B64;

    fn relay_with(threshold: usize, stub_all: bool) -> TransmitRelay {
        let mut config = Config::default();
        config.kitty_offload_threshold = threshold;
        config.kitty_stub_all_formats = stub_all;
        TransmitRelay::new(1, &config)
    }

    fn seq(body: &str) -> Vec<u8> {
        let mut v = b"\x1b_G".to_vec();
        v.extend_from_slice(body.as_bytes());
        v.extend_from_slice(b"\x1b\\");
        v
    }

    fn tiny_png() -> Vec<u8> {
        let mut png = vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
        png.extend_from_slice(&13u32.to_be_bytes());
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&1u32.to_be_bytes());
        png.extend_from_slice(&1u32.to_be_bytes());
        png.extend_from_slice(&[8, 6, 0, 0, 0]);
        png
    }

    #[test]
    fn plain_text_passes_to_emulator_only() {
        let mut relay = relay_with(512 * 1024, false);
        let out = relay.process(b"hello\x1b[1mworld");
        assert_eq!(out.emu_sequence, b"hello\x1b[1mworld");
        assert!(out.forward_sequence.is_none());
    }

    #[test]
    fn png_transmit_is_forwarded_and_stubbed() {
        let mut relay = relay_with(512 * 1024, false);
        let payload = B64.encode(tiny_png());
        let input = seq(&format!("a=t,f=100,i=7;{}", payload));
        let out = relay.process(&input);

        assert_eq!(out.forward_sequence.as_deref(), Some(input.as_slice()));
        let emu = String::from_utf8(out.emu_sequence).unwrap();
        assert!(emu.contains("f=100"));
        assert!(emu.contains("s=1"));
        assert!(emu.contains("v=1"));
        assert!(emu.contains("i=7"));
        assert!(!emu.contains(&payload));
    }

    #[test]
    fn shared_memory_transmit_is_stubbed_without_key() {
        let mut relay = relay_with(512 * 1024, true);
        let input = seq("a=t,t=s,s=10,v=12,i=7;SHMKEY");
        let out = relay.process(&input);

        assert_eq!(out.forward_sequence.as_deref(), Some(input.as_slice()));
        let emu = String::from_utf8(out.emu_sequence).unwrap();
        assert!(emu.contains("f=100"));
        assert!(emu.contains("s=10"));
        assert!(emu.contains("v=12"));
        assert!(!emu.contains("t=s"));
        assert!(!emu.contains("SHMKEY"));
    }

    #[test]
    fn display_command_passes_untouched() {
        let mut relay = relay_with(512 * 1024, false);
        let input = seq("a=p,i=7,p=3");
        let out = relay.process(&input);
        assert_eq!(out.emu_sequence, input);
        assert!(out.forward_sequence.is_none());
    }

    #[test]
    fn targeted_delete_forwards_to_host() {
        let mut relay = relay_with(512 * 1024, false);
        let input = seq("a=d,d=I,i=7");
        let out = relay.process(&input);
        assert_eq!(out.emu_sequence, input);
        assert_eq!(out.forward_sequence.as_deref(), Some(input.as_slice()));

        let input = seq("a=d,d=a");
        let out = relay.process(&input);
        assert_eq!(out.emu_sequence, input);
        assert!(out.forward_sequence.is_none(), "untargeted delete stays local");
    }

    #[test]
    fn missing_id_gets_synthetic_injection() {
        let mut relay = relay_with(512 * 1024, false);
        let payload = B64.encode(tiny_png());
        let out = relay.process(&seq(&format!("a=t,f=100;{}", payload)));
        let forwarded = String::from_utf8(out.forward_sequence.unwrap()).unwrap();
        let expected = format!("i={}", sequences::SYNTHETIC_GUEST_ID_MAX);
        assert!(forwarded.contains(&expected), "synthetic id injected: {}", forwarded);
        // Next anonymous transmission gets the next id down.
        let out = relay.process(&seq(&format!("a=t,f=100;{}", payload)));
        let forwarded = String::from_utf8(out.forward_sequence.unwrap()).unwrap();
        assert!(forwarded.contains(&format!("i={}", sequences::SYNTHETIC_GUEST_ID_MAX - 1)));
    }

    #[test]
    fn stub_emitted_once_per_guest_key() {
        let mut relay = relay_with(512 * 1024, false);
        let payload = B64.encode(tiny_png());
        let input = seq(&format!("a=t,f=100,i=7;{}", payload));
        let first = relay.process(&input);
        assert!(!first.emu_sequence.is_empty());
        let second = relay.process(&input);
        assert!(second.emu_sequence.is_empty(), "same key, same dims: stub dropped");
        assert!(second.forward_sequence.is_some(), "host still gets the payload");
    }

    #[test]
    fn multichunk_interior_chunks_reach_host_not_emulator() {
        let mut relay = relay_with(0, false);
        let data = vec![7u8; 300];
        let encoded = B64.encode(&data);
        let (a, b) = encoded.split_at(encoded.len() / 2);

        let first = relay.process(&seq(&format!("a=t,f=24,s=10,v=10,m=1,i=4;{}", a)));
        assert!(first.emu_sequence.is_empty(), "interior chunk hidden from emulator");
        assert!(first.forward_sequence.is_some());

        let second = relay.process(&seq(&format!("m=0;{}", b)));
        assert!(second.forward_sequence.is_some());
        // f=24 raw RGB below stub rules: emulator sees the final chunk raw.
        assert!(!second.emu_sequence.is_empty());
    }

    #[test]
    fn forwarded_chunks_roundtrip_payload() {
        let mut relay = relay_with(0, false);
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let encoded = B64.encode(&data);
        let (a, b) = encoded.split_at(encoded.len() / 2);

        let mut forwarded = Vec::new();
        for (control, chunk) in [("a=t,f=24,s=10,v=25,m=1,i=9", a), ("m=0,i=9", b)] {
            let out = relay.process(&seq(&format!("{};{}", control, chunk)));
            if let Some(f) = out.forward_sequence {
                forwarded.extend_from_slice(&f);
            }
        }
        // Re-scan the forwarded bytes and collect the payloads.
        let mut scanner = SequenceScanner::new();
        let mut b64 = Vec::new();
        for item in scanner.scan(&forwarded) {
            if let ScanItem::Kitty { body, .. } = item {
                let (_, data) = split_control_data(&body);
                b64.extend_from_slice(data);
            }
        }
        assert_eq!(B64.decode(&b64).unwrap(), data);
    }

    #[test]
    fn below_threshold_multichunk_forwards_buffered_chunks_at_end() {
        let mut relay = relay_with(512 * 1024, false);
        let data = vec![9u8; 600];
        let encoded = B64.encode(&data);
        let (a, b) = encoded.split_at(encoded.len() / 2);

        let first = relay.process(&seq(&format!("a=t,f=24,s=10,v=20,m=1,i=2;{}", a)));
        assert!(first.forward_sequence.is_none(), "held until the offload decision");
        let second = relay.process(&seq(&format!("m=0,i=2;{}", b)));
        let forwarded = second.forward_sequence.expect("all chunks released");

        let mut scanner = SequenceScanner::new();
        let mut b64 = Vec::new();
        for item in scanner.scan(&forwarded) {
            if let ScanItem::Kitty { body, .. } = item {
                let (_, data) = split_control_data(&body);
                b64.extend_from_slice(data);
            }
        }
        assert_eq!(B64.decode(&b64).unwrap(), data);
    }

    #[test]
    fn large_direct_payload_is_offloaded_to_file() {
        let mut relay = relay_with(1024, false);
        let data = vec![42u8; 4096];
        let encoded = B64.encode(&data);
        let mid = encoded.len() / 2;

        let first = relay.process(&seq(&format!("a=t,f=24,s=32,v=32,m=1,i=5;{}", &encoded[..mid])));
        let second = relay.process(&seq(&format!("m=0,i=5;{}", &encoded[mid..])));
        // Nothing forwarded until the file transfer is complete.
        assert!(first.forward_sequence.is_none());
        let forwarded = second.forward_sequence.expect("file-transfer sequence");
        let text = String::from_utf8(forwarded.clone()).unwrap();
        assert!(text.contains("t=f"), "rewritten as file transfer: {}", text);
        assert!(text.contains("S=4096"));

        // The base64 payload decodes to the temp file path, whose contents
        // are byte-identical to the transmitted data.
        let mut scanner = SequenceScanner::new();
        let items = scanner.scan(&forwarded);
        let ScanItem::Kitty { body, .. } = &items[0] else { panic!("kitty seq") };
        let (_, path_b64) = split_control_data(body);
        let path = String::from_utf8(B64.decode(path_b64).unwrap()).unwrap();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, data);

        relay.abort();
        assert!(!std::path::Path::new(&path).exists(), "abort removes temp files");
    }

    #[test]
    fn abort_cleans_half_written_offload() {
        let mut relay = relay_with(64, false);
        let data = vec![1u8; 1024];
        let encoded = B64.encode(&data);
        let _ = relay.process(&seq(&format!("a=t,f=24,m=1,i=3;{}", encoded)));
        let path = relay
            .pending_chunk
            .as_ref()
            .and_then(|p| p.offload.as_ref())
            .map(|o| o.path.clone())
            .expect("offload started");
        relay.abort();
        assert!(relay.pending_chunk.is_none());
        assert!(!path.exists());
    }
}
