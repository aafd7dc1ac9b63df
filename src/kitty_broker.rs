//! Per-host Kitty transmit broker: the single sink through which every
//! graphics byte reaches the host TTY, and the owner of the guest→host
//! image-id mapping. One broker per process; there is only one host
//! terminal.
//!
//! Forwarded transmissions are rewritten on the way out: the guest's
//! image id becomes a process-unique host id so two PTYs picking the same
//! id can never collide in the host's image cache.

use std::collections::{HashMap, VecDeque};
use std::io;

use crate::config::Config;
use crate::kitty_relay::TransmitRelay;
use crate::sequences::{
    KittyAction, ScanItem, SequenceScanner, TransmitParams, build_sequence, split_control_data,
};
use crate::types::{ImageIdentity, KittyImageInfo, PtyId};

pub type HostWriter = Box<dyn FnMut(&[u8]) -> io::Result<()> + Send>;

struct BrokerEntry {
    host_id: u32,
    /// Bound on the first `resolve_host_id` call for the mapping. A fresh
    /// transmit for the same guest id resets it: the host image is
    /// immutable per id, so replacement means a new host id.
    identity: Option<ImageIdentity>,
}

pub struct TransmitBroker {
    /// `(pty, guest id)` → host mapping. The first pane to transmit wins
    /// the host id; later attachments of the same PTY reuse it.
    mappings: HashMap<(PtyId, u32), BrokerEntry>,
    next_host_id: u32,
    writer: Option<HostWriter>,
    /// Writes queued while no writer is installed or while the host
    /// applies backpressure. Entries are whole sequences, so one PTY's
    /// transmit is never split by another's.
    pending: VecDeque<(PtyId, Vec<u8>)>,
    /// Chunked transmissions in flight: bytes stage here until the m=0
    /// chunk closes them, keeping the transmit one atomic queue entry.
    staging: HashMap<PtyId, Vec<u8>>,
    open_transmits: std::collections::HashSet<PtyId>,
    /// Relay for sequences written directly to the broker, bypassing a
    /// PTY's own relay (testing/harness path). Shares the offload knobs.
    direct_relays: HashMap<PtyId, TransmitRelay>,
    config: Config,
}

impl TransmitBroker {
    pub fn new(config: Config) -> Self {
        TransmitBroker {
            mappings: HashMap::new(),
            next_host_id: 1,
            writer: None,
            pending: VecDeque::new(),
            staging: HashMap::new(),
            open_transmits: std::collections::HashSet::new(),
            direct_relays: HashMap::new(),
            config,
        }
    }

    /// Install the single host sink. At most one writer exists per
    /// process; installing a new one replaces the old.
    pub fn set_writer(&mut self, writer: HostWriter) {
        self.writer = Some(writer);
    }

    pub fn has_writer(&self) -> bool {
        self.writer.is_some()
    }

    /// Host id for an already-known image. The first call for a mapping
    /// binds the image's identity 6-tuple; equal tuples always resolve to
    /// equal host ids, a differing tuple means the mapping is stale.
    pub fn resolve_host_id(&mut self, pty: PtyId, info: &KittyImageInfo) -> Option<u32> {
        let entry = self.mappings.get_mut(&(pty, info.id))?;
        match entry.identity {
            None => {
                entry.identity = Some(info.identity());
                Some(entry.host_id)
            }
            Some(identity) if identity == info.identity() => Some(entry.host_id),
            Some(_) => None,
        }
    }

    /// Allocate a mapping on the renderer's behalf (images that never
    /// travelled through the relay, e.g. harness-injected ones).
    pub fn assign_host_id(&mut self, pty: PtyId, info: &KittyImageInfo) -> u32 {
        if let Some(id) = self.resolve_host_id(pty, info) {
            return id;
        }
        let id = self.fresh_host_id();
        self.mappings.insert(
            (pty, info.id),
            BrokerEntry { host_id: id, identity: Some(info.identity()) },
        );
        id
    }

    fn fresh_host_id(&mut self) -> u32 {
        let id = self.next_host_id;
        self.next_host_id += 1;
        id
    }

    /// Forget an image after the graphics renderer deleted it; the next
    /// reappearance allocates a fresh host id.
    pub fn drop_mapping(&mut self, pty: PtyId, info: &KittyImageInfo) {
        self.mappings.remove(&(pty, info.id));
    }

    /// On PTY destruction: drop every mapping and abort any half-written
    /// direct-path offload.
    pub fn clear_pty(&mut self, pty: PtyId) {
        self.mappings.retain(|&(p, _), _| p != pty);
        if let Some(mut relay) = self.direct_relays.remove(&pty) {
            relay.abort();
        }
        self.pending.retain(|(p, _)| *p != pty);
        self.staging.remove(&pty);
        self.open_transmits.remove(&pty);
    }

    /// Queue relay output for the host, remapping guest image ids to host
    /// ids on the way. Per-PTY order is preserved, and a chunked transmit
    /// stays one atomic entry: bytes stage until its m=0 chunk lands.
    pub fn send(&mut self, pty: PtyId, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let (rewritten, open) = self.remap_ids(pty, &bytes);
        let staged = self.staging.entry(pty).or_default();
        staged.extend_from_slice(&rewritten);
        if open {
            return;
        }
        let batch = std::mem::take(staged);
        self.staging.remove(&pty);
        self.pending.push_back((pty, batch));
        self.flush_pending(None);
    }

    /// Queue bytes that already carry host ids (renderer-assembled
    /// commands).
    pub fn send_host(&mut self, pty: PtyId, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.pending.push_back((pty, bytes));
        self.flush_pending(None);
    }

    /// Rewrite guest ids to host ids across one batch, tracking whether a
    /// chunked transmission is left open at the end. While a transmit is
    /// open, repeated `a=t` keys on continuation chunks do not roll the
    /// mapping.
    fn remap_ids(&mut self, pty: PtyId, bytes: &[u8]) -> (Vec<u8>, bool) {
        let mut open = self.open_transmits.contains(&pty);
        let mut scanner = SequenceScanner::new();
        let mut out = Vec::with_capacity(bytes.len());
        for item in scanner.scan(bytes) {
            match item {
                ScanItem::Text(t) => out.extend_from_slice(&t),
                ScanItem::Kitty { body, raw } => {
                    let (control, data) = split_control_data(&body);
                    let Some(params) = TransmitParams::parse(control) else {
                        out.extend_from_slice(&raw);
                        continue;
                    };
                    let is_transmit = matches!(
                        params.action,
                        Some(KittyAction::Transmit) | Some(KittyAction::TransmitAndDisplay)
                    );
                    let host = match params.image_id.filter(|&i| i > 0) {
                        Some(guest) if is_transmit && !open => {
                            // A fresh transmit replaces the host image, so
                            // a previously bound mapping rolls to a new id.
                            let fresh = self.fresh_host_id();
                            let entry = self
                                .mappings
                                .entry((pty, guest))
                                .or_insert(BrokerEntry { host_id: fresh, identity: None });
                            if entry.identity.is_some() {
                                entry.host_id = fresh;
                                entry.identity = None;
                            }
                            Some((guest, entry.host_id))
                        }
                        Some(guest) => {
                            self.mappings.get(&(pty, guest)).map(|e| (guest, e.host_id))
                        }
                        None => None,
                    };
                    if is_transmit || params.more.is_some() {
                        open = params.more == Some(true);
                    }
                    match host {
                        Some((guest, host)) => {
                            out.extend_from_slice(&rewrite_image_id(control, data, guest, host))
                        }
                        None => out.extend_from_slice(&raw),
                    }
                }
            }
        }
        if open {
            self.open_transmits.insert(pty);
        } else {
            self.open_transmits.remove(&pty);
        }
        (out, open)
    }

    /// Direct write path bypassing a PTY's relay: the sequence still goes
    /// through relay rewriting (offload, id injection) before the host.
    pub fn handle_sequence(&mut self, pty: PtyId, seq: &[u8]) {
        let config = self.config.clone();
        let relay = self
            .direct_relays
            .entry(pty)
            .or_insert_with(|| TransmitRelay::new(pty, &config));
        let out = relay.process(seq);
        if let Some(forward) = out.forward_sequence {
            self.send(pty, forward);
        }
    }

    /// Drain queued writes. With `sink`, bytes are appended there so the
    /// caller can coalesce them with its own output (the renderer's flush
    /// path); otherwise the installed writer is used.
    pub fn flush_pending(&mut self, mut sink: Option<&mut Vec<u8>>) {
        if let Some(sink) = sink.as_deref_mut() {
            while let Some((_, bytes)) = self.pending.pop_front() {
                sink.extend_from_slice(&bytes);
            }
            return;
        }
        let Some(writer) = self.writer.as_mut() else {
            // No writer installed: keep queueing. Rendering for this scope
            // is a no-op until one appears.
            return;
        };
        while let Some((pty, bytes)) = self.pending.pop_front() {
            match writer(&bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Host backpressure: requeue and retry next frame.
                    log::debug!("host write backpressure, requeueing {} bytes", bytes.len());
                    self.pending.push_front((pty, bytes));
                    return;
                }
                Err(e) => {
                    log::debug!("host write failed, dropping sequence: {}", e);
                }
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Rebuild a control payload with `i=<guest>` replaced by `i=<host>`.
fn rewrite_image_id(control: &[u8], data: &[u8], guest: u32, host: u32) -> Vec<u8> {
    let control = String::from_utf8_lossy(control);
    let rewritten: Vec<String> = control
        .split(',')
        .map(|pair| {
            if pair.strip_prefix("i=").and_then(|v| v.parse::<u32>().ok()) == Some(guest) {
                format!("i={}", host)
            } else {
                pair.to_string()
            }
        })
        .collect();
    build_sequence(&rewritten.join(","), data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Compression, ImageFormat};
    use std::sync::{Arc, Mutex};

    fn info(guest_id: u32, transmit_time: u64) -> KittyImageInfo {
        KittyImageInfo {
            id: guest_id,
            number: 0,
            width: 4,
            height: 4,
            data_length: 64,
            format: ImageFormat::Png,
            compression: Compression::None,
            implicit_id: false,
            transmit_time,
        }
    }

    fn capture_writer() -> (HostWriter, Arc<Mutex<Vec<u8>>>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let writer: HostWriter = Box::new(move |bytes: &[u8]| {
            sink.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        });
        (writer, captured)
    }

    #[test]
    fn equal_identities_resolve_equal_host_ids() {
        let mut broker = TransmitBroker::new(Config::default());
        let a = broker.assign_host_id(1, &info(7, 10));
        let b = broker.assign_host_id(1, &info(7, 10));
        assert_eq!(a, b);
        assert_eq!(broker.resolve_host_id(1, &info(7, 10)), Some(a));
    }

    #[test]
    fn changed_identity_makes_mapping_stale() {
        let mut broker = TransmitBroker::new(Config::default());
        let a = broker.assign_host_id(1, &info(7, 10));
        // Same guest id, different transmit: the old mapping no longer
        // answers for the new content.
        assert_eq!(broker.resolve_host_id(1, &info(7, 99)), None);
        assert_eq!(broker.resolve_host_id(1, &info(7, 10)), Some(a));
    }

    #[test]
    fn per_pty_mappings_are_independent() {
        let mut broker = TransmitBroker::new(Config::default());
        let a = broker.assign_host_id(1, &info(7, 10));
        let b = broker.assign_host_id(2, &info(7, 10));
        assert_ne!(a, b);
    }

    #[test]
    fn drop_mapping_forces_reallocation() {
        let mut broker = TransmitBroker::new(Config::default());
        let a = broker.assign_host_id(1, &info(7, 10));
        broker.drop_mapping(1, &info(7, 10));
        assert_eq!(broker.resolve_host_id(1, &info(7, 10)), None);
        let b = broker.assign_host_id(1, &info(7, 10));
        assert_ne!(a, b);
    }

    #[test]
    fn forwarded_transmit_gets_host_id_rewrite() {
        let mut broker = TransmitBroker::new(Config::default());
        let (writer, captured) = capture_writer();
        broker.set_writer(writer);
        broker.send(1, b"\x1b_Ga=t,f=100,i=7;QUJD\x1b\\".to_vec());
        let sent = String::from_utf8(captured.lock().unwrap().clone()).unwrap();
        assert!(sent.contains("i=1"), "guest id 7 remapped to host id 1: {}", sent);
        assert!(!sent.contains("i=7"));
        // The renderer resolves the same mapping by guest id.
        assert_eq!(broker.resolve_host_id(1, &info(7, 10)), Some(1));
    }

    #[test]
    fn two_ptys_with_same_guest_id_do_not_collide() {
        let mut broker = TransmitBroker::new(Config::default());
        let (writer, captured) = capture_writer();
        broker.set_writer(writer);
        broker.send(1, b"\x1b_Ga=t,f=100,i=7;QUJD\x1b\\".to_vec());
        broker.send(2, b"\x1b_Ga=t,f=100,i=7;QUJD\x1b\\".to_vec());
        let sent = String::from_utf8(captured.lock().unwrap().clone()).unwrap();
        assert!(sent.contains("i=1"));
        assert!(sent.contains("i=2"));
    }

    #[test]
    fn writes_queue_until_writer_installed() {
        let mut broker = TransmitBroker::new(Config::default());
        broker.send(1, b"\x1b_Ga=t,i=1;AAAA\x1b\\".to_vec());
        assert_eq!(broker.pending_len(), 1);
        let (writer, captured) = capture_writer();
        broker.set_writer(writer);
        broker.flush_pending(None);
        assert_eq!(broker.pending_len(), 0);
        assert!(!captured.lock().unwrap().is_empty());
    }

    #[test]
    fn flush_into_sink_coalesces_with_caller_output() {
        let mut broker = TransmitBroker::new(Config::default());
        broker.send_host(1, b"one".to_vec());
        broker.send_host(2, b"two".to_vec());
        let mut sink = b"prefix:".to_vec();
        broker.flush_pending(Some(&mut sink));
        assert_eq!(sink, b"prefix:onetwo");
        assert_eq!(broker.pending_len(), 0);
    }

    #[test]
    fn backpressure_requeues_in_order() {
        let mut broker = TransmitBroker::new(Config::default());
        let attempts = Arc::new(Mutex::new(0usize));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let (a, c) = (attempts.clone(), captured.clone());
        broker.set_writer(Box::new(move |bytes: &[u8]| {
            let mut n = a.lock().unwrap();
            *n += 1;
            if *n == 1 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "full"));
            }
            c.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }));
        broker.send_host(1, b"first".to_vec());
        assert_eq!(broker.pending_len(), 1, "blocked write stays queued");
        broker.send_host(1, b"second".to_vec());
        broker.flush_pending(None);
        assert_eq!(captured.lock().unwrap().as_slice(), b"firstsecond");
    }

    #[test]
    fn clear_pty_drops_mappings_and_queue() {
        let mut broker = TransmitBroker::new(Config::default());
        broker.assign_host_id(1, &info(7, 10));
        broker.assign_host_id(2, &info(7, 10));
        broker.send_host(1, b"queued".to_vec());
        broker.clear_pty(1);
        assert_eq!(broker.resolve_host_id(1, &info(7, 10)), None);
        assert!(broker.resolve_host_id(2, &info(7, 10)).is_some());
        assert_eq!(broker.pending_len(), 0);
    }

    #[test]
    fn chunked_transmit_stays_one_atomic_batch() {
        let mut broker = TransmitBroker::new(Config::default());
        // First chunk (m=1) of pty 1 stages; pty 2's write may not split it.
        broker.send(1, b"\x1b_Ga=t,f=24,s=2,v=2,m=1,i=7;AAAA\x1b\\".to_vec());
        assert_eq!(broker.pending_len(), 0, "open transmit stays staged");
        broker.send(2, b"\x1b_Ga=t,f=100,i=3;QUJD\x1b\\".to_vec());
        broker.send(1, b"\x1b_Gm=0,i=7;BBBB\x1b\\".to_vec());

        let mut sink = Vec::new();
        broker.flush_pending(Some(&mut sink));
        let text = String::from_utf8_lossy(&sink);
        // pty 1's two chunks are adjacent despite pty 2 writing between.
        let first_chunk = text.find("m=1").unwrap();
        let closing_chunk = text.find("m=0").unwrap();
        let other = text.find("f=100").unwrap();
        assert!(
            other < first_chunk || other > closing_chunk,
            "interleaved transmit: {}",
            text
        );
    }

    #[test]
    fn handle_sequence_relays_direct_writes() {
        let mut broker = TransmitBroker::new(Config::default());
        let (writer, captured) = capture_writer();
        broker.set_writer(writer);
        broker.handle_sequence(3, b"\x1b_Ga=t,f=100,i=2;QUJD\x1b\\");
        let sent = captured.lock().unwrap();
        assert!(!sent.is_empty());
        let text = String::from_utf8_lossy(&sent);
        assert!(text.contains("a=t"));
    }
}
