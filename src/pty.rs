//! PTY fleet management: spawn, feed, resize, destroy. Each PTY owns a
//! reader thread that runs child output through the transmit relay and
//! into the emulator; the UI task only ever sees channel events.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};

use crate::config::Config;
use crate::emulator::{SharedEmulator, Vt100Emulator};
use crate::kitty_relay::TransmitRelay;
use crate::types::{PaneId, PtyId, SessionId};

/// Events marshalled from PTY worker threads onto the UI task.
pub enum PtyEvent {
    /// New output was processed into the emulator; a render is due.
    Output(PtyId),
    /// Kitty bytes the relay wants forwarded to the host.
    Forward(PtyId, Vec<u8>),
    /// The child exited (reader hit EOF). Always drives pane close.
    Exited(PtyId),
}

pub struct PtyHandle {
    pub id: PtyId,
    pub emulator: SharedEmulator,
    master: Box<dyn MasterPty>,
    child: Box<dyn portable_pty::Child + Send>,
    writer: Box<dyn Write + Send>,
    child_pid: Option<u32>,
    /// Cleared on destroy so the reader thread stops reporting.
    alive: Arc<AtomicBool>,
    rows: u16,
    cols: u16,
}

impl PtyHandle {
    /// Working directory of the child, for session cwd capture.
    pub fn current_cwd(&self) -> Option<PathBuf> {
        let pid = self.child_pid?;
        std::fs::read_link(format!("/proc/{}/cwd", pid)).ok()
    }

    pub fn write_input(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }
}

fn shell_command(cwd: Option<&PathBuf>, command: Option<&str>, session: Option<&str>) -> CommandBuilder {
    let shell = std::env::var("SHELL").ok().or_else(|| {
        which::which("bash")
            .or_else(|_| which::which("sh"))
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    });
    let mut builder = match (command, shell) {
        (Some(cmd), Some(shell)) => {
            let mut b = CommandBuilder::new(shell);
            b.args(["-c", cmd]);
            b
        }
        (Some(cmd), None) => CommandBuilder::new(cmd),
        (None, Some(shell)) => CommandBuilder::new(shell),
        (None, None) => CommandBuilder::new("sh"),
    };
    builder.env("TERM", "xterm-256color");
    builder.env("COLORTERM", "truecolor");
    builder.env("OPENMUX", "1");
    if let Some(session) = session {
        builder.env("OPENMUX_SESSION", session);
    }
    if let Some(dir) = cwd {
        builder.cwd(dir);
    }
    builder
}

pub struct PtyManager {
    ptys: HashMap<PtyId, PtyHandle>,
    next_pty_id: PtyId,
    pty_to_pane: HashMap<PtyId, PaneId>,
    pane_to_pty: HashMap<PaneId, PtyId>,
    /// Suspended bindings of inactive sessions, kept so a switch back can
    /// re-attach without respawning.
    session_pty_map: HashMap<SessionId, HashMap<PaneId, PtyId>>,
    pty_to_session: HashMap<PtyId, (SessionId, PaneId)>,
    event_tx: mpsc::Sender<PtyEvent>,
    config: Config,
    /// Host cell metrics, for the pixel sizes handed to children.
    cell_pixel: Option<(u16, u16)>,
    /// Exported into children as OPENMUX_SESSION for the control client.
    session_name: Option<String>,
}

impl PtyManager {
    pub fn new(event_tx: mpsc::Sender<PtyEvent>, config: Config) -> Self {
        PtyManager {
            ptys: HashMap::new(),
            next_pty_id: 1,
            pty_to_pane: HashMap::new(),
            pane_to_pty: HashMap::new(),
            session_pty_map: HashMap::new(),
            pty_to_session: HashMap::new(),
            event_tx,
            config,
            cell_pixel: None,
            session_name: None,
        }
    }

    pub fn set_session(&mut self, name: &str) {
        self.session_name = Some(name.to_string());
    }

    pub fn set_cell_pixel(&mut self, width: u16, height: u16) {
        if width > 0 && height > 0 {
            self.cell_pixel = Some((width, height));
        }
    }

    fn pty_size(&self, rows: u16, cols: u16) -> PtySize {
        let (pw, ph) = self.cell_pixel.unwrap_or((0, 0));
        PtySize {
            rows,
            cols,
            pixel_width: cols.saturating_mul(pw),
            pixel_height: rows.saturating_mul(ph),
        }
    }

    /// Spawn a PTY and bind it to `pane`. The exit path is armed before
    /// any content flows: the reader thread reports EOF on the same
    /// channel the output events use, so an exit can never be missed.
    pub fn spawn(
        &mut self,
        pane: PaneId,
        rows: u16,
        cols: u16,
        cwd: Option<PathBuf>,
        command: Option<&str>,
    ) -> io::Result<PtyId> {
        let pty_system = native_pty_system();
        let size = self.pty_size(rows.max(1), cols.max(1));
        let pair = pty_system
            .openpty(size)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("openpty error: {e}")))?;
        let cmd = shell_command(cwd.as_ref(), command, self.session_name.as_deref());
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("spawn shell error: {e}")))?;
        // The child must own the sole slave reference.
        drop(pair.slave);

        let id = self.next_pty_id;
        self.next_pty_id += 1;

        let emulator: Arc<Mutex<Vt100Emulator>> = Arc::new(Mutex::new(Vt100Emulator::new(
            size.rows,
            size.cols,
            self.config.history_limit,
        )));
        let shared: SharedEmulator = emulator.clone();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("writer error: {e}")))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("clone reader error: {e}")))?;

        let alive = Arc::new(AtomicBool::new(true));
        let thread_alive = alive.clone();
        let thread_emulator = shared.clone();
        let tx = self.event_tx.clone();
        let mut relay = TransmitRelay::new(id, &self.config);
        thread::spawn(move || {
            let mut buf = [0u8; 65536];
            loop {
                match reader.read(&mut buf) {
                    Ok(n) if n > 0 => {
                        let out = relay.process(&buf[..n]);
                        if !out.emu_sequence.is_empty() {
                            if let Ok(mut emu) = thread_emulator.lock() {
                                emu.process(&out.emu_sequence);
                            }
                        }
                        if let Some(forward) = out.forward_sequence {
                            let _ = tx.send(PtyEvent::Forward(id, forward));
                        }
                        relay.sweep_cleanup();
                        if thread_alive.load(Ordering::Acquire) {
                            let _ = tx.send(PtyEvent::Output(id));
                        }
                    }
                    Ok(_) => thread::sleep(Duration::from_millis(5)),
                    Err(_) => break,
                }
            }
            if thread_alive.load(Ordering::Acquire) {
                let _ = tx.send(PtyEvent::Exited(id));
            }
        });

        let child_pid = child.process_id();
        self.ptys.insert(
            id,
            PtyHandle {
                id,
                emulator: shared,
                master: pair.master,
                child,
                writer,
                child_pid,
                alive,
                rows: size.rows,
                cols: size.cols,
            },
        );
        self.pty_to_pane.insert(id, pane);
        self.pane_to_pty.insert(pane, id);
        Ok(id)
    }

    pub fn get(&self, pty: PtyId) -> Option<&PtyHandle> {
        self.ptys.get(&pty)
    }

    pub fn emulator(&self, pty: PtyId) -> Option<SharedEmulator> {
        self.ptys.get(&pty).map(|h| h.emulator.clone())
    }

    pub fn pane_of(&self, pty: PtyId) -> Option<PaneId> {
        self.pty_to_pane.get(&pty).copied()
    }

    pub fn pty_of(&self, pane: PaneId) -> Option<PtyId> {
        self.pane_to_pty.get(&pane).copied()
    }

    pub fn write_input(&mut self, pty: PtyId, bytes: &[u8]) -> io::Result<()> {
        match self.ptys.get_mut(&pty) {
            Some(handle) => handle.write_input(bytes),
            None => Ok(()),
        }
    }

    pub fn resize(&mut self, pty: PtyId, rows: u16, cols: u16) {
        let size = self.pty_size(rows.max(1), cols.max(1));
        let Some(handle) = self.ptys.get_mut(&pty) else { return };
        if handle.rows == size.rows && handle.cols == size.cols {
            return;
        }
        handle.rows = size.rows;
        handle.cols = size.cols;
        let _ = handle.master.resize(size);
        if let Ok(mut emu) = handle.emulator.lock() {
            emu.resize(size.rows, size.cols);
        }
    }

    pub fn cwd(&self, pty: PtyId) -> Option<PathBuf> {
        self.ptys.get(&pty).and_then(|h| h.current_cwd())
    }

    /// Map of pane → cwd for every live binding, captured at save time.
    pub fn capture_cwds(&self) -> HashMap<PaneId, PathBuf> {
        let mut out = HashMap::new();
        for (&pane, &pty) in &self.pane_to_pty {
            if let Some(cwd) = self.cwd(pty) {
                out.insert(pane, cwd);
            }
        }
        out
    }

    /// Kill the child but keep the handle: the reader thread's EOF turns
    /// into the exit event, which is what drives the pane close.
    pub fn kill_child(&mut self, pty: PtyId) {
        if let Some(handle) = self.ptys.get_mut(&pty) {
            let _ = handle.child.kill();
        }
    }

    /// Hard teardown: kill the child, dispose the emulator, drop maps.
    /// Callers clear visibility counts first so no gate write races this.
    pub fn destroy(&mut self, pty: PtyId) {
        if let Some(mut handle) = self.ptys.remove(&pty) {
            handle.alive.store(false, Ordering::Release);
            let _ = handle.child.kill();
            if let Ok(mut emu) = handle.emulator.lock() {
                emu.dispose();
            }
        }
        self.unbind(pty);
        self.pty_to_session.remove(&pty);
    }

    /// Exit path: the session is already gone, never re-kill; just clear
    /// the caches and report which pane closes.
    pub fn handle_exit(&mut self, pty: PtyId) -> Option<PaneId> {
        let pane = self.pty_to_pane.get(&pty).copied();
        if let Some(handle) = self.ptys.remove(&pty) {
            handle.alive.store(false, Ordering::Release);
            if let Ok(mut emu) = handle.emulator.lock() {
                emu.dispose();
            }
        }
        self.unbind(pty);
        self.pty_to_session.remove(&pty);
        pane
    }

    fn unbind(&mut self, pty: PtyId) {
        if let Some(pane) = self.pty_to_pane.remove(&pty) {
            self.pane_to_pty.remove(&pane);
        }
    }

    /// Suspend the active session's bindings: PTYs stay alive but detach
    /// from the pane maps, keyed for re-attachment.
    pub fn suspend_session(&mut self, session: &SessionId) {
        let mut bindings = HashMap::new();
        for (pane, pty) in self.pane_to_pty.drain() {
            bindings.insert(pane, pty);
            self.pty_to_session.insert(pty, (session.clone(), pane));
        }
        self.pty_to_pane.clear();
        self.session_pty_map.insert(session.clone(), bindings);
    }

    /// Re-attach a previously suspended session. Returns the restored
    /// pane → pty bindings (panes keep their ids across save/load).
    /// Bindings whose PTY died while suspended are restored too; the app
    /// discovers the missing emulator on mount and closes the pane.
    pub fn resume_session(&mut self, session: &SessionId) -> HashMap<PaneId, PtyId> {
        let bindings = self.session_pty_map.remove(session).unwrap_or_default();
        for (&pane, &pty) in &bindings {
            self.pane_to_pty.insert(pane, pty);
            self.pty_to_pane.insert(pty, pane);
            self.pty_to_session.remove(&pty);
        }
        bindings
    }

    /// Destroy every PTY still parked under a session (session delete).
    pub fn destroy_session_ptys(&mut self, session: &SessionId) {
        if let Some(bindings) = self.session_pty_map.remove(session) {
            for (_, pty) in bindings {
                self.destroy(pty);
            }
        }
    }

    pub fn live_ptys(&self) -> Vec<PtyId> {
        self.ptys.keys().copied().collect()
    }

    pub fn shutdown(&mut self) {
        let ids: Vec<PtyId> = self.ptys.keys().copied().collect();
        for id in ids {
            self.destroy(id);
        }
    }
}
