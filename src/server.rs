//! Control-socket server: a UNIX domain socket per session speaking a
//! line-oriented JSON protocol. Connections are handled on the accept
//! thread; every request is marshalled to the UI task and answered from
//! its response channel.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use crate::cli::parse_selector;
use crate::config;
use crate::types::{ControlRequest, SplitDirection};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ControlServer {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl ControlServer {
    /// Bind the session's socket and start the accept loop. A stale
    /// socket file from a dead server is replaced.
    pub fn start(session: &str, tx: mpsc::Sender<ControlRequest>) -> io::Result<ControlServer> {
        let dir = config::control_socket_dir();
        std::fs::create_dir_all(&dir)?;
        let path = config::control_socket_path(session);
        if path.exists() {
            if UnixStream::connect(&path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("session '{}' already has a live server", session),
                ));
            }
            let _ = std::fs::remove_file(&path);
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        thread::spawn(move || {
            loop {
                if thread_shutdown.load(Ordering::Acquire) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        let tx = tx.clone();
                        thread::spawn(move || handle_connection(stream, tx));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(_) => break,
                }
            }
        });
        Ok(ControlServer { path, shutdown })
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = std::fs::remove_file(&self.path);
    }
}

fn handle_connection(stream: UnixStream, tx: mpsc::Sender<ControlRequest>) {
    let Ok(read_half) = stream.try_clone() else { return };
    let mut reader = BufReader::new(read_half);
    let mut writer = stream;
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => break,
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Value>(trimmed) {
            Ok(request) => dispatch(&request, &tx),
            Err(e) => err_reply("bad_args", &format!("invalid request: {}", e)),
        };
        if writeln!(writer, "{}", reply).is_err() {
            break;
        }
        let _ = writer.flush();
    }
}

fn err_reply(code: &str, message: &str) -> Value {
    json!({ "err": { "code": code, "message": message } })
}

fn ok_reply(value: Value) -> Value {
    json!({ "ok": value })
}

/// Map an app-side error string onto the wire error codes.
fn app_error(message: String) -> Value {
    let code = if message == "not_found" || message.contains("not found") {
        "not_found"
    } else if message.contains("already exists") {
        "bad_args"
    } else {
        "internal"
    };
    err_reply(code, &message)
}

fn parse_direction(value: Option<&Value>) -> Option<SplitDirection> {
    match value.and_then(|v| v.as_str()) {
        Some("vertical") => Some(SplitDirection::Vertical),
        Some("horizontal") => Some(SplitDirection::Horizontal),
        _ => None,
    }
}

fn dispatch(request: &Value, tx: &mpsc::Sender<ControlRequest>) -> Value {
    let cmd = request.get("cmd").and_then(|c| c.as_str()).unwrap_or("");
    match cmd {
        "version" => ok_reply(json!(config::reported_version())),
        "session-list" => {
            let (rtx, rrx) = mpsc::channel();
            if tx.send(ControlRequest::SessionList(rtx)).is_err() {
                return err_reply("internal", "server shutting down");
            }
            match rrx.recv_timeout(REPLY_TIMEOUT) {
                Ok(listing) => {
                    ok_reply(serde_json::from_str(&listing).unwrap_or(Value::Null))
                }
                Err(_) => err_reply("internal", "no reply from server"),
            }
        }
        "session-create" | "session-delete" | "session-switch" => {
            let Some(name) = request.get("name").and_then(|n| n.as_str()) else {
                return err_reply("bad_args", "missing session name");
            };
            let (rtx, rrx) = mpsc::channel();
            let req = match cmd {
                "session-create" => ControlRequest::SessionCreate(name.to_string(), rtx),
                "session-switch" => ControlRequest::SessionSwitch(name.to_string(), rtx),
                _ => ControlRequest::SessionDelete(name.to_string(), rtx),
            };
            if tx.send(req).is_err() {
                return err_reply("internal", "server shutting down");
            }
            match rrx.recv_timeout(REPLY_TIMEOUT) {
                Ok(Ok(())) => ok_reply(Value::Null),
                Ok(Err(message)) => app_error(message),
                Err(_) => err_reply("internal", "no reply from server"),
            }
        }
        "session-rename" => {
            let from = request.get("from").and_then(|n| n.as_str());
            let to = request.get("to").and_then(|n| n.as_str());
            let (Some(from), Some(to)) = (from, to) else {
                return err_reply("bad_args", "rename needs from and to");
            };
            let (rtx, rrx) = mpsc::channel();
            if tx
                .send(ControlRequest::SessionRename(from.to_string(), to.to_string(), rtx))
                .is_err()
            {
                return err_reply("internal", "server shutting down");
            }
            match rrx.recv_timeout(REPLY_TIMEOUT) {
                Ok(Ok(())) => ok_reply(Value::Null),
                Ok(Err(message)) => app_error(message),
                Err(_) => err_reply("internal", "no reply from server"),
            }
        }
        "pane-split" => {
            let Some(direction) = parse_direction(request.get("direction")) else {
                return err_reply("bad_args", "direction must be vertical or horizontal");
            };
            let selector = match request.get("pane").and_then(|p| p.as_str()) {
                Some(raw) => match parse_selector(raw) {
                    Some(sel) => Some(sel),
                    None => return err_reply("bad_args", "unrecognised pane selector"),
                },
                None => None,
            };
            let workspace = request.get("workspace").and_then(|w| w.as_u64()).map(|w| w as u32);
            let (rtx, rrx) = mpsc::channel();
            if tx
                .send(ControlRequest::PaneSplit { direction, workspace, selector, resp: rtx })
                .is_err()
            {
                return err_reply("internal", "server shutting down");
            }
            match rrx.recv_timeout(REPLY_TIMEOUT) {
                Ok(Ok(pane)) => ok_reply(json!({ "pane": pane.to_string() })),
                Ok(Err(message)) => app_error(message),
                Err(_) => err_reply("internal", "no reply from server"),
            }
        }
        "pane-send" => {
            let Some(text) = request.get("text").and_then(|t| t.as_str()) else {
                return err_reply("bad_args", "missing text");
            };
            let selector = match request.get("pane").and_then(|p| p.as_str()) {
                Some(raw) => match parse_selector(raw) {
                    Some(sel) => Some(sel),
                    None => return err_reply("bad_args", "unrecognised pane selector"),
                },
                None => None,
            };
            let (rtx, rrx) = mpsc::channel();
            if tx
                .send(ControlRequest::PaneSend { text: text.to_string(), selector, resp: rtx })
                .is_err()
            {
                return err_reply("internal", "server shutting down");
            }
            match rrx.recv_timeout(REPLY_TIMEOUT) {
                Ok(Ok(())) => ok_reply(Value::Null),
                Ok(Err(message)) => app_error(message),
                Err(_) => err_reply("internal", "no reply from server"),
            }
        }
        "pane-capture" => {
            let lines = request.get("lines").and_then(|l| l.as_u64()).map(|l| l as usize);
            let raw = request.get("raw").and_then(|r| r.as_bool()).unwrap_or(false);
            let selector = match request.get("pane").and_then(|p| p.as_str()) {
                Some(raw_sel) => match parse_selector(raw_sel) {
                    Some(sel) => Some(sel),
                    None => return err_reply("bad_args", "unrecognised pane selector"),
                },
                None => None,
            };
            let (rtx, rrx) = mpsc::channel();
            if tx
                .send(ControlRequest::PaneCapture { lines, raw, selector, resp: rtx })
                .is_err()
            {
                return err_reply("internal", "server shutting down");
            }
            match rrx.recv_timeout(REPLY_TIMEOUT) {
                Ok(Ok(text)) => ok_reply(json!(text)),
                Ok(Err(message)) => app_error(message),
                Err(_) => err_reply("internal", "no reply from server"),
            }
        }
        "detach" => {
            if tx.send(ControlRequest::Detach).is_err() {
                return err_reply("internal", "server shutting down");
            }
            ok_reply(Value::Null)
        }
        other => err_reply("bad_args", &format!("unknown command: {}", other)),
    }
}
