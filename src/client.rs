//! Control client: connects to a session's UNIX socket, sends one JSON
//! request per line and decodes the `ok`/`err` reply envelope.

use std::env;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::config;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot reach server: {0}")]
    Transport(#[from] io::Error),
    #[error("{message}")]
    Server { code: String, message: String },
    #[error("malformed reply: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl ClientError {
    /// CLI exit code for this failure: 1 bad args, 2 not found, 3
    /// transport/other.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Server { code, .. } if code == "bad_args" => 1,
            ClientError::Server { code, .. } if code == "not_found" => 2,
            _ => 3,
        }
    }
}

/// One request/reply round-trip against a session's control socket.
pub fn request(session: &str, payload: &Value) -> Result<Value, ClientError> {
    let path = config::control_socket_path(session);
    let mut stream = UnixStream::connect(&path)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    writeln!(stream, "{}", payload)?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let reply: Value = serde_json::from_str(line.trim())?;
    if let Some(err) = reply.get("err") {
        return Err(ClientError::Server {
            code: err.get("code").and_then(|c| c.as_str()).unwrap_or("internal").to_string(),
            message: err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown server error")
                .to_string(),
        });
    }
    Ok(reply.get("ok").cloned().unwrap_or(Value::Null))
}

/// Is a server for this session actually accepting connections?
pub fn server_alive(session: &str) -> bool {
    UnixStream::connect(config::control_socket_path(session)).is_ok()
}

/// Session to target when none is given: `OPENMUX_SESSION` (exported into
/// every pane) first, then the most recently active live socket.
pub fn default_session() -> Option<String> {
    if let Ok(name) = env::var("OPENMUX_SESSION") {
        if server_alive(&name) {
            return Some(name);
        }
    }
    let dir = config::control_socket_dir();
    let mut candidates: Vec<(String, std::time::SystemTime)> = Vec::new();
    for entry in std::fs::read_dir(&dir).ok()?.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "sock").unwrap_or(false) {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            if UnixStream::connect(&path).is_ok() {
                let mtime = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                candidates.push((name.to_string(), mtime));
            } else {
                // Stale socket from a dead server.
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    candidates.sort_by_key(|(_, t)| *t);
    candidates.pop().map(|(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_taxonomy() {
        let bad = ClientError::Server { code: "bad_args".into(), message: "x".into() };
        let missing = ClientError::Server { code: "not_found".into(), message: "x".into() };
        let transport = ClientError::Transport(io::Error::new(io::ErrorKind::Other, "gone"));
        assert_eq!(bad.exit_code(), 1);
        assert_eq!(missing.exit_code(), 2);
        assert_eq!(transport.exit_code(), 3);
    }
}
