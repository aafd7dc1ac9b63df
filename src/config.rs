use std::env;
use std::path::PathBuf;

/// Runtime configuration, read once at startup from the `OPENMUX_*`
/// environment and threaded through explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fraction of the viewport the main pane takes (per mille).
    pub main_ratio_permille: u16,
    /// Scrollback rows retained per PTY.
    pub history_limit: usize,
    /// Direct Kitty payloads at or above this many decoded bytes are
    /// offloaded to temp files. 0 disables offloading.
    pub kitty_offload_threshold: usize,
    /// Delay before offload temp files are deleted.
    pub kitty_offload_cleanup_ms: u64,
    /// Stub every transmission format for the in-process emulator, not just
    /// PNG and shared memory.
    pub kitty_stub_all_formats: bool,
    /// Emit `q=2` on outgoing Kitty commands (quiet all host responses).
    pub kitty_quiet: bool,
    /// Prefetch window in rows around a missing scrollback range.
    pub prefetch_window: usize,
    pub sessions_dir: PathBuf,
}

pub const DEFAULT_OFFLOAD_THRESHOLD: usize = 512 * 1024;
pub const DEFAULT_OFFLOAD_CLEANUP_MS: u64 = 5000;
pub const DEFAULT_PREFETCH_WINDOW: usize = 32;

impl Default for Config {
    fn default() -> Self {
        Config {
            main_ratio_permille: 550,
            history_limit: 2000,
            kitty_offload_threshold: DEFAULT_OFFLOAD_THRESHOLD,
            kitty_offload_cleanup_ms: DEFAULT_OFFLOAD_CLEANUP_MS,
            kitty_stub_all_formats: false,
            kitty_quiet: true,
            prefetch_window: DEFAULT_PREFETCH_WINDOW,
            sessions_dir: default_sessions_dir(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        // Over SSH the host-side terminal is remote; file offloading buys
        // nothing and the path would not resolve there.
        let under_ssh = env::var("SSH_CONNECTION").is_ok() || env::var("SSH_TTY").is_ok();
        cfg.kitty_offload_threshold = env::var("OPENMUX_KITTY_OFFLOAD_THRESHOLD")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(if under_ssh { 0 } else { DEFAULT_OFFLOAD_THRESHOLD });
        cfg.kitty_offload_cleanup_ms = env::var("OPENMUX_KITTY_OFFLOAD_CLEANUP_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_OFFLOAD_CLEANUP_MS);
        cfg.kitty_stub_all_formats = env::var("OPENMUX_KITTY_EMULATOR_STUB")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if let Ok(v) = env::var("OPENMUX_HISTORY_LIMIT") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.history_limit = n;
            }
        }
        cfg
    }
}

fn home_dir() -> String {
    env::var("HOME").or_else(|_| env::var("USERPROFILE")).unwrap_or_else(|_| ".".to_string())
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from(home_dir()).join(".openmux").join("sessions")
}

/// Directory holding per-session control sockets. `OPENMUX_CONTROL_SOCKET_DIR`
/// overrides; the fallback lives under the runtime dir when available.
pub fn control_socket_dir() -> PathBuf {
    if let Ok(dir) = env::var("OPENMUX_CONTROL_SOCKET_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("openmux");
    }
    PathBuf::from(home_dir()).join(".openmux")
}

/// Full socket path for a session. `OPENMUX_CONTROL_SOCKET_PATH` wins over
/// everything, including the session name.
pub fn control_socket_path(session: &str) -> PathBuf {
    if let Ok(path) = env::var("OPENMUX_CONTROL_SOCKET_PATH") {
        return PathBuf::from(path);
    }
    control_socket_dir().join(format!("{}.sock", session))
}

/// Version string reported by the control surface; `OPENMUX_VERSION`
/// overrides the compiled-in one (used by packaged builds).
pub fn reported_version() -> String {
    env::var("OPENMUX_VERSION").unwrap_or_else(|_| crate::types::VERSION.to_string())
}

/// Host capability hint: a Kitty-family terminal accepts graphics commands
/// natively.
pub fn host_supports_kitty_graphics() -> bool {
    if env::var("KITTY_WINDOW_ID").is_ok() {
        return true;
    }
    matches!(env::var("TERM_PROGRAM").as_deref(), Ok("WezTerm") | Ok("ghostty"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_quiet_and_windowed() {
        let cfg = Config::default();
        assert!(cfg.kitty_quiet);
        assert_eq!(cfg.prefetch_window, DEFAULT_PREFETCH_WINDOW);
        assert_eq!(cfg.kitty_offload_threshold, 512 * 1024);
    }

    #[test]
    fn socket_path_uses_session_name() {
        let p = control_socket_path("work");
        assert!(p.to_string_lossy().ends_with("work.sock"));
    }
}
