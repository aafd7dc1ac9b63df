//! Command-line surface. Hand-rolled parsing: the grammar is small and
//! the help output stays exactly what the flags are.
//!
//! Exit codes: 0 success, 1 bad arguments, 2 not found, 3 transport.

use serde_json::json;

use crate::client::{self, ClientError};
use crate::config;
use crate::session::SessionStore;
use crate::types::{PaneSelector, VERSION};

/// What `main` should do after argument parsing.
pub enum CliOutcome {
    /// Run the server/UI loop attached to this terminal.
    Attach { session: Option<String> },
    Exit(i32),
}

/// `focused | main | stack:N | pane:<id> | pty:<id> | pane-N`.
pub fn parse_selector(raw: &str) -> Option<PaneSelector> {
    match raw {
        "focused" => return Some(PaneSelector::Focused),
        "main" => return Some(PaneSelector::Main),
        _ => {}
    }
    if let Some(n) = raw.strip_prefix("stack:") {
        let n: usize = n.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some(PaneSelector::Stack(n));
    }
    if let Some(id) = raw.strip_prefix("pane:") {
        return Some(PaneSelector::ById(id.parse().ok()?));
    }
    if let Some(id) = raw.strip_prefix("pty:") {
        return Some(PaneSelector::ByPty(id.parse().ok()?));
    }
    if let Some(id) = raw.strip_prefix("pane-") {
        return Some(PaneSelector::ById(id.parse().ok()?));
    }
    None
}

fn print_help() {
    println!("openmux {} - terminal multiplexer", config::reported_version());
    println!();
    println!("USAGE:");
    println!("  openmux attach [--session <name>]");
    println!("  openmux session <list|create|rename|delete> ...");
    println!("  openmux pane <split|send|capture> ...");
    println!("  openmux version");
    println!();
    println!("Run a subcommand with --help for details.");
}

fn print_session_help() {
    println!("openmux session - manage sessions");
    println!();
    println!("  session list [--json]        list sessions, attached one marked");
    println!("  session create <name>        create an empty session");
    println!("  session switch <name>        switch the attached server to another session");
    println!("  session rename <from> <to>   rename a session");
    println!("  session delete <name>        delete a session and its state");
}

fn print_pane_help() {
    println!("openmux pane - operate on panes of the attached session");
    println!();
    println!("  pane split --direction <vertical|horizontal> [--workspace <n>] [--pane <selector>]");
    println!("  pane send --text <string> [--pane <selector>]");
    println!("      \\n, \\t and \\\\ escapes are expanded");
    println!("  pane capture [--lines <n>] [--raw] [--pane <selector>]");
    println!();
    println!("Selectors: focused | main | stack:N | pane:<id> | pty:<id> | pane-N");
}

fn wants_help(args: &[String]) -> bool {
    args.iter().any(|a| a == "--help" || a == "-h")
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).map(|s| s.as_str())
}

fn report(err: ClientError) -> i32 {
    eprintln!("openmux: {}", err);
    err.exit_code()
}

/// Resolve the session the pane commands should talk to.
fn target_session() -> Result<String, i32> {
    match client::default_session() {
        Some(session) => Ok(session),
        None => {
            eprintln!("openmux: no running session found");
            Err(3)
        }
    }
}

pub fn dispatch(args: Vec<String>) -> CliOutcome {
    if args.is_empty() || wants_help(&args) && args.len() == 1 {
        print_help();
        return CliOutcome::Exit(0);
    }
    match args[0].as_str() {
        "-h" | "--help" | "help" => {
            print_help();
            CliOutcome::Exit(0)
        }
        "-V" | "--version" | "version" => {
            println!("openmux {}", VERSION);
            CliOutcome::Exit(0)
        }
        "attach" => {
            let rest = &args[1..];
            if wants_help(rest) {
                println!("openmux attach [--session <name>]");
                println!();
                println!("Attach to (and start, if needed) a session in this terminal.");
                return CliOutcome::Exit(0);
            }
            CliOutcome::Attach { session: flag_value(rest, "--session").map(String::from) }
        }
        "session" => CliOutcome::Exit(run_session_command(&args[1..])),
        "pane" => CliOutcome::Exit(run_pane_command(&args[1..])),
        other => {
            eprintln!("openmux: unknown command '{}' (try --help)", other);
            CliOutcome::Exit(1)
        }
    }
}

fn run_session_command(args: &[String]) -> i32 {
    if args.is_empty() || wants_help(args) {
        print_session_help();
        return if args.is_empty() { 1 } else { 0 };
    }
    match args[0].as_str() {
        "list" => {
            let json_output = args.iter().any(|a| a == "--json");
            // Prefer the live server, which knows which session is
            // attached; fall back to the on-disk store.
            let listing = match client::default_session() {
                Some(session) => match client::request(&session, &json!({ "cmd": "session-list" })) {
                    Ok(value) => value,
                    Err(e) => return report(e),
                },
                None => {
                    let store = SessionStore::new(config::Config::from_env().sessions_dir);
                    serde_json::Value::Array(
                        store
                            .list()
                            .into_iter()
                            .map(|m| {
                                json!({
                                    "name": m.name,
                                    "created_at": m.created_at,
                                    "last_switched_at": m.last_switched_at,
                                    "attached": false,
                                })
                            })
                            .collect(),
                    )
                }
            };
            if json_output {
                println!("{}", listing);
            } else if let Some(sessions) = listing.as_array() {
                for s in sessions {
                    let name = s.get("name").and_then(|n| n.as_str()).unwrap_or("?");
                    let attached = s.get("attached").and_then(|a| a.as_bool()).unwrap_or(false);
                    println!("{}{}", name, if attached { " (attached)" } else { "" });
                }
            }
            0
        }
        "create" => {
            let Some(name) = args.get(1).filter(|n| !n.starts_with('-')) else {
                eprintln!("openmux: session create needs a name");
                return 1;
            };
            match client::default_session() {
                Some(session) => {
                    match client::request(&session, &json!({ "cmd": "session-create", "name": name })) {
                        Ok(_) => 0,
                        Err(e) => report(e),
                    }
                }
                None => {
                    let store = SessionStore::new(config::Config::from_env().sessions_dir);
                    match store.create(name, false) {
                        Ok(_) => 0,
                        Err(e) => {
                            eprintln!("openmux: {}", e);
                            1
                        }
                    }
                }
            }
        }
        "switch" => {
            let Some(name) = args.get(1).filter(|n| !n.starts_with('-')) else {
                eprintln!("openmux: session switch needs a name");
                return 1;
            };
            let session = match target_session() {
                Ok(s) => s,
                Err(code) => return code,
            };
            match client::request(&session, &json!({ "cmd": "session-switch", "name": name })) {
                Ok(_) => 0,
                Err(e) => report(e),
            }
        }
        "rename" => {
            let (Some(from), Some(to)) = (args.get(1), args.get(2)) else {
                eprintln!("openmux: session rename needs <from> <to>");
                return 1;
            };
            match client::default_session() {
                Some(session) => match client::request(
                    &session,
                    &json!({ "cmd": "session-rename", "from": from, "to": to }),
                ) {
                    Ok(_) => 0,
                    Err(e) => report(e),
                },
                None => {
                    let store = SessionStore::new(config::Config::from_env().sessions_dir);
                    match store.rename(from, to) {
                        Ok(_) => 0,
                        Err(crate::session::SessionError::NotFound(_)) => {
                            eprintln!("openmux: no such session: {}", from);
                            2
                        }
                        Err(e) => {
                            eprintln!("openmux: {}", e);
                            1
                        }
                    }
                }
            }
        }
        "delete" => {
            let Some(name) = args.get(1).filter(|n| !n.starts_with('-')) else {
                eprintln!("openmux: session delete needs a name");
                return 1;
            };
            match client::default_session() {
                Some(session) => {
                    match client::request(&session, &json!({ "cmd": "session-delete", "name": name })) {
                        Ok(_) => 0,
                        Err(e) => report(e),
                    }
                }
                None => {
                    let store = SessionStore::new(config::Config::from_env().sessions_dir);
                    match store.delete(name) {
                        Ok(_) => 0,
                        Err(crate::session::SessionError::NotFound(_)) => {
                            eprintln!("openmux: no such session: {}", name);
                            2
                        }
                        Err(e) => {
                            eprintln!("openmux: {}", e);
                            1
                        }
                    }
                }
            }
        }
        other => {
            eprintln!("openmux: unknown session command '{}'", other);
            1
        }
    }
}

fn run_pane_command(args: &[String]) -> i32 {
    if args.is_empty() || wants_help(args) {
        print_pane_help();
        return if args.is_empty() { 1 } else { 0 };
    }
    let selector_arg = flag_value(args, "--pane");
    if let Some(raw) = selector_arg {
        if parse_selector(raw).is_none() {
            eprintln!("openmux: unrecognised pane selector '{}'", raw);
            return 1;
        }
    }
    match args[0].as_str() {
        "split" => {
            let direction = match flag_value(args, "--direction") {
                Some("vertical") => "vertical",
                Some("horizontal") => "horizontal",
                Some(other) => {
                    eprintln!("openmux: bad direction '{}'", other);
                    return 1;
                }
                None => {
                    eprintln!("openmux: pane split needs --direction");
                    return 1;
                }
            };
            let workspace = flag_value(args, "--workspace").and_then(|w| w.parse::<u32>().ok());
            let session = match target_session() {
                Ok(s) => s,
                Err(code) => return code,
            };
            let mut payload = json!({ "cmd": "pane-split", "direction": direction });
            if let Some(ws) = workspace {
                payload["workspace"] = json!(ws);
            }
            if let Some(sel) = selector_arg {
                payload["pane"] = json!(sel);
            }
            match client::request(&session, &payload) {
                Ok(value) => {
                    if let Some(pane) = value.get("pane").and_then(|p| p.as_str()) {
                        println!("{}", pane);
                    }
                    0
                }
                Err(e) => report(e),
            }
        }
        "send" => {
            let Some(text) = flag_value(args, "--text") else {
                eprintln!("openmux: pane send needs --text");
                return 1;
            };
            let session = match target_session() {
                Ok(s) => s,
                Err(code) => return code,
            };
            let mut payload = json!({ "cmd": "pane-send", "text": text });
            if let Some(sel) = selector_arg {
                payload["pane"] = json!(sel);
            }
            match client::request(&session, &payload) {
                Ok(_) => 0,
                Err(e) => report(e),
            }
        }
        "capture" => {
            let lines = flag_value(args, "--lines").and_then(|l| l.parse::<usize>().ok());
            let raw = args.iter().any(|a| a == "--raw");
            let session = match target_session() {
                Ok(s) => s,
                Err(code) => return code,
            };
            let mut payload = json!({ "cmd": "pane-capture", "raw": raw });
            if let Some(n) = lines {
                payload["lines"] = json!(n);
            }
            if let Some(sel) = selector_arg {
                payload["pane"] = json!(sel);
            }
            match client::request(&session, &payload) {
                Ok(value) => {
                    if let Some(text) = value.as_str() {
                        println!("{}", text);
                    }
                    0
                }
                Err(e) => report(e),
            }
        }
        other => {
            eprintln!("openmux: unknown pane command '{}'", other);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_grammar() {
        assert_eq!(parse_selector("focused"), Some(PaneSelector::Focused));
        assert_eq!(parse_selector("main"), Some(PaneSelector::Main));
        assert_eq!(parse_selector("stack:2"), Some(PaneSelector::Stack(2)));
        assert_eq!(parse_selector("pane:17"), Some(PaneSelector::ById(17)));
        assert_eq!(parse_selector("pty:3"), Some(PaneSelector::ByPty(3)));
        assert_eq!(parse_selector("pane-9"), Some(PaneSelector::ById(9)));
        assert_eq!(parse_selector("stack:0"), None, "stack positions are 1-based");
        assert_eq!(parse_selector("window:1"), None);
        assert_eq!(parse_selector("pane:x"), None);
    }

    #[test]
    fn attach_takes_optional_session() {
        match dispatch(vec!["attach".into(), "--session".into(), "dev".into()]) {
            CliOutcome::Attach { session } => assert_eq!(session.as_deref(), Some("dev")),
            _ => panic!("expected attach"),
        }
        match dispatch(vec!["attach".into()]) {
            CliOutcome::Attach { session } => assert!(session.is_none()),
            _ => panic!("expected attach"),
        }
    }

    #[test]
    fn help_exits_zero_at_any_prefix() {
        assert!(matches!(dispatch(vec!["--help".into()]), CliOutcome::Exit(0)));
        assert!(matches!(
            dispatch(vec!["session".into(), "--help".into()]),
            CliOutcome::Exit(0)
        ));
        assert!(matches!(dispatch(vec!["pane".into(), "-h".into()]), CliOutcome::Exit(0)));
        assert!(matches!(
            dispatch(vec!["attach".into(), "--help".into()]),
            CliOutcome::Exit(0)
        ));
    }

    #[test]
    fn unknown_commands_exit_one() {
        assert!(matches!(dispatch(vec!["frob".into()]), CliOutcome::Exit(1)));
        assert!(matches!(
            dispatch(vec!["session".into(), "frob".into()]),
            CliOutcome::Exit(1)
        ));
    }

    #[test]
    fn bad_selector_rejected_before_any_connection() {
        let code = run_pane_command(&[
            "send".to_string(),
            "--text".to_string(),
            "hi".to_string(),
            "--pane".to_string(),
            "bogus".to_string(),
        ]);
        assert_eq!(code, 1);
    }
}
