mod app;
mod cli;
mod client;
mod commands;
mod config;
mod emulator;
mod geometry;
mod input;
mod kitty_broker;
mod kitty_images;
mod kitty_relay;
mod layout;
mod pty;
mod rendering;
mod sequences;
mod server;
mod session;
mod types;
mod util;
mod view;
mod visibility;

use std::io;
use std::sync::mpsc;

use crossterm::event::{
    DisableBracketedPaste, DisableMouseCapture, EnableBracketedPaste, EnableMouseCapture,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;

use crate::cli::CliOutcome;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match cli::dispatch(args) {
        CliOutcome::Exit(code) => std::process::exit(code),
        CliOutcome::Attach { session } => {
            let code = match run_attached(session.as_deref()) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("openmux: {}", e);
                    3
                }
            };
            std::process::exit(code);
        }
    }
}

fn run_attached(session: Option<&str>) -> io::Result<()> {
    let config = config::Config::from_env();
    let mut app = app::App::new(config, session)?;

    // Control socket up before the terminal is touched, so scripted
    // clients can talk to us from the first frame.
    let (control_tx, control_rx) = mpsc::channel();
    let control_server = server::ControlServer::start(&app.active_session_id(), control_tx)?;
    app.set_control_rx(control_rx);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture, EnableBracketedPaste)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.hide_cursor().ok();

    let result = app.run(&mut terminal);

    // Teardown mirrors setup even when the loop errored.
    let mut stdout = io::stdout();
    let _ = execute!(stdout, DisableBracketedPaste, DisableMouseCapture, LeaveAlternateScreen);
    let _ = disable_raw_mode();
    drop(control_server);

    match result {
        Ok(detached) => {
            if detached {
                println!("[detached: session '{}' saved]", app.active_session_id());
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}
