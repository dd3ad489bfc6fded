//! Line-oriented presentation: stdin lines become edits and commands, roster
//! and field changes are printed as they happen.

use std::fmt::Write as _;

use fieldsync_core::{Identity, RosterEntry};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::session::{FieldView, SessionHandle};

const NO_PEERS_HINT: &str = "No devices connected yet; edit not shared.";

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Edit(String),
    Connect(Identity),
    Roster,
    Quit,
    Unknown(String),
}

fn parse_line(line: &str) -> Input {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(cmd) = line.strip_prefix('/') else {
        return Input::Edit(line.to_string());
    };
    let mut parts = cmd.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("connect"), Some(id)) => Input::Connect(Identity::new(id)),
        (Some("roster"), None) => Input::Roster,
        (Some("quit"), None) => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    }
}

fn connected_peers(roster: &[RosterEntry]) -> usize {
    roster.iter().filter(|e| !e.is_self && e.connected).count()
}

/// Status line, connected list and nearby list.
pub fn render_roster(roster: &[RosterEntry]) -> String {
    let peers = connected_peers(roster);
    let mut out = String::new();
    if peers > 0 {
        let _ = writeln!(out, "✓ {peers} device(s) connected");
    } else {
        let _ = writeln!(out, "Scanning for nearby devices…");
    }

    let _ = writeln!(out, "Connected:");
    for e in roster.iter().filter(|e| e.connected) {
        let _ = write!(out, "  {} {}", e.descriptor.icon, e.descriptor.name);
        if e.is_self {
            let _ = write!(out, " (this device)");
        }
        out.push('\n');
    }

    let nearby: Vec<_> = roster.iter().filter(|e| !e.connected).collect();
    if !nearby.is_empty() {
        let _ = writeln!(out, "Nearby:");
        for e in nearby {
            let _ = writeln!(
                out,
                "  {} {}  /connect {}",
                e.descriptor.icon, e.descriptor.name, e.identity
            );
        }
    }
    out
}

pub fn render_field(view: &FieldView) -> String {
    if view.acknowledging {
        format!("» {}  [synced]", view.value)
    } else {
        format!("» {}", view.value)
    }
}

/// Print roster and remote field updates until both channels close.
async fn print_updates(
    mut roster: watch::Receiver<Vec<RosterEntry>>,
    mut field: watch::Receiver<FieldView>,
) {
    print!("{}", render_roster(&roster.borrow_and_update()));
    loop {
        tokio::select! {
            changed = roster.changed() => {
                if changed.is_err() {
                    break;
                }
                print!("{}", render_roster(&roster.borrow_and_update()));
            }
            changed = field.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = field.borrow_and_update().clone();
                // Remote edits carry the badge; local edits and badge expiry are not echoed.
                if view.acknowledging {
                    println!("{}", render_field(&view));
                }
            }
        }
    }
}

/// Drive the console until `/quit`. Returns immediately on quit; stdin EOF
/// leaves the session running until a signal.
pub async fn run(handle: &SessionHandle) {
    let printer = tokio::spawn(print_updates(handle.roster(), handle.field()));
    println!("device id: {}", handle.identity());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("stdin closed, console input disabled");
                std::future::pending::<()>().await;
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed, console input disabled");
                std::future::pending::<()>().await;
                continue;
            }
        };
        match parse_line(&line) {
            Input::Edit(value) => {
                // Nothing to share with; the edit is not applied.
                if connected_peers(&handle.roster().borrow()) == 0 {
                    println!("{NO_PEERS_HINT}");
                    continue;
                }
                handle.local_edit(value)
            }
            Input::Connect(id) => handle.connect(id),
            Input::Roster => print!("{}", render_roster(&handle.roster().borrow())),
            Input::Quit => break,
            Input::Unknown(cmd) => println!("unknown command: {cmd} (try /connect <id>, /roster, /quit)"),
        }
    }
    printer.abort();
}
