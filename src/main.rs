mod calc;
mod class_run;
mod close;
mod config;
mod db;
mod error;
mod ipc;
mod store;
mod telemetry;

use std::io::{self, BufRead, Write};

fn main() {
    let config = config::DaemonConfig::from_env();
    telemetry::init_tracing(&config);

    let mut state = ipc::AppState::default();
    if let Some(ws) = config.workspace.as_deref() {
        if let Err(e) = state.open_workspace(ws) {
            tracing::warn!(
                workspace = %ws.display(),
                "could not open workspace from environment: {e:?}"
            );
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "pautad ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to answer to; reply with a bare error line.
                tracing::warn!("unparseable request line: {}", e);
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
