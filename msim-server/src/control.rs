//! Operator control channel.
//!
//! A unix-domain socket accepting one line command per connection:
//! `stats` and `shutdown|reason|[completion_rfc3339]`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::protocol::parse_ts;
use crate::server::SharedState;

pub fn spawn(state: Arc<SharedState>, path: String) {
    tokio::spawn(async move {
        serve(state, path).await;
    });
}

async fn serve(state: Arc<SharedState>, path: String) {
    // Replace a stale socket file from a previous run.
    let _ = std::fs::remove_file(&path);

    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to create control socket {path}: {e}");
            return;
        }
    };
    tracing::info!("Control socket listening on {path}");

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = Arc::clone(&state);
                let path = path.clone();
                tokio::spawn(async move {
                    handle_command(state, stream, path).await;
                });
            }
            Err(e) => {
                tracing::warn!("Control socket accept error: {e}");
            }
        }
    }
}

async fn handle_command(state: Arc<SharedState>, stream: UnixStream, socket_path: String) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    if reader.read_line(&mut line).await.is_err() {
        return;
    }
    let line = line.trim();
    let parts: Vec<&str> = line.splitn(3, '|').collect();

    match parts[0] {
        "stats" => {
            let reply = format!("OK|{}\n", state.stats());
            let _ = write_half.write_all(reply.as_bytes()).await;
        }
        "shutdown" => {
            let reason = match parts.get(1) {
                Some(r) if !r.is_empty() => *r,
                _ => "maintenance",
            };
            let completion = parts.get(2).and_then(|t| parse_ts(t));

            let _ = write_half.write_all(b"OK|Shutting down\n").await;
            let _ = write_half.shutdown().await;
            // Give the reply a moment to reach the operator.
            tokio::time::sleep(Duration::from_millis(100)).await;

            tracing::info!(reason, ?completion, "Shutdown requested via control socket");
            state.shutdown(reason, completion);
            let _ = std::fs::remove_file(&socket_path);
            std::process::exit(0);
        }
        _ => {
            let _ = write_half.write_all(b"ERROR|Unknown command\n").await;
        }
    }
}
