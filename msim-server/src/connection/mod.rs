//! Per-client connection handler.
//!
//! Each TCP connection gets a read loop that decodes framed line packets and
//! dispatches them to the handler for their type, plus a writer task fed by a
//! bounded queue so that other connections (delivery, presence, transfer
//! notifications) can write to this client without blocking.
//!
//! Handlers are split into submodules:
//! - [`auth`] — `reg`, `auth`
//! - [`messaging`] — `msg`, `ack`, `hist`, `hclear`, `offmsg`
//! - [`contacts`] — `list`, `add`, `ren`, `del`, `stat`
//! - [`files`] — `fsnd`, `facc`, `fdec`, `fcan`, `fst`

mod auth;
mod contacts;
mod files;
mod messaging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::{format_packet, format_raw, Packet};
use crate::server::{Session, SharedState};

/// Cap on a single inbound line; anything longer is rejected.
const MAX_LINE_LEN: usize = 8192;
/// Upper bound on how long the read loop sleeps between liveness checks.
const LIVENESS_POLL: Duration = Duration::from_secs(30);
/// Outbound queue depth per connection.
const SEND_QUEUE: usize = 4096;

/// State of a single client connection.
pub struct Conn {
    pub session_id: String,
    /// Authenticated login, empty until `auth` succeeds.
    pub login: Option<String>,
    /// Registry handle for the authenticated session.
    pub handle: Option<Arc<Session>>,
    tx: mpsc::Sender<String>,
}

impl Conn {
    fn new(session_id: String, tx: mpsc::Sender<String>) -> Self {
        Self {
            session_id,
            login: None,
            handle: None,
            tx,
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<String> {
        self.tx.clone()
    }

    pub(crate) fn send_line(&self, line: String) {
        if self.tx.try_send(line).is_err() {
            tracing::warn!(session_id = %self.session_id, "Send buffer full or closed");
        }
    }

    pub(crate) fn send_packet(&self, ptype: &str, fields: &[&str]) {
        self.send_line(format_packet(ptype, fields));
    }

    /// Send a packet whose content carries intentionally unescaped inner
    /// delimiters (composite responses).
    pub(crate) fn send_raw(&self, ptype: &str, raw_content: &str) {
        self.send_line(format_raw(ptype, raw_content));
    }

    pub(crate) fn send_ok(&self, operation: &str) {
        self.send_packet("ok", &[operation]);
    }

    pub(crate) fn send_fail(&self, operation: &str, description: &str) {
        if operation.is_empty() {
            self.send_packet("fail", &[description]);
        } else {
            self.send_packet("fail", &[operation, description]);
        }
    }

    /// The login of an authenticated session, or a `fail|op|Not
    /// authenticated` reply and `None`.
    pub(crate) fn require_login(&self, operation: &str) -> Option<String> {
        match self.login {
            Some(ref login) => Some(login.clone()),
            None => {
                self.send_fail(operation, "Not authenticated");
                None
            }
        }
    }
}

/// Handle one client connection until it disconnects.
pub async fn handle(stream: TcpStream, state: Arc<SharedState>) -> Result<()> {
    let peer = stream.peer_addr()?;
    let session_id = peer.to_string();
    tracing::info!(%session_id, "New client connected");

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<String>(SEND_QUEUE);
    let write_handle = spawn_writer(
        write_half,
        rx,
        state.config.write_timeout(),
        session_id.clone(),
    );

    let mut reader = BufReader::new(read_half);
    let mut conn = Conn::new(session_id.clone(), tx);
    let read_timeout = state.config.read_timeout();
    let poll = LIVENESS_POLL.min(read_timeout);
    let mut last_activity = Instant::now();
    let mut line_buf = String::new();

    loop {
        let read_result = match conn.handle.clone() {
            Some(handle) => tokio::select! {
                result = tokio::time::timeout(poll, reader.read_line(&mut line_buf)) => Some(result),
                _ = handle.kicked.notified() => None,
            },
            None => Some(tokio::time::timeout(poll, reader.read_line(&mut line_buf)).await),
        };

        // Evicted by a re-authentication or an administrative shutdown; the
        // registry entry is already gone and the bye line is queued.
        let Some(read_result) = read_result else {
            tracing::info!(%session_id, login = ?conn.login, "Session kicked");
            conn.login = None;
            conn.handle = None;
            break;
        };

        match read_result {
            Err(_elapsed) => {
                // No complete line inside the poll window. A partial line, if
                // any, stays buffered for the next iteration. An
                // authenticated session silent past the idle ceiling is torn
                // down.
                if conn.login.is_some() && last_activity.elapsed() > read_timeout {
                    tracing::info!(%session_id, login = ?conn.login, "Idle timeout");
                    conn.send_packet("bye", &["timeout"]);
                    teardown(&mut conn, &state, "timeout");
                    break;
                }
                continue;
            }
            Ok(Ok(0)) => break, // EOF
            Ok(Err(e)) => {
                tracing::warn!(%session_id, "Read error: {e}");
                break;
            }
            Ok(Ok(_)) => {}
        }

        last_activity = Instant::now();

        if line_buf.len() > MAX_LINE_LEN {
            tracing::warn!(%session_id, len = line_buf.len(), "Line too long, dropping");
            conn.send_packet("fail", &["Invalid packet format"]);
            line_buf.clear();
            continue;
        }

        let line = line_buf.trim();
        if line.is_empty() {
            line_buf.clear();
            continue;
        }

        // Never log credential-bearing packets verbatim.
        if !line.starts_with("auth|") && !line.starts_with("reg|") {
            tracing::debug!(%session_id, "<- {line}");
        }

        let pkt = match Packet::parse(line) {
            Ok(pkt) => pkt,
            Err(e) => {
                tracing::warn!(%session_id, "Parse error: {e}");
                conn.send_packet("fail", &["Invalid packet format"]);
                line_buf.clear();
                continue;
            }
        };
        line_buf.clear();

        let is_bye = pkt.ptype == "bye";
        dispatch(&mut conn, &pkt, &state).await;
        if is_bye {
            // The bye handler already tore the session down.
            drop(conn);
            let _ = write_handle.await;
            return Ok(());
        }
    }

    teardown(&mut conn, &state, "connection closed");
    tracing::info!(%session_id, "Connection closed");
    drop(conn);
    let _ = write_handle.await;
    Ok(())
}

async fn dispatch(conn: &mut Conn, pkt: &Packet, state: &Arc<SharedState>) {
    match pkt.ptype.as_str() {
        "ping" => conn.send_packet("pong", &[]),
        "auth" => auth::handle_auth(conn, pkt, state),
        "reg" => auth::handle_register(conn, pkt, state),
        "msg" => messaging::handle_message(conn, pkt, state),
        "ack" => messaging::handle_ack(conn, pkt, state),
        "hist" => messaging::handle_history(conn, pkt, state),
        "hclear" => messaging::handle_clear_history(conn, pkt, state),
        "offmsg" => messaging::handle_offline_counts(conn, state),
        "stat" => contacts::handle_status(conn, pkt, state),
        "list" => contacts::handle_list(conn, state),
        "add" => contacts::handle_add(conn, pkt, state),
        "ren" => contacts::handle_rename(conn, pkt, state),
        "del" => contacts::handle_delete(conn, pkt, state),
        "bye" => handle_bye(conn, state),
        "help" => handle_help(conn),
        "fsnd" => files::handle_send(conn, pkt, state),
        "facc" => files::handle_accept(conn, pkt, state).await,
        "fdec" => files::handle_decline(conn, pkt, state),
        "fcan" => files::handle_cancel(conn, pkt, state),
        "fst" => files::handle_transfer_status(conn, pkt, state),
        _ => conn.send_packet("fail", &["Unknown packet type"]),
    }
}

/// Client-requested session end: confirm, then tear down.
fn handle_bye(conn: &mut Conn, state: &Arc<SharedState>) {
    conn.send_packet("bye", &[]);
    teardown(conn, state, "bye");
}

fn handle_help(conn: &Conn) {
    let operations = [
        "ping", "auth", "reg", "msg", "ack", "hist", "hclear", "offmsg", "stat", "list", "add",
        "ren", "del", "bye", "help", "fsnd", "facc", "fdec", "fcan", "fst",
    ];
    conn.send_raw("help", &operations.join(","));
}

/// Remove the session from the registry (unless a replacement already owns
/// the login), persist the offline time, and fan presence out to contacts.
fn teardown(conn: &mut Conn, state: &Arc<SharedState>, why: &str) {
    let (login, handle) = match (conn.login.take(), conn.handle.take()) {
        (Some(login), Some(handle)) => (login, handle),
        _ => return,
    };

    if state.remove_session(&login, &handle) {
        let now = Utc::now();
        if let Err(e) = state.db.lock().unwrap().update_last_offline(&login, now) {
            tracing::error!(login = %login, "Failed to update last_offline: {e}");
        }
        state.notify_presence(&login, "off", now);
        tracing::info!(session_id = %conn.session_id, login = %login, "Client disconnected ({why})");
    }
}

fn spawn_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<String>,
    write_timeout: Duration,
    session_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_frame(&mut writer, &line, write_timeout, &session_id)
                .await
                .is_err()
            {
                return;
            }
            // Drain queued lines and batch-write them (reduces syscalls).
            let mut batched = 0;
            while let Ok(queued) = rx.try_recv() {
                if write_frame(&mut writer, &queued, write_timeout, &session_id)
                    .await
                    .is_err()
                {
                    return;
                }
                batched += 1;
                if batched >= 64 {
                    break;
                }
            }
        }
        // Queue closed and drained: flush the FIN.
        let _ = writer.shutdown().await;
    })
}

/// Write one frame under the configured write deadline.
async fn write_frame(
    writer: &mut OwnedWriteHalf,
    line: &str,
    deadline: Duration,
    session_id: &str,
) -> std::result::Result<(), ()> {
    match tokio::time::timeout(deadline, writer.write_all(line.as_bytes())).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::warn!(session_id, "Write error: {e}");
            Err(())
        }
        Err(_) => {
            tracing::warn!(session_id, "Write timed out");
            Err(())
        }
    }
}
