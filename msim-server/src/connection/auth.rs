//! Registration and authentication.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;

use crate::protocol::{format_packet, Packet};
use crate::server::{Session, SharedState};

use super::Conn;

pub(super) fn handle_register(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let login = pkt.arg(0).unwrap_or("");
    let password = pkt.arg(1).unwrap_or("");
    if login.is_empty() || password.is_empty() {
        conn.send_fail("reg", "Invalid data");
        return;
    }

    match state.db.lock().unwrap().user_exists(login) {
        Ok(true) => {
            conn.send_fail("reg", "User already exists");
            return;
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!(login, "Register error: {e}");
            conn.send_fail("reg", "Internal error");
            return;
        }
    }

    if let Err(e) = state.db.lock().unwrap().create_user(login, password) {
        tracing::error!(login, "Register error: {e}");
        conn.send_fail("reg", "Internal error");
        return;
    }

    tracing::info!(session_id = %conn.session_id, login, "User registered");
    conn.send_ok("reg");
}

pub(super) fn handle_auth(conn: &mut Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let login = pkt.arg(0).unwrap_or("");
    let password = pkt.arg(1).unwrap_or("");
    if login.is_empty() || password.is_empty() {
        conn.send_fail("auth", "Invalid credentials");
        return;
    }

    // Re-authenticating an already-bound session is a no-op.
    if conn.login.is_some() {
        conn.send_ok("auth");
        return;
    }

    match state.db.lock().unwrap().authenticate(login, password) {
        Ok(true) => {}
        Ok(false) => {
            conn.send_fail("auth", "Invalid credentials");
            return;
        }
        Err(e) => {
            tracing::error!(login, "Auth error: {e}");
            conn.send_fail("auth", "Internal error");
            return;
        }
    }

    let handle = Arc::new(Session {
        login: login.to_string(),
        tx: conn.sender(),
        kicked: Notify::new(),
    });

    // A login may hold one active session: a concurrent authentication on a
    // second socket evicts the prior one.
    if let Some(previous) = state.insert_session(Arc::clone(&handle)) {
        tracing::info!(login, "Evicting previous session (re-authentication)");
        let _ = previous.tx.try_send(format_packet("bye", &["replaced"]));
        previous.kicked.notify_one();
    }

    conn.login = Some(login.to_string());
    conn.handle = Some(handle);
    conn.send_ok("auth");
    tracing::info!(session_id = %conn.session_id, login, "Client authenticated");

    let now = Utc::now();
    if let Err(e) = state.db.lock().unwrap().update_last_online(login, now) {
        tracing::error!(login, "Failed to update last_online: {e}");
    }
    state.notify_presence(login, "on", now);
}
