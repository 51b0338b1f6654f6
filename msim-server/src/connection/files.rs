//! File-transfer control: `fsnd`, `facc`, `fdec`, `fcan`, `fst`.
//!
//! The heavy lifting lives in the broker ([`crate::transfer`]); these
//! handlers enforce the contract (who may do what, in which state) and relay
//! notifications to the peer.

use std::sync::Arc;

use crate::protocol::{format_packet, Packet};
use crate::server::SharedState;
use crate::transfer::{TransferError, PENDING_TTL};

use super::Conn;

fn fail_transfer(conn: &Conn, operation: &str, err: &TransferError) {
    let description = match err {
        TransferError::SessionNotFound => "Session not found",
        TransferError::SessionNotPending => "Session not in pending state",
        TransferError::NoAvailablePorts => "No available ports",
    };
    conn.send_fail(operation, description);
}

pub(super) fn handle_send(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("fsnd") else {
        return;
    };

    // fsnd|recipient|filename|size|hash
    let recipient = pkt.arg(0).unwrap_or("");
    let filename = pkt.arg(1).unwrap_or("");
    let hash = pkt.arg(3).unwrap_or("");
    if recipient.is_empty() || filename.is_empty() {
        conn.send_fail("fsnd", "Invalid data");
        return;
    }
    let Some(size) = pkt.arg(2).and_then(|s| s.parse::<u64>().ok()) else {
        conn.send_fail("fsnd", "Invalid data");
        return;
    };

    match state.db.lock().unwrap().user_exists(recipient) {
        Ok(true) => {}
        Ok(false) => {
            conn.send_fail("fsnd", "Recipient not found");
            return;
        }
        Err(e) => {
            tracing::error!("File send error: {e}");
            conn.send_fail("fsnd", "Internal error");
            return;
        }
    }

    // Transfer invitations have no offline delivery, so an offline recipient
    // fails fast instead of creating a session that can only expire.
    if !state.is_online(recipient) {
        conn.send_fail("fsnd", "Recipient offline");
        return;
    }

    let session = state.transfers.create(&login, recipient, filename, size, hash);
    let expires = PENDING_TTL.as_secs().to_string();
    conn.send_packet("ok", &["fsnd", &session.id, &expires]);

    state.send_to(
        recipient,
        format_packet(
            "fsnd",
            &[&login, filename, &size.to_string(), hash, &session.id],
        ),
    );
}

pub(super) async fn handle_accept(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("facc") else {
        return;
    };

    // facc|sender|session_id
    let sender = pkt.arg(0).unwrap_or("");
    let session_id = pkt.arg(1).unwrap_or("");
    if sender.is_empty() || session_id.is_empty() {
        conn.send_fail("facc", "Invalid data");
        return;
    }

    // Only the invited recipient may accept; anyone else learns nothing.
    match state.transfers.get(session_id) {
        Some(session) if session.recipient == login && session.sender == sender => {}
        _ => {
            conn.send_fail("facc", "Session not found");
            return;
        }
    }

    let (session, upload_port, download_port) = match state.transfers.accept(session_id).await {
        Ok(accepted) => accepted,
        Err(e) => {
            tracing::warn!(session = session_id, "File accept failed: {e}");
            fail_transfer(conn, "facc", &e);
            return;
        }
    };

    conn.send_packet("ok", &["facc", &download_port.to_string()]);
    state.send_to(
        &session.sender,
        format_packet("facc", &[&login, &session.id, &upload_port.to_string()]),
    );
}

pub(super) fn handle_decline(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("fdec") else {
        return;
    };

    // fdec|sender|session_id|[reason]
    let sender = pkt.arg(0).unwrap_or("");
    let session_id = pkt.arg(1).unwrap_or("");
    let reason = pkt.arg(2).unwrap_or("");
    if sender.is_empty() || session_id.is_empty() {
        conn.send_fail("fdec", "Invalid data");
        return;
    }

    match state.transfers.get(session_id) {
        Some(session) if session.recipient == login && session.sender == sender => {}
        _ => {
            conn.send_fail("fdec", "Session not found");
            return;
        }
    }

    let session = match state.transfers.decline(session_id) {
        Ok(session) => session,
        Err(e) => {
            fail_transfer(conn, "fdec", &e);
            return;
        }
    };

    conn.send_ok("fdec");
    state.send_to(
        &session.sender,
        format_packet("fdec", &[&login, &session.id, reason]),
    );
}

pub(super) fn handle_cancel(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("fcan") else {
        return;
    };

    // fcan|peer|session_id|[reason]
    let peer = pkt.arg(0).unwrap_or("");
    let session_id = pkt.arg(1).unwrap_or("");
    let reason = pkt.arg(2).unwrap_or("");
    if peer.is_empty() || session_id.is_empty() {
        conn.send_fail("fcan", "Invalid data");
        return;
    }

    match state.transfers.get(session_id) {
        Some(session) if session.involves(&login) => {}
        _ => {
            conn.send_fail("fcan", "Session not found");
            return;
        }
    }

    let session = match state.transfers.cancel(session_id) {
        Ok(session) => session,
        Err(e) => {
            fail_transfer(conn, "fcan", &e);
            return;
        }
    };

    conn.send_ok("fcan");
    let other = if session.sender == login {
        &session.recipient
    } else {
        &session.sender
    };
    state.send_to(other, format_packet("fcan", &[&login, &session.id, reason]));
}

pub(super) fn handle_transfer_status(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("fst") else {
        return;
    };

    let session_id = pkt.arg(0).unwrap_or("");
    let session = match state.transfers.get(session_id) {
        Some(session) if session.involves(&login) => session,
        _ => {
            conn.send_fail("fst", "Session not found");
            return;
        }
    };

    conn.send_packet(
        "ok",
        &[
            "fst",
            &session.id,
            session.status().as_str(),
            &session.bytes_transferred().to_string(),
        ],
    );
}
