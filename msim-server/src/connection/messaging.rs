//! Message routing: `msg`, `ack`, `hist`, `hclear`, `offmsg`.
//!
//! `msg` is persist-then-forward: the row is written before any delivery
//! attempt, and a delivery failure never fails the originator's request.
//! `ack` is update-then-relay.

use std::sync::Arc;

use chrono::Utc;

use crate::protocol::{encode_item, escape, format_packet, format_ts, join_items, parse_ts, Packet};
use crate::server::SharedState;

use super::Conn;

/// Server-side ceiling on a single history page.
const MAX_HISTORY_LIMIT: i64 = 1000;

pub(super) fn handle_message(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("msg") else {
        return;
    };

    let recipient = pkt.arg(0).unwrap_or("");
    let text = pkt.arg(1).unwrap_or("");
    if recipient.is_empty() {
        conn.send_fail("msg", "Recipient required");
        return;
    }
    if text.is_empty() {
        conn.send_fail("msg", "Message text required");
        return;
    }

    match state.db.lock().unwrap().user_exists(recipient) {
        Ok(true) => {}
        Ok(false) => {
            conn.send_fail("msg", "Recipient not found");
            return;
        }
        Err(e) => {
            tracing::error!("Message error: {e}");
            conn.send_fail("msg", "Internal error");
            return;
        }
    }

    let timestamp = Utc::now();
    if let Err(e) = state
        .db
        .lock()
        .unwrap()
        .save_message(&login, recipient, text, timestamp)
    {
        tracing::error!("Message error: {e}");
        conn.send_fail("msg", "Internal error");
        return;
    }

    // Forward to the recipient if online. Best-effort: the message is
    // already delivered to the server.
    let ts = format_ts(timestamp);
    state.send_to(recipient, format_packet("msg", &[&login, text, &ts]));

    conn.send_ok("msg");
}

pub(super) fn handle_ack(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("ack") else {
        return;
    };

    let sender = pkt.arg(0).unwrap_or("");
    let raw_ts = pkt.arg(1).unwrap_or("");
    if sender.is_empty() || raw_ts.is_empty() {
        conn.send_fail("ack", "Invalid ack format");
        return;
    }

    // Canonicalise so minor RFC3339 spellings still hit the stored row.
    let Some(parsed) = parse_ts(raw_ts) else {
        conn.send_fail("ack", "Invalid timestamp");
        return;
    };
    let ts = format_ts(parsed);

    if let Err(e) = state.db.lock().unwrap().mark_ack(sender, &login, &ts) {
        tracing::error!("Ack error: {e}");
        conn.send_fail("ack", "Internal error");
        return;
    }

    conn.send_ok("ack");

    // Relay the acknowledgement to the original sender if online.
    state.send_to(sender, format_packet("ack", &[&login, &ts]));
}

pub(super) fn handle_history(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("hist") else {
        return;
    };

    let contact = pkt.arg(0).unwrap_or("");
    if contact.is_empty() {
        conn.send_fail("hist", "Contact required");
        return;
    }

    // hist|contact, hist|contact|limit, or hist|contact|offset|limit.
    let mut offset: i64 = 0;
    let mut limit: i64 = MAX_HISTORY_LIMIT;
    match (pkt.arg(1), pkt.arg(2)) {
        (Some(l), None) => {
            if let Ok(parsed) = l.parse::<i64>() {
                limit = parsed;
            }
        }
        (Some(o), Some(l)) => {
            if let Ok(parsed) = o.parse::<i64>() {
                offset = parsed;
            }
            if let Ok(parsed) = l.parse::<i64>() {
                limit = parsed;
            }
        }
        _ => {}
    }
    let offset = offset.max(0);
    let limit = if limit <= 0 {
        MAX_HISTORY_LIMIT
    } else {
        limit.min(MAX_HISTORY_LIMIT)
    };

    let messages = match state.db.lock().unwrap().get_messages(&login, contact, offset, limit) {
        Ok(messages) => messages,
        Err(e) => {
            tracing::error!("History error: {e}");
            conn.send_fail("hist", "Internal error");
            return;
        }
    };

    let items: Vec<String> = messages
        .iter()
        .map(|m| encode_item(&["msg", &m.sender, &m.text, &m.timestamp, &m.status]))
        .collect();

    // hist|contact|msg|sender|text|ts|status,msg|…
    let raw = format!("{}|{}", escape(contact), join_items(&items));
    conn.send_raw("hist", &raw);
}

pub(super) fn handle_clear_history(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("hclear") else {
        return;
    };

    let contact = pkt.arg(0).unwrap_or("");
    if contact.is_empty() {
        conn.send_fail("hclear", "Contact required");
        return;
    }

    if let Err(e) = state.db.lock().unwrap().clear_history(&login, contact) {
        tracing::error!("Clear history error: {e}");
        conn.send_fail("hclear", "Internal error");
        return;
    }
    conn.send_ok("hclear");
}

pub(super) fn handle_offline_counts(conn: &Conn, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("offmsg") else {
        return;
    };

    let counts = match state.db.lock().unwrap().offline_counts(&login) {
        Ok(counts) => counts,
        Err(e) => {
            tracing::error!("Offmsg error: {e}");
            conn.send_fail("offmsg", "Internal error");
            return;
        }
    };

    let items: Vec<String> = counts
        .iter()
        .map(|(sender, count)| encode_item(&[sender, &count.to_string()]))
        .collect();
    conn.send_raw("offmsg", &join_items(&items));
}
