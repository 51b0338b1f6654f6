//! Contact-list management and presence queries: `list`, `add`, `ren`,
//! `del`, `stat`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::protocol::{encode_item, escape, format_ts, join_items, Packet};
use crate::server::SharedState;

use super::Conn;

/// One `user|status|last_seen` row for a `stat` response. `last_seen` is the
/// later of the stored online/offline transitions.
fn status_item(state: &Arc<SharedState>, user: &str) -> Option<String> {
    let (last_online, last_offline) = match state.db.lock().unwrap().get_status(user) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(user, "Status lookup failed: {e}");
            return None;
        }
    };
    let status = if state.is_online(user) { "on" } else { "off" };
    let last_seen: DateTime<Utc> = last_online.max(last_offline);
    Some(format!(
        "{}|{}|{}",
        escape(user),
        status,
        format_ts(last_seen)
    ))
}

pub(super) fn handle_status(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("stat") else {
        return;
    };

    let target = pkt.arg(0).unwrap_or("");
    let mut items = Vec::new();

    if !target.is_empty() {
        match state.db.lock().unwrap().user_exists(target) {
            Ok(true) => {}
            Ok(false) => {
                conn.send_fail("stat", "User not found");
                return;
            }
            Err(e) => {
                tracing::error!("Status error: {e}");
                conn.send_fail("stat", "Internal error");
                return;
            }
        }
        match status_item(state, target) {
            Some(item) => items.push(item),
            None => {
                conn.send_fail("stat", "Internal error");
                return;
            }
        }
    } else {
        let contacts = match state.db.lock().unwrap().get_contacts(&login) {
            Ok(contacts) => contacts,
            Err(e) => {
                tracing::error!("Status error: {e}");
                conn.send_fail("stat", "Internal error");
                return;
            }
        };
        for contact in contacts {
            // Skip a contact whose status lookup fails rather than failing
            // the whole response.
            if let Some(item) = status_item(state, &contact.contact) {
                items.push(item);
            }
        }
    }

    conn.send_raw("stat", &join_items(&items));
}

pub(super) fn handle_list(conn: &Conn, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("list") else {
        return;
    };

    let contacts = match state.db.lock().unwrap().get_contacts(&login) {
        Ok(contacts) => contacts,
        Err(e) => {
            tracing::error!("List error: {e}");
            conn.send_fail("list", "Internal error");
            return;
        }
    };

    let items: Vec<String> = contacts
        .iter()
        .map(|c| encode_item(&[&c.contact, &c.nick]))
        .collect();
    conn.send_raw("list", &join_items(&items));
}

pub(super) fn handle_add(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("add") else {
        return;
    };

    let contact = pkt.arg(0).unwrap_or("");
    if contact.is_empty() {
        conn.send_fail("add", "Invalid data");
        return;
    }

    match state.db.lock().unwrap().user_exists(contact) {
        Ok(true) => {}
        Ok(false) => {
            conn.send_fail("add", "User not found");
            return;
        }
        Err(e) => {
            tracing::error!("Add contact error: {e}");
            conn.send_fail("add", "Internal error");
            return;
        }
    }

    // The nick defaults to the contact's login.
    let nick = match pkt.arg(1) {
        Some(nick) if !nick.is_empty() => nick,
        _ => contact,
    };

    if let Err(e) = state.db.lock().unwrap().add_contact(&login, contact, nick) {
        tracing::error!("Add contact error: {e}");
        conn.send_fail("add", "Contact already exists or internal error");
        return;
    }
    conn.send_ok("add");
}

pub(super) fn handle_rename(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("ren") else {
        return;
    };

    let contact = pkt.arg(0).unwrap_or("");
    let nick = pkt.arg(1).unwrap_or("");
    if contact.is_empty() || nick.is_empty() {
        conn.send_fail("ren", "Invalid data");
        return;
    }

    match state.db.lock().unwrap().update_nick(&login, contact, nick) {
        Ok(true) => conn.send_ok("ren"),
        Ok(false) => conn.send_fail("ren", "Contact not found"),
        Err(e) => {
            tracing::error!("Rename contact error: {e}");
            conn.send_fail("ren", "Internal error");
        }
    }
}

pub(super) fn handle_delete(conn: &Conn, pkt: &Packet, state: &Arc<SharedState>) {
    let Some(login) = conn.require_login("del") else {
        return;
    };

    let contact = pkt.arg(0).unwrap_or("");
    if contact.is_empty() {
        conn.send_fail("del", "Invalid data");
        return;
    }

    match state.db.lock().unwrap().delete_contact(&login, contact) {
        Ok(true) => conn.send_ok("del"),
        Ok(false) => conn.send_fail("del", "Contact not found"),
        Err(e) => {
            tracing::error!("Delete contact error: {e}");
            conn.send_fail("del", "Internal error");
        }
    }
}
