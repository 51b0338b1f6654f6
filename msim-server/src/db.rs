//! SQLite persistence layer.
//!
//! Stores users (with Argon2id password hashes and presence timestamps),
//! contact lists, and message history. Uses WAL mode for concurrent reads
//! during writes. Timestamps are stored as RFC3339 TEXT in UTC with second
//! precision, so lexicographic comparison equals chronological comparison.

use std::path::Path;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::protocol::{format_ts, parse_ts};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("password hash error: {0}")]
    PasswordHash(argon2::password_hash::Error),
}

impl From<argon2::password_hash::Error> for DbError {
    fn from(e: argon2::password_hash::Error) -> Self {
        DbError::PasswordHash(e)
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// A persisted message row. The timestamp is kept in wire format.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub sender: String,
    pub recipient: String,
    pub text: String,
    pub timestamp: String,
    pub status: String,
}

/// One contact-list row.
#[derive(Debug, Clone)]
pub struct ContactRow {
    pub contact: String,
    pub nick: String,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                login        TEXT UNIQUE NOT NULL,
                password     TEXT NOT NULL,
                last_online  TEXT NOT NULL DEFAULT '',
                last_offline TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS contacts (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                owner   TEXT NOT NULL,
                contact TEXT NOT NULL,
                nick    TEXT NOT NULL,
                UNIQUE(owner, contact)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                sender    TEXT NOT NULL,
                recipient TEXT NOT NULL,
                text      TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                status    TEXT NOT NULL DEFAULT 'sent'
            );

            CREATE INDEX IF NOT EXISTS idx_messages_sender
                ON messages(sender, timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_recipient
                ON messages(recipient, timestamp);
            CREATE INDEX IF NOT EXISTS idx_contacts_owner
                ON contacts(owner);
            ",
        )?;

        // Migrate databases created before presence tracking existed.
        // ALTER TABLE ADD COLUMN is idempotent-safe via error suppression.
        let migrations = [
            "ALTER TABLE users ADD COLUMN last_online TEXT NOT NULL DEFAULT ''",
            "ALTER TABLE users ADD COLUMN last_offline TEXT NOT NULL DEFAULT ''",
        ];
        for sql in &migrations {
            let _ = self.conn.execute(sql, []);
        }

        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────────

    /// Create a user. The password is stored as an Argon2id PHC string with
    /// a random salt; plaintext never reaches the database. Fails on a
    /// duplicate login.
    pub fn create_user(&self, login: &str, password: &str) -> Result<()> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)?
            .to_string();

        let now = format_ts(Utc::now());
        self.conn.execute(
            "INSERT INTO users (login, password, last_online, last_offline) VALUES (?1, ?2, ?3, ?3)",
            params![login, hash, now],
        )?;
        Ok(())
    }

    /// Verify credentials. Unknown logins and wrong passwords both return
    /// `Ok(false)`.
    pub fn authenticate(&self, login: &str, password: &str) -> Result<bool> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT password FROM users WHERE login = ?1",
                params![login],
                |row| row.get(0),
            )
            .optional()?;
        let Some(stored) = stored else {
            return Ok(false);
        };

        let parsed = PasswordHash::new(&stored)?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn user_exists(&self, login: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM users WHERE login = ?1",
            params![login],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn update_last_online(&self, login: &str, t: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE users SET last_online = ?1 WHERE login = ?2",
            params![format_ts(t), login],
        )?;
        Ok(())
    }

    pub fn update_last_offline(&self, login: &str, t: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE users SET last_offline = ?1 WHERE login = ?2",
            params![format_ts(t), login],
        )?;
        Ok(())
    }

    /// Fetch `(last_online, last_offline)`. Missing or unparsable values fall
    /// back to the epoch.
    pub fn get_status(&self, login: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let (online, offline): (String, String) = self.conn.query_row(
            "SELECT COALESCE(last_online, ''), COALESCE(last_offline, '') FROM users WHERE login = ?1",
            params![login],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Ok((
            parse_ts(&online).unwrap_or(epoch),
            parse_ts(&offline).unwrap_or(epoch),
        ))
    }

    // ── Contacts ───────────────────────────────────────────────────────

    pub fn get_contacts(&self, owner: &str) -> Result<Vec<ContactRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT contact, nick FROM contacts WHERE owner = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![owner], |row| {
            Ok(ContactRow {
                contact: row.get(0)?,
                nick: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn add_contact(&self, owner: &str, contact: &str, nick: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO contacts (owner, contact, nick) VALUES (?1, ?2, ?3)",
            params![owner, contact, nick],
        )?;
        Ok(())
    }

    /// Returns `false` when no such contact row exists.
    pub fn update_nick(&self, owner: &str, contact: &str, nick: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE contacts SET nick = ?1 WHERE owner = ?2 AND contact = ?3",
            params![nick, owner, contact],
        )?;
        Ok(changed > 0)
    }

    /// Returns `false` when no such contact row exists.
    pub fn delete_contact(&self, owner: &str, contact: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM contacts WHERE owner = ?1 AND contact = ?2",
            params![owner, contact],
        )?;
        Ok(changed > 0)
    }

    pub fn contact_exists(&self, owner: &str, contact: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM contacts WHERE owner = ?1 AND contact = ?2",
            params![owner, contact],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ── Messages ───────────────────────────────────────────────────────

    pub fn save_message(
        &self,
        sender: &str,
        recipient: &str,
        text: &str,
        t: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO messages (sender, recipient, text, timestamp, status) VALUES (?1, ?2, ?3, ?4, 'sent')",
            params![sender, recipient, text, format_ts(t)],
        )?;
        Ok(())
    }

    /// Fetch the conversation between two users, both directions, ordered by
    /// timestamp ascending.
    pub fn get_messages(
        &self,
        owner: &str,
        contact: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<MessageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT sender, recipient, text, timestamp, status
             FROM messages
             WHERE (sender = ?1 AND recipient = ?2) OR (sender = ?2 AND recipient = ?1)
             ORDER BY timestamp ASC, id ASC
             LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query_map(params![owner, contact, limit, offset], |row| {
            Ok(MessageRow {
                sender: row.get(0)?,
                recipient: row.get(1)?,
                text: row.get(2)?,
                timestamp: row.get(3)?,
                status: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Transition the row matching `(sender, recipient, timestamp)` to
    /// `ackn`. Applying it twice is a no-op; returns the number of rows
    /// changed.
    pub fn mark_ack(&self, sender: &str, recipient: &str, timestamp: &str) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE messages SET status = 'ackn'
             WHERE sender = ?1 AND recipient = ?2 AND timestamp = ?3",
            params![sender, recipient, timestamp],
        )?;
        Ok(changed)
    }

    /// Delete the conversation between two users, both directions.
    pub fn clear_history(&self, owner: &str, contact: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM messages
             WHERE (sender = ?1 AND recipient = ?2) OR (sender = ?2 AND recipient = ?1)",
            params![owner, contact],
        )?;
        Ok(())
    }

    /// Per-sender counts of messages to `recipient` whose timestamp falls in
    /// the `(last_offline, last_online]` window — the backlog that arrived
    /// between the last disconnect and the current login.
    pub fn offline_counts(&self, recipient: &str) -> Result<Vec<(String, i64)>> {
        let (mut last_offline, mut last_online): (String, String) = self.conn.query_row(
            "SELECT COALESCE(last_offline, ''), COALESCE(last_online, '') FROM users WHERE login = ?1",
            params![recipient],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if last_offline.is_empty() {
            last_offline = "1970-01-01T00:00:00Z".to_string();
        }
        if last_online.is_empty() {
            last_online = "2099-12-31T23:59:59Z".to_string();
        }

        let mut stmt = self.conn.prepare(
            "SELECT sender, COUNT(*)
             FROM messages
             WHERE recipient = ?1 AND timestamp > ?2 AND timestamp <= ?3
             GROUP BY sender
             ORDER BY sender",
        )?;
        let rows = stmt.query_map(params![recipient, last_offline, last_online], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_ts(s).unwrap()
    }

    #[test]
    fn create_and_authenticate_user() {
        let db = Db::open_memory().unwrap();
        db.create_user("alice@x", "secret").unwrap();

        assert!(db.authenticate("alice@x", "secret").unwrap());
        assert!(!db.authenticate("alice@x", "wrong").unwrap());
        assert!(!db.authenticate("nobody", "secret").unwrap());
        assert!(db.user_exists("alice@x").unwrap());
        assert!(!db.user_exists("bob@x").unwrap());
    }

    #[test]
    fn duplicate_login_rejected() {
        let db = Db::open_memory().unwrap();
        db.create_user("alice@x", "one").unwrap();
        assert!(db.create_user("alice@x", "two").is_err());
    }

    #[test]
    fn stored_password_is_hashed() {
        let db = Db::open_memory().unwrap();
        db.create_user("alice@x", "secret").unwrap();
        let stored: String = db
            .conn
            .query_row("SELECT password FROM users WHERE login = 'alice@x'", [], |r| r.get(0))
            .unwrap();
        assert!(stored.starts_with("$argon2id$"));
        assert!(!stored.contains("secret"));
    }

    #[test]
    fn presence_timestamps_roundtrip() {
        let db = Db::open_memory().unwrap();
        db.create_user("alice@x", "pw").unwrap();

        let online = Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap();
        let offline = Utc.with_ymd_and_hms(2026, 8, 2, 11, 0, 0).unwrap();
        db.update_last_online("alice@x", online).unwrap();
        db.update_last_offline("alice@x", offline).unwrap();

        let (got_online, got_offline) = db.get_status("alice@x").unwrap();
        assert_eq!(got_online, online);
        assert_eq!(got_offline, offline);
    }

    #[test]
    fn contacts_crud() {
        let db = Db::open_memory().unwrap();
        db.add_contact("alice", "bob", "Bobby").unwrap();
        db.add_contact("alice", "carol", "carol").unwrap();

        let contacts = db.get_contacts("alice").unwrap();
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].contact, "bob");
        assert_eq!(contacts[0].nick, "Bobby");

        assert!(db.contact_exists("alice", "bob").unwrap());
        assert!(!db.contact_exists("bob", "alice").unwrap());

        // Duplicate (owner, contact) violates the unique constraint.
        assert!(db.add_contact("alice", "bob", "again").is_err());

        assert!(db.update_nick("alice", "bob", "Robert").unwrap());
        assert!(!db.update_nick("alice", "nobody", "x").unwrap());
        let contacts = db.get_contacts("alice").unwrap();
        assert_eq!(contacts[0].nick, "Robert");

        assert!(db.delete_contact("alice", "bob").unwrap());
        assert!(!db.delete_contact("alice", "bob").unwrap());
        assert_eq!(db.get_contacts("alice").unwrap().len(), 1);
    }

    #[test]
    fn messages_both_directions_ordered() {
        let db = Db::open_memory().unwrap();
        db.save_message("alice", "bob", "one", ts("2026-01-01T10:00:00Z")).unwrap();
        db.save_message("bob", "alice", "two", ts("2026-01-01T10:00:01Z")).unwrap();
        db.save_message("alice", "bob", "three", ts("2026-01-01T10:00:02Z")).unwrap();
        db.save_message("alice", "carol", "other", ts("2026-01-01T10:00:03Z")).unwrap();

        let msgs = db.get_messages("alice", "bob", 0, 100).unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].text, "one");
        assert_eq!(msgs[1].sender, "bob");
        assert_eq!(msgs[2].text, "three");

        let paged = db.get_messages("alice", "bob", 1, 1).unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].text, "two");
    }

    #[test]
    fn ack_is_idempotent_and_keyed() {
        let db = Db::open_memory().unwrap();
        db.save_message("alice", "bob", "hello", ts("2026-01-01T10:00:00Z")).unwrap();

        assert_eq!(db.mark_ack("alice", "bob", "2026-01-01T10:00:00Z").unwrap(), 1);
        let msgs = db.get_messages("alice", "bob", 0, 10).unwrap();
        assert_eq!(msgs[0].status, "ackn");

        // Second ack changes nothing and never regresses the row.
        assert_eq!(db.mark_ack("alice", "bob", "2026-01-01T10:00:00Z").unwrap(), 0);
        assert_eq!(db.get_messages("alice", "bob", 0, 10).unwrap()[0].status, "ackn");

        // Wrong triple matches nothing.
        assert_eq!(db.mark_ack("bob", "alice", "2026-01-01T10:00:00Z").unwrap(), 0);
        assert_eq!(db.mark_ack("alice", "bob", "2026-01-01T10:00:01Z").unwrap(), 0);
    }

    #[test]
    fn clear_history_removes_both_directions() {
        let db = Db::open_memory().unwrap();
        db.save_message("alice", "bob", "a", ts("2026-01-01T10:00:00Z")).unwrap();
        db.save_message("bob", "alice", "b", ts("2026-01-01T10:00:01Z")).unwrap();
        db.save_message("alice", "carol", "keep", ts("2026-01-01T10:00:02Z")).unwrap();

        db.clear_history("alice", "bob").unwrap();
        assert!(db.get_messages("alice", "bob", 0, 10).unwrap().is_empty());
        assert_eq!(db.get_messages("alice", "carol", 0, 10).unwrap().len(), 1);
    }

    #[test]
    fn offline_counts_window() {
        let db = Db::open_memory().unwrap();
        db.create_user("bob", "pw").unwrap();
        db.update_last_offline("bob", ts("2026-01-01T10:00:00Z")).unwrap();
        db.update_last_online("bob", ts("2026-01-01T11:00:00Z")).unwrap();

        // Before the window: not counted.
        db.save_message("alice", "bob", "old", ts("2026-01-01T09:59:59Z")).unwrap();
        // At last_offline exactly: excluded (strictly greater).
        db.save_message("alice", "bob", "edge", ts("2026-01-01T10:00:00Z")).unwrap();
        // Inside the window.
        db.save_message("alice", "bob", "in1", ts("2026-01-01T10:30:00Z")).unwrap();
        db.save_message("carol", "bob", "in2", ts("2026-01-01T10:31:00Z")).unwrap();
        // At last_online exactly: included.
        db.save_message("alice", "bob", "edge2", ts("2026-01-01T11:00:00Z")).unwrap();
        // After the window: not counted.
        db.save_message("alice", "bob", "late", ts("2026-01-01T11:00:01Z")).unwrap();

        let counts = db.offline_counts("bob").unwrap();
        assert_eq!(counts, vec![("alice".to_string(), 2), ("carol".to_string(), 1)]);
    }
}
