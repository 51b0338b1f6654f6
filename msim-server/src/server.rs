//! Server state and TCP listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::connection;
use crate::control;
use crate::db::Db;
use crate::protocol::{format_packet, format_ts};
use crate::transfer::TransferManager;

/// An authenticated session: a login bound to the writer queue of its
/// connection. Lifetime = lifetime of the connection.
pub struct Session {
    pub login: String,
    /// Sender for queueing lines to this client's writer task.
    pub tx: mpsc::Sender<String>,
    /// Signalled when the session is evicted (re-auth elsewhere) or the
    /// server shuts down; the connection's read loop exits on it.
    pub kicked: Notify,
}

/// Shared state accessible by all connection handlers.
pub struct SharedState {
    pub config: ServerConfig,
    /// Database handle. rusqlite connections are not Sync, so all repository
    /// calls go through this mutex; callers must not hold the guard across
    /// an await point or another lock() call.
    pub db: Mutex<Db>,
    /// login -> active session.
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    pub transfers: Arc<TransferManager>,
}

impl SharedState {
    /// Bind a login to a session. Returns the session previously holding the
    /// login, if any (the caller evicts it).
    pub fn insert_session(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .unwrap()
            .insert(session.login.clone(), session)
    }

    /// Remove a session, but only while the registry still maps the login to
    /// this very session — an evicted connection must not remove its
    /// replacement. Returns whether the entry was removed.
    pub fn remove_session(&self, login: &str, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get(login) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(login);
                true
            }
            _ => false,
        }
    }

    pub fn get_session(&self, login: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(login).cloned()
    }

    pub fn is_online(&self, login: &str) -> bool {
        self.sessions.read().unwrap().contains_key(login)
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    /// Queue a line to a user's connection if they are online. Delivery is
    /// best-effort: a full or closed queue is logged and dropped.
    pub fn send_to(&self, login: &str, line: String) -> bool {
        let Some(session) = self.get_session(login) else {
            return false;
        };
        if session.tx.try_send(line).is_err() {
            tracing::warn!(login, "Send buffer full or closed, dropping line");
            return false;
        }
        true
    }

    /// Presence fan-out: notify each of `login`'s currently online contacts
    /// with `on|login|ts` or `off|login|ts`. Best-effort.
    pub fn notify_presence(&self, login: &str, event: &str, t: DateTime<Utc>) {
        let contacts = match self.db.lock().unwrap().get_contacts(login) {
            Ok(contacts) => contacts,
            Err(e) => {
                tracing::error!(login, "Presence fan-out contact lookup failed: {e}");
                return;
            }
        };

        let ts = format_ts(t);
        for contact in contacts {
            if self.is_online(&contact.contact) {
                self.send_to(&contact.contact, format_packet(event, &[login, &ts]));
            }
        }
    }

    /// Server statistics for the operator channel.
    pub fn stats(&self) -> String {
        let sessions = self.sessions.read().unwrap();
        let mut users: Vec<&str> = sessions.keys().map(String::as_str).collect();
        users.sort_unstable();
        format!("connections={},users={}", sessions.len(), users.join(";"))
    }

    /// Administrative shutdown: send every session `bye|reason|[completion]`,
    /// persist its offline time, and drop it from the registry. The caller
    /// decides when to exit the process.
    pub fn shutdown(&self, reason: &str, completion: Option<DateTime<Utc>>) {
        let sessions = self.snapshot();
        tracing::info!(reason, count = sessions.len(), "Shutting down sessions");

        let line = match completion {
            Some(t) => format_packet("bye", &[reason, &format_ts(t)]),
            None => format_packet("bye", &[reason]),
        };
        let now = Utc::now();
        for session in sessions {
            let _ = session.tx.try_send(line.clone());
            if let Err(e) = self.db.lock().unwrap().update_last_offline(&session.login, now) {
                tracing::error!(login = %session.login, "Failed to update last_offline: {e}");
            }
            self.remove_session(&session.login, &session);
            session.kicked.notify_one();
        }
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Build SharedState, opening the database and the transfer broker.
    fn build_state(&self) -> Result<Arc<SharedState>> {
        tracing::info!("Opening database: {}", self.config.db_path);
        let db = Db::open(&self.config.db_path)
            .with_context(|| format!("Failed to open database at {}", self.config.db_path))?;

        let (range_start, range_end) = self.config.file_port_range();
        let transfers = Arc::new(TransferManager::new(range_start, range_end));

        Ok(Arc::new(SharedState {
            config: self.config.clone(),
            db: Mutex::new(db),
            sessions: RwLock::new(HashMap::new()),
            transfers,
        }))
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        Arc::clone(&state.transfers).start_sweeper();
        control::spawn(Arc::clone(&state), state.config.control_socket.clone());

        // SIGINT/SIGTERM drain sessions like an operator shutdown.
        {
            let signal_state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut sigterm =
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::error!("Failed to install SIGTERM handler: {e}");
                            return;
                        }
                    };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                tracing::info!("Received shutdown signal");
                signal_state.shutdown("maintenance", None);
                let _ = std::fs::remove_file(&signal_state.config.control_socket);
                std::process::exit(0);
            });
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("Failed to bind port {}", self.config.port))?;
        tracing::info!("MSIM server listening on port {}", self.config.port);

        loop {
            let (stream, _addr) = listener.accept().await?;
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                if let Err(e) = connection::handle(stream, state).await {
                    tracing::error!("Connection error: {e}");
                }
            });
        }
    }

    /// Start the server on an ephemeral port and return the bound address,
    /// the shared state, and the accept-loop handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(("127.0.0.1", self.config.port)).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let state = self.build_state()?;
        Arc::clone(&state.transfers).start_sweeper();

        let loop_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _addr) = listener.accept().await?;
                let state = Arc::clone(&loop_state);
                tokio::spawn(async move {
                    if let Err(e) = connection::handle(stream, state).await {
                        tracing::error!("Connection error: {e}");
                    }
                });
            }
        });

        Ok((addr, state, handle))
    }
}
