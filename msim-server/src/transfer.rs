//! File-transfer broker.
//!
//! Each transfer gets a short-lived session: the initiator's `fsnd` creates
//! it in `pending`; the recipient's `facc` reserves two ports from the
//! configured range, binds a listener on each, and a proxy task splices the
//! upload stream into the download stream without inspecting payload bytes.
//! A sweeper reaps sessions past their expiry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How long a pending session waits for the recipient to accept.
pub const PENDING_TTL: Duration = Duration::from_secs(300);
/// How long an accepted session may take to finish the transfer.
pub const ACTIVE_TTL: Duration = Duration::from_secs(600);
/// Sweeper period.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const COPY_BUF_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("session not found")]
    SessionNotFound,

    #[error("session not in pending state")]
    SessionNotPending,

    #[error("no available ports")]
    NoAvailablePorts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Accepted,
    Transferring,
    Completed,
    Declined,
    Cancelled,
    Error,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Accepted => "accepted",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Completed => "completed",
            TransferStatus::Declined => "declined",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Error => "error",
        }
    }

    /// Terminal states hold no ports and accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Declined
                | TransferStatus::Cancelled
                | TransferStatus::Error
        )
    }
}

struct TransferState {
    status: TransferStatus,
    upload_port: Option<u16>,
    download_port: Option<u16>,
    expires_at: Instant,
}

/// One brokered transfer between two authenticated users.
pub struct FileTransfer {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub filename: String,
    pub size: u64,
    pub hash: String,
    state: Mutex<TransferState>,
    bytes: AtomicU64,
    cancel: Notify,
}

impl FileTransfer {
    pub fn status(&self) -> TransferStatus {
        self.state.lock().unwrap().status
    }

    /// Bytes copied so far (observable progress for `fst`).
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Does this login participate in the session?
    pub fn involves(&self, login: &str) -> bool {
        self.sender == login || self.recipient == login
    }

    fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Move from `from` to `to`; returns false if some other transition got
    /// there first (e.g. a cancellation racing the proxy).
    fn transition(&self, from: TransferStatus, to: TransferStatus) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.status == from {
            st.status = to;
            true
        } else {
            false
        }
    }

    async fn cancelled(&self) {
        self.cancel.notified().await;
    }
}

/// Broker state: the session map and the reserved port pool.
pub struct TransferManager {
    sessions: RwLock<HashMap<String, Arc<FileTransfer>>>,
    used_ports: Mutex<HashSet<u16>>,
    range_start: u16,
    range_end: u16,
}

impl TransferManager {
    pub fn new(range_start: u16, range_end: u16) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            used_ports: Mutex::new(HashSet::new()),
            range_start,
            range_end,
        }
    }

    /// Create a new session in `pending`.
    pub fn create(
        &self,
        sender: &str,
        recipient: &str,
        filename: &str,
        size: u64,
        hash: &str,
    ) -> Arc<FileTransfer> {
        let id = format!("{:08x}", rand::random::<u32>());
        let session = Arc::new(FileTransfer {
            id: id.clone(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            filename: filename.to_string(),
            size,
            hash: hash.to_string(),
            state: Mutex::new(TransferState {
                status: TransferStatus::Pending,
                upload_port: None,
                download_port: None,
                expires_at: Instant::now() + PENDING_TTL,
            }),
            bytes: AtomicU64::new(0),
            cancel: Notify::new(),
        });

        self.sessions
            .write()
            .unwrap()
            .insert(id.clone(), Arc::clone(&session));
        tracing::info!(
            session = %id,
            sender,
            recipient,
            filename,
            size,
            "Created file transfer session"
        );
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<FileTransfer>> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    /// Accept a pending session: reserve and bind two data ports, start the
    /// proxy, and return `(session, upload_port, download_port)`.
    pub async fn accept(
        self: &Arc<Self>,
        id: &str,
    ) -> Result<(Arc<FileTransfer>, u16, u16), TransferError> {
        let session = self.get(id).ok_or(TransferError::SessionNotFound)?;

        // Claim the session before binding so a concurrent accept fails fast.
        if !session.transition(TransferStatus::Pending, TransferStatus::Accepted) {
            return Err(TransferError::SessionNotPending);
        }

        let (upload_port, upload_listener) = match self.bind_in_range().await {
            Ok(pair) => pair,
            Err(e) => {
                session.transition(TransferStatus::Accepted, TransferStatus::Pending);
                return Err(e);
            }
        };
        let (download_port, download_listener) = match self.bind_in_range().await {
            Ok(pair) => pair,
            Err(e) => {
                self.release_port(upload_port);
                session.transition(TransferStatus::Accepted, TransferStatus::Pending);
                return Err(e);
            }
        };

        {
            let mut st = session.state.lock().unwrap();
            st.upload_port = Some(upload_port);
            st.download_port = Some(download_port);
            st.expires_at = Instant::now() + ACTIVE_TTL;
        }

        tokio::spawn(run_proxy(
            Arc::clone(self),
            Arc::clone(&session),
            upload_listener,
            download_listener,
        ));

        tracing::info!(
            session = %id,
            upload_port,
            download_port,
            "Accepted file transfer session"
        );
        Ok((session, upload_port, download_port))
    }

    /// Decline a pending session.
    pub fn decline(&self, id: &str) -> Result<Arc<FileTransfer>, TransferError> {
        let session = self.get(id).ok_or(TransferError::SessionNotFound)?;
        if !session.transition(TransferStatus::Pending, TransferStatus::Declined) {
            return Err(TransferError::SessionNotPending);
        }
        tracing::info!(session = %id, "Declined file transfer session");
        Ok(session)
    }

    /// Cancel a session from either side. Cancelling a session that already
    /// reached a terminal state is a no-op.
    pub fn cancel(&self, id: &str) -> Result<Arc<FileTransfer>, TransferError> {
        let session = self.get(id).ok_or(TransferError::SessionNotFound)?;
        {
            let mut st = session.state.lock().unwrap();
            if st.status.is_terminal() {
                drop(st);
                return Ok(session);
            }
            st.status = TransferStatus::Cancelled;
        }
        // Wake the proxy (stores a permit, so a proxy that has not reached
        // its select yet still observes the cancellation).
        session.cancel.notify_one();
        tracing::info!(session = %id, "Cancelled file transfer session");
        Ok(session)
    }

    /// Spawn the background sweeper that reaps expired sessions.
    pub fn start_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // skip first immediate tick
            loop {
                interval.tick().await;
                self.sweep(Instant::now());
            }
        });
    }

    fn sweep(&self, now: Instant) {
        let expired: Vec<Arc<FileTransfer>> = self
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.state.lock().unwrap().expires_at <= now)
            .cloned()
            .collect();

        for session in expired {
            let was_active = {
                let mut st = session.state.lock().unwrap();
                if st.status.is_terminal() {
                    false
                } else {
                    st.status = TransferStatus::Cancelled;
                    true
                }
            };
            if was_active {
                tracing::info!(session = %session.id, "Cleaning expired file transfer session");
                session.cancel.notify_one();
            }
            self.release_ports(&session);
            self.sessions.write().unwrap().remove(&session.id);
        }
    }

    /// Number of reserved ports (for tests and stats).
    pub fn ports_in_use(&self) -> usize {
        self.used_ports.lock().unwrap().len()
    }

    /// Reserve the lowest free port in the range.
    fn allocate_port(&self) -> Result<u16, TransferError> {
        let mut used = self.used_ports.lock().unwrap();
        for port in self.range_start..=self.range_end {
            if used.insert(port) {
                return Ok(port);
            }
        }
        Err(TransferError::NoAvailablePorts)
    }

    fn release_port(&self, port: u16) {
        self.used_ports.lock().unwrap().remove(&port);
    }

    /// Reserve a port and bind a listener on it. A reserved port that fails
    /// to bind (something else on the host grabbed it) stays marked used and
    /// the scan moves on.
    async fn bind_in_range(&self) -> Result<(u16, TcpListener), TransferError> {
        loop {
            let port = self.allocate_port()?;
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => return Ok((port, listener)),
                Err(e) => {
                    tracing::warn!(port, "Reserved data port failed to bind: {e}");
                }
            }
        }
    }

    fn release_ports(&self, session: &FileTransfer) {
        let (upload, download) = {
            let mut st = session.state.lock().unwrap();
            (st.upload_port.take(), st.download_port.take())
        };
        let mut used = self.used_ports.lock().unwrap();
        if let Some(port) = upload {
            used.remove(&port);
        }
        if let Some(port) = download {
            used.remove(&port);
        }
    }
}

/// Wait for both data connections, then copy upload → download until EOF or
/// error. Payload bytes are never inspected. Ports release on every exit
/// path.
async fn run_proxy(
    manager: Arc<TransferManager>,
    session: Arc<FileTransfer>,
    upload_listener: TcpListener,
    download_listener: TcpListener,
) {
    let deadline = session.state.lock().unwrap().expires_at;

    let accepted = tokio::select! {
        result = async { tokio::try_join!(upload_listener.accept(), download_listener.accept()) } => {
            match result {
                Ok(((upload, _), (download, _))) => Some((upload, download)),
                Err(e) => {
                    tracing::warn!(session = %session.id, "Data accept error: {e}");
                    None
                }
            }
        }
        _ = session.cancelled() => None,
        _ = tokio::time::sleep_until(deadline) => {
            tracing::info!(session = %session.id, "Timed out waiting for data connections");
            None
        }
    };
    // No further data connections are expected either way.
    drop(upload_listener);
    drop(download_listener);

    let Some((mut upload, mut download)) = accepted else {
        session.transition(TransferStatus::Accepted, TransferStatus::Cancelled);
        manager.release_ports(&session);
        return;
    };

    if !session.transition(TransferStatus::Accepted, TransferStatus::Transferring) {
        // Cancelled between accept and both connections coming up.
        manager.release_ports(&session);
        return;
    }
    tracing::info!(session = %session.id, "Starting file transfer");

    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let outcome = loop {
        tokio::select! {
            read = upload.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    if let Err(e) = download.write_all(&buf[..n]).await {
                        break Err(e);
                    }
                    session.add_bytes(n as u64);
                }
                Err(e) => break Err(e),
            },
            _ = session.cancelled() => {
                tracing::info!(session = %session.id, "File transfer cancelled mid-stream");
                manager.release_ports(&session);
                return;
            }
        }
    };

    match outcome {
        Ok(()) => {
            session.transition(TransferStatus::Transferring, TransferStatus::Completed);
            tracing::info!(
                session = %session.id,
                bytes = session.bytes_transferred(),
                "File transfer completed"
            );
        }
        Err(e) => {
            session.transition(TransferStatus::Transferring, TransferStatus::Error);
            tracing::warn!(session = %session.id, "File transfer error: {e}");
        }
    }

    // Flush the FIN towards the receiver before releasing resources.
    let _ = download.shutdown().await;
    manager.release_ports(&session);
    tracing::info!(
        session = %session.id,
        status = session.status().as_str(),
        "File transfer session finished"
    );
}
