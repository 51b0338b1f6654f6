#![allow(dead_code)]
//! Shared harness: starts a real server on an ephemeral port and speaks the
//! wire protocol over TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use msim_server::config::ServerConfig;
use msim_server::server::{Server, SharedState};

pub fn test_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        db_path: ":memory:".to_string(),
        read_timeout_secs: 120,
        write_timeout_secs: 5,
        file_port_start: 0,
        file_port_end: 0,
        control_socket: "/tmp/msim-test.sock".to_string(),
    }
}

pub async fn start_server(config: ServerConfig) -> (SocketAddr, Arc<SharedState>) {
    let (addr, state, _handle) = Server::new(config).start().await.unwrap();
    (addr, state)
}

/// One protocol client over a live TCP connection.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Client {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Send one protocol line (newline appended).
    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    /// Receive one line, without the trailing newline.
    pub async fn recv(&mut self) -> String {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .expect("read failed");
        assert!(n > 0, "connection closed while expecting a line");
        line.trim_end_matches(|c| c == '\r' || c == '\n').to_string()
    }

    /// Receive lines until one starts with `prefix`, skipping interleaved
    /// notifications.
    pub async fn recv_until(&mut self, prefix: &str) -> String {
        for _ in 0..20 {
            let line = self.recv().await;
            if line.starts_with(prefix) {
                return line;
            }
        }
        panic!("no line starting with {prefix:?} arrived");
    }

    /// Assert the peer closed the connection.
    pub async fn expect_closed(&mut self) {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for close")
            .expect("read failed");
        assert_eq!(n, 0, "expected close, got {line:?}");
    }

    pub async fn register(&mut self, login: &str, password: &str) {
        self.send(&format!("reg|{login}|{password}")).await;
        assert_eq!(self.recv().await, "ok|reg");
    }

    pub async fn auth(&mut self, login: &str, password: &str) {
        self.send(&format!("auth|{login}|{password}")).await;
        assert_eq!(self.recv().await, "ok|auth");
    }

    pub async fn register_and_auth(&mut self, login: &str, password: &str) {
        self.register(login, password).await;
        self.auth(login, password).await;
    }
}
