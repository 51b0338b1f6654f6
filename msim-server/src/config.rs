//! Server configuration.
//!
//! Every option is available both as a long flag and as an `MSIM_*`
//! environment variable; flags win.

use std::time::Duration;

use clap::Parser;

pub const DEFAULT_FILE_PORT_START: u16 = 35000;
pub const DEFAULT_FILE_PORT_END: u16 = 35999;

#[derive(Parser, Debug, Clone)]
#[command(name = "msim-server", about = "mSIM instant-messaging server")]
pub struct ServerConfig {
    /// TCP port for the client control channel.
    #[arg(long, env = "MSIM_PORT", default_value_t = 3215)]
    pub port: u16,

    /// Path to the SQLite database file.
    #[arg(long, env = "MSIM_DB_PATH", default_value = "msim.db")]
    pub db_path: String,

    /// Seconds of silence before an authenticated session is considered idle.
    #[arg(long, env = "MSIM_READ_TIMEOUT", default_value_t = 120)]
    pub read_timeout_secs: u64,

    /// Deadline in seconds for each outbound frame.
    #[arg(long, env = "MSIM_WRITE_TIMEOUT", default_value_t = 30)]
    pub write_timeout_secs: u64,

    /// First port of the file-transfer data range (0 = default range).
    #[arg(long, env = "MSIM_FILE_PORT_START", default_value_t = DEFAULT_FILE_PORT_START)]
    pub file_port_start: u16,

    /// Last port of the file-transfer data range (0 = default range).
    #[arg(long, env = "MSIM_FILE_PORT_END", default_value_t = DEFAULT_FILE_PORT_END)]
    pub file_port_end: u16,

    /// Unix socket for operator commands (stats, shutdown).
    #[arg(long, env = "MSIM_CONTROL_SOCKET", default_value = "/tmp/msim.sock")]
    pub control_socket: String,
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// File-transfer port range, with zero endpoints falling back to the
    /// default range.
    pub fn file_port_range(&self) -> (u16, u16) {
        let start = if self.file_port_start == 0 {
            DEFAULT_FILE_PORT_START
        } else {
            self.file_port_start
        };
        let end = if self.file_port_end == 0 {
            DEFAULT_FILE_PORT_END
        } else {
            self.file_port_end
        };
        (start, end)
    }
}
