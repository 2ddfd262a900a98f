//! Error types for the hub and the spoke client

use std::net::SocketAddr;

/// Failures of a spoke session
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Liveness probe failed, even after resetting the network interface
    #[error("hub {0} unreachable after interface reset")]
    Unreachable(String),

    /// No greeted connection within the attempt budget
    #[error("could not connect to hub {addr} after {attempts} attempts")]
    ConnectFailed { addr: SocketAddr, attempts: u32 },

    /// One reading was never acknowledged; the session carries on
    #[error("reading {label} not acknowledged after {attempts} sends")]
    SendRejected { label: String, attempts: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SendError {
    /// true for failures that end the whole session
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SendError::SendRejected { .. })
    }
}

/// Failures of the hub
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind to {addr} failed after {attempts} attempts: {source}")]
    BindFailed {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
