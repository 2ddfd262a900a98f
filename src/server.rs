//! ==============================================================================
//! server.rs - the hub's tcp socket server
//! ==============================================================================
//!
//! purpose:
//!     accepts satellite connections, greets them, acknowledges every
//!     message and feeds decoded readings into the field registry.
//!
//! per-connection lifecycle:
//!
//! ```text
//!     LISTENING -> ACCEPTED -> GREETED -> ACTIVE (one loop per read) -> CLOSED
//! ```
//!
//! ```text
//!     a zero-length read (peer closed) is the only way a handler ends on
//!     its own. reads and writes have no timeout, so a silent peer keeps its
//!     handler, and its connection permit, until it closes or the process
//!     exits.
//! ```
//!
//! relationships:
//!     - uses: protocol.rs (greeting, framing, ack, decode)
//!     - uses: registry.rs (RegistryHandle for updates)
//!     - used by: main.rs (hub role)
//!
//! ==============================================================================

use crate::config::HubConfig;
use crate::error::ServerError;
use crate::protocol::{self, DecodeError, Framer, GREETING};
use crate::registry::{FieldValue, RegistryHandle};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Greeted,
    Active,
    Closed,
}

/// what a finished handler saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub peer: SocketAddr,
    pub state: ConnectionState,
    /// messages acknowledged
    pub messages: usize,
    /// messages that updated the registry
    pub decoded: usize,
}

pub struct HubServer {
    listener: TcpListener,
    registry: RegistryHandle,
    permits: Arc<Semaphore>,
    read_buffer: usize,
}

/// bind, retrying immediately up to `attempts` times
pub async fn bind_with_retry(addr: &str, attempts: u32) -> Result<TcpListener, ServerError> {
    let mut last_err = None;

    for attempt in 1..=attempts {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!("socket bind complete on {}", addr);
                return Ok(listener);
            }
            Err(e) => {
                warn!("try {}: bind to {} failed: {}", attempt, addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(ServerError::BindFailed {
        addr: addr.to_string(),
        attempts,
        source: last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "no bind attempts allowed")
        }),
    })
}

impl HubServer {
    pub fn new(
        listener: TcpListener,
        registry: RegistryHandle,
        max_connections: usize,
        read_buffer: usize,
    ) -> Self {
        Self {
            listener,
            registry,
            permits: Arc::new(Semaphore::new(max_connections)),
            read_buffer,
        }
    }

    /// bind per `config` and wrap the listener
    pub async fn bind(config: &HubConfig, registry: RegistryHandle) -> Result<Self, ServerError> {
        let listener = bind_with_retry(&config.bind_address(), config.bind_attempts).await?;
        Ok(Self::new(
            listener,
            registry,
            config.max_connections,
            config.read_buffer,
        ))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// accept until `shutdown` resolves. handlers already running are left
    /// alone; they end when their peer closes or the runtime stops.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("socket now listening on {}", self.local_addr()?);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            info!(%peer, "connected");
            let registry = self.registry.clone();
            let read_buffer = self.read_buffer;

            tokio::spawn(async move {
                let _permit = permit;
                match handle_connection(stream, peer, registry, read_buffer).await {
                    Ok(summary) => info!(
                        %peer,
                        messages = summary.messages,
                        decoded = summary.decoded,
                        "no more data, connection closed"
                    ),
                    Err(e) => warn!(%peer, "connection dropped: {}", e),
                }
            });
        }

        info!("closing listener");
        Ok(())
    }
}

/// greet, then ack and decode every message until the peer closes
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: RegistryHandle,
    read_buffer: usize,
) -> std::io::Result<ConnectionSummary> {
    let mut summary = ConnectionSummary {
        peer,
        state: ConnectionState::Accepted,
        messages: 0,
        decoded: 0,
    };

    stream.write_all(GREETING.as_bytes()).await?;
    summary.state = ConnectionState::Greeted;
    debug!(%peer, "greeted");

    let mut framer = Framer::new(read_buffer);
    let mut buf = vec![0u8; read_buffer];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        summary.state = ConnectionState::Active;

        for frame in framer.push(&buf[..n]) {
            let message = String::from_utf8_lossy(&frame);
            debug!(%peer, "data received: {:?}", message);
            stream.write_all(&protocol::ack(&frame)).await?;
            summary.messages += 1;

            if record(&message, &registry).await {
                summary.decoded += 1;
            }
        }
    }

    if !framer.pending().is_empty() {
        debug!(
            %peer,
            "discarding {} unterminated bytes",
            framer.pending().len()
        );
    }

    summary.state = ConnectionState::Closed;
    Ok(summary)
}

/// decode one message and hand it to the registry
async fn record(message: &str, registry: &RegistryHandle) -> bool {
    let reading = match protocol::decode(message, registry.labels()) {
        Ok(r) => r,
        Err(DecodeError::UnrecognizedLabel(label)) => {
            debug!("ignoring message for unrecognized label {:?}", label);
            return false;
        }
        Err(e) => {
            debug!("could not decode {:?}: {}", message, e);
            return false;
        }
    };

    let value = FieldValue::classify(reading.value(), reading.epoch(), protocol::now_epoch());
    if value == FieldValue::Stale {
        info!(
            label = reading.label(),
            sent = reading.epoch(),
            "reading older than the freshness window"
        );
    }

    registry.update(reading.label(), value).await
}
