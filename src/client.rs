//! ==============================================================================
//! client.rs - spoke side: push readings to the hub
//! ==============================================================================
//!
//! purpose:
//!     delivers a batch of readings over one greeted connection.
//!
//! session:
//!     1. probe the hub; on failure reset the network interface and probe
//!        once more. still down -> Unreachable.
//!     2. connect + handshake, up to `connect_attempts` times with a fixed
//!        back-off. a connection only counts once the greeting was seen.
//!        budget exhausted -> ConnectFailed.
//!     3. per reading: send, wait for "OK...", up to `send_attempts` sends.
//!        budget exhausted -> that reading is abandoned, the rest still go.
//!
//! relationships:
//!     - uses: protocol.rs (encode, greeting marker, ack check)
//!     - uses: hal.rs (LivenessProbe)
//!     - used by: main.rs (spoke role)
//!
//! ==============================================================================

use crate::error::SendError;
use crate::hal::LivenessProbe;
use crate::protocol::{self, Reading, ACK_PREFIX, GREETING_MARKER};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const REPLY_BUFFER: usize = 2048;

/// retry budgets of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    pub send_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            connect_backoff: Duration::from_secs(10),
            send_attempts: 10,
        }
    }
}

/// outcome of a session that got connected
#[derive(Debug, Default)]
pub struct SendReport {
    /// labels acknowledged by the hub
    pub delivered: Vec<String>,
    /// readings given up on, each a `SendError::SendRejected`
    pub abandoned: Vec<SendError>,
}

impl SendReport {
    pub fn all_delivered(&self) -> bool {
        self.abandoned.is_empty()
    }
}

pub struct SensorClient {
    host: String,
    addr: SocketAddr,
    policy: RetryPolicy,
    probe: Arc<dyn LivenessProbe>,
}

impl SensorClient {
    /// `host` is what the probe pings, `addr` where the hub listens
    pub fn new(
        host: impl Into<String>,
        addr: SocketAddr,
        policy: RetryPolicy,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            host: host.into(),
            addr,
            policy,
            probe,
        }
    }

    pub async fn send(&self, readings: &[Reading]) -> Result<SendReport, SendError> {
        self.check_reachable().await?;
        let mut stream = self.connect().await?;

        let mut report = SendReport::default();
        for reading in readings {
            match self.push(&mut stream, reading).await {
                Ok(()) => report.delivered.push(reading.label().to_string()),
                Err(e) => {
                    warn!("{}", e);
                    report.abandoned.push(e);
                }
            }
        }

        if let Err(e) = stream.shutdown().await {
            debug!("shutdown: {}", e);
        }
        Ok(report)
    }

    async fn check_reachable(&self) -> Result<(), SendError> {
        if self.probe_once().await {
            info!("hub {} is available", self.host);
            return Ok(());
        }

        warn!("hub {} not answering, resetting the network interface", self.host);
        let probe = self.probe.clone();
        tokio::task::spawn_blocking(move || probe.reset_interface())
            .await
            .ok();

        if self.probe_once().await {
            info!("hub {} is available after interface reset", self.host);
            Ok(())
        } else {
            Err(SendError::Unreachable(self.host.clone()))
        }
    }

    async fn probe_once(&self) -> bool {
        let probe = self.probe.clone();
        let host = self.host.clone();
        tokio::task::spawn_blocking(move || probe.probe(&host))
            .await
            .unwrap_or(false)
    }

    /// a fresh socket per attempt; only a verified greeting ends the loop
    async fn connect(&self) -> Result<TcpStream, SendError> {
        let attempts = self.policy.connect_attempts;

        for attempt in 1..=attempts {
            match self.try_connect().await {
                Ok(stream) => {
                    info!("connected to {} and welcome text received", self.addr);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(attempt, "can't connect to {}: {}", self.addr, e);
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.connect_backoff).await;
                    }
                }
            }
        }

        Err(SendError::ConnectFailed {
            addr: self.addr,
            attempts,
        })
    }

    async fn try_connect(&self) -> std::io::Result<TcpStream> {
        let mut stream = TcpStream::connect(self.addr).await?;

        let mut greeting = Vec::with_capacity(protocol::GREETING.len());
        let mut buf = [0u8; 256];
        while !greeting.contains(&b'\n') && greeting.len() < REPLY_BUFFER {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            greeting.extend_from_slice(&buf[..n]);
        }

        let text = String::from_utf8_lossy(&greeting);
        if text.contains(GREETING_MARKER) {
            Ok(stream)
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected greeting {:?}", text.trim_end()),
            ))
        }
    }

    async fn push(&self, stream: &mut TcpStream, reading: &Reading) -> Result<(), SendError> {
        let message = reading.encode();
        let attempts = self.policy.send_attempts;

        for attempt in 1..=attempts {
            debug!(attempt, "sending {}", message);
            match exchange(stream, &message).await {
                Ok(reply) if protocol::is_ack(&reply) => {
                    info!("{} sent OK", reading.label());
                    return Ok(());
                }
                Ok(reply) => warn!(
                    attempt,
                    "{} not acknowledged, got {:?}",
                    reading.label(),
                    String::from_utf8_lossy(&reply)
                ),
                Err(e) => warn!(attempt, "{} send failed: {}", reading.label(), e),
            }
        }

        Err(SendError::SendRejected {
            label: reading.label().to_string(),
            attempts,
        })
    }
}

/// write one message and read just enough of the reply to judge it.
///
/// the verdict rests on the first 5 bytes, so reading stops once they are
/// in (or stop matching "OK..."). whatever the hub echoes after that is
/// discarded before the next message goes out.
async fn exchange(stream: &mut TcpStream, message: &str) -> std::io::Result<Vec<u8>> {
    discard_leftover(stream);
    stream.write_all(message.as_bytes()).await?;

    let mut reply = Vec::new();
    let mut buf = [0u8; REPLY_BUFFER];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            if reply.is_empty() {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            break;
        }
        reply.extend_from_slice(&buf[..n]);

        let common = reply.len().min(ACK_PREFIX.len());
        if reply.len() >= ACK_PREFIX.len()
            || reply[..common] != ACK_PREFIX.as_bytes()[..common]
        {
            break;
        }
    }
    Ok(reply)
}

/// drop reply bytes already sitting in the socket, without waiting
fn discard_leftover(stream: &TcpStream) {
    let mut buf = [0u8; REPLY_BUFFER];
    while let Ok(n) = stream.try_read(&mut buf) {
        if n == 0 {
            break;
        }
        debug!("discarding {} leftover reply bytes", n);
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::AssumeReachable;
    use crate::protocol::{now_epoch, Framer, GREETING};
    use crate::registry::{default_labels, FieldRegistry, FieldValue};
    use crate::server::HubServer;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            connect_attempts: attempts,
            connect_backoff: Duration::ZERO,
            send_attempts: attempts,
        }
    }

    fn reading(label: &str, value: &str) -> Reading {
        Reading::new(label, value, now_epoch()).unwrap()
    }

    #[derive(Default)]
    struct CountingProbe {
        up_after_reset: bool,
        probes: AtomicUsize,
        resets: AtomicUsize,
    }

    impl LivenessProbe for CountingProbe {
        fn probe(&self, _host: &str) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.up_after_reset && self.resets.load(Ordering::SeqCst) > 0
        }

        fn reset_interface(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn free_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn unreachable_after_one_reset() {
        let probe = Arc::new(CountingProbe::default());
        let client = SensorClient::new("10.0.0.99", free_addr().await, quick(3), probe.clone());

        let err = client.send(&[reading("sense001", "1.00")]).await.unwrap_err();
        assert!(matches!(err, SendError::Unreachable(_)));
        assert!(err.is_fatal());
        assert_eq!(probe.probes.load(Ordering::SeqCst), 2);
        assert_eq!(probe.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_recovers_reachability() {
        let probe = Arc::new(CountingProbe {
            up_after_reset: true,
            ..Default::default()
        });
        // nothing listens there, so the session then fails on connect
        let client = SensorClient::new("127.0.0.1", free_addr().await, quick(2), probe.clone());

        let err = client.send(&[]).await.unwrap_err();
        assert!(matches!(err, SendError::ConnectFailed { attempts: 2, .. }));
        assert_eq!(probe.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_stops_after_budget() {
        // a server that never says the right thing
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let (mut s, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = s.write_all(b"Go away\n").await;
            }
        });

        let client = SensorClient::new("127.0.0.1", addr, quick(10), Arc::new(AssumeReachable));
        let err = client.send(&[reading("sense001", "1.00")]).await.unwrap_err();

        match err {
            SendError::ConnectFailed { attempts, .. } => assert_eq!(attempts, 10),
            other => panic!("expected ConnectFailed, got {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn connect_refused_is_fatal() {
        let client = SensorClient::new(
            "127.0.0.1",
            free_addr().await,
            quick(3),
            Arc::new(AssumeReachable),
        );
        let err = client.send(&[]).await.unwrap_err();
        assert!(matches!(err, SendError::ConnectFailed { attempts: 3, .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn rejected_reading_is_abandoned_and_session_continues() {
        // greets, then refuses sense001 and acks everything else
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
        let log = seen.clone();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(GREETING.as_bytes()).await.unwrap();
            let mut framer = Framer::new(1024);
            let mut buf = [0u8; 1024];
            loop {
                let n = s.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                for msg in framer.push(&buf[..n]) {
                    let label = String::from_utf8_lossy(&msg[..8]).into_owned();
                    *log.lock().unwrap().entry(label.clone()).or_default() += 1;
                    let reply = if label == "sense001" {
                        b"NOPE\n".to_vec()
                    } else {
                        protocol::ack(&msg)
                    };
                    s.write_all(&reply).await.unwrap();
                }
            }
        });

        let client = SensorClient::new("127.0.0.1", addr, quick(10), Arc::new(AssumeReachable));
        let report = client
            .send(&[reading("sense001", "21.34"), reading("sense002", "07.50")])
            .await
            .unwrap();

        assert_eq!(report.delivered, vec!["sense002".to_string()]);
        assert_eq!(report.abandoned.len(), 1);
        match &report.abandoned[0] {
            SendError::SendRejected { label, attempts } => {
                assert_eq!(label, "sense001");
                assert_eq!(*attempts, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!report.abandoned[0].is_fatal());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.get("sense001"), Some(&10));
        assert_eq!(seen.get("sense002"), Some(&1));
    }

    #[tokio::test]
    async fn bare_ack_without_echo_counts_as_delivered() {
        // greets, then answers each message with nothing but "OK...\n"
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(GREETING.as_bytes()).await.unwrap();
            let mut framer = Framer::new(1024);
            let mut buf = [0u8; 1024];
            loop {
                let n = s.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                for _ in framer.push(&buf[..n]) {
                    s.write_all(b"OK...\n").await.unwrap();
                }
            }
        });

        let client = SensorClient::new("127.0.0.1", addr, quick(3), Arc::new(AssumeReachable));
        let report = tokio::time::timeout(
            Duration::from_secs(3),
            client.send(&[reading("sense001", "21.34"), reading("sense002", "07.50")]),
        )
        .await
        .expect("client waited past a complete ack")
        .unwrap();

        assert!(report.all_delivered());
        assert_eq!(report.delivered, vec!["sense001", "sense002"]);
    }

    #[tokio::test]
    async fn delivers_to_a_real_hub() {
        let registry = FieldRegistry::spawn(default_labels());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub = HubServer::new(listener, registry.clone(), 4, 1024);
        let addr = hub.local_addr().unwrap();
        tokio::spawn(hub.serve(std::future::pending()));

        let client = SensorClient::new(
            "127.0.0.1",
            addr,
            RetryPolicy::default(),
            Arc::new(AssumeReachable),
        );
        let report = client
            .send(&[reading("sense001", "21.34"), reading("sense002", "-12.3")])
            .await
            .unwrap();
        assert!(report.all_delivered());
        assert_eq!(report.delivered, vec!["sense001", "sense002"]);

        for _ in 0..200 {
            let snap = registry.snapshot().await.unwrap();
            if snap.get("sense002") == Some(&FieldValue::Fresh("-12.3".into())) {
                assert_eq!(snap.get("sense001"), Some(&FieldValue::Fresh("21.34".into())));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("readings never reached the registry");
    }
}
