//! ==============================================================================
//! registry.rs - field registry owned by a single actor task
//! ==============================================================================
//!
//! purpose:
//!     holds the last known value for every configured label.
//!     connection handlers never touch the map directly; they send updates
//!     through a channel and the actor applies them in arrival order.
//!
//! update semantics:
//!     last write wins by ARRIVAL at the actor, not by the epoch embedded in
//!     the message. two satellites reporting the same label out of order
//!     will leave the older reading in place.
//!
//! relationships:
//!     - used by: server.rs (handlers send updates)
//!     - used by: status.rs (snapshot for the json api)
//!
//! ==============================================================================

use crate::protocol::{FRESHNESS_WINDOW_SECS, STALE_SENTINEL};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// value stored against a label
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// known label, nothing received since start
    NotSet,
    Fresh(String),
    /// received, but older than the freshness window
    Stale,
}

impl FieldValue {
    /// classify a reading sent at `sent_epoch` as seen at `now`.
    /// an age that does not fit in an i64 counts as stale.
    pub fn classify(value: &str, sent_epoch: i64, now: i64) -> Self {
        let fresh = now
            .checked_sub(sent_epoch)
            .is_some_and(|age| age < FRESHNESS_WINDOW_SECS);
        if fresh {
            FieldValue::Fresh(value.to_string())
        } else {
            FieldValue::Stale
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldValue::NotSet => "not set",
            FieldValue::Fresh(v) => v,
            FieldValue::Stale => STALE_SENTINEL,
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// point-in-time copy of the registry
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub fields: BTreeMap<String, FieldValue>,
    /// unix timestamp (ms) of the last applied update, 0 if none
    pub last_update: u64,
}

impl Snapshot {
    pub fn get(&self, label: &str) -> Option<&FieldValue> {
        self.fields.get(label)
    }
}

enum Command {
    Update { label: String, value: FieldValue },
    Snapshot { reply: oneshot::Sender<Snapshot> },
}

/// cheap, cloneable sender side of the registry
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
    labels: std::sync::Arc<Vec<String>>,
}

impl RegistryHandle {
    /// labels the registry accepts
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// queue an update. labels outside the configured set are dropped by
    /// the actor. returns false once the actor has gone away.
    pub async fn update(&self, label: impl Into<String>, value: FieldValue) -> bool {
        self.tx
            .send(Command::Update {
                label: label.into(),
                value,
            })
            .await
            .is_ok()
    }

    /// snapshot taken after every update queued before this call
    pub async fn snapshot(&self) -> Option<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Snapshot { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// the actor's private state
pub struct FieldRegistry {
    fields: BTreeMap<String, FieldValue>,
    last_update: u64,
    rx: mpsc::Receiver<Command>,
}

impl FieldRegistry {
    /// spawn the registry actor for `labels`; it lives until every handle
    /// is dropped
    pub fn spawn(labels: Vec<String>) -> RegistryHandle {
        let (tx, rx) = mpsc::channel(256);
        let fields = labels
            .iter()
            .map(|l| (l.clone(), FieldValue::NotSet))
            .collect();

        let registry = FieldRegistry {
            fields,
            last_update: 0,
            rx,
        };
        tokio::spawn(registry.run());

        RegistryHandle {
            tx,
            labels: std::sync::Arc::new(labels),
        }
    }

    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Update { label, value } => self.apply(label, value),
                Command::Snapshot { reply } => {
                    let _ = reply.send(Snapshot {
                        fields: self.fields.clone(),
                        last_update: self.last_update,
                    });
                }
            }
        }
        debug!("registry actor stopped");
    }

    fn apply(&mut self, label: String, value: FieldValue) {
        match self.fields.get_mut(&label) {
            Some(slot) => {
                info!(label = %label, value = value.as_str(), "field updated");
                *slot = value;
                self.last_update = timestamp_ms();
            }
            None => debug!(label = %label, "ignoring update for unknown label"),
        }
    }
}

/// unix timestamp in milliseconds
fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// labels of the two satellite families on the home network
pub fn default_labels() -> Vec<String> {
    let mut labels = Vec::new();
    for n in 1..=5 {
        labels.push(format!("AQsys{:03}", n));
    }
    for n in 1..=5 {
        labels.push(format!("sense{:03}", n));
    }
    labels
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_at_window_boundary() {
        let now = 1_700_000_300;
        assert_eq!(
            FieldValue::classify("21.34", now - 299, now),
            FieldValue::Fresh("21.34".into())
        );
        assert_eq!(FieldValue::classify("21.34", now - 300, now), FieldValue::Stale);
        assert_eq!(FieldValue::classify("21.34", now - 301, now), FieldValue::Stale);
        assert_eq!(
            FieldValue::classify("21.34", now, now),
            FieldValue::Fresh("21.34".into())
        );
    }

    #[test]
    fn classify_survives_extreme_epochs() {
        let now = 1_700_000_000;
        assert_eq!(FieldValue::classify("1.0", i64::MIN, now), FieldValue::Stale);
        assert_eq!(FieldValue::classify("1.0", i64::MIN, 0), FieldValue::Stale);
        assert_eq!(
            FieldValue::classify("1.0", i64::MAX, now),
            FieldValue::Fresh("1.0".into())
        );
        assert_eq!(FieldValue::classify("1.0", i64::MAX, -2), FieldValue::Stale);
    }

    #[test]
    fn stale_renders_sentinel() {
        assert_eq!(FieldValue::Stale.as_str(), "*too old!*");
        assert_eq!(FieldValue::NotSet.as_str(), "not set");
    }

    #[test]
    fn default_labels_cover_both_families() {
        let labels = default_labels();
        assert_eq!(labels.len(), 10);
        assert!(labels.contains(&"AQsys001".to_string()));
        assert!(labels.contains(&"sense005".to_string()));
        assert!(labels.iter().all(|l| l.len() == 8));
    }

    #[tokio::test]
    async fn last_arrival_wins() {
        let registry = FieldRegistry::spawn(default_labels());
        registry
            .update("sense001", FieldValue::Fresh("20.00".into()))
            .await;
        registry
            .update("sense001", FieldValue::Fresh("19.50".into()))
            .await;
        registry.update("sense002", FieldValue::Stale).await;

        let snap = registry.snapshot().await.unwrap();
        assert_eq!(snap.get("sense001"), Some(&FieldValue::Fresh("19.50".into())));
        assert_eq!(snap.get("sense002"), Some(&FieldValue::Stale));
        assert_eq!(snap.get("sense003"), Some(&FieldValue::NotSet));
        assert!(snap.last_update > 0);
    }

    #[tokio::test]
    async fn unknown_labels_leave_no_entry() {
        let registry = FieldRegistry::spawn(vec!["sense001".into()]);
        registry
            .update("garage01", FieldValue::Fresh("1".into()))
            .await;

        let snap = registry.snapshot().await.unwrap();
        assert_eq!(snap.fields.len(), 1);
        assert!(snap.get("garage01").is_none());
        assert_eq!(snap.last_update, 0);
    }

    #[tokio::test]
    async fn snapshot_serializes_as_strings() {
        let registry = FieldRegistry::spawn(vec!["sense001".into(), "sense002".into()]);
        registry.update("sense001", FieldValue::Stale).await;

        let snap = registry.snapshot().await.unwrap();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["fields"]["sense001"], "*too old!*");
        assert_eq!(json["fields"]["sense002"], "not set");
    }
}
