//! sense-hub: a TCP hub and sensor client for a home IoT network.
//!
//! Satellites ("spokes") read local probes and push fixed-format text
//! messages to the hub, which acknowledges each one and keeps the latest
//! value per label in a [`registry::FieldRegistry`].

pub mod client;
pub mod config;
pub mod error;
pub mod hal;
pub mod protocol;
pub mod registry;
pub mod sensor;
pub mod server;
pub mod status;
