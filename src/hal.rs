//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     narrow interfaces to the things a spoke needs from its host but does
//!     not own: temperature probes and the network link to the hub.
//!     real implementations shell out or read sysfs, mock ones let the
//!     spoke run on a development machine.
//!
//! relationships:
//!     - used by: client.rs (LivenessProbe before connecting)
//!     - used by: main.rs (SensorSource per configured sensor)
//!     - implemented by: sensor.rs (W1Thermometer)
//!
//! ==============================================================================

use anyhow::Result;
use std::process::Command;
use std::time::Duration;

/// a temperature probe. blocking; call from `spawn_blocking`.
pub trait SensorSource: Send + Sync {
    /// (celsius, fahrenheit)
    fn read_temperature(&self) -> Result<(f32, f32)>;
}

/// reachability of the hub and the one recovery action a spoke can take.
/// blocking; call from `spawn_blocking`.
pub trait LivenessProbe: Send + Sync {
    fn probe(&self, host: &str) -> bool;
    fn reset_interface(&self);
}

// ==============================================================================================
// MOCK IMPLEMENTATIONS (For development machines)
// ==============================================================================================

/// sensor that always reports the same temperature
pub struct FixedSensor {
    celsius: f32,
}

impl FixedSensor {
    pub fn new(celsius: f32) -> Self {
        tracing::info!("Using MOCK sensor ({:.2} degC)", celsius);
        Self { celsius }
    }
}

impl SensorSource for FixedSensor {
    fn read_temperature(&self) -> Result<(f32, f32)> {
        Ok((self.celsius, crate::sensor::to_fahrenheit(self.celsius)))
    }
}

/// probe for setups without ping, e.g. a hub on the same host
pub struct AssumeReachable;

impl LivenessProbe for AssumeReachable {
    fn probe(&self, host: &str) -> bool {
        tracing::debug!("[MOCK PROBE] assuming {} is reachable", host);
        true
    }

    fn reset_interface(&self) {}
}

// ==============================================================================================
// REAL IMPLEMENTATION (ping + ip link)
// ==============================================================================================

pub struct PingProbe {
    count: u32,
    interface: String,
    settle: Duration,
}

impl PingProbe {
    pub fn new(count: u32, interface: impl Into<String>) -> Self {
        Self {
            count,
            interface: interface.into(),
            settle: Duration::from_secs(5),
        }
    }

    fn set_link(&self, state: &str) {
        let output = Command::new("sudo")
            .args(["ip", "link", "set", "dev", &self.interface, state])
            .output();

        match output {
            Ok(o) if o.status.success() => {
                tracing::debug!("interface {} {}", self.interface, state)
            }
            Ok(o) => tracing::warn!(
                "ip link set {} {} failed: {}",
                self.interface,
                state,
                String::from_utf8_lossy(&o.stderr).trim()
            ),
            Err(e) => tracing::warn!("could not run ip: {}", e),
        }
    }
}

impl LivenessProbe for PingProbe {
    fn probe(&self, host: &str) -> bool {
        let output = Command::new("ping")
            .args([host, "-n", "-c", &self.count.to_string()])
            .output();

        match output {
            Ok(o) => {
                let stdout = String::from_utf8_lossy(&o.stdout);
                let ok = ping_succeeded(&stdout);
                if ok {
                    tracing::debug!("{}: successful ping", host);
                } else {
                    tracing::warn!(
                        "{}: failed ping (exit {:?}): {}",
                        host,
                        o.status.code(),
                        String::from_utf8_lossy(&o.stderr).trim()
                    );
                }
                ok
            }
            Err(e) => {
                tracing::warn!("could not run ping: {}", e);
                false
            }
        }
    }

    fn reset_interface(&self) {
        tracing::info!("toggling {} down/up", self.interface);
        self.set_link("down");
        std::thread::sleep(self.settle);
        self.set_link("up");
        std::thread::sleep(self.settle);
    }
}

/// a reply line carries "ttl=" only when an echo came back
fn ping_succeeded(stdout: &str) -> bool {
    stdout.to_ascii_lowercase().contains("ttl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_output_detection() {
        let ok = "PING 192.168.1.20 (192.168.1.20) 56(84) bytes of data.\n\
                  64 bytes from 192.168.1.20: icmp_seq=1 ttl=64 time=3.21 ms\n";
        let lost = "PING 192.168.1.99 (192.168.1.99) 56(84) bytes of data.\n\
                    --- 192.168.1.99 ping statistics ---\n\
                    3 packets transmitted, 0 received, 100% packet loss\n";
        assert!(ping_succeeded(ok));
        assert!(!ping_succeeded(lost));
    }

    #[test]
    fn fixed_sensor_reports_both_scales() {
        let (c, f) = FixedSensor::new(20.0).read_temperature().unwrap();
        assert_eq!(c, 20.0);
        assert_eq!(f, 68.0);
    }
}
