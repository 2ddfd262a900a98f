//! ==============================================================================
//! sensor.rs - ds18b20 1-wire temperature probes
//! ==============================================================================
//!
//! purpose:
//!     reads the kernel's w1_slave file for a ds18b20 probe and formats the
//!     temperature the way the hub expects it in a message value.
//!
//! w1_slave layout:
//!     72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
//!     72 01 4b 46 7f ff 0e 10 57 t=23125
//!
//! ```text
//!     the first line ends in YES once the crc checked out, the second
//!     carries the temperature in millidegrees celsius.
//! ```
//!
//! relationships:
//!     - implements: hal.rs (SensorSource)
//!     - used by: main.rs (spoke role)
//!
//! ==============================================================================

use crate::hal::SensorSource;
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// where the w1-gpio overlay exposes probes
pub const W1_DEVICES: &str = "/sys/bus/w1/devices";

/// re-reads while the crc line is not yet YES
const NOT_READY_RETRIES: u32 = 5;

pub struct W1Thermometer {
    path: PathBuf,
    poll: Duration,
}

impl W1Thermometer {
    pub fn new(device_id: &str) -> Self {
        Self::at(PathBuf::from(W1_DEVICES).join(device_id).join("w1_slave"))
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            poll: Duration::from_millis(200),
        }
    }
}

impl SensorSource for W1Thermometer {
    fn read_temperature(&self) -> Result<(f32, f32)> {
        for _ in 0..=NOT_READY_RETRIES {
            let text = std::fs::read_to_string(&self.path)
                .with_context(|| format!("reading {}", self.path.display()))?;

            if let Some(celsius) = parse_w1_slave(&text)? {
                return Ok((celsius, to_fahrenheit(celsius)));
            }
            std::thread::sleep(self.poll);
        }
        Err(anyhow!("{}: crc never reported YES", self.path.display()))
    }
}

/// `Ok(None)` while the probe has not finished a valid conversion
pub fn parse_w1_slave(text: &str) -> Result<Option<f32>> {
    let mut lines = text.lines();
    let (crc_line, data_line) = match (lines.next(), lines.next()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(anyhow!("w1_slave too short: {:?}", text)),
    };

    if !crc_line.trim_end().ends_with("YES") {
        return Ok(None);
    }

    let raw = data_line
        .split_once("t=")
        .map(|(_, t)| t.trim())
        .ok_or_else(|| anyhow!("no t= in {:?}", data_line))?;
    let milli: f32 = raw
        .parse()
        .map_err(|e| anyhow!("bad temperature {:?}: {}", raw, e))?;

    Ok(Some(milli / 1000.0))
}

pub fn to_fahrenheit(celsius: f32) -> f32 {
    celsius * 9.0 / 5.0 + 32.0
}

/// two decimals (one below -9.999), zero padded to five characters
pub fn format_celsius(celsius: f32) -> String {
    let text = if celsius < -9.999 {
        format!("{:.1}", celsius)
    } else {
        format!("{:.2}", celsius)
    };
    zero_pad(&text, 5)
}

fn zero_pad(text: &str, width: usize) -> String {
    if text.len() >= width {
        return text.to_string();
    }
    let zeros = "0".repeat(width - text.len());
    match text.strip_prefix('-') {
        Some(digits) => format!("-{}{}", zeros, digits),
        None => format!("{}{}", zeros, text),
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const READY: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n\
                         72 01 4b 46 7f ff 0e 10 57 t=23125\n";

    #[test]
    fn parses_ready_probe() {
        assert_eq!(parse_w1_slave(READY).unwrap(), Some(23.125));
    }

    #[test]
    fn parses_negative_temperature() {
        let text = "5e ff 4b 46 7f ff 02 10 d7 : crc=d7 YES\n\
                    5e ff 4b 46 7f ff 02 10 d7 t=-10125\n";
        assert_eq!(parse_w1_slave(text).unwrap(), Some(-10.125));
    }

    #[test]
    fn not_ready_until_crc_yes() {
        let text = "72 01 4b 46 7f ff 0e 10 57 : crc=00 NO\n\
                    72 01 4b 46 7f ff 0e 10 57 t=23125\n";
        assert_eq!(parse_w1_slave(text).unwrap(), None);
    }

    #[test]
    fn short_file_is_an_error() {
        assert!(parse_w1_slave("").is_err());
        assert!(parse_w1_slave("72 01 : crc=57 YES\n72 01 garbage\n").is_err());
    }

    #[test]
    fn formats_like_the_sense_box() {
        assert_eq!(format_celsius(7.5), "07.50");
        assert_eq!(format_celsius(21.34), "21.34");
        assert_eq!(format_celsius(-5.0), "-5.00");
        assert_eq!(format_celsius(-12.34), "-12.3");
        assert_eq!(format_celsius(0.0), "00.00");
        assert_eq!(format_celsius(100.0), "100.00");
    }

    #[test]
    fn reads_from_a_device_file() {
        let dir = std::env::temp_dir().join(format!("sense-hub-w1-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("w1_slave");
        std::fs::write(&path, READY).unwrap();

        let (c, f) = W1Thermometer::at(path).read_temperature().unwrap();
        assert_eq!(c, 23.125);
        assert!((f - 73.625).abs() < 1e-4);

        std::fs::remove_dir_all(&dir).ok();
    }
}
