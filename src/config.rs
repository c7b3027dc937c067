//! Link configuration.

use crate::base::{Error, Result};
use crate::internals::*;
use log::{error, info};
use serde::Deserialize;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::time::Duration;

/// Serial device and protocol timing settings. Missing fields take their defaults.
///
/// ```ignore
/// let config = LinkConfig::from_json(r#"{"port": "/dev/ttyUSB0"}"#)?;
/// assert_eq!(config.baud_rate, 57600);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Device path, e.g. `/dev/ttyS1` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
    /// Upper bound on one blocking read; also bounds how long shutdown takes.
    pub read_timeout_ms: u64,
    /// Pause after a device error before reading again.
    pub error_backoff_ms: u64,
    pub read_chunk_size: usize,
    /// Poll-triggered send attempts before a command times out. Must be at least 1.
    pub max_retries: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            port: DEFAULT_SERIAL_PORT.to_owned(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT.as_millis() as u64,
            error_backoff_ms: DEFAULT_ERROR_BACKOFF.as_millis() as u64,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl LinkConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json(text: &str) -> Result<LinkConfig> {
        let config: LinkConfig = serde_json::from_str(text)
            .map_err(|e| Error::InvalidRequest(format!("config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the link cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::validation(
                "max_retries",
                "at least one send attempt is required",
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(Error::validation("read_chunk_size", "must be positive"));
        }
        if self.port.is_empty() {
            return Err(Error::validation("port", "no serial device given"));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Opens the serial device as 8N1 without flow control.
    ///
    /// This is the only fatal failure of the link: without a device there is nothing to retry.
    pub fn open_port(&self) -> Result<Box<dyn SerialPort>> {
        self.validate()?;
        info!("Opening serial port {} at {} baud", self.port, self.baud_rate);
        serialport::new(self.port.as_str(), self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.read_timeout())
            .open()
            .map_err(|e| {
                error!("Cannot open serial port {}: {}", self.port, e);
                Error::from(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.port, "/dev/ttyS1");
        assert_eq!(config.baud_rate, 57600);
        assert_eq!(config.read_timeout(), Duration::from_millis(50));
        assert_eq!(config.error_backoff(), Duration::from_secs(1));
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config =
            LinkConfig::from_json(r#"{"port": "/dev/ttyUSB0", "max_retries": 3}"#).unwrap();
        assert_eq!(
            config,
            LinkConfig {
                port: "/dev/ttyUSB0".to_owned(),
                max_retries: 3,
                ..LinkConfig::default()
            }
        );
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            LinkConfig::from_json(r#"{"baud_rate": "fast"}"#),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn zero_retry_budget_is_rejected() {
        match LinkConfig::from_json(r#"{"max_retries": 0}"#) {
            Err(Error::Validation { field, .. }) => assert_eq!(field, "max_retries"),
            other => panic!("expected a validation error, got {:?}", other),
        }
        let config = LinkConfig {
            max_retries: 0,
            ..LinkConfig::default()
        };
        assert!(matches!(config.open_port(), Err(Error::Validation { .. })));
        assert!(LinkConfig::default().validate().is_ok());
    }

    #[test]
    fn missing_device_fails_to_open() {
        let config = LinkConfig {
            port: "/dev/this-port-does-not-exist".to_owned(),
            ..LinkConfig::default()
        };
        assert!(matches!(config.open_port(), Err(Error::Serial(_))));
    }
}
