use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 7-bit bus address.  Discovered at runtime, never configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress(u8);

impl DeviceAddress {
    /// Highest address representable in 7 bits.
    pub const MAX: u8 = 0x7F;

    /// Wrap `raw` as an address.  Returns `None` when it does not fit in
    /// 7 bits.
    pub const fn new(raw: u8) -> Option<Self> {
        if raw <= Self::MAX { Some(Self(raw)) } else { None }
    }

    /// The raw 7-bit value.
    pub const fn raw(self) -> u8 {
        self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// One 3-axis magnetic flux density sample, in microtesla.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub x_ut: f64,
    pub y_ut: f64,
    pub z_ut: f64,
}

impl Measurement {
    /// Largest absolute component of the sample.
    pub fn max_abs(&self) -> f64 {
        self.x_ut.abs().max(self.y_ut.abs()).max(self.z_ut.abs())
    }
}

/// Link-state notification emitted by a pub/sub transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// A single message delivered on the pub/sub bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub topic: String,
    /// Empty payload on a retained topic means "clear".
    pub payload: String,
    pub retained: bool,
    pub timestamp: DateTime<Utc>,
}

/// Workspace-wide error type spanning configuration, bus and transport
/// failures.
///
/// Only [`BridgeError::Configuration`] is fatal; every other variant is
/// recovered by the driver loop.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("No device answered on any of {scanned} scanned addresses")]
    NoDeviceFound { scanned: u8 },

    #[error("Bus transfer failed at {address:#04x}: {details}")]
    Transfer { address: u8, details: String },

    #[error("Transport disconnected")]
    TransportDisconnected,

    #[error("Transport Error: {0}")]
    Transport(String),
}

impl BridgeError {
    /// `true` for errors that must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_address_rejects_eight_bit_values() {
        assert!(DeviceAddress::new(0x7F).is_some());
        assert!(DeviceAddress::new(0x80).is_none());
        assert_eq!(DeviceAddress::new(0x5E).map(DeviceAddress::raw), Some(0x5E));
    }

    #[test]
    fn device_address_display_is_hex() {
        let addr = DeviceAddress::new(0x5E).unwrap();
        assert_eq!(addr.to_string(), "0x5e");
    }

    #[test]
    fn measurement_max_abs_uses_magnitude() {
        let m = Measurement {
            x_ut: 10.0,
            y_ut: -250.0,
            z_ut: 100.0,
        };
        assert!((m.max_abs() - 250.0).abs() < f64::EPSILON);
    }

    #[test]
    fn publication_roundtrip() {
        let publication = Publication {
            topic: "/devices/tlv493d/controls/field".to_string(),
            payload: "12.50".to_string(),
            retained: true,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&publication).unwrap();
        let back: Publication = serde_json::from_str(&json).unwrap();
        assert_eq!(publication, back);
    }

    #[test]
    fn only_configuration_errors_are_fatal() {
        assert!(BridgeError::Configuration("bus_num missing".to_string()).is_fatal());
        assert!(!BridgeError::NoDeviceFound { scanned: 128 }.is_fatal());
        assert!(
            !BridgeError::Transfer {
                address: 0x5E,
                details: "nack".to_string()
            }
            .is_fatal()
        );
        assert!(!BridgeError::TransportDisconnected.is_fatal());
    }

    #[test]
    fn bridge_error_display() {
        let err = BridgeError::Transfer {
            address: 0x5E,
            details: "remote i/o error".to_string(),
        };
        assert!(err.to_string().contains("0x5e"));
        assert!(err.to_string().contains("remote i/o error"));
    }
}
