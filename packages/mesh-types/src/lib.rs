//! # meshloc-types
//!
//! Shared identifier and protocol types for the meshloc RF surveillance mesh.
//!
//! These types are used by:
//! - `node`: the on-device daemon (coordinator/peer roles, mesh bus)
//! - `packages/mesh-simulator`: embedded multi-node scenario harness
//!
//! ## Wire conventions
//!
//! The mesh link is a line-oriented text protocol over a LoRa-style serial
//! bridge: printable ASCII, newline-terminated, at most 200 bytes per line.
//! Every line carries a sender prefix (`<sender>: <body>`) and may carry a
//! targeting prefix (`@<node|ALL> `) that restricts which nodes process it.
//! The full codec lives in [`wire`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod wire;

// ── Node identifiers ──────────────────────────────────────────────────────────

/// Short printable node identifier, 2–5 alphanumeric ASCII characters.
/// Unique by convention within a session. `ALL` is reserved for broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("node id must be 2-5 alphanumeric characters, got {0:?}")]
    InvalidNodeId(String),
    #[error("invalid MAC address {0:?}")]
    InvalidMac(String),
    #[error("invalid identity token {0:?}")]
    InvalidIdentity(String),
}

impl NodeId {
    pub fn new(s: &str) -> Result<Self, IdError> {
        let ok = (2..=5).contains(&s.len())
            && s.bytes().all(|b| b.is_ascii_alphanumeric())
            && s != "ALL";
        if ok {
            Ok(Self(s.to_string()))
        } else {
            Err(IdError::InvalidNodeId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ── MAC addresses ─────────────────────────────────────────────────────────────

/// 48-bit MAC address. Rendered uppercase colon-separated on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let mut out = [0u8; 6];
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(IdError::InvalidMac(s.to_string()));
        }
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(IdError::InvalidMac(s.to_string()));
            }
            out[i] =
                u8::from_str_radix(part, 16).map_err(|_| IdError::InvalidMac(s.to_string()))?;
        }
        Ok(Self(out))
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl FromStr for Mac {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── Target references ─────────────────────────────────────────────────────────

/// What a session hunts: a concrete MAC, or an opaque identity token of the
/// form `T-xxxx` (4 hex digits) assigned by the randomization-correlation
/// subsystem to a device whose MAC rotates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetRef {
    Mac(Mac),
    Identity([u8; 4]),
}

impl TargetRef {
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if let Some(hex) = s.strip_prefix("T-") {
            if hex.len() == 4 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                let mut tok = [0u8; 4];
                tok.copy_from_slice(hex.as_bytes());
                return Ok(Self::Identity(tok));
            }
            return Err(IdError::InvalidIdentity(s.to_string()));
        }
        Ok(Self::Mac(Mac::parse(s)?))
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mac(mac) => mac.fmt(f),
            Self::Identity(tok) => {
                // Token bytes are ASCII hex digits by construction
                write!(f, "T-{}", std::str::from_utf8(tok).unwrap_or("????"))
            }
        }
    }
}

impl FromStr for TargetRef {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── RF environment presets ────────────────────────────────────────────────────

/// Propagation environment selected at session start. Maps to default
/// log-distance path-loss parameters per radio type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum RfEnvironment {
    OpenSky = 0,
    Suburban = 1,
    #[default]
    Indoor = 2,
    IndoorDense = 3,
    Industrial = 4,
}

/// Default `(n, rssi0)` pairs per radio for one environment.
/// Calibrated for an 8 dBi RX antenna; BLE reference levels assume typical
/// phone/wearable TX power (0 to -8 dBm).
#[derive(Debug, Clone, Copy)]
pub struct RfPreset {
    pub n_wifi: f32,
    pub n_ble: f32,
    pub rssi0_wifi: f32,
    pub rssi0_ble: f32,
}

impl RfEnvironment {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::OpenSky,
            1 => Self::Suburban,
            3 => Self::IndoorDense,
            4 => Self::Industrial,
            _ => Self::Indoor,
        }
    }

    pub fn preset(self) -> RfPreset {
        match self {
            Self::OpenSky => RfPreset { n_wifi: 2.0, n_ble: 2.0, rssi0_wifi: -22.0, rssi0_ble: -59.0 },
            Self::Suburban => RfPreset { n_wifi: 2.7, n_ble: 2.5, rssi0_wifi: -25.0, rssi0_ble: -63.0 },
            Self::Indoor => RfPreset { n_wifi: 3.2, n_ble: 3.0, rssi0_wifi: -27.0, rssi0_ble: -67.0 },
            Self::IndoorDense => RfPreset { n_wifi: 4.0, n_ble: 3.5, rssi0_wifi: -29.0, rssi0_ble: -71.0 },
            Self::Industrial => RfPreset { n_wifi: 4.8, n_ble: 4.0, rssi0_wifi: -32.0, rssi0_ble: -75.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_bounds() {
        assert!(NodeId::new("N1").is_ok());
        assert!(NodeId::new("AB12C").is_ok());
        assert!(NodeId::new("X").is_err());
        assert!(NodeId::new("TOOLONG").is_err());
        assert!(NodeId::new("N-1").is_err());
        assert!(NodeId::new("ALL").is_err());
    }

    #[test]
    fn mac_round_trip() {
        let mac = Mac::parse("aa:bb:cc:00:11:22").unwrap();
        assert_eq!(mac.to_string(), "AA:BB:CC:00:11:22");
        assert_eq!(Mac::parse(&mac.to_string()).unwrap(), mac);
        assert!(Mac::parse("aa:bb:cc:00:11").is_err());
        assert!(Mac::parse("aabbcc001122").is_err());
    }

    #[test]
    fn target_ref_identity() {
        let t = TargetRef::parse("T-3fa9").unwrap();
        assert_eq!(t.to_string(), "T-3fa9");
        assert!(TargetRef::parse("T-3fa").is_err());
        assert!(TargetRef::parse("T-zzzz").is_err());
        assert!(matches!(
            TargetRef::parse("DE:AD:BE:EF:00:01").unwrap(),
            TargetRef::Mac(_)
        ));
    }

    #[test]
    fn environment_presets() {
        assert_eq!(RfEnvironment::from_u8(9), RfEnvironment::Indoor);
        let p = RfEnvironment::OpenSky.preset();
        assert_eq!(p.n_wifi, 2.0);
        let p = RfEnvironment::Industrial.preset();
        assert!(p.rssi0_ble < p.rssi0_wifi);
    }
}
