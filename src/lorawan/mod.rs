//! Core LoRaWAN identifier types.
//!
//! Provides the EUI-64 and NetID newtypes used as keys and filter
//! values throughout the bridge, with the wire conventions the BasicStation
//! dialect expects: lowercase plain hex on the wire, colon-separated hex in
//! log output, and tolerance for `-`/`:` separators on input.

pub mod gps;

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing identifier hex forms.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid EUI-64 '{0}': expected 16 hex digits")]
    InvalidEui64(String),

    #[error("invalid NetID '{0}': expected 6 hex digits")]
    InvalidNetId(String),
}

/// 64-bit extended unique identifier; the canonical key for every
/// per-gateway structure.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    pub fn from_slice(b: &[u8]) -> Option<Self> {
        let mut out = [0u8; 8];
        if b.len() != 8 {
            return None;
        }
        out.copy_from_slice(b);
        Some(Eui64(out))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Big-endian integer value (the `router` field of router-info
    /// requests may arrive as a plain integer).
    pub fn to_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn from_u64(v: u64) -> Self {
        Eui64(v.to_be_bytes())
    }

    /// Plain lowercase hex, the on-the-wire form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Dash-separated uppercase-free hex used by the BasicStation `DevEui`
    /// fields of downlink messages.
    pub fn to_dashed(&self) -> String {
        self.0
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl fmt::Display for Eui64 {
    /// Colon-separated hex, the log form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self
            .0
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":");
        f.write_str(&s)
    }
}

impl fmt::Debug for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Eui64({})", self)
    }
}

impl FromStr for Eui64 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let b = hex::decode(&cleaned).map_err(|_| Error::InvalidEui64(s.to_string()))?;
        Eui64::from_slice(&b).ok_or_else(|| Error::InvalidEui64(s.to_string()))
    }
}

impl Serialize for Eui64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Eui64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EuiVisitor;

        impl<'de> Visitor<'de> for EuiVisitor {
            type Value = Eui64;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an EUI-64 as hex string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Eui64, E> {
                v.parse().map_err(de::Error::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Eui64, E> {
                Ok(Eui64::from_u64(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Eui64, E> {
                Ok(Eui64::from_u64(v as u64))
            }
        }

        deserializer.deserialize_any(EuiVisitor)
    }
}

/// 24-bit LoRaWAN network identifier, used in the router-config NetID
/// filter list.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetId(pub [u8; 3]);

impl NetId {
    pub fn to_u32(&self) -> u32 {
        ((self.0[0] as u32) << 16) | ((self.0[1] as u32) << 8) | self.0[2] as u32
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetId({})", self)
    }
}

impl FromStr for NetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b = hex::decode(s).map_err(|_| Error::InvalidNetId(s.to_string()))?;
        if b.len() != 3 {
            return Err(Error::InvalidNetId(s.to_string()));
        }
        Ok(NetId([b[0], b[1], b[2]]))
    }
}
