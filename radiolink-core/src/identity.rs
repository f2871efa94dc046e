//! Device identity: 6-byte radio hardware address, its text form, broadcast constant.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a hardware address in bytes.
pub const MAC_LEN: usize = 6;

/// Length of the `aa:bb:cc:dd:ee:ff` text form.
pub const MAC_STR_LEN: usize = MAC_LEN * 3 - 1;

/// Radio hardware address. Peers are addressed by this, never by a registry index.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MacAddr([u8; MAC_LEN]);

impl MacAddr {
    /// Transport-level broadcast destination. Never a registry entry.
    pub const BROADCAST: MacAddr = MacAddr([0xff; MAC_LEN]);

    pub const fn new(bytes: [u8; MAC_LEN]) -> Self {
        MacAddr(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MAC_LEN] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Clear the locally-administered bit (bit 1 of the first octet).
    /// Some radios flip it on frames that were received via broadcast, so the same
    /// peer would otherwise show up under two addresses.
    pub fn without_local_admin_bit(self) -> Self {
        let mut bytes = self.0;
        bytes[0] &= 0b1111_1101;
        MacAddr(bytes)
    }
}

impl From<[u8; MAC_LEN]> for MacAddr {
    fn from(bytes: [u8; MAC_LEN]) -> Self {
        MacAddr(bytes)
    }
}

impl TryFrom<&[u8]> for MacAddr {
    type Error = AddrParseError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let raw: [u8; MAC_LEN] = bytes
            .try_into()
            .map_err(|_| AddrParseError::WrongLength(bytes.len()))?;
        Ok(MacAddr(raw))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = AddrParseError;

    /// Parse `aa:bb:cc:dd:ee:ff` (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; MAC_LEN];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or(AddrParseError::WrongLength(s.len()))?;
            if part.len() != 2 || !part.bytes().all(|c| c.is_ascii_hexdigit()) {
                return Err(AddrParseError::InvalidOctet(part.to_string()));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| AddrParseError::InvalidOctet(part.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddrParseError::WrongLength(s.len()));
        }
        Ok(MacAddr(out))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error parsing a hardware address from text or bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrParseError {
    #[error("expected 6 octets, got input of length {0}")]
    WrongLength(usize),
    #[error("invalid octet {0:?}")]
    InvalidOctet(String),
}
