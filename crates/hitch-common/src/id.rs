//! Endpoint identifiers and hardware addresses.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{HitchError, HitchResult};

/// A 48-bit Ethernet hardware address.
///
/// Displayed and serialized in the lowercase colon form used by `ip`,
/// `ebtables` and `ovs-ofctl` (`12:34:56:78:9a:bc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// The broadcast address.
    pub const BROADCAST: Self = Self([0xff; 6]);

    /// Create a MAC address from raw octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Hex digits without separators, as used in OpenFlow `load:` actions.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = HitchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HitchError::Config {
            message: format!("invalid MAC address: {s}"),
        };

        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in &mut octets {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || part.len() > 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Build the endpoint ID for a container interface.
///
/// The ID is the first 8 characters of the container ID joined with the
/// interface name, so the same container gets distinct endpoints per interface.
///
/// # Errors
///
/// Returns an error if the container ID is empty.
pub fn endpoint_id(container_id: &str, if_name: &str) -> HitchResult<String> {
    if container_id.is_empty() {
        return Err(HitchError::Config {
            message: "container ID must not be empty".to_string(),
        });
    }

    let short: String = container_id.chars().take(8).collect();
    if if_name.is_empty() {
        Ok(short)
    } else {
        Ok(format!("{short}-{if_name}"))
    }
}

/// Stable short hash of a caller supplied key (11 hex characters).
///
/// Used to derive interface names that survive retries of the same request.
#[must_use]
pub fn short_hash(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(11);
    hex
}
