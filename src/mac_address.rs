//! Canonical Bluetooth device address.
//!
//! Addresses arrive from scanners, operator prompts and the JSON registry in
//! whatever case and separator the source prefers. Everything is parsed into
//! [`MacAddress`] at the boundary so comparisons never see raw strings.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A Bluetooth MAC address stored as a compact 6-byte array.
///
/// Displays (and serializes) as uppercase, colon-separated hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Errors returned when parsing a MAC address string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseMacError {
    #[error("invalid MAC address: expected 6 octets, got {0}")]
    InvalidLength(usize),
    #[error("invalid MAC address: octet {0} has wrong length")]
    InvalidOctetLength(usize),
    #[error("invalid MAC address: '{0}' is not valid hex")]
    InvalidHex(String),
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    /// Accepts `:` or `-` separators and either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let separator = if s.contains('-') { '-' } else { ':' };
        let octets: Vec<&str> = s.split(separator).collect();
        if octets.len() != 6 {
            return Err(ParseMacError::InvalidLength(octets.len()));
        }

        let mut bytes = [0u8; 6];
        for (i, octet) in octets.iter().enumerate() {
            if octet.len() != 2 {
                return Err(ParseMacError::InvalidOctetLength(i));
            }
            bytes[i] = u8::from_str_radix(octet, 16)
                .map_err(|_| ParseMacError::InvalidHex(octet.to_string()))?;
        }

        Ok(MacAddress(bytes))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_uppercase_colon_separated() {
        let addr = MacAddress([0xa4, 0xc1, 0x38, 0x0d, 0x0e, 0x0f]);
        assert_eq!(addr.to_string(), "A4:C1:38:0D:0E:0F");
    }

    #[test]
    fn test_from_str_any_case() {
        let upper: MacAddress = "A4:C1:38:AA:BB:CC".parse().unwrap();
        let lower: MacAddress = "a4:c1:38:aa:bb:cc".parse().unwrap();
        assert_eq!(upper, lower);
        assert_eq!(lower.to_string(), "A4:C1:38:AA:BB:CC");
    }

    #[test]
    fn test_from_str_dash_separated() {
        let addr: MacAddress = "a4-c1-38-aa-bb-cc".parse().unwrap();
        assert_eq!(addr.0, [0xA4, 0xC1, 0x38, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_from_str_invalid() {
        assert_eq!(
            "invalid".parse::<MacAddress>(),
            Err(ParseMacError::InvalidLength(1))
        );
        assert_eq!(
            "A4:C1:38".parse::<MacAddress>(),
            Err(ParseMacError::InvalidLength(3))
        );
        assert_eq!(
            "A4:C1:38:AA:BB:C".parse::<MacAddress>(),
            Err(ParseMacError::InvalidOctetLength(5))
        );
        assert!(matches!(
            "A4:C1:38:AA:BB:ZZ".parse::<MacAddress>(),
            Err(ParseMacError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let addr: MacAddress = serde_json::from_str("\"a4:c1:38:aa:bb:cc\"").unwrap();
        assert_eq!(
            serde_json::to_string(&addr).unwrap(),
            "\"A4:C1:38:AA:BB:CC\""
        );
        assert!(serde_json::from_str::<MacAddress>("\"nope\"").is_err());
    }
}
