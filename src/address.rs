//! Account addresses
//!
//! Accepts the raw `workchain:hex` form and the 48-character user-friendly
//! form (base64 or base64url, with CRC16 checksum).

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::cell::Cell;

const FRIENDLY_LEN: usize = 36;
const TAG_BOUNCEABLE: u8 = 0x11;
const TAG_NON_BOUNCEABLE: u8 = 0x51;
const TAG_TEST_ONLY: u8 = 0x80;

/// Standard account address
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub workchain: i8,
    pub hash: [u8; 32],
}

impl Address {
    /// Address from its workchain and account hash
    pub fn new(workchain: i8, hash: [u8; 32]) -> Self {
        Self { workchain, hash }
    }

    /// Address of a contract deployed with the given `StateInit`
    pub fn from_state_init(workchain: i8, state_init: &Cell) -> Self {
        Self::new(workchain, state_init.hash())
    }

    /// Raw `workchain:hex` representation
    pub fn to_raw(&self) -> String {
        format!("{}:{}", self.workchain, hex::encode(self.hash))
    }

    /// User-friendly base64url representation
    pub fn to_friendly(&self, bounceable: bool, test_only: bool) -> String {
        let mut tag = if bounceable {
            TAG_BOUNCEABLE
        } else {
            TAG_NON_BOUNCEABLE
        };
        if test_only {
            tag |= TAG_TEST_ONLY;
        }
        let mut bytes = Vec::with_capacity(FRIENDLY_LEN);
        bytes.push(tag);
        bytes.push(self.workchain as u8);
        bytes.extend_from_slice(&self.hash);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        URL_SAFE.encode(bytes)
    }

    fn parse_raw(s: &str) -> Result<Self, AddressError> {
        let (wc, hash_hex) = s
            .split_once(':')
            .ok_or_else(|| AddressError::Malformed(s.to_string()))?;
        let workchain: i8 = wc
            .parse()
            .map_err(|_| AddressError::InvalidWorkchain(wc.to_string()))?;
        let bytes = hex::decode(hash_hex).map_err(|e| AddressError::Malformed(e.to_string()))?;
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AddressError::Malformed(format!("hash must be 32 bytes: {}", s)))?;
        Ok(Self::new(workchain, hash))
    }

    fn parse_friendly(s: &str) -> Result<Self, AddressError> {
        let bytes = if s.contains('-') || s.contains('_') {
            URL_SAFE.decode(s)
        } else {
            STANDARD.decode(s)
        }
        .map_err(|e| AddressError::Malformed(e.to_string()))?;

        if bytes.len() != FRIENDLY_LEN {
            return Err(AddressError::Malformed(format!(
                "expected {} bytes, got {}",
                FRIENDLY_LEN,
                bytes.len()
            )));
        }

        let expected = u16::from_be_bytes([bytes[34], bytes[35]]);
        if crc16(&bytes[..34]) != expected {
            return Err(AddressError::BadChecksum);
        }

        let tag = bytes[0] & !TAG_TEST_ONLY;
        if tag != TAG_BOUNCEABLE && tag != TAG_NON_BOUNCEABLE {
            return Err(AddressError::Malformed(format!("unknown tag {:#x}", bytes[0])));
        }

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[2..34]);
        Ok(Self::new(bytes[1] as i8, hash))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains(':') {
            Self::parse_raw(s)
        } else {
            Self::parse_friendly(s)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_raw())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_raw())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_raw())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// CRC16-XMODEM (poly 0x1021, init 0)
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Address parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Malformed address: {0}")]
    Malformed(String),

    #[error("Invalid workchain: {0}")]
    InvalidWorkchain(String),

    #[error("Address checksum mismatch")]
    BadChecksum,
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "0:83dfd552e63729b472fcbcc8c45ebcc6691702558b68ec7527e1ba403a0f31a8";

    #[test]
    fn test_crc16_reference() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_parse_raw() {
        let addr: Address = RAW.parse().unwrap();
        assert_eq!(addr.workchain, 0);
        assert_eq!(addr.hash[0], 0x83);
        assert_eq!(addr.to_string(), RAW);

        let master: Address = format!("-1:{}", &RAW[2..]).parse().unwrap();
        assert_eq!(master.workchain, -1);
    }

    #[test]
    fn test_friendly_round_trip() {
        let addr: Address = RAW.parse().unwrap();
        for (bounce, test_only) in [(true, false), (false, false), (true, true)] {
            let friendly = addr.to_friendly(bounce, test_only);
            assert_eq!(friendly.len(), 48);
            assert_eq!(friendly.parse::<Address>().unwrap(), addr);
        }
    }

    #[test]
    fn test_friendly_bad_checksum() {
        let addr: Address = RAW.parse().unwrap();
        let mut friendly = addr.to_friendly(true, false).into_bytes();
        let last = friendly.len() - 1;
        friendly[last] = if friendly[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(friendly).unwrap();
        assert!(tampered.parse::<Address>().is_err());
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            "0:abcd".parse::<Address>(),
            Err(AddressError::Malformed(_))
        ));
        assert!(matches!(
            format!("x:{}", &RAW[2..]).parse::<Address>(),
            Err(AddressError::InvalidWorkchain(_))
        ));
        assert!("not-an-address".parse::<Address>().is_err());
    }

    #[test]
    fn test_serde() {
        let addr: Address = RAW.parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", RAW));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
