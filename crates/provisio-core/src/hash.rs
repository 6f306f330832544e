use std::fmt;
use std::str::FromStr;

use provisio_security::{sha256_digest, SHA256_LEN};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ProvisionError, Result};

/// SHA-256 digest identifying a piece of file content.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; SHA256_LEN]);

impl ContentHash {
    pub const fn from_bytes(bytes: [u8; SHA256_LEN]) -> Self {
        Self(bytes)
    }

    pub fn of(content: &[u8]) -> Self {
        Self(sha256_digest(content))
    }

    pub fn as_bytes(&self) -> &[u8; SHA256_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let decoded = hex::decode(value.trim()).map_err(|err| {
            ProvisionError::serialization(format!("invalid content hash '{value}': {err}"))
        })?;
        let len = decoded.len();
        let bytes: [u8; SHA256_LEN] = decoded.try_into().map_err(|_| {
            ProvisionError::serialization(format!(
                "invalid content hash length: expected {SHA256_LEN} bytes, got {len}"
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = ProvisionError;

    fn from_str(value: &str) -> Result<Self> {
        Self::from_hex(value)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}
