//! Canonical CBOR encoding and SHA-256 content hashes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_cbor::value::Value as CborValue;
use sha2::{Digest, Sha256};
use std::fmt;

/// Prefix for serialized hashes (e.g. `sha256:deadbeef...`).
pub const HASH_PREFIX: &str = "sha256:";

/// Serialize a value into canonical CBOR bytes.
///
/// Going through `serde_cbor::Value` sorts map keys, so two snapshots with the
/// same entries encode identically regardless of insertion order.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    let canonical: CborValue = serde_cbor::value::to_value(value)?;
    let mut buf = Vec::with_capacity(256);
    let mut serializer = serde_cbor::ser::Serializer::new(&mut buf);
    serializer.self_describe()?;
    canonical.serialize(&mut serializer)?;
    Ok(buf)
}

/// 32-byte SHA-256 digest used for content addressing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&digest);
        ContentHash(arr)
    }

    /// Bare hex digest, used for file names.
    pub fn hex_digest(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        format!("{HASH_PREFIX}{}", hex::encode(self.0))
    }

    pub fn from_hex_str(s: &str) -> Result<Self, HashParseError> {
        let rest = s
            .strip_prefix(HASH_PREFIX)
            .ok_or(HashParseError::MissingPrefix)?;
        if rest.len() != 64 {
            return Err(HashParseError::InvalidLength(rest.len()));
        }
        let mut buf = [0u8; 32];
        hex::decode_to_slice(rest, &mut buf)?;
        Ok(ContentHash(buf))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentHash").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ContentHash::from_hex_str(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HashParseError {
    #[error("hash string missing '{HASH_PREFIX}' prefix")]
    MissingPrefix,
    #[error("hash hex length must be 64, got {0}")]
    InvalidLength(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}
