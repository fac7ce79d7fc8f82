//! Cache keys
//!
//! A [`CacheKey`] is an opaque SHA-256 identity. Keys for whole artifacts are
//! computed by the caller from task inputs; keys for content entries are the
//! digest of the content itself.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a cache key in bytes
pub const KEY_LEN: usize = 32;

/// Fixed-length hash identifying a cache entry
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; KEY_LEN]);

impl CacheKey {
    /// Wrap raw hash bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Compute the content key for a byte slice
    #[must_use]
    pub fn from_content(data: &[u8]) -> Self {
        Self::from_digest(Sha256::digest(data).as_slice())
    }

    /// Build a key from a finished SHA-256 digest
    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&digest[..KEY_LEN]);
        Self(bytes)
    }

    /// Parse from a hex string
    ///
    /// # Errors
    ///
    /// Returns error if the string is not 64 hex characters
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != KEY_LEN * 2 {
            return Err(Error::invalid_key(format!(
                "expected {} hex characters, got {}",
                KEY_LEN * 2,
                hex.len()
            )));
        }
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(hex, &mut bytes)
            .map_err(|e| Error::invalid_key(format!("{hex}: {e}")))?;
        Ok(Self(bytes))
    }

    /// Raw hash bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Lowercase hex representation
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

impl FromStr for CacheKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn content_key_is_sha256() {
        let key = CacheKey::from_content(b"hello world");
        assert_eq!(
            key.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn hex_validation() {
        assert!(
            CacheKey::from_hex("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef")
                .is_ok()
        );
        assert!(CacheKey::from_hex("abc").is_err());
        assert!(
            CacheKey::from_hex("xyz3456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef")
                .is_err()
        );
    }

    #[test]
    fn equality_and_hashing_follow_bytes() {
        let a = CacheKey::from_content(b"a");
        let parsed: CacheKey = a.to_hex().parse().unwrap();
        assert_eq!(a, parsed);

        let set: HashSet<CacheKey> = [a, parsed, CacheKey::from_content(b"b")].into();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn serializes_as_hex_string() {
        let key = CacheKey::from_content(b"x");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
        let back: CacheKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<CacheKey>("\"nope\"").is_err());
    }
}
