//! Manifest describing the contents of a cached artifact

use crate::key::CacheKey;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

/// Kind of filesystem location recorded in a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    /// Regular file, content stored under `content_hash`
    File,
    /// Directory
    Directory,
    /// Output location that did not exist
    Missing,
}

/// One filesystem location of an output property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Kind of location
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Path relative to the output root; empty for the root itself
    pub relative_path: String,
    /// Content key (file entries) or tree hash (directories)
    pub content_hash: CacheKey,
    /// Length in bytes, zero for non-files
    pub length: u64,
}

/// Which build produced an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMetadata {
    /// Identity of the producing build invocation
    pub build_invocation_id: String,
    /// How long the producing work took
    #[serde(with = "duration_millis")]
    pub execution_time: Duration,
    /// When the artifact was stored
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl OriginMetadata {
    /// Create origin metadata stamped with the current time
    #[must_use]
    pub fn new(build_invocation_id: impl Into<String>, execution_time: Duration) -> Self {
        Self {
            build_invocation_id: build_invocation_id.into(),
            execution_time,
            created_at: Utc::now(),
        }
    }
}

/// Contents of one cached artifact
///
/// Every file entry's `content_hash` is itself a cache key whose entry holds
/// the file bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    /// Producing build
    pub origin_metadata: OriginMetadata,
    /// Ordered entries per output property; the root location comes first
    pub property_manifests: BTreeMap<String, Vec<ManifestEntry>>,
}

impl CacheManifest {
    /// Serialize to JSON bytes
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::serialization(format!("Failed to serialize manifest: {e}")))
    }

    /// Parse from a JSON stream
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        serde_json::from_reader(reader)
            .map_err(|e| Error::serialization(format!("Failed to parse manifest: {e}")))
    }

    /// Total length of all file entries
    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.entries().map(|entry| entry.length).sum()
    }

    /// Number of file entries
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.entries()
            .filter(|entry| entry.entry_type == EntryType::File)
            .count()
    }

    fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.property_manifests.values().flatten()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> CacheManifest {
        let file_hash = CacheKey::from_content(b"fn main() {}");
        CacheManifest {
            origin_metadata: OriginMetadata::new("build-1", Duration::from_millis(1500)),
            property_manifests: BTreeMap::from([(
                "classes".to_string(),
                vec![
                    ManifestEntry {
                        entry_type: EntryType::Directory,
                        relative_path: String::new(),
                        content_hash: CacheKey::from_content(b"tree"),
                        length: 0,
                    },
                    ManifestEntry {
                        entry_type: EntryType::File,
                        relative_path: "main.rs".to_string(),
                        content_hash: file_hash,
                        length: 12,
                    },
                ],
            )]),
        }
    }

    #[test]
    fn json_uses_screaming_entry_types_and_millis() {
        let json = String::from_utf8(sample_manifest().to_json().unwrap()).unwrap();
        assert!(json.contains("\"type\":\"DIRECTORY\""));
        assert!(json.contains("\"type\":\"FILE\""));
        assert!(json.contains("\"execution_time\":1500"));
    }

    #[test]
    fn parses_back_from_reader() {
        let manifest = sample_manifest();
        let json = manifest.to_json().unwrap();
        let parsed = CacheManifest::from_reader(json.as_slice()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn counts_files_and_bytes() {
        let manifest = sample_manifest();
        assert_eq!(manifest.file_count(), 1);
        assert_eq!(manifest.total_length(), 12);
    }

    #[test]
    fn rejects_garbage() {
        assert!(CacheManifest::from_reader(&b"{not json"[..]).is_err());
    }
}
