//! Two-tier content-addressed build cache
//!
//! Entries are immutable byte blobs addressed by a 32-byte [`CacheKey`].
//! Every entry lives in a local directory tier and, optionally, a shared
//! remote tier:
//! - [`TieredCacheAccess`] moves batches of entries between the tiers with
//!   bounded transfer concurrency, mirroring remote hits into the local tier
//! - [`CompressingAccess`] layers codecs (gzip, lz4, lzf, zstd) over any
//!   access
//! - [`BuildCacheController`] stores an entity's output trees as a manifest
//!   plus deduplicated file contents, and restores them
//! - [`ArtifactController`] is the older whole-artifact scheme where all
//!   outputs travel as one tar archive
//! - [`ControllerRegistry`] shares one controller between nested build
//!   scopes and closes it exactly once
//!
//! # Lookup
//!
//! A load consults the local tier first. Keys it cannot serve are fetched
//! from the remote tier concurrently; hits are handed to the caller and
//! written back locally. Remote failures degrade to misses, and with
//! `disable_on_error` the remote tier is switched off for the rest of the
//! build.

#![expect(
    clippy::missing_errors_doc,
    reason = "Errors are described on the Error enum"
)]

pub mod access;
pub mod artifact;
pub mod compression;
pub mod config;
pub mod controller;
pub mod entity;
mod error;
pub mod key;
pub mod lifetime;
pub mod local;
pub mod manifest;
pub mod remote;
pub mod writer;

// Re-export error types at crate root
pub use error::{Error, RemoteError, RemoteResult, Result};

// Re-export main types
pub use access::{
    AccessSettings, BuildCacheAccess, LoadHandler, StoreHandler, Tier, TieredCacheAccess,
    TransferStats,
};
pub use artifact::{ArtifactController, EntityLoadCommand, EntityStoreCommand, TarArtifactPacker};
pub use compression::{CodecChain, CompressingAccess, Compression};
pub use config::{BackendKind, CacheConfig, LocalConfig, RemoteConfig, RetryConfig};
pub use controller::{BuildCacheController, LoadResult, StoreResult};
pub use entity::{CacheableEntity, OutputTrees, TreeType};
pub use key::CacheKey;
pub use lifetime::{AsyncClose, ControllerRegistry, Lease};
pub use local::{DirectoryLocalCache, LocalCacheHandle, LocalCacheService};
pub use manifest::{CacheManifest, EntryType, ManifestEntry, OriginMetadata};
pub use remote::{RemoteCacheHandle, RemoteCacheService};
pub use writer::{BytesWriter, EntryWriter, FileWriter};
