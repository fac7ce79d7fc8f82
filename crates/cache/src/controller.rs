//! Manifest-based storage of an entity's outputs
//!
//! Storing snapshots every output tree, stores each distinct file once under
//! its content hash, then stores the manifest JSON under the artifact key.
//! Loading fetches the manifest, clears the output locations, replays the
//! directory and missing entries, and fetches each distinct file hash once,
//! writing every file that shares it.

use crate::access::{BuildCacheAccess, LoadHandler, StoreHandler};
use crate::entity::{CacheableEntity, TreeType, clean_output, remove_any};
use crate::key::CacheKey;
use crate::manifest::{CacheManifest, EntryType, ManifestEntry, OriginMetadata};
use crate::writer::{BytesWriter, CountingWriter, EntryWriter, FileWriter, WriteCounters};
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, field, warn};

/// Hash recorded for output locations that do not exist
const MISSING_HASH: CacheKey = CacheKey::from_bytes([0; 32]);

/// Outcome of a successful load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    /// Entries loaded, the manifest included
    pub artifact_entry_count: u64,
    /// Build that produced the artifact
    pub origin_metadata: OriginMetadata,
    /// Restored entries per output property
    pub property_entries: BTreeMap<String, Vec<ManifestEntry>>,
}

/// Outcome of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreResult {
    /// Entries written to at least one tier, the manifest included
    pub entry_count: u64,
    /// Bytes of those entries before compression
    pub total_size: u64,
}

/// Stores and restores entity outputs through a [`BuildCacheAccess`]
#[derive(Debug)]
pub struct BuildCacheController<A> {
    access: A,
    build_invocation_id: String,
}

impl<A: BuildCacheAccess> BuildCacheController<A> {
    /// Controller stamping artifacts with a fresh build invocation id
    #[must_use]
    pub fn new(access: A) -> Self {
        Self::with_build_invocation_id(access, uuid::Uuid::new_v4().to_string())
    }

    /// Controller stamping artifacts with `build_invocation_id`
    #[must_use]
    pub fn with_build_invocation_id(access: A, build_invocation_id: impl Into<String>) -> Self {
        Self {
            access,
            build_invocation_id: build_invocation_id.into(),
        }
    }

    /// Underlying access
    #[must_use]
    pub fn access(&self) -> &A {
        &self.access
    }

    /// Identity written into stored origin metadata
    #[must_use]
    pub fn build_invocation_id(&self) -> &str {
        &self.build_invocation_id
    }

    /// Restore the outputs of `entity` from the artifact stored under `key`
    ///
    /// Returns `Ok(None)` on a miss, including when the manifest references
    /// content that no tier can supply.
    #[tracing::instrument(
        name = "load_manifest",
        skip(self, entity),
        fields(key = %key, entity = entity.identity())
    )]
    pub async fn load(
        &self,
        key: &CacheKey,
        entity: &dyn CacheableEntity,
    ) -> Result<Option<LoadResult>> {
        let manifest_handler = ManifestLoadHandler::default();
        self.access
            .load(HashMap::from([(*key, ())]), &manifest_handler)
            .await?;
        let Some((manifest, manifest_size)) = manifest_handler.take() else {
            debug!(key = %key, "No build cache manifest");
            return Ok(None);
        };
        self.unpack(key, entity, manifest, manifest_size).await
    }

    #[tracing::instrument(
        name = "unpack",
        skip_all,
        fields(key = %key, entries = field::Empty, bytes = field::Empty)
    )]
    async fn unpack(
        &self,
        key: &CacheKey,
        entity: &dyn CacheableEntity,
        manifest: CacheManifest,
        manifest_size: u64,
    ) -> Result<Option<LoadResult>> {
        let trees = collect_trees(entity)?;
        for (property, _, _) in &trees {
            if !manifest.property_manifests.contains_key(property) {
                warn!(key = %key, property = %property, "Build cache manifest does not cover output property");
                return Ok(None);
            }
        }

        let mut targets: HashMap<CacheKey, FileTargets> = HashMap::new();
        for (property, tree_type, root) in &trees {
            clean_output(*tree_type, root)?;
            for entry in &manifest.property_manifests[property] {
                let path = entry_path(root, &entry.relative_path)?;
                match entry.entry_type {
                    EntryType::Directory => {
                        fs::create_dir_all(&path).map_err(|e| Error::io(e, &path, "create_dir_all"))?;
                    }
                    EntryType::File => {
                        targets
                            .entry(entry.content_hash)
                            .or_insert_with(|| FileTargets {
                                hash: entry.content_hash,
                                length: entry.length,
                                files: Vec::new(),
                            })
                            .files
                            .push(path);
                    }
                    EntryType::Missing => remove_any(&path)?,
                }
            }
        }

        let expected: HashSet<CacheKey> = targets.keys().copied().collect();
        let file_handler = FileLoadHandler::default();
        self.access.load(targets, &file_handler).await?;

        let resolved = file_handler.resolved();
        let unresolved = expected.difference(&resolved).count();
        if unresolved > 0 {
            warn!(
                key = %key,
                unresolved,
                "Build cache content entries unavailable, treating artifact as a miss"
            );
            for (_, _, root) in &trees {
                remove_any(root)?;
            }
            return Ok(None);
        }

        let artifact_entry_count = 1 + file_handler.entries.load(Ordering::Relaxed);
        let span = tracing::Span::current();
        span.record("entries", artifact_entry_count);
        span.record("bytes", manifest_size + manifest.total_length());

        let CacheManifest {
            origin_metadata,
            property_manifests,
        } = manifest;
        let property_entries = trees
            .iter()
            .filter_map(|(property, _, _)| {
                property_manifests
                    .get(property)
                    .map(|entries| (property.clone(), entries.clone()))
            })
            .collect();

        Ok(Some(LoadResult {
            artifact_entry_count,
            origin_metadata,
            property_entries,
        }))
    }

    /// Store the outputs of `entity` as an artifact under `key`
    #[tracing::instrument(
        name = "pack",
        skip(self, entity),
        fields(key = %key, entity = entity.identity(), entries = field::Empty, bytes = field::Empty)
    )]
    pub async fn store(
        &self,
        key: &CacheKey,
        entity: &dyn CacheableEntity,
        execution_time: Duration,
    ) -> Result<StoreResult> {
        let trees = collect_trees(entity)?;
        let mut property_manifests = BTreeMap::new();
        let mut files: HashMap<CacheKey, FileWriter> = HashMap::new();
        for (property, tree_type, root) in &trees {
            let entries = snapshot_tree(*tree_type, root)?;
            for entry in entries.iter().filter(|e| e.entry_type == EntryType::File) {
                // Identical files are read from whichever comes first
                files.entry(entry.content_hash).or_insert_with(|| {
                    FileWriter::new(entry_path_unchecked(root, &entry.relative_path), entry.length)
                });
            }
            property_manifests.insert(property.clone(), entries);
        }

        let manifest = CacheManifest {
            origin_metadata: OriginMetadata::new(&self.build_invocation_id, execution_time),
            property_manifests,
        };
        let manifest_json = manifest.to_json()?;

        let counters = Arc::new(WriteCounters::default());
        let store_files = CountingStoreHandler {
            counters: Arc::clone(&counters),
        };
        self.access.store(files, &store_files).await?;
        self.access
            .store(
                HashMap::from([(*key, BytesWriter::new(manifest_json))]),
                &store_files,
            )
            .await?;

        let result = StoreResult {
            entry_count: counters.entries(),
            total_size: counters.bytes(),
        };
        let span = tracing::Span::current();
        span.record("entries", result.entry_count);
        span.record("bytes", result.total_size);
        debug!(key = %key, entries = result.entry_count, bytes = result.total_size, "Stored build cache artifact");
        Ok(result)
    }

    /// Close the underlying access
    pub async fn close(&self) -> Result<()> {
        self.access.close().await
    }
}

fn collect_trees(entity: &dyn CacheableEntity) -> Result<Vec<(String, TreeType, PathBuf)>> {
    let mut trees = Vec::new();
    entity.visit_output_trees(&mut |property, tree_type, root| {
        trees.push((property.to_string(), tree_type, root.to_path_buf()));
        Ok(())
    })?;
    Ok(trees)
}

/// Resolve a manifest path under `root`, refusing paths that escape it
fn entry_path(root: &Path, relative_path: &str) -> Result<PathBuf> {
    let relative = Path::new(relative_path);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(Error::invalid_output(format!(
            "manifest path {relative_path:?} escapes {}",
            root.display()
        )));
    }
    Ok(entry_path_unchecked(root, relative_path))
}

fn entry_path_unchecked(root: &Path, relative_path: &str) -> PathBuf {
    if relative_path.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative_path)
    }
}

/// Build the ordered manifest entries for one output tree, root first
fn snapshot_tree(tree_type: TreeType, root: &Path) -> Result<Vec<ManifestEntry>> {
    let metadata = match fs::metadata(root) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(vec![ManifestEntry {
                entry_type: EntryType::Missing,
                relative_path: String::new(),
                content_hash: MISSING_HASH,
                length: 0,
            }]);
        }
        Err(e) => return Err(Error::io(e, root, "metadata")),
    };

    match tree_type {
        TreeType::File => {
            if !metadata.is_file() {
                return Err(Error::invalid_output(format!(
                    "Expected '{}' to be a file",
                    root.display()
                )));
            }
            Ok(vec![ManifestEntry {
                entry_type: EntryType::File,
                relative_path: String::new(),
                content_hash: hash_file(root)?,
                length: metadata.len(),
            }])
        }
        TreeType::Directory => {
            if !metadata.is_dir() {
                return Err(Error::invalid_output(format!(
                    "Expected '{}' to be a directory",
                    root.display()
                )));
            }
            snapshot_directory(root)
        }
    }
}

fn snapshot_directory(root: &Path) -> Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            Error::io(io::Error::other(e.to_string()), path, "walk")
        })?;
        let path = entry.path();
        let relative = path.strip_prefix(root).map_err(|_| {
            Error::configuration(format!(
                "path {} is not under output root {}",
                path.display(),
                root.display()
            ))
        })?;
        let relative_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            entries.push(ManifestEntry {
                entry_type: EntryType::Directory,
                relative_path,
                content_hash: MISSING_HASH,
                length: 0,
            });
        } else {
            let length = entry
                .metadata()
                .map_err(|e| Error::io(io::Error::other(e.to_string()), path, "metadata"))?
                .len();
            entries.push(ManifestEntry {
                entry_type: EntryType::File,
                relative_path,
                content_hash: hash_file(path)?,
                length,
            });
        }
    }

    // Pre-order walk: a directory's descendants follow it contiguously
    for index in (0..entries.len()).rev() {
        if entries[index].entry_type == EntryType::Directory {
            entries[index].content_hash = tree_hash(&entries, index);
        }
    }
    Ok(entries)
}

/// Hash of a directory over its descendants' paths, types and hashes
fn tree_hash(entries: &[ManifestEntry], index: usize) -> CacheKey {
    let directory = &entries[index].relative_path;
    let prefix = if directory.is_empty() {
        String::new()
    } else {
        format!("{directory}/")
    };
    let mut hasher = Sha256::new();
    for child in entries[index + 1..]
        .iter()
        .take_while(|child| child.relative_path.starts_with(&prefix))
    {
        let tag: &[u8] = match child.entry_type {
            EntryType::File => b"F",
            EntryType::Directory => b"D",
            EntryType::Missing => b"M",
        };
        hasher.update(tag);
        hasher.update(child.relative_path[prefix.len()..].as_bytes());
        hasher.update([0u8]);
        hasher.update(child.content_hash.as_bytes());
    }
    CacheKey::from_digest(hasher.finalize().as_slice())
}

fn hash_file(path: &Path) -> Result<CacheKey> {
    let mut file = File::open(path).map_err(|e| Error::io(e, path, "open"))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io(e, path, "read")),
        };
        hasher.update(&buffer[..n]);
    }
    Ok(CacheKey::from_digest(hasher.finalize().as_slice()))
}

#[derive(Default)]
struct ManifestLoadHandler {
    manifest: Mutex<Option<(CacheManifest, u64)>>,
}

impl ManifestLoadHandler {
    fn take(&self) -> Option<(CacheManifest, u64)> {
        self.manifest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl LoadHandler<()> for ManifestLoadHandler {
    fn handle(&self, input: &mut dyn Read, _payload: ()) -> Result<()> {
        let mut json = Vec::new();
        input
            .read_to_end(&mut json)
            .map_err(|e| Error::io_no_path(e, "read manifest"))?;
        let manifest = CacheManifest::from_reader(json.as_slice())?;
        *self.manifest.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((manifest, json.len() as u64));
        Ok(())
    }
}

/// Every file restored from one content entry
struct FileTargets {
    hash: CacheKey,
    length: u64,
    files: Vec<PathBuf>,
}

#[derive(Default)]
struct FileLoadHandler {
    resolved: Mutex<HashSet<CacheKey>>,
    entries: AtomicU64,
}

impl FileLoadHandler {
    fn resolved(&self) -> HashSet<CacheKey> {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LoadHandler<FileTargets> for FileLoadHandler {
    fn handle(&self, input: &mut dyn Read, payload: FileTargets) -> Result<()> {
        let mut outputs = Vec::with_capacity(payload.files.len());
        for path in &payload.files {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
            }
            outputs.push(File::create(path).map_err(|e| Error::io(e, path, "create"))?);
        }

        let mut hasher = Sha256::new();
        let mut length = 0u64;
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = match input.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::io_no_path(e, format!("read entry {}", payload.hash)));
                }
            };
            hasher.update(&buffer[..n]);
            length += n as u64;
            for (output, path) in outputs.iter_mut().zip(&payload.files) {
                output
                    .write_all(&buffer[..n])
                    .map_err(|e| Error::io(e, path, "write"))?;
            }
        }

        let actual = CacheKey::from_digest(hasher.finalize().as_slice());
        if actual != payload.hash || length != payload.length {
            drop(outputs);
            for path in &payload.files {
                let _ = fs::remove_file(path);
            }
            return Err(Error::content_mismatch(
                payload.hash,
                format!(
                    "got {length} bytes hashing to {actual}, expected {} bytes",
                    payload.length
                ),
            ));
        }

        self.entries
            .fetch_add(payload.files.len() as u64, Ordering::Relaxed);
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(payload.hash);
        Ok(())
    }
}

struct CountingStoreHandler {
    counters: Arc<WriteCounters>,
}

impl<W: EntryWriter + Clone + 'static> StoreHandler<W> for CountingStoreHandler {
    fn create_writer(&self, payload: &W) -> Result<Box<dyn EntryWriter>> {
        Ok(Box::new(CountingWriter::new(
            Box::new(payload.clone()),
            Arc::clone(&self.counters),
        )))
    }
}
