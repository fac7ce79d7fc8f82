//! Whole-artifact controller
//!
//! The single-object model: an artifact is packed into one temp file and
//! stored as one entry, straight against the local and remote handles.
//! Temp files are [`NamedTempFile`]s and disappear on every exit path.

use crate::entity::{CacheableEntity, TreeType, clean_output};
use crate::error::RemoteError;
use crate::key::CacheKey;
use crate::local::LocalCacheHandle;
use crate::manifest::OriginMetadata;
use crate::remote::RemoteCacheHandle;
use crate::writer::FileWriter;
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, field, info_span, warn};

/// What packing or unpacking touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackSummary {
    /// Files and directories written into or out of the archive
    pub entries: u64,
}

/// Packs an artifact
pub trait StoreCommand: Send + Sync {
    /// Key the artifact is stored under
    fn key(&self) -> &CacheKey;

    /// Write the packed artifact to `output`
    fn store(&self, output: &mut dyn Write) -> Result<PackSummary>;
}

/// Unpacks an artifact
pub trait LoadCommand: Send + Sync {
    /// What a successful unpack yields
    type Output: Send;

    /// Key the artifact is stored under
    fn key(&self) -> &CacheKey;

    /// Restore the artifact from `input`
    fn load(&self, input: &mut dyn Read) -> Result<(PackSummary, Self::Output)>;
}

/// Single-entry controller over a local and an optional remote handle
pub struct ArtifactController {
    local: LocalCacheHandle,
    remote: Option<RemoteCacheHandle>,
    temp_dir: PathBuf,
    transfer_timeout: Duration,
    disable_remote_on_error: bool,
}

impl ArtifactController {
    /// Create a controller keeping its temp files in `temp_dir`
    #[must_use]
    pub fn new(
        local: LocalCacheHandle,
        remote: Option<RemoteCacheHandle>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            local,
            remote,
            temp_dir: temp_dir.into(),
            transfer_timeout: Duration::from_secs(60),
            disable_remote_on_error: true,
        }
    }

    /// Deadline for a single remote transfer
    #[must_use]
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Whether the remote handle is disabled after its first failure
    #[must_use]
    pub fn with_disable_remote_on_error(mut self, disable: bool) -> Self {
        self.disable_remote_on_error = disable;
        self
    }

    fn temp_file(&self) -> Result<NamedTempFile> {
        fs::create_dir_all(&self.temp_dir)
            .map_err(|e| Error::io(e, &self.temp_dir, "create_dir_all"))?;
        NamedTempFile::new_in(&self.temp_dir).map_err(|e| Error::io(e, &self.temp_dir, "create"))
    }

    fn remote_failed(&self, remote: &RemoteCacheHandle, key: &CacheKey, error: &RemoteError) {
        warn!(key = %key, error = %error, "Remote build cache transfer failed");
        if self.disable_remote_on_error && !matches!(error, RemoteError::Cancelled) {
            remote.disable_on_error(error);
        }
    }

    /// Load an artifact, local tier first
    ///
    /// A local hit that fails to unpack is an error. A remote hit that fails
    /// to unpack is a miss.
    pub async fn load<C: LoadCommand>(&self, command: &C) -> Result<Option<C::Output>> {
        let key = *command.key();

        if self.local.can_load() {
            let mut temp = self.temp_file()?;
            let found = {
                let file = temp.as_file_mut();
                self.local.load(&key, &mut |input| {
                    io::copy(input, &mut *file).map_err(|e| Error::io_no_path(e, "copy local entry"))?;
                    Ok(())
                })?
            };
            if found {
                let output = unpack_file(&key, &mut temp, command)?;
                debug!(key = %key, "Loaded artifact from local build cache");
                return Ok(Some(output));
            }
        }

        let Some(remote) = self.remote.as_ref().filter(|r| r.can_load()) else {
            return Ok(None);
        };
        let data = match self.download(remote, &key).await {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(None),
            Err(error) => {
                self.remote_failed(remote, &key, &error);
                return Ok(None);
            }
        };

        let mut temp = self.temp_file()?;
        temp.write_all(&data)
            .map_err(|e| Error::io(e, temp.path(), "write"))?;
        let output = match unpack_file(&key, &mut temp, command) {
            Ok(output) => output,
            Err(error) => {
                warn!(key = %key, error = %error, "Could not unpack remote build cache artifact");
                return Ok(None);
            }
        };
        if self.local.can_store() {
            self.local
                .store(&key, &FileWriter::new(temp.path(), data.len() as u64))?;
        }
        debug!(key = %key, "Loaded artifact from remote build cache");
        Ok(Some(output))
    }

    /// Pack an artifact once and store it in every tier that accepts stores
    pub async fn store<C: StoreCommand>(&self, command: &C) -> Result<PackSummary> {
        let key = *command.key();
        let remote = self.remote.as_ref().filter(|r| r.can_store());
        if remote.is_none() && !self.local.can_store() {
            return Ok(PackSummary::default());
        }

        let mut temp = self.temp_file()?;
        let (summary, size) = pack_file(&key, &mut temp, command)?;

        if let Some(remote) = remote {
            let data = fs::read(temp.path()).map_err(|e| Error::io(e, temp.path(), "read"))?;
            if let Err(error) = self.upload(remote, &key, Bytes::from(data)).await {
                self.remote_failed(remote, &key, &error);
            }
        }
        if self.local.can_store() {
            self.local.store(&key, &FileWriter::new(temp.path(), size))?;
        }
        Ok(summary)
    }

    async fn download(
        &self,
        remote: &RemoteCacheHandle,
        key: &CacheKey,
    ) -> std::result::Result<Option<Bytes>, RemoteError> {
        tokio::time::timeout(self.transfer_timeout, remote.load(key))
            .await
            .unwrap_or_else(|_| Err(RemoteError::timeout("load", self.transfer_timeout.as_secs())))
    }

    async fn upload(
        &self,
        remote: &RemoteCacheHandle,
        key: &CacheKey,
        data: Bytes,
    ) -> std::result::Result<(), RemoteError> {
        tokio::time::timeout(self.transfer_timeout, remote.store(key, data))
            .await
            .unwrap_or_else(|_| Err(RemoteError::timeout("store", self.transfer_timeout.as_secs())))
    }

    /// Close both handles
    pub async fn close(&self) -> Result<()> {
        if let Some(remote) = &self.remote
            && let Err(e) = remote.close().await
        {
            warn!(error = %e, "Failed to close remote build cache");
        }
        self.local.close()
    }
}

fn unpack_file<C: LoadCommand>(
    key: &CacheKey,
    temp: &mut NamedTempFile,
    command: &C,
) -> Result<C::Output> {
    let span = info_span!("unpack", key = %key, entries = field::Empty, bytes = field::Empty);
    let _guard = span.enter();

    let file = temp.as_file_mut();
    let bytes = file
        .seek(SeekFrom::End(0))
        .and_then(|len| file.seek(SeekFrom::Start(0)).map(|_| len))
        .map_err(|e| Error::io_no_path(e, "rewind artifact"))?;
    let (summary, output) = command.load(file)?;
    span.record("entries", summary.entries);
    span.record("bytes", bytes);
    Ok(output)
}

fn pack_file<C: StoreCommand>(
    key: &CacheKey,
    temp: &mut NamedTempFile,
    command: &C,
) -> Result<(PackSummary, u64)> {
    let span = info_span!("pack", key = %key, entries = field::Empty, bytes = field::Empty);
    let _guard = span.enter();

    let summary = {
        let mut output = BufWriter::new(temp.as_file_mut());
        let summary = command.store(&mut output)?;
        output
            .flush()
            .map_err(|e| Error::io_no_path(e, "flush artifact"))?;
        summary
    };
    let size = temp
        .as_file()
        .metadata()
        .map_err(|e| Error::io(e, temp.path(), "metadata"))?
        .len();
    span.record("entries", summary.entries);
    span.record("bytes", size);
    Ok((summary, size))
}

const ORIGIN_ENTRY: &str = "origin.json";
const TREE_PREFIX: &str = "tree-";
const ZSTD_LEVEL: i32 = 3;

/// Packs an entity's outputs as a zstd-compressed tar
///
/// The archive holds `origin.json` followed by one `tree-{property}` subtree
/// (or file) per output property. Missing outputs have no archive entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarArtifactPacker;

impl TarArtifactPacker {
    /// Write the outputs of `entity` to `output`
    pub fn pack(
        self,
        entity: &dyn CacheableEntity,
        origin: &OriginMetadata,
        output: &mut dyn Write,
    ) -> Result<PackSummary> {
        let encoder = zstd::Encoder::new(output, ZSTD_LEVEL)
            .map_err(|e| Error::codec("zstd", e.to_string()))?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(true);

        let origin_json = serde_json::to_vec(origin)
            .map_err(|e| Error::serialization(format!("Failed to serialize origin: {e}")))?;
        let mut header = tar::Header::new_gnu();
        header.set_size(origin_json.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, ORIGIN_ENTRY, origin_json.as_slice())
            .map_err(|e| Error::io_no_path(e, "append origin"))?;

        let mut entries = 0;
        entity.visit_output_trees(&mut |property, tree_type, root| {
            entries += append_tree(&mut builder, property, tree_type, root)?;
            Ok(())
        })?;

        let encoder = builder
            .into_inner()
            .map_err(|e| Error::io_no_path(e, "finish tar"))?;
        encoder
            .finish()
            .map_err(|e| Error::codec("zstd", e.to_string()))?;
        Ok(PackSummary { entries })
    }

    /// Restore the outputs of `entity` from `input`
    pub fn unpack(
        self,
        entity: &dyn CacheableEntity,
        input: &mut dyn Read,
    ) -> Result<(PackSummary, OriginMetadata)> {
        let mut roots: HashMap<String, PathBuf> = HashMap::new();
        entity.visit_output_trees(&mut |property, tree_type, root| {
            clean_output(tree_type, root)?;
            roots.insert(format!("{TREE_PREFIX}{property}"), root.to_path_buf());
            Ok(())
        })?;

        let decoder =
            zstd::Decoder::new(input).map_err(|e| Error::codec("zstd", e.to_string()))?;
        let mut archive = tar::Archive::new(decoder);
        let mut origin = None;
        let mut entries = 0;

        for entry in archive
            .entries()
            .map_err(|e| Error::io_no_path(e, "read tar"))?
        {
            let mut entry = entry.map_err(|e| Error::io_no_path(e, "read tar entry"))?;
            let path = entry
                .path()
                .map_err(|e| Error::io_no_path(e, "read tar path"))?
                .into_owned();

            if path == Path::new(ORIGIN_ENTRY) {
                let mut json = Vec::new();
                entry
                    .read_to_end(&mut json)
                    .map_err(|e| Error::io_no_path(e, "read origin"))?;
                origin = Some(serde_json::from_slice(&json).map_err(|e| {
                    Error::serialization(format!("Failed to parse origin: {e}"))
                })?);
                continue;
            }

            let destination = destination_for(&roots, &path)?;
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
            }
            entry
                .unpack(&destination)
                .map_err(|e| Error::io(e, &destination, "unpack"))?;
            entries += 1;
        }

        let origin = origin
            .ok_or_else(|| Error::serialization("Artifact archive has no origin metadata"))?;
        Ok((PackSummary { entries }, origin))
    }
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    property: &str,
    tree_type: TreeType,
    root: &Path,
) -> Result<u64> {
    let name = format!("{TREE_PREFIX}{property}");
    if !root.exists() {
        return Ok(0);
    }
    match tree_type {
        TreeType::File => {
            let mut file = File::open(root).map_err(|e| Error::io(e, root, "open"))?;
            builder
                .append_file(&name, &mut file)
                .map_err(|e| Error::io(e, root, "append"))?;
            Ok(1)
        }
        TreeType::Directory => {
            let mut entries = 0;
            for entry in walkdir::WalkDir::new(root)
                .follow_links(true)
                .sort_by_file_name()
            {
                let entry = entry.map_err(|e| {
                    Error::io(io::Error::other(e.to_string()), root, "walk")
                })?;
                let relative = entry.path().strip_prefix(root).map_err(|_| {
                    Error::configuration(format!(
                        "path {} is not under output root {}",
                        entry.path().display(),
                        root.display()
                    ))
                })?;
                let archived = Path::new(&name).join(relative);
                builder
                    .append_path_with_name(entry.path(), &archived)
                    .map_err(|e| Error::io(e, entry.path(), "append"))?;
                entries += 1;
            }
            Ok(entries)
        }
    }
}

/// Map an archive path to its output location, refusing paths that escape
fn destination_for(roots: &HashMap<String, PathBuf>, path: &Path) -> Result<PathBuf> {
    let mut components = path.components();
    let tree = components
        .next()
        .and_then(|c| match c {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
        .ok_or_else(|| Error::invalid_output(format!("unexpected archive entry {}", path.display())))?;
    let root = roots.get(tree).ok_or_else(|| {
        Error::invalid_output(format!("archive entry {} matches no output", path.display()))
    })?;
    let rest = components.as_path();
    if rest.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(Error::invalid_output(format!(
            "archive entry {} escapes its output",
            path.display()
        )));
    }
    if rest.as_os_str().is_empty() {
        Ok(root.clone())
    } else {
        Ok(root.join(rest))
    }
}

/// Stores an entity through [`TarArtifactPacker`]
pub struct EntityStoreCommand<'a> {
    key: CacheKey,
    entity: &'a dyn CacheableEntity,
    origin: OriginMetadata,
}

impl<'a> EntityStoreCommand<'a> {
    /// Command storing `entity` under `key`
    #[must_use]
    pub fn new(key: CacheKey, entity: &'a dyn CacheableEntity, origin: OriginMetadata) -> Self {
        Self {
            key,
            entity,
            origin,
        }
    }
}

impl StoreCommand for EntityStoreCommand<'_> {
    fn key(&self) -> &CacheKey {
        &self.key
    }

    fn store(&self, output: &mut dyn Write) -> Result<PackSummary> {
        TarArtifactPacker.pack(self.entity, &self.origin, output)
    }
}

/// Restores an entity through [`TarArtifactPacker`]
pub struct EntityLoadCommand<'a> {
    key: CacheKey,
    entity: &'a dyn CacheableEntity,
}

impl<'a> EntityLoadCommand<'a> {
    /// Command restoring `entity` from `key`
    #[must_use]
    pub fn new(key: CacheKey, entity: &'a dyn CacheableEntity) -> Self {
        Self { key, entity }
    }
}

impl LoadCommand for EntityLoadCommand<'_> {
    type Output = OriginMetadata;

    fn key(&self) -> &CacheKey {
        &self.key
    }

    fn load(&self, input: &mut dyn Read) -> Result<(PackSummary, OriginMetadata)> {
        TarArtifactPacker.unpack(self.entity, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::OutputTrees;
    use crate::local::DirectoryLocalCache;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn entity(root: &Path) -> OutputTrees {
        OutputTrees::new(":jar")
            .with_tree("classes", TreeType::Directory, root.join("classes"))
            .with_tree("manifest", TreeType::File, root.join("MANIFEST.MF"))
    }

    fn write_outputs(root: &Path) {
        fs::create_dir_all(root.join("classes/com/example")).unwrap();
        fs::write(root.join("classes/com/example/Main.class"), b"cafebabe").unwrap();
        fs::write(root.join("MANIFEST.MF"), b"Main-Class: Main\n").unwrap();
    }

    #[test]
    fn tar_packer_restores_outputs_and_origin() {
        let tmp = TempDir::new().unwrap();
        write_outputs(tmp.path());
        let entity = entity(tmp.path());
        let origin = OriginMetadata::new("build-7", Duration::from_millis(42));

        let mut archive = Vec::new();
        let packed = TarArtifactPacker.pack(&entity, &origin, &mut archive).unwrap();
        assert_eq!(packed.entries, 5);

        fs::remove_dir_all(tmp.path().join("classes")).unwrap();
        fs::write(tmp.path().join("MANIFEST.MF"), b"stale").unwrap();

        let (unpacked, restored) = TarArtifactPacker
            .unpack(&entity, &mut archive.as_slice())
            .unwrap();
        assert_eq!(unpacked.entries, 5);
        assert_eq!(restored.build_invocation_id, "build-7");
        assert_eq!(
            fs::read(tmp.path().join("classes/com/example/Main.class")).unwrap(),
            b"cafebabe"
        );
        assert_eq!(
            fs::read(tmp.path().join("MANIFEST.MF")).unwrap(),
            b"Main-Class: Main\n"
        );
    }

    #[test]
    fn archive_paths_cannot_escape() {
        let roots = HashMap::from([("tree-out".to_string(), PathBuf::from("/work/out"))]);
        assert_eq!(
            destination_for(&roots, Path::new("tree-out/a.txt")).unwrap(),
            PathBuf::from("/work/out/a.txt")
        );
        assert!(destination_for(&roots, Path::new("tree-out/../../etc")).is_err());
        assert!(destination_for(&roots, Path::new("tree-other/a")).is_err());
    }

    #[tokio::test]
    async fn local_round_trip_through_temp_files() {
        let tmp = TempDir::new().unwrap();
        let outputs = tmp.path().join("outputs");
        write_outputs(&outputs);
        let local = DirectoryLocalCache::open(tmp.path().join("cache")).unwrap();
        let controller = ArtifactController::new(
            LocalCacheHandle::new(Arc::new(local), true),
            None,
            tmp.path().join("tmp"),
        );
        let entity = entity(&outputs);
        let key = CacheKey::from_content(b":jar inputs");

        let origin = OriginMetadata::new("build-1", Duration::from_secs(3));
        controller
            .store(&EntityStoreCommand::new(key, &entity, origin))
            .await
            .unwrap();
        fs::remove_dir_all(&outputs).unwrap();

        let restored = controller
            .load(&EntityLoadCommand::new(key, &entity))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored.build_invocation_id, "build-1");
        assert!(outputs.join("classes/com/example/Main.class").is_file());
        assert_eq!(fs::read_dir(tmp.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unknown_key_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let local = DirectoryLocalCache::open(tmp.path().join("cache")).unwrap();
        let controller = ArtifactController::new(
            LocalCacheHandle::new(Arc::new(local), true),
            None,
            tmp.path().join("tmp"),
        );
        let entity = entity(tmp.path());
        let loaded = controller
            .load(&EntityLoadCommand::new(CacheKey::from_content(b"?"), &entity))
            .await
            .unwrap();
        assert!(loaded.is_none());
    }
}
