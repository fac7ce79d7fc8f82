//! Disk-backed local tier
//!
//! Entries live in a two-level directory structure keyed by their hex key:
//!
//! ```text
//! {root}/
//!   ab/
//!     cd/
//!       abcdef123456...  (header + payload)
//! ```
//!
//! Each entry file starts with a fixed header holding the payload length and
//! its SHA-256, so a truncated or bit-flipped entry is detected on load and
//! reported as [`Error::LocalCorruption`]. Writes go to a temp file in the
//! target directory and are persisted without clobbering: when two writers
//! race on the same key, the first one wins.

use crate::key::CacheKey;
use crate::writer::EntryWriter;
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"BCE1";
const HEADER_LEN: usize = 4 + 8 + 32;

/// Synchronous content-addressed store
///
/// Calls with distinct keys may run concurrently.
pub trait LocalCacheService: Send + Sync {
    /// Whether an entry exists
    fn contains(&self, key: &CacheKey) -> bool;

    /// Feed an entry to `consumer`
    ///
    /// Returns `Ok(false)` when the entry does not exist. An entry that
    /// exists but cannot be read back intact is an error.
    fn load(
        &self,
        key: &CacheKey,
        consumer: &mut dyn FnMut(&mut dyn Read) -> Result<()>,
    ) -> Result<bool>;

    /// Store an entry
    fn store(&self, key: &CacheKey, writer: &dyn EntryWriter) -> Result<()>;

    /// Release resources held by the store
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Summary of what a local store holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalStats {
    /// Number of entries
    pub entries: u64,
    /// Bytes on disk, headers included
    pub bytes: u64,
}

/// Local store rooted at a directory
#[derive(Debug, Clone)]
pub struct DirectoryLocalCache {
    root: PathBuf,
}

impl DirectoryLocalCache {
    /// Create a store at the given root, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        Ok(Self { root })
    }

    /// Root directory of the store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an entry: `{root}/{hex[0:2]}/{hex[2:4]}/{hex}`
    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    /// Count entries and bytes
    pub fn stats(&self) -> Result<LocalStats> {
        let mut stats = LocalStats::default();
        for entry in walkdir::WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = entry.map_err(|e| {
                Error::io_no_path(io::Error::other(e.to_string()), "walk local cache")
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let is_entry = entry
                .file_name()
                .to_str()
                .is_some_and(|name| CacheKey::from_hex(name).is_ok());
            if !is_entry {
                // In-flight temp files
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|e| Error::io_no_path(io::Error::other(e.to_string()), "metadata"))?;
            stats.entries += 1;
            stats.bytes += metadata.len();
        }
        Ok(stats)
    }

    fn write_entry(&self, key: &CacheKey, path: &Path, writer: &dyn EntryWriter) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::configuration(format!("{} has no parent", path.display())))?;
        fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| Error::io(e, parent, "create"))?;
        tmp.write_all(&[0u8; HEADER_LEN])
            .map_err(|e| Error::io(e, tmp.path(), "write"))?;

        let (digest, length) = {
            let mut hashing = HashingWriter::new(BufWriter::new(tmp.as_file_mut()));
            writer
                .write_to(&mut hashing)
                .map_err(|e| Error::io_no_path(e, format!("write entry {key}")))?;
            hashing.finish()
        }
        .map_err(|e| Error::io(e, path, "flush"))?;

        let header = EntryHeader { length, digest };
        let file = tmp.as_file_mut();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&header.encode()))
            .and_then(|()| file.sync_all())
            .map_err(|e| Error::io(e, path, "write header"))?;

        match tmp.persist_noclobber(path) {
            Ok(_) => {
                debug!(key = %key, length, "Stored local build cache entry");
                Ok(())
            }
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                let existing = fs::metadata(path).map(|m| m.len()).unwrap_or_default();
                if existing != HEADER_LEN as u64 + length {
                    warn!(
                        key = %key,
                        existing_bytes = existing,
                        new_bytes = HEADER_LEN as u64 + length,
                        "Conflicting content stored concurrently for the same key; keeping the first"
                    );
                }
                Ok(())
            }
            Err(err) => Err(Error::io(err.error, path, "rename")),
        }
    }
}

impl LocalCacheService for DirectoryLocalCache {
    fn contains(&self, key: &CacheKey) -> bool {
        self.entry_path(key).is_file()
    }

    fn load(
        &self,
        key: &CacheKey,
        consumer: &mut dyn FnMut(&mut dyn Read) -> Result<()>,
    ) -> Result<bool> {
        let path = self.entry_path(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::io(e, &path, "open")),
        };

        let mut reader = BufReader::new(file);
        let header = EntryHeader::read(&mut reader).map_err(|m| Error::local_corruption(key, m))?;
        let mut payload = VerifyingReader::new(reader.take(header.length));

        let consumed = consumer(&mut payload);
        let drained = io::copy(&mut payload, &mut io::sink());
        let verified = payload.verify(&header);

        // A broken entry explains a consumer failure better than the failure itself
        if let Err(message) = verified {
            return Err(Error::local_corruption(key, message));
        }
        consumed?;
        drained.map_err(|e| Error::io(e, &path, "read"))?;
        Ok(true)
    }

    #[tracing::instrument(name = "store_entry", skip_all, fields(key = %key, tier = "local"))]
    fn store(&self, key: &CacheKey, writer: &dyn EntryWriter) -> Result<()> {
        let path = self.entry_path(key);
        if path.is_file() {
            debug!(key = %key, "Local build cache entry already present");
            return Ok(());
        }
        self.write_entry(key, &path, writer)
    }
}

/// A local store together with whether it may be read and written
#[derive(Clone)]
pub struct LocalCacheHandle {
    service: Option<Arc<dyn LocalCacheService>>,
    push: bool,
}

impl LocalCacheHandle {
    /// Handle on an enabled store; `push` controls whether it is written
    #[must_use]
    pub fn new(service: Arc<dyn LocalCacheService>, push: bool) -> Self {
        Self {
            service: Some(service),
            push,
        }
    }

    /// Handle with no local tier
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            service: None,
            push: false,
        }
    }

    /// Whether the local tier may be read
    #[must_use]
    pub fn can_load(&self) -> bool {
        self.service.is_some()
    }

    /// Whether the local tier may be written
    #[must_use]
    pub fn can_store(&self) -> bool {
        self.service.is_some() && self.push
    }

    /// Whether the local tier holds `key`
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.service.as_ref().is_some_and(|s| s.contains(key))
    }

    /// Load from the local tier; `Ok(false)` on a miss or when disabled
    pub fn load(
        &self,
        key: &CacheKey,
        consumer: &mut dyn FnMut(&mut dyn Read) -> Result<()>,
    ) -> Result<bool> {
        match &self.service {
            Some(service) => service.load(key, consumer),
            None => Ok(false),
        }
    }

    /// Store into the local tier if storing is enabled
    pub fn store(&self, key: &CacheKey, writer: &dyn EntryWriter) -> Result<()> {
        match &self.service {
            Some(service) if self.push => service.store(key, writer),
            _ => Ok(()),
        }
    }

    /// Close the underlying store
    pub fn close(&self) -> Result<()> {
        self.service.as_ref().map_or(Ok(()), |s| s.close())
    }
}

struct EntryHeader {
    length: u64,
    digest: [u8; 32],
}

impl EntryHeader {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        out[4..12].copy_from_slice(&self.length.to_le_bytes());
        out[12..].copy_from_slice(&self.digest);
        out
    }

    fn read(reader: &mut impl Read) -> std::result::Result<Self, String> {
        let mut raw = [0u8; HEADER_LEN];
        reader
            .read_exact(&mut raw)
            .map_err(|e| format!("unreadable header: {e}"))?;
        if &raw[..4] != MAGIC {
            return Err("unrecognized entry header".to_string());
        }
        let mut length = [0u8; 8];
        length.copy_from_slice(&raw[4..12]);
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&raw[12..]);
        Ok(Self {
            length: u64::from_le_bytes(length),
            digest,
        })
    }
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(mut self) -> io::Result<([u8; 32], u64)> {
        self.inner.flush()?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(self.hasher.finalize().as_slice());
        Ok((digest, self.written))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct VerifyingReader<R: Read> {
    inner: R,
    hasher: Sha256,
    read: u64,
}

impl<R: Read> VerifyingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            read: 0,
        }
    }

    fn verify(self, header: &EntryHeader) -> std::result::Result<(), String> {
        if self.read != header.length {
            return Err(format!(
                "expected {} payload bytes, found {}",
                header.length, self.read
            ));
        }
        if self.hasher.finalize().as_slice() != header.digest {
            return Err("payload digest mismatch".to_string());
        }
        Ok(())
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}
