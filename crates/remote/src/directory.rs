//! Shared-directory remote backend
//!
//! Stores entries as `{root}/{hex[0..2]}/{hex}`, typically on a network
//! mount shared between machines. Writes go to a temporary file in the
//! target directory and are renamed into place, so readers never observe a
//! partial entry.

use async_trait::async_trait;
use buildcache::{CacheKey, Error, RemoteCacheService, RemoteConfig, RemoteError, RemoteResult};
use bytes::Bytes;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Remote tier backed by a directory
#[derive(Debug, Clone)]
pub struct DirectoryRemote {
    root: PathBuf,
}

impl DirectoryRemote {
    /// Backend rooted at `root`, created if missing
    pub fn open(root: impl Into<PathBuf>) -> buildcache::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        Ok(Self { root })
    }

    /// Build a backend from remote configuration
    pub fn from_config(config: &RemoteConfig) -> buildcache::Result<Self> {
        let path = config
            .path
            .as_ref()
            .ok_or_else(|| Error::configuration("directory remote requires a path"))?;
        Self::open(path)
    }

    /// Directory entries are stored under
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[0..2]).join(hex)
    }
}

fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("entry path has no parent"))?;
    std::fs::create_dir_all(parent)?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl RemoteCacheService for DirectoryRemote {
    fn name(&self) -> &str {
        "directory"
    }

    async fn contains(&self, key: &CacheKey) -> RemoteResult<bool> {
        tokio::fs::try_exists(self.entry_path(key))
            .await
            .map_err(|e| RemoteError::io(e, "contains"))
    }

    async fn load(&self, key: &CacheKey) -> RemoteResult<Option<Bytes>> {
        match tokio::fs::read(self.entry_path(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RemoteError::io(e, "load")),
        }
    }

    async fn store(&self, key: &CacheKey, data: Bytes) -> RemoteResult<()> {
        let path = self.entry_path(key);
        debug!(path = %path.display(), size = data.len(), "Writing build cache entry to shared directory");
        tokio::task::spawn_blocking(move || write_atomically(&path, &data))
            .await
            .map_err(|e| RemoteError::io(io::Error::other(e), "store"))?
            .map_err(|e| RemoteError::io(e, "store"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn stores_and_loads_entries() {
        let tmp = TempDir::new().unwrap();
        let remote = DirectoryRemote::open(tmp.path().join("shared")).unwrap();
        let key = CacheKey::from_content(b"entry");

        assert!(!remote.contains(&key).await.unwrap());
        assert!(remote.load(&key).await.unwrap().is_none());

        remote.store(&key, Bytes::from_static(b"entry")).await.unwrap();

        assert!(remote.contains(&key).await.unwrap());
        assert_eq!(
            remote.load(&key).await.unwrap().as_deref(),
            Some(&b"entry"[..])
        );
        let hex = key.to_hex();
        assert!(remote.root().join(&hex[0..2]).join(&hex).is_file());
    }

    #[tokio::test]
    async fn storing_twice_replaces_atomically() {
        let tmp = TempDir::new().unwrap();
        let remote = DirectoryRemote::open(tmp.path()).unwrap();
        let key = CacheKey::from_content(b"v");

        remote.store(&key, Bytes::from_static(b"v")).await.unwrap();
        remote.store(&key, Bytes::from_static(b"v")).await.unwrap();

        let hex = key.to_hex();
        let shard: Vec<_> = std::fs::read_dir(tmp.path().join(&hex[0..2]))
            .unwrap()
            .collect();
        assert_eq!(shard.len(), 1);
    }

    #[test]
    fn requires_a_path() {
        let config = RemoteConfig {
            path: None,
            ..RemoteConfig::directory("/unused")
        };
        assert!(DirectoryRemote::from_config(&config).is_err());
    }
}
