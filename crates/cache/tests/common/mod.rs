//! Shared fixtures for build cache integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use buildcache::{
    AccessSettings, BuildCacheAccess, BytesWriter, CacheKey, DirectoryLocalCache, EntryWriter,
    Error, LoadHandler, LocalCacheHandle, RemoteCacheHandle, RemoteCacheService, RemoteError,
    RemoteResult, Result, StoreHandler, TieredCacheAccess, Tier,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// In-memory remote backend that counts calls and can be slowed down or broken
#[derive(Default)]
pub struct MemoryRemote {
    entries: Mutex<HashMap<CacheKey, Bytes>>,
    pub loads: AtomicUsize,
    pub stores: AtomicUsize,
    pub contains_checks: AtomicUsize,
    pub closes: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    failing: AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        let remote = Self::default();
        *remote.delay.lock().unwrap() = Some(delay);
        Arc::new(remote)
    }

    pub fn failing() -> Arc<Self> {
        let remote = Self::default();
        remote.failing.store(true, Ordering::SeqCst);
        Arc::new(remote)
    }

    pub fn insert(&self, key: CacheKey, data: impl Into<Bytes>) {
        self.entries.lock().unwrap().insert(key, data.into());
    }

    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    async fn pause(&self) -> RemoteResult<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::connection("memory://", "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteCacheService for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn contains(&self, key: &CacheKey) -> RemoteResult<bool> {
        self.contains_checks.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        Ok(self.entries.lock().unwrap().contains_key(key))
    }

    async fn load(&self, key: &CacheKey) -> RemoteResult<Option<Bytes>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        Ok(self.get(key))
    }

    async fn store(&self, key: &CacheKey, data: Bytes) -> RemoteResult<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        self.insert(*key, data);
        Ok(())
    }

    async fn close(&self) -> RemoteResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Open a writable local tier under `dir`
pub fn local_handle(dir: &TempDir) -> LocalCacheHandle {
    let local = DirectoryLocalCache::open(dir.path()).unwrap();
    LocalCacheHandle::new(Arc::new(local), true)
}

/// Coordinator over a fresh local tier and `remote` with pull and push enabled
pub fn tiered(
    dir: &TempDir,
    remote: Option<Arc<MemoryRemote>>,
    settings: AccessSettings,
) -> TieredCacheAccess {
    let remote = remote.map(|r| RemoteCacheHandle::new(r, true, true));
    TieredCacheAccess::new(local_handle(dir), remote, settings)
}

/// Load handler that records everything it sees
#[derive(Default)]
pub struct RecordingLoad {
    pub loaded: Mutex<HashMap<CacheKey, Vec<u8>>>,
    pub hits: Mutex<Vec<(CacheKey, Tier)>>,
    pub misses: Mutex<Vec<CacheKey>>,
    pub failures: AtomicUsize,
    pub unpack_failures: AtomicUsize,
}

impl RecordingLoad {
    pub fn loaded(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.loaded.lock().unwrap().get(key).cloned()
    }

    pub fn miss_count(&self) -> usize {
        self.misses.lock().unwrap().len()
    }

    pub fn hit_tier(&self, key: &CacheKey) -> Option<Tier> {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .find(|(hit, _)| hit == key)
            .map(|(_, tier)| *tier)
    }
}

impl LoadHandler<CacheKey> for RecordingLoad {
    fn handle(&self, input: &mut dyn Read, key: CacheKey) -> Result<()> {
        let mut content = Vec::new();
        input
            .read_to_end(&mut content)
            .map_err(|e| Error::io_no_path(e, "read"))?;
        self.loaded.lock().unwrap().insert(key, content);
        Ok(())
    }

    fn record_load_hit(&self, key: &CacheKey, tier: Tier, _size: u64) {
        self.hits.lock().unwrap().push((*key, tier));
    }

    fn record_load_miss(&self, key: &CacheKey) {
        self.misses.lock().unwrap().push(*key);
    }

    fn record_load_failure(&self, _key: &CacheKey, _error: &RemoteError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn record_unpack_failure(&self, _key: &CacheKey, _error: &Error) {
        self.unpack_failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Store handler over in-memory content
#[derive(Default)]
pub struct RecordingStore {
    pub finished: Mutex<Vec<(CacheKey, bool)>>,
    pub failures: AtomicUsize,
}

impl StoreHandler<Vec<u8>> for RecordingStore {
    fn create_writer(&self, payload: &Vec<u8>) -> Result<Box<dyn EntryWriter>> {
        Ok(Box::new(BytesWriter::new(payload.clone())))
    }

    fn record_store_finished(&self, key: &CacheKey, stored: bool) {
        self.finished.lock().unwrap().push((*key, stored));
    }

    fn record_store_failure(&self, _key: &CacheKey, _error: &RemoteError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Store `content` under its own hash and return the key
pub async fn store_content<A: BuildCacheAccess>(access: &A, content: &[u8]) -> CacheKey {
    let key = CacheKey::from_content(content);
    access
        .store(HashMap::from([(key, content.to_vec())]), &RecordingStore::default())
        .await
        .unwrap();
    key
}

/// Load `keys`, each carrying itself as payload
pub async fn load_keys<A: BuildCacheAccess>(
    access: &A,
    keys: impl IntoIterator<Item = CacheKey>,
) -> RecordingLoad {
    let handler = RecordingLoad::default();
    let batch: HashMap<CacheKey, CacheKey> = keys.into_iter().map(|k| (k, k)).collect();
    access.load(batch, &handler).await.unwrap();
    handler
}

/// Load a single key and return its content, if any tier had it
pub async fn load_one<A: BuildCacheAccess>(access: &A, key: CacheKey) -> Option<Vec<u8>> {
    load_keys(access, [key]).await.loaded(&key)
}
