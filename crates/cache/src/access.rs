//! Batched tiered access
//!
//! [`TieredCacheAccess`] fans every key of a batch to the local tier on the
//! caller, and schedules the remote counterpart on a bounded pool of tokio
//! tasks. A batch returns only once every key has resolved to a hit, a miss
//! or a failure. Remote hits are mirrored into the local tier.
//!
//! Remote trouble never fails a batch: it is recorded through the handler
//! hooks and the key counts as a miss. Local trouble always does.

use crate::error::{RemoteError, RemoteResult};
use crate::key::CacheKey;
use crate::local::LocalCacheHandle;
use crate::remote::RemoteCacheHandle;
use crate::writer::{BytesWriter, EntryWriter, materialize};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, warn};

/// Which tier satisfied a load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Local disk
    Local,
    /// Remote backend
    Remote,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Consumes loaded entries
///
/// Hooks are observational; they never change the outcome of a batch.
pub trait LoadHandler<P>: Sync {
    /// Consume the content of a hit
    fn handle(&self, input: &mut dyn Read, payload: P) -> Result<()>;

    /// Fired once per key before its first I/O
    fn ensure_load_operation_started(&self, _key: &CacheKey) {}

    /// The key was found
    fn record_load_hit(&self, _key: &CacheKey, _tier: Tier, _size: u64) {}

    /// No tier holds the key
    fn record_load_miss(&self, _key: &CacheKey) {}

    /// The remote tier failed for the key
    fn record_load_failure(&self, _key: &CacheKey, _error: &RemoteError) {}

    /// A remote hit could not be consumed
    fn record_unpack_failure(&self, _key: &CacheKey, _error: &Error) {}
}

/// Produces entries to store
pub trait StoreHandler<P>: Sync {
    /// Build the content for a key
    fn create_writer(&self, payload: &P) -> Result<Box<dyn EntryWriter>>;

    /// Fired once per key before its first I/O
    fn ensure_store_operation_started(&self, _key: &CacheKey) {}

    /// The key is done; `stored` is whether any tier now holds new content
    fn record_store_finished(&self, _key: &CacheKey, _stored: bool) {}

    /// The remote tier failed for the key
    fn record_store_failure(&self, _key: &CacheKey, _error: &RemoteError) {}

    /// The content for a key could not be produced
    fn record_pack_failure(&self, _key: &CacheKey, _error: &Error) {}
}

/// Batched load/store contract shared by the coordinator and its decorators
#[async_trait]
pub trait BuildCacheAccess: Send + Sync {
    /// Load every key, invoking `handler` for each hit
    async fn load<P, H>(&self, entries: HashMap<CacheKey, P>, handler: &H) -> Result<()>
    where
        P: Send,
        H: LoadHandler<P> + ?Sized;

    /// Store every key
    async fn store<P, H>(&self, entries: HashMap<CacheKey, P>, handler: &H) -> Result<()>
    where
        P: Send,
        H: StoreHandler<P> + ?Sized;

    /// Wait for outstanding transfers and close both tiers
    async fn close(&self) -> Result<()>;
}

/// Tuning for [`TieredCacheAccess`]
#[derive(Debug, Clone)]
pub struct AccessSettings {
    /// Remote transfers allowed to run at once
    pub max_concurrent_transfers: usize,
    /// Deadline for a single remote transfer
    pub transfer_timeout: Duration,
    /// How long close waits for outstanding transfers
    pub close_timeout: Duration,
    /// Disable the remote handle after its first failure
    pub disable_remote_on_error: bool,
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 16,
            transfer_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(300),
            disable_remote_on_error: true,
        }
    }
}

/// Point-in-time view of remote transfer activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Most transfers ever waiting for a permit at once
    pub peak_queued: usize,
    /// Most transfers ever running at once
    pub peak_active: usize,
    /// Remote loads attempted
    pub downloads: u64,
    /// Entries actually uploaded
    pub uploads: u64,
    /// Remote loads that found the entry
    pub remote_hits: u64,
    /// Remote loads that did not find the entry
    pub remote_misses: u64,
    /// Remote loads and stores that failed
    pub remote_failures: u64,
}

#[derive(Debug, Default)]
struct TransferCounters {
    queued: AtomicUsize,
    active: AtomicUsize,
    peak_queued: AtomicUsize,
    peak_active: AtomicUsize,
    downloads: AtomicU64,
    uploads: AtomicU64,
    remote_hits: AtomicU64,
    remote_misses: AtomicU64,
    remote_failures: AtomicU64,
}

impl TransferCounters {
    fn snapshot(&self) -> TransferStats {
        TransferStats {
            peak_queued: self.peak_queued.load(Ordering::Relaxed),
            peak_active: self.peak_active.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            remote_misses: self.remote_misses.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Holds a slot in one of the gauges and updates its peak
struct Gauge {
    counters: Arc<TransferCounters>,
    active: bool,
}

impl Gauge {
    fn queued(counters: &Arc<TransferCounters>) -> Self {
        let now = counters.queued.fetch_add(1, Ordering::Relaxed) + 1;
        counters.peak_queued.fetch_max(now, Ordering::Relaxed);
        Self {
            counters: Arc::clone(counters),
            active: false,
        }
    }

    fn active(counters: &Arc<TransferCounters>) -> Self {
        let now = counters.active.fetch_add(1, Ordering::Relaxed) + 1;
        counters.peak_active.fetch_max(now, Ordering::Relaxed);
        Self {
            counters: Arc::clone(counters),
            active: true,
        }
    }
}

impl Drop for Gauge {
    fn drop(&mut self) {
        let gauge = if self.active {
            &self.counters.active
        } else {
            &self.counters.queued
        };
        gauge.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Everything a spawned transfer needs, detached from `&self`
#[derive(Clone)]
struct TransferContext {
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    counters: Arc<TransferCounters>,
    timeout: Duration,
}

impl TransferContext {
    /// Run `transfer` once a permit is free, under the per-transfer deadline
    async fn run<T>(
        self,
        operation: &'static str,
        transfer: impl Future<Output = RemoteResult<T>>,
    ) -> RemoteResult<T> {
        let queued = Gauge::queued(&self.counters);
        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| RemoteError::Cancelled)?
            }
            () = self.cancel.cancelled() => return Err(RemoteError::Cancelled),
        };
        drop(queued);
        let _active = Gauge::active(&self.counters);

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(RemoteError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, transfer) => {
                outcome.unwrap_or_else(|_| Err(RemoteError::timeout(operation, self.timeout.as_secs())))
            }
        }
    }
}

/// Coordinator over a local and an optional remote tier
pub struct TieredCacheAccess {
    local: LocalCacheHandle,
    remote: Option<Arc<RemoteCacheHandle>>,
    settings: AccessSettings,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    counters: Arc<TransferCounters>,
    closed: AtomicBool,
}

impl TieredCacheAccess {
    /// Create a coordinator
    #[must_use]
    pub fn new(
        local: LocalCacheHandle,
        remote: Option<RemoteCacheHandle>,
        settings: AccessSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_transfers.max(1)));
        Self {
            local,
            remote: remote.map(Arc::new),
            settings,
            permits,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            counters: Arc::new(TransferCounters::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Local tier handle
    #[must_use]
    pub fn local(&self) -> &LocalCacheHandle {
        &self.local
    }

    /// Remote tier handle, if one is configured
    #[must_use]
    pub fn remote(&self) -> Option<&RemoteCacheHandle> {
        self.remote.as_deref()
    }

    /// Transfer activity so far
    #[must_use]
    pub fn stats(&self) -> TransferStats {
        self.counters.snapshot()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn transfer_context(&self) -> TransferContext {
        TransferContext {
            permits: Arc::clone(&self.permits),
            cancel: self.cancel.clone(),
            counters: Arc::clone(&self.counters),
            timeout: self.settings.transfer_timeout,
        }
    }

    fn loadable_remote(&self) -> Option<&Arc<RemoteCacheHandle>> {
        self.remote.as_ref().filter(|remote| remote.can_load())
    }

    fn storable_remote(&self) -> Option<&Arc<RemoteCacheHandle>> {
        self.remote.as_ref().filter(|remote| remote.can_store())
    }

    fn remote_failed(&self, key: &CacheKey, operation: &str, error: &RemoteError) {
        TransferCounters::bump(&self.counters.remote_failures);
        warn!(key = %key, operation, error = %error, "Remote build cache transfer failed");
        if self.settings.disable_remote_on_error
            && !matches!(error, RemoteError::Cancelled)
            && let Some(remote) = &self.remote
        {
            remote.disable_on_error(error);
        }
    }

    /// Consume a remote hit and mirror it into the local tier
    fn complete_remote_hit<P, H>(
        &self,
        key: &CacheKey,
        data: Bytes,
        payload: P,
        handler: &H,
    ) -> Result<()>
    where
        H: LoadHandler<P> + ?Sized,
    {
        let mut input: &[u8] = &data;
        if let Err(error) = handler.handle(&mut input, payload) {
            warn!(key = %key, error = %error, "Could not unpack remote build cache entry");
            handler.record_unpack_failure(key, &error);
            return Ok(());
        }
        handler.record_load_hit(key, Tier::Remote, data.len() as u64);
        if self.local.can_store() {
            self.local.store(key, &BytesWriter::new(data))?;
            debug!(key = %key, "Mirrored remote build cache entry into local cache");
        }
        Ok(())
    }
}

/// Classify a failed local load
fn local_load_failure(key: &CacheKey, error: Error) -> Error {
    match error {
        Error::Codec { .. } | Error::ContentMismatch { .. } => {
            Error::local_corruption(key, error.to_string())
        }
        other => other,
    }
}

struct CountingReader<'a> {
    inner: &'a mut dyn Read,
    count: u64,
}

impl Read for CountingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

#[async_trait]
impl BuildCacheAccess for TieredCacheAccess {
    async fn load<P, H>(&self, entries: HashMap<CacheKey, P>, handler: &H) -> Result<()>
    where
        P: Send,
        H: LoadHandler<P> + ?Sized,
    {
        self.ensure_open()?;
        let mut pending: HashMap<CacheKey, P> = HashMap::new();
        let mut downloads: JoinSet<(CacheKey, RemoteResult<Option<Bytes>>)> = JoinSet::new();

        for (key, payload) in entries {
            handler.ensure_load_operation_started(&key);

            let mut slot = Some(payload);
            let mut size = 0;
            let found = self.local.load(&key, &mut |input| {
                let Some(payload) = slot.take() else {
                    return Ok(());
                };
                let mut counting = CountingReader {
                    inner: input,
                    count: 0,
                };
                let outcome = handler.handle(&mut counting, payload);
                size = counting.count;
                outcome
            });
            match found {
                Ok(true) => {
                    debug!(key = %key, "Local build cache hit");
                    handler.record_load_hit(&key, Tier::Local, size);
                    continue;
                }
                Ok(false) => {}
                Err(error) => {
                    downloads.abort_all();
                    return Err(local_load_failure(&key, error));
                }
            }
            let Some(payload) = slot else {
                continue;
            };

            let Some(remote) = self.loadable_remote() else {
                handler.record_load_miss(&key);
                continue;
            };
            let remote = Arc::clone(remote);
            let context = self.transfer_context();
            TransferCounters::bump(&self.counters.downloads);
            downloads.spawn(self.tracker.track_future(async move {
                let result = context.run("load", remote.load(&key)).await;
                (key, result)
            }));
            pending.insert(key, payload);
        }

        while let Some(joined) = downloads.join_next().await {
            let (key, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Remote build cache download task failed");
                    continue;
                }
            };
            let Some(payload) = pending.remove(&key) else {
                continue;
            };
            match result {
                Ok(Some(data)) => {
                    TransferCounters::bump(&self.counters.remote_hits);
                    debug!(key = %key, size = data.len(), "Remote build cache hit");
                    self.complete_remote_hit(&key, data, payload, handler)?;
                }
                Ok(None) => {
                    TransferCounters::bump(&self.counters.remote_misses);
                    handler.record_load_miss(&key);
                }
                Err(error) => {
                    self.remote_failed(&key, "load", &error);
                    handler.record_load_failure(&key, &error);
                }
            }
        }

        for key in pending.keys() {
            handler.record_load_miss(key);
        }
        Ok(())
    }

    async fn store<P, H>(&self, entries: HashMap<CacheKey, P>, handler: &H) -> Result<()>
    where
        P: Send,
        H: StoreHandler<P> + ?Sized,
    {
        self.ensure_open()?;
        let mut uploads: JoinSet<(CacheKey, RemoteResult<bool>)> = JoinSet::new();
        let mut local_stored: HashMap<CacheKey, bool> = HashMap::new();
        let mut fatal = None;

        for (key, payload) in entries {
            let store_local = self.local.can_store() && !self.local.contains(&key);
            let remote = self.storable_remote();
            if !store_local && remote.is_none() {
                continue;
            }
            handler.ensure_store_operation_started(&key);

            let writer = match handler.create_writer(&payload) {
                Ok(writer) => writer,
                Err(error) => {
                    handler.record_pack_failure(&key, &error);
                    fatal = Some(error);
                    break;
                }
            };

            let Some(remote) = remote else {
                if let Err(error) = self.local.store(&key, writer.as_ref()) {
                    fatal = Some(error);
                    break;
                }
                handler.record_store_finished(&key, true);
                continue;
            };

            let data = match materialize(writer.as_ref()) {
                Ok(data) => data,
                Err(error) => {
                    handler.record_pack_failure(&key, &error);
                    fatal = Some(error);
                    break;
                }
            };
            if store_local
                && let Err(error) = self.local.store(&key, &BytesWriter::new(data.clone()))
            {
                fatal = Some(error);
                break;
            }

            let remote = Arc::clone(remote);
            let context = self.transfer_context();
            let span = tracing::debug_span!("store_entry", key = %key, tier = "remote", size = data.len());
            let upload = async move {
                let result = context
                    .run("store", async {
                        if remote.contains(&key).await? {
                            return Ok(false);
                        }
                        remote.store(&key, data).await?;
                        Ok::<bool, RemoteError>(true)
                    })
                    .await;
                (key, result)
            };
            uploads.spawn(self.tracker.track_future(upload.instrument(span)));
            local_stored.insert(key, store_local);
        }

        // Uploads already scheduled are drained even when the batch failed
        while let Some(joined) = uploads.join_next().await {
            let (key, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Remote build cache upload task failed");
                    continue;
                }
            };
            let stored_locally = local_stored.remove(&key).unwrap_or(false);
            match result {
                Ok(uploaded) => {
                    if uploaded {
                        TransferCounters::bump(&self.counters.uploads);
                        debug!(key = %key, "Uploaded build cache entry");
                    } else {
                        debug!(key = %key, "Remote build cache already holds entry");
                    }
                    handler.record_store_finished(&key, uploaded || stored_locally);
                }
                Err(error) => {
                    self.remote_failed(&key, "store", &error);
                    handler.record_store_failure(&key, &error);
                    handler.record_store_finished(&key, stored_locally);
                }
            }
        }
        for (key, stored_locally) in local_stored {
            handler.record_store_finished(&key, stored_locally);
        }

        fatal.map_or(Ok(()), Err)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.tracker.close();

        let pending = self.tracker.len();
        if pending > 0 {
            warn!(pending, "Build cache transfers still running at close, waiting for them");
        }

        let drained = tokio::time::timeout(self.settings.close_timeout, self.tracker.wait())
            .await
            .is_ok();
        let mut outcome = Ok(());
        if !drained {
            let pending = self.tracker.len();
            self.cancel.cancel();
            error!(
                pending,
                timeout_secs = self.settings.close_timeout.as_secs(),
                "Gave up waiting for build cache transfers"
            );
            outcome = Err(Error::ShutdownTimeout {
                pending,
                timeout_secs: self.settings.close_timeout.as_secs(),
            });
        }

        let stats = self.stats();
        info!(
            peak_queued = stats.peak_queued,
            peak_active = stats.peak_active,
            downloads = stats.downloads,
            uploads = stats.uploads,
            remote_hits = stats.remote_hits,
            remote_misses = stats.remote_misses,
            remote_failures = stats.remote_failures,
            "Build cache transfer summary"
        );

        if let Some(remote) = &self.remote
            && let Err(e) = remote.close().await
        {
            warn!(error = %e, "Failed to close remote build cache");
        }
        outcome.and(self.local.close())
    }
}

impl fmt::Debug for TieredCacheAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredCacheAccess")
            .field("remote", &self.remote)
            .field("settings", &self.settings)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
