//! Remote tier capability and its handle
//!
//! Concrete backends live outside this crate; the coordinator only sees
//! [`RemoteCacheService`]. Failures are [`RemoteError`]s and are always
//! soft from the caller's point of view.

use crate::error::{RemoteError, RemoteResult};
use crate::key::CacheKey;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Network-backed content-addressed store
#[async_trait]
pub trait RemoteCacheService: Send + Sync {
    /// Short backend name for diagnostics
    fn name(&self) -> &str;

    /// Whether the backend holds `key`
    async fn contains(&self, key: &CacheKey) -> RemoteResult<bool>;

    /// Fetch an entry; `Ok(None)` when absent
    async fn load(&self, key: &CacheKey) -> RemoteResult<Option<Bytes>>;

    /// Upload an entry
    async fn store(&self, key: &CacheKey, data: Bytes) -> RemoteResult<()>;

    /// Release connections and other resources
    async fn close(&self) -> RemoteResult<()> {
        Ok(())
    }
}

/// A remote backend together with its pull/push switches and health
///
/// Disabling is one-way: once [`disable_on_error`](Self::disable_on_error)
/// has fired, the handle refuses loads and stores for the rest of its life.
pub struct RemoteCacheHandle {
    service: Arc<dyn RemoteCacheService>,
    pull: bool,
    push: bool,
    disabled: AtomicBool,
}

impl RemoteCacheHandle {
    /// Wrap a backend
    #[must_use]
    pub fn new(service: Arc<dyn RemoteCacheService>, pull: bool, push: bool) -> Self {
        Self {
            service,
            pull,
            push,
            disabled: AtomicBool::new(false),
        }
    }

    /// Backend behind this handle
    #[must_use]
    pub fn service(&self) -> &Arc<dyn RemoteCacheService> {
        &self.service
    }

    /// Whether loads may be attempted
    #[must_use]
    pub fn can_load(&self) -> bool {
        self.pull && !self.is_disabled()
    }

    /// Whether stores may be attempted
    #[must_use]
    pub fn can_store(&self) -> bool {
        self.push && !self.is_disabled()
    }

    /// Whether the handle has been disabled after an error
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Permanently disable the handle in response to `error`
    ///
    /// Only the first call logs.
    pub fn disable_on_error(&self, error: &RemoteError) {
        if !self.disabled.swap(true, Ordering::AcqRel) {
            warn!(
                backend = self.service.name(),
                error = %error,
                "Remote build cache disabled for the rest of this build"
            );
        }
    }

    /// Whether the backend holds `key`
    pub async fn contains(&self, key: &CacheKey) -> RemoteResult<bool> {
        self.service.contains(key).await
    }

    /// Fetch an entry
    pub async fn load(&self, key: &CacheKey) -> RemoteResult<Option<Bytes>> {
        self.service.load(key).await
    }

    /// Upload an entry
    pub async fn store(&self, key: &CacheKey, data: Bytes) -> RemoteResult<()> {
        self.service.store(key, data).await
    }

    /// Close the backend
    pub async fn close(&self) -> RemoteResult<()> {
        self.service.close().await
    }
}

impl std::fmt::Debug for RemoteCacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCacheHandle")
            .field("backend", &self.service.name())
            .field("pull", &self.pull)
            .field("push", &self.push)
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullRemote;

    #[async_trait]
    impl RemoteCacheService for NullRemote {
        fn name(&self) -> &str {
            "null"
        }

        async fn contains(&self, _key: &CacheKey) -> RemoteResult<bool> {
            Ok(false)
        }

        async fn load(&self, _key: &CacheKey) -> RemoteResult<Option<Bytes>> {
            Ok(None)
        }

        async fn store(&self, _key: &CacheKey, _data: Bytes) -> RemoteResult<()> {
            Ok(())
        }
    }

    #[test]
    fn switches_follow_configuration() {
        let pull_only = RemoteCacheHandle::new(Arc::new(NullRemote), true, false);
        assert!(pull_only.can_load());
        assert!(!pull_only.can_store());

        let push_only = RemoteCacheHandle::new(Arc::new(NullRemote), false, true);
        assert!(!push_only.can_load());
        assert!(push_only.can_store());
    }

    #[test]
    fn disabling_is_permanent() {
        let handle = RemoteCacheHandle::new(Arc::new(NullRemote), true, true);
        handle.disable_on_error(&RemoteError::timeout("load", 1));
        handle.disable_on_error(&RemoteError::timeout("load", 1));

        assert!(handle.is_disabled());
        assert!(!handle.can_load());
        assert!(!handle.can_store());
    }
}
