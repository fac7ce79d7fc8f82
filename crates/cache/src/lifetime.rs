//! Shared ownership of one controller across nested build scopes
//!
//! A single owner registers the controller and receives the first
//! [`Lease`]. Nested scopes take further leases with
//! [`Lease::new_reference`]. The registry tracks every live lease by id and
//! closes the controller exactly once, when the last lease is released.
//! Releasing the same lease twice is an error rather than a silent
//! under-close.

use crate::access::{BuildCacheAccess, TieredCacheAccess};
use crate::artifact::ArtifactController;
use crate::compression::CompressingAccess;
use crate::controller::BuildCacheController;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, warn};

/// Something closed asynchronously, once
#[async_trait]
pub trait AsyncClose: Send + Sync {
    /// Release the resources held
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<A: BuildCacheAccess> AsyncClose for BuildCacheController<A> {
    async fn close(&self) -> Result<()> {
        Self::close(self).await
    }
}

#[async_trait]
impl AsyncClose for ArtifactController {
    async fn close(&self) -> Result<()> {
        Self::close(self).await
    }
}

#[async_trait]
impl AsyncClose for TieredCacheAccess {
    async fn close(&self) -> Result<()> {
        BuildCacheAccess::close(self).await
    }
}

#[async_trait]
impl<A: BuildCacheAccess> AsyncClose for CompressingAccess<A> {
    async fn close(&self) -> Result<()> {
        BuildCacheAccess::close(self).await
    }
}

#[derive(Debug, Default)]
struct LeaseTable {
    live: BTreeSet<u64>,
    next_id: u64,
    closed: bool,
}

struct Registry<C> {
    controller: C,
    leases: Mutex<LeaseTable>,
}

/// Entry point for sharing a controller
pub struct ControllerRegistry;

impl ControllerRegistry {
    /// Take ownership of `controller` and hand out its first lease
    #[must_use]
    pub fn register<C: AsyncClose>(controller: C) -> Lease<C> {
        let registry = Arc::new(Registry {
            controller,
            leases: Mutex::new(LeaseTable {
                live: BTreeSet::from([0]),
                next_id: 1,
                closed: false,
            }),
        });
        Lease {
            id: 0,
            registry,
            released: AtomicBool::new(false),
        }
    }
}

/// One scope's claim on a shared controller
///
/// Dereferences to the controller. Must be released with [`Lease::close`].
pub struct Lease<C: AsyncClose> {
    id: u64,
    registry: Arc<Registry<C>>,
    released: AtomicBool,
}

impl<C: AsyncClose> Lease<C> {
    /// Identifier of this lease within its registry
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of leases not yet released
    #[must_use]
    pub fn live_leases(&self) -> usize {
        self.table().live.len()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, LeaseTable> {
        self.registry
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Take another lease on the same controller
    pub fn new_reference(&self) -> Result<Self> {
        let mut table = self.table();
        if table.closed {
            return Err(Error::Closed);
        }
        if !table.live.contains(&self.id) {
            return Err(Error::LeaseReleased { lease: self.id });
        }
        let id = table.next_id;
        table.next_id += 1;
        table.live.insert(id);
        debug!(lease = id, live = table.live.len(), "Build cache lease taken");
        Ok(Self {
            id,
            registry: Arc::clone(&self.registry),
            released: AtomicBool::new(false),
        })
    }

    /// Release this lease, closing the controller if it was the last one
    pub async fn close(&self) -> Result<()> {
        let last = {
            let mut table = self.table();
            if !table.live.remove(&self.id) {
                error!(lease = self.id, "Build cache lease released twice");
                return Err(Error::LeaseReleased { lease: self.id });
            }
            self.released.store(true, Ordering::Release);
            let last = table.live.is_empty();
            if last {
                table.closed = true;
            }
            debug!(lease = self.id, live = table.live.len(), "Build cache lease released");
            last
        };
        if last {
            debug!("Last build cache lease released, closing controller");
            self.registry.controller.close().await?;
        }
        Ok(())
    }
}

impl<C: AsyncClose> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.registry.controller
    }
}

impl<C: AsyncClose> Drop for Lease<C> {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            warn!(lease = self.id, "Build cache lease dropped without being released");
        }
    }
}

impl<C: AsyncClose> std::fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingClose {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl AsyncClose for CountingClose {
        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delegate_closes_once_after_last_release() {
        let owner = ControllerRegistry::register(CountingClose::default());
        let first = owner.new_reference().unwrap();
        let second = owner.new_reference().unwrap();
        assert_eq!(owner.live_leases(), 3);

        owner.close().await.unwrap();
        assert_eq!(first.closes.load(Ordering::SeqCst), 0);
        first.close().await.unwrap();
        assert_eq!(second.closes.load(Ordering::SeqCst), 0);
        second.close().await.unwrap();
        assert_eq!(second.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn double_release_is_an_error() {
        let owner = ControllerRegistry::register(CountingClose::default());
        let nested = owner.new_reference().unwrap();

        nested.close().await.unwrap();
        let err = nested.close().await.unwrap_err();
        assert!(matches!(err, Error::LeaseReleased { lease } if lease == nested.id()));

        owner.close().await.unwrap();
        assert_eq!(owner.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_registry_hands_out_no_leases() {
        let owner = ControllerRegistry::register(CountingClose::default());
        owner.close().await.unwrap();

        assert!(matches!(owner.new_reference(), Err(Error::Closed)));
        assert!(matches!(owner.close().await, Err(Error::LeaseReleased { .. })));
        assert_eq!(owner.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn released_lease_cannot_spawn_references() {
        let owner = ControllerRegistry::register(CountingClose::default());
        let nested = owner.new_reference().unwrap();
        nested.close().await.unwrap();

        assert!(matches!(
            nested.new_reference(),
            Err(Error::LeaseReleased { .. })
        ));
        owner.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_scopes_close_exactly_once() {
        let owner = ControllerRegistry::register(CountingClose::default());
        let leases: Vec<_> = (0..16).map(|_| owner.new_reference().unwrap()).collect();

        let mut tasks = tokio::task::JoinSet::new();
        for lease in leases {
            tasks.spawn(async move { lease.close().await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }
        assert_eq!(owner.closes.load(Ordering::SeqCst), 0);

        owner.close().await.unwrap();
        assert_eq!(owner.closes.load(Ordering::SeqCst), 1);
    }
}
