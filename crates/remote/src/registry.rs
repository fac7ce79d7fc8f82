//! Backend registry
//!
//! Maps a configured [`BackendKind`] to the factory that builds it. Every
//! backend produced here is wrapped in [`RetryingRemote`] with the retry
//! policy from its configuration.

use crate::directory::DirectoryRemote;
use crate::http::HttpRemote;
use crate::retry::RetryingRemote;
use buildcache::{
    BackendKind, CacheConfig, CompressingAccess, Error, RemoteCacheService, RemoteConfig, Result,
    TieredCacheAccess,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds a backend from its configuration
pub type BackendFactory = fn(&RemoteConfig) -> Result<Arc<dyn RemoteCacheService>>;

/// Registry of backend factories keyed by kind
#[derive(Clone)]
pub struct BackendRegistry {
    factories: HashMap<BackendKind, BackendFactory>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl BackendRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding the HTTP and directory backends
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(BackendKind::Http, http_backend);
        registry.register(BackendKind::Directory, directory_backend);
        registry
    }

    /// Register or replace the factory for `kind`
    pub fn register(&mut self, kind: BackendKind, factory: BackendFactory) {
        self.factories.insert(kind, factory);
    }

    /// Whether a factory exists for `kind`
    #[must_use]
    pub fn supports(&self, kind: BackendKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Build the backend described by `config`
    pub fn create(&self, config: &RemoteConfig) -> Result<Arc<dyn RemoteCacheService>> {
        let factory = self.factories.get(&config.backend).ok_or_else(|| {
            Error::configuration(format!("no remote backend registered for {:?}", config.backend))
        })?;
        let service = factory(config)?;
        debug!(backend = service.name(), "Created remote build cache backend");
        Ok(service)
    }

    /// Build the full access stack for `config`
    pub fn open_access(
        &self,
        config: &CacheConfig,
    ) -> Result<CompressingAccess<TieredCacheAccess>> {
        let remote = config
            .remote
            .as_ref()
            .map(|remote| self.create(remote))
            .transpose()?;
        config.build_access(remote)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn http_backend(config: &RemoteConfig) -> Result<Arc<dyn RemoteCacheService>> {
    let remote = HttpRemote::from_config(config)?;
    Ok(Arc::new(RetryingRemote::new(remote, config.retry.clone())))
}

fn directory_backend(config: &RemoteConfig) -> Result<Arc<dyn RemoteCacheService>> {
    let remote = DirectoryRemote::from_config(config)?;
    Ok(Arc::new(RetryingRemote::new(remote, config.retry.clone())))
}

/// Build the backend described by `config` with the built-in registry
pub fn create_remote_service(config: &RemoteConfig) -> Result<Arc<dyn RemoteCacheService>> {
    BackendRegistry::with_builtin().create(config)
}
