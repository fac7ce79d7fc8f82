//! Build cache configuration
//!
//! Loaded from TOML:
//!
//! ```toml
//! compression = ["zstd"]
//! max_concurrent_transfers = 16
//! close_timeout_secs = 300
//!
//! [local]
//! enabled = true
//! push = true
//! directory = "/var/cache/buildcache"
//!
//! [remote]
//! backend = "http"
//! url = "https://cache.example.com/cache"
//! push = true
//! token = "..."
//!
//! [remote.retry]
//! max_attempts = 3
//! ```

use crate::access::{AccessSettings, TieredCacheAccess};
use crate::compression::{CodecChain, Compression, CompressingAccess};
use crate::local::{DirectoryLocalCache, LocalCacheHandle};
use crate::remote::{RemoteCacheHandle, RemoteCacheService};
use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Environment variable overriding the local cache directory
pub const CACHE_DIR_ENV: &str = "BUILDCACHE_DIR";

/// Top-level build cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Local tier
    #[serde(default)]
    pub local: LocalConfig,

    /// Remote tier, absent when there is none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,

    /// Codecs applied to stored entries, in order
    #[serde(default)]
    pub compression: Vec<Compression>,

    /// Remote transfers allowed to run at once
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    /// How long closing waits for outstanding transfers, in seconds
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local: LocalConfig::default(),
            remote: None,
            compression: Vec::new(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            close_timeout_secs: default_close_timeout_secs(),
        }
    }
}

/// Local tier configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
    /// Whether the local tier is used at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether entries are written to the local tier
    #[serde(default = "default_true")]
    pub push: bool,

    /// Explicit cache directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            push: true,
            directory: None,
        }
    }
}

/// Kind of remote backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// HTTP server: `HEAD`/`GET`/`PUT {url}/{key}`
    Http,
    /// Shared directory, e.g. a network mount
    Directory,
}

/// Remote tier configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Backend kind
    pub backend: BackendKind,

    /// Base URL for HTTP backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Root directory for directory backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Whether entries are uploaded
    #[serde(default)]
    pub push: bool,

    /// Whether entries are downloaded
    #[serde(default = "default_true")]
    pub pull: bool,

    /// Stop using the remote tier after its first failure
    #[serde(default = "default_true")]
    pub disable_on_error: bool,

    /// Deadline for a single transfer, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Bearer token sent to HTTP backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl RemoteConfig {
    /// Remote configuration for an HTTP backend with default settings
    #[must_use]
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::with_backend(BackendKind::Http)
        }
    }

    /// Remote configuration for a directory backend with default settings
    #[must_use]
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::with_backend(BackendKind::Directory)
        }
    }

    fn with_backend(backend: BackendKind) -> Self {
        Self {
            backend,
            url: None,
            path: None,
            push: false,
            pull: true,
            disable_on_error: true,
            timeout_secs: default_timeout_secs(),
            token: None,
            retry: RetryConfig::default(),
        }
    }

    /// Per-transfer deadline
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl CacheConfig {
    /// Read and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::configuration(format!("{}: {e}", path.display())))
    }

    /// Parse and validate a TOML configuration
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_transfers == 0 {
            return Err(Error::configuration(
                "max_concurrent_transfers must be at least 1",
            ));
        }

        let mut seen = HashSet::new();
        for codec in &self.compression {
            if !seen.insert(codec) {
                return Err(Error::configuration(format!(
                    "compression codec '{codec}' listed more than once"
                )));
            }
        }

        if let Some(remote) = &self.remote {
            match remote.backend {
                BackendKind::Http if remote.url.as_deref().is_none_or(str::is_empty) => {
                    return Err(Error::configuration("http remote requires a url"));
                }
                BackendKind::Directory if remote.path.is_none() => {
                    return Err(Error::configuration("directory remote requires a path"));
                }
                _ => {}
            }
            if remote.retry.max_attempts == 0 {
                return Err(Error::configuration("remote.retry.max_attempts must be at least 1"));
            }
        }
        Ok(())
    }

    /// Coordinator settings derived from this configuration
    #[must_use]
    pub fn access_settings(&self) -> AccessSettings {
        let defaults = AccessSettings::default();
        AccessSettings {
            max_concurrent_transfers: self.max_concurrent_transfers,
            transfer_timeout: self
                .remote
                .as_ref()
                .map_or(defaults.transfer_timeout, RemoteConfig::timeout),
            close_timeout: Duration::from_secs(self.close_timeout_secs),
            disable_remote_on_error: self
                .remote
                .as_ref()
                .is_none_or(|remote| remote.disable_on_error),
        }
    }

    /// Directory the local tier lives in
    pub fn resolve_local_dir(&self) -> Result<PathBuf> {
        local_dir_from_inputs(LocalDirInputs::from_env(self.local.directory.clone()))
    }

    /// Open the local tier, or a disabled handle when it is switched off
    pub fn local_handle(&self) -> Result<LocalCacheHandle> {
        if !self.local.enabled {
            return Ok(LocalCacheHandle::disabled());
        }
        let store = DirectoryLocalCache::open(self.resolve_local_dir()?)?;
        Ok(LocalCacheHandle::new(Arc::new(store), self.local.push))
    }

    /// Build the compressing, tiered access this configuration describes
    ///
    /// `remote` is the backend constructed for `self.remote`, if any.
    pub fn build_access(
        &self,
        remote: Option<Arc<dyn RemoteCacheService>>,
    ) -> Result<CompressingAccess<TieredCacheAccess>> {
        self.validate()?;
        let local = self.local_handle()?;
        let remote = match (remote, &self.remote) {
            (Some(service), Some(config)) => {
                Some(RemoteCacheHandle::new(service, config.pull, config.push))
            }
            (Some(_), None) => {
                return Err(Error::configuration(
                    "remote backend supplied without remote configuration",
                ));
            }
            (None, _) => None,
        };
        let tiered = TieredCacheAccess::new(local, remote, self.access_settings());
        Ok(CompressingAccess::new(
            tiered,
            CodecChain::from_config(&self.compression),
        ))
    }
}

/// Inputs for determining the local cache directory
#[derive(Debug, Clone)]
struct LocalDirInputs {
    configured: Option<PathBuf>,
    env_override: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

impl LocalDirInputs {
    fn from_env(configured: Option<PathBuf>) -> Self {
        let non_empty = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
        };
        Self {
            configured,
            env_override: non_empty(CACHE_DIR_ENV),
            xdg_cache_home: non_empty("XDG_CACHE_HOME"),
            os_cache_dir: cache_dir(),
            home_dir: home_dir(),
            temp_dir: std::env::temp_dir(),
        }
    }
}

fn local_dir_from_inputs(inputs: LocalDirInputs) -> Result<PathBuf> {
    // Resolution order (first writable wins):
    // 1) configured directory
    // 2) BUILDCACHE_DIR
    // 3) XDG_CACHE_HOME/buildcache
    // 4) OS cache dir/buildcache
    // 5) ~/.buildcache/cache
    // 6) TMPDIR/buildcache
    let mut candidates: Vec<PathBuf> = Vec::new();
    candidates.extend(inputs.configured.filter(|p| !p.as_os_str().is_empty()));
    candidates.extend(inputs.env_override);
    candidates.extend(inputs.xdg_cache_home.map(|p| p.join("buildcache")));
    candidates.extend(inputs.os_cache_dir.map(|p| p.join("buildcache")));
    candidates.extend(inputs.home_dir.map(|p| p.join(".buildcache/cache")));
    candidates.push(inputs.temp_dir.join("buildcache"));

    for path in candidates {
        if path.starts_with("/homeless-shelter") {
            continue;
        }
        // Existing directories may be read-only in CI
        if path.exists() {
            let probe = path.join(".write_probe");
            if std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&probe)
                .is_ok()
            {
                let _ = std::fs::remove_file(&probe);
                return Ok(path);
            }
            continue;
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(Error::configuration(
        "Failed to determine a writable build cache directory",
    ))
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_concurrent_transfers() -> usize {
    16
}

fn default_close_timeout_secs() -> u64 {
    300
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
