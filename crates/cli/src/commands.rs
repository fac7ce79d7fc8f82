//! Command implementations
//!
//! Every command opens the access stack described by the configuration,
//! runs, and closes the stack again before returning its output. Output
//! is returned as a string so `main` owns stdout.

use crate::cli::{CliError, Commands};
use buildcache::{
    BuildCacheAccess, BuildCacheController, CacheConfig, CacheKey, CompressingAccess,
    DirectoryLocalCache, EntryWriter, FileWriter, LoadHandler, OutputTrees, RemoteError,
    StoreHandler, Tier, TieredCacheAccess, TreeType,
};
use buildcache_remote::BackendRegistry;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Configuration file picked up from the working directory
pub const DEFAULT_CONFIG_FILE: &str = "buildcache.toml";

type Access = CompressingAccess<TieredCacheAccess>;

/// Load configuration from `path`, `./buildcache.toml`, or defaults
pub fn load_config(path: Option<&Path>) -> Result<CacheConfig, CliError> {
    match path {
        Some(path) => CacheConfig::load(path).map_err(|e| {
            CliError::from(e).with_help(format!(
                "Check that {} exists and is valid TOML",
                path.display()
            ))
        }),
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.is_file() {
                Ok(CacheConfig::load(default)?)
            } else {
                Ok(CacheConfig::default())
            }
        }
    }
}

/// Parse a key given on the command line
///
/// 64 hex characters are taken as a key verbatim; anything else is hashed.
#[must_use]
pub fn parse_key(input: &str) -> CacheKey {
    if input.len() == 64
        && let Ok(key) = CacheKey::from_hex(input)
    {
        return key;
    }
    CacheKey::from_content(input.as_bytes())
}

/// Run `command` against the cache described by `config`
pub async fn execute(command: &Commands, config: &CacheConfig) -> Result<String, CliError> {
    if let Commands::Stats = command {
        return stats(config);
    }

    let controller = BuildCacheController::new(BackendRegistry::with_builtin().open_access(config)?);
    let access = controller.access();
    let outcome = match command {
        Commands::Put { file, key } => put(access, file, key.as_deref()).await,
        Commands::Get { key, out } => get(access, &parse_key(key), out).await,
        Commands::Contains { key } => contains(access, &parse_key(key)).await,
        Commands::Pack { key, dir } => pack(&controller, &parse_key(key), dir).await,
        Commands::Unpack { key, dir } => unpack(&controller, &parse_key(key), dir).await,
        Commands::Stats => stats(config),
    };
    let closed = controller.close().await;
    let output = outcome?;
    closed?;
    Ok(output)
}

/// Reports remote trouble to the user without failing the command
struct FileStore;

impl StoreHandler<FileWriter> for FileStore {
    fn create_writer(&self, payload: &FileWriter) -> buildcache::Result<Box<dyn EntryWriter>> {
        Ok(Box::new(payload.clone()))
    }

    fn record_store_failure(&self, key: &CacheKey, error: &RemoteError) {
        warn!(key = %key, error = %error, "Remote upload failed, entry is only cached locally");
    }
}

async fn put(access: &Access, file: &Path, key: Option<&str>) -> Result<String, CliError> {
    let key = match key {
        Some(key) => parse_key(key),
        None => {
            let data = fs::read(file).map_err(|e| buildcache::Error::io(e, file, "read"))?;
            CacheKey::from_content(&data)
        }
    };
    let writer = FileWriter::from_path(file)?;
    let size = writer.size();
    access
        .store(HashMap::from([(key, writer)]), &FileStore)
        .await?;
    info!(key = %key, size, "Stored file in build cache");
    Ok(key.to_hex())
}

/// Writes a loaded entry to its destination file
#[derive(Default)]
struct FileLoad {
    tier: Mutex<Option<Tier>>,
    out: PathBuf,
}

impl LoadHandler<PathBuf> for FileLoad {
    fn handle(&self, input: &mut dyn Read, payload: PathBuf) -> buildcache::Result<()> {
        if let Some(parent) = payload.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| buildcache::Error::io(e, parent, "create_dir_all"))?;
        }
        let mut output =
            fs::File::create(&payload).map_err(|e| buildcache::Error::io(e, &payload, "create"))?;
        io::copy(input, &mut output).map_err(|e| buildcache::Error::io(e, &payload, "write"))?;
        Ok(())
    }

    fn record_load_hit(&self, _key: &CacheKey, tier: Tier, _size: u64) {
        if let Ok(mut slot) = self.tier.lock() {
            *slot = Some(tier);
        }
    }

    fn record_load_failure(&self, key: &CacheKey, error: &RemoteError) {
        warn!(key = %key, error = %error, "Remote download failed");
    }

    fn record_unpack_failure(&self, key: &CacheKey, error: &buildcache::Error) {
        warn!(key = %key, error = %error, "Remote entry could not be decoded");
        if let Ok(mut slot) = self.tier.lock() {
            *slot = None;
        }
        let _ = fs::remove_file(&self.out);
    }
}

async fn get(access: &Access, key: &CacheKey, out: &Path) -> Result<String, CliError> {
    let handler = FileLoad {
        out: out.to_path_buf(),
        ..FileLoad::default()
    };
    access
        .load(HashMap::from([(*key, out.to_path_buf())]), &handler)
        .await?;
    let tier = handler.tier.lock().ok().and_then(|slot| *slot);
    match tier {
        Some(tier) => Ok(format!("{key} restored from {tier} cache to {}", out.display())),
        None => Err(CliError::miss(format!("no entry for {key}"))),
    }
}

async fn contains(access: &Access, key: &CacheKey) -> Result<String, CliError> {
    let local = access.delegate().local().contains(key);
    let remote = match access.delegate().remote() {
        Some(remote) if remote.can_load() => match remote.contains(key).await {
            Ok(true) => "yes",
            Ok(false) => "no",
            Err(error) => {
                warn!(key = %key, error = %error, "Remote lookup failed");
                "unreachable"
            }
        },
        Some(_) => "disabled",
        None => "not configured",
    };
    let local = if local { "yes" } else { "no" };
    Ok(format!("{key}\nlocal: {local}\nremote: {remote}"))
}

fn stats(config: &CacheConfig) -> Result<String, CliError> {
    if !config.local.enabled {
        return Ok("local cache disabled".to_string());
    }
    let root = config.resolve_local_dir()?;
    let stats = DirectoryLocalCache::open(&root)?.stats()?;
    Ok(format!(
        "directory: {}\nentries: {}\nbytes: {}",
        root.display(),
        stats.entries,
        stats.bytes
    ))
}

fn directory_entity(dir: &Path) -> OutputTrees {
    OutputTrees::new(dir.display().to_string()).with_tree("output", TreeType::Directory, dir)
}

async fn pack(
    controller: &BuildCacheController<Access>,
    key: &CacheKey,
    dir: &Path,
) -> Result<String, CliError> {
    if !dir.is_dir() {
        return Err(CliError::config(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    // Producing the directory happened outside this process and was not timed
    let result = controller
        .store(key, &directory_entity(dir), Duration::ZERO)
        .await?;
    Ok(format!(
        "{key} stored {} entries ({} bytes)",
        result.entry_count, result.total_size
    ))
}

async fn unpack(
    controller: &BuildCacheController<Access>,
    key: &CacheKey,
    dir: &Path,
) -> Result<String, CliError> {
    match controller.load(key, &directory_entity(dir)).await? {
        Some(result) => Ok(format!(
            "{key} restored {} entries into {} (built by {})",
            result.artifact_entry_count,
            dir.display(),
            result.origin_metadata.build_invocation_id
        )),
        None => Err(CliError::miss(format!("no artifact for {key}"))),
    }
}
