//! Integration tests for tiered, batched cache access
//!
//! Covers tier fallback and mirroring, upload deduplication, bounded
//! transfer concurrency, shutdown behavior and failure isolation.

mod common;

use buildcache::{
    AccessSettings, BuildCacheAccess, CacheKey, CodecChain, CompressingAccess, Compression, Error,
    Tier,
};
use common::{MemoryRemote, RecordingStore, load_keys, load_one, store_content, tiered};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn settings() -> AccessSettings {
    AccessSettings::default()
}

#[tokio::test]
async fn remote_hit_is_mirrored_into_local() {
    let remote = MemoryRemote::new();
    let key = CacheKey::from_content(b"compiled output");
    remote.insert(key, &b"compiled output"[..]);

    let dir = TempDir::new().unwrap();
    let access = tiered(&dir, Some(Arc::clone(&remote)), settings());

    let first = load_keys(&access, [key]).await;
    assert_eq!(first.loaded(&key).as_deref(), Some(&b"compiled output"[..]));
    assert_eq!(first.hit_tier(&key), Some(Tier::Remote));
    assert!(access.local().contains(&key));

    let second = load_keys(&access, [key]).await;
    assert_eq!(second.hit_tier(&key), Some(Tier::Local));
    assert_eq!(remote.loads.load(Ordering::SeqCst), 1);

    let stats = access.stats();
    assert_eq!(stats.downloads, 1);
    assert_eq!(stats.remote_hits, 1);
}

#[tokio::test]
async fn miss_in_both_tiers_is_reported_once() {
    let remote = MemoryRemote::new();
    let dir = TempDir::new().unwrap();
    let access = tiered(&dir, Some(Arc::clone(&remote)), settings());

    let key = CacheKey::from_content(b"never stored");
    let handler = load_keys(&access, [key]).await;

    assert_eq!(handler.miss_count(), 1);
    assert!(handler.loaded(&key).is_none());
    assert_eq!(access.stats().remote_misses, 1);
}

#[tokio::test]
async fn store_writes_both_tiers() {
    let remote = MemoryRemote::new();
    let dir = TempDir::new().unwrap();
    let access = tiered(&dir, Some(Arc::clone(&remote)), settings());

    let key = CacheKey::from_content(b"artifact");
    let handler = RecordingStore::default();
    access
        .store(HashMap::from([(key, b"artifact".to_vec())]), &handler)
        .await
        .unwrap();

    assert!(access.local().contains(&key));
    assert_eq!(remote.get(&key).as_deref(), Some(&b"artifact"[..]));
    assert_eq!(*handler.finished.lock().unwrap(), vec![(key, true)]);
    assert_eq!(access.stats().uploads, 1);
}

#[tokio::test]
async fn entry_already_in_remote_is_not_uploaded_again() {
    let remote = MemoryRemote::new();

    let first_dir = TempDir::new().unwrap();
    let first = tiered(&first_dir, Some(Arc::clone(&remote)), settings());
    store_content(&first, b"shared").await;

    // A second build with an empty local tier stores the same content
    let second_dir = TempDir::new().unwrap();
    let second = tiered(&second_dir, Some(Arc::clone(&remote)), settings());
    let key = store_content(&second, b"shared").await;

    assert_eq!(remote.stores.load(Ordering::SeqCst), 1);
    assert_eq!(remote.contains_checks.load(Ordering::SeqCst), 2);
    assert!(second.local().contains(&key));
    assert_eq!(second.stats().uploads, 0);
}

#[tokio::test]
async fn pull_only_remote_receives_no_uploads() {
    let remote = MemoryRemote::new();
    let dir = TempDir::new().unwrap();
    let access = buildcache::TieredCacheAccess::new(
        common::local_handle(&dir),
        Some(buildcache::RemoteCacheHandle::new(
            Arc::clone(&remote) as Arc<dyn buildcache::RemoteCacheService>,
            true,
            false,
        )),
        settings(),
    );

    let key = store_content(&access, b"local only").await;

    assert!(access.local().contains(&key));
    assert_eq!(remote.stores.load(Ordering::SeqCst), 0);
    assert_eq!(remote.len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_transfers_respect_concurrency_limit() {
    let remote = MemoryRemote::slow(Duration::from_millis(200));
    let keys: Vec<CacheKey> = (0..8u8)
        .map(|i| {
            let key = CacheKey::from_content(&[i]);
            remote.insert(key, vec![i; 16]);
            key
        })
        .collect();

    let dir = TempDir::new().unwrap();
    let access = tiered(
        &dir,
        Some(Arc::clone(&remote)),
        AccessSettings {
            max_concurrent_transfers: 4,
            ..settings()
        },
    );

    let started = Instant::now();
    let handler = load_keys(&access, keys.iter().copied()).await;
    let elapsed = started.elapsed();

    for key in &keys {
        assert!(handler.loaded(key).is_some(), "missing {key}");
    }
    // Two waves of four
    assert!(elapsed >= Duration::from_millis(400), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1600), "took {elapsed:?}");

    let stats = access.stats();
    assert!(stats.peak_active <= 4, "peak_active {}", stats.peak_active);
    assert_eq!(stats.downloads, 8);
    assert!(stats.peak_queued >= 4, "peak_queued {}", stats.peak_queued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_waits_for_uploads_of_running_batches() {
    let remote = MemoryRemote::slow(Duration::from_millis(300));
    let dir = TempDir::new().unwrap();
    let access = Arc::new(tiered(&dir, Some(Arc::clone(&remote)), settings()));

    let batch: HashMap<CacheKey, Vec<u8>> = (0..3u8)
        .map(|i| (CacheKey::from_content(&[i]), vec![i; 8]))
        .collect();
    let storing = {
        let access = Arc::clone(&access);
        tokio::spawn(async move { access.store(batch, &RecordingStore::default()).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    access.close().await.unwrap();

    assert_eq!(remote.len(), 3);
    assert_eq!(remote.closes.load(Ordering::SeqCst), 1);
    storing.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_gives_up_after_timeout() {
    let remote = MemoryRemote::slow(Duration::from_secs(5));
    let key = CacheKey::from_content(b"slow");
    remote.insert(key, &b"slow"[..]);

    let dir = TempDir::new().unwrap();
    let access = Arc::new(tiered(
        &dir,
        Some(Arc::clone(&remote)),
        AccessSettings {
            close_timeout: Duration::from_millis(100),
            ..settings()
        },
    ));

    let loading = {
        let access = Arc::clone(&access);
        tokio::spawn(async move { load_keys(access.as_ref(), [key]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let err = access.close().await.unwrap_err();
    assert!(
        matches!(err, Error::ShutdownTimeout { pending, .. } if pending >= 1),
        "unexpected {err:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(2));

    // The cancelled transfer resolves as a miss without disabling the remote
    let handler = loading.await.unwrap();
    assert!(handler.loaded(&key).is_none());
    assert_eq!(handler.miss_count(), 0);
    assert_eq!(handler.failures.load(Ordering::SeqCst), 1);
    assert!(!access.remote().unwrap().is_disabled());
}

#[tokio::test]
async fn remote_failure_is_a_miss_and_disables_remote() {
    let remote = MemoryRemote::failing();
    let dir = TempDir::new().unwrap();
    let access = tiered(&dir, Some(Arc::clone(&remote)), settings());

    let key = CacheKey::from_content(b"x");
    let handler = load_keys(&access, [key]).await;
    assert!(handler.loaded(&key).is_none());
    assert_eq!(handler.failures.load(Ordering::SeqCst), 1);
    assert!(access.remote().unwrap().is_disabled());

    // Disabled: later batches skip the remote entirely
    let handler = load_keys(&access, [key]).await;
    assert_eq!(handler.miss_count(), 1);
    assert_eq!(remote.loads.load(Ordering::SeqCst), 1);

    // Stores still land locally
    let stored = store_content(&access, b"still cached").await;
    assert!(access.local().contains(&stored));
    assert_eq!(remote.stores.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn remote_failure_keeps_remote_enabled_when_configured() {
    let remote = MemoryRemote::failing();
    let dir = TempDir::new().unwrap();
    let access = tiered(
        &dir,
        Some(Arc::clone(&remote)),
        AccessSettings {
            disable_remote_on_error: false,
            ..settings()
        },
    );

    let key = CacheKey::from_content(b"x");
    load_keys(&access, [key]).await;
    load_keys(&access, [key]).await;

    assert!(!access.remote().unwrap().is_disabled());
    assert_eq!(remote.loads.load(Ordering::SeqCst), 2);
    assert_eq!(access.stats().remote_failures, 2);
}

#[tokio::test]
async fn slow_remote_transfer_times_out() {
    let remote = MemoryRemote::slow(Duration::from_secs(2));
    let key = CacheKey::from_content(b"late");
    remote.insert(key, &b"late"[..]);

    let dir = TempDir::new().unwrap();
    let access = tiered(
        &dir,
        Some(Arc::clone(&remote)),
        AccessSettings {
            transfer_timeout: Duration::from_millis(100),
            ..settings()
        },
    );

    let started = Instant::now();
    let handler = load_keys(&access, [key]).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(handler.loaded(&key).is_none());
    assert_eq!(handler.failures.load(Ordering::SeqCst), 1);
    assert!(access.remote().unwrap().is_disabled());
}

#[tokio::test]
async fn corrupted_local_entry_fails_the_batch() {
    let dir = TempDir::new().unwrap();
    let access = tiered(&dir, None, settings());
    let key = store_content(&access, b"precious bytes").await;

    let hex = key.to_hex();
    let path = dir.path().join(&hex[0..2]).join(&hex[2..4]).join(&hex);
    let mut raw = std::fs::read(&path).unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0xff;
    std::fs::write(&path, raw).unwrap();

    let handler = common::RecordingLoad::default();
    let err = access
        .load(HashMap::from([(key, key)]), &handler)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LocalCorruption { .. }), "unexpected {err:?}");
}

#[tokio::test]
async fn compressed_entries_round_trip_through_remote() {
    let content = b"fn main() { println!(\"hello\"); }\n".repeat(64);

    for codec in [
        Compression::Gzip,
        Compression::Lz4,
        Compression::Lzf,
        Compression::Zstd,
    ] {
        let remote = MemoryRemote::new();
        let producer_dir = TempDir::new().unwrap();
        let producer = CompressingAccess::new(
            tiered(&producer_dir, Some(Arc::clone(&remote)), settings()),
            CodecChain::from_config(&[codec]),
        );
        let key = store_content(&producer, &content).await;

        let stored = remote.get(&key).unwrap();
        assert!(stored.len() < content.len(), "{codec} did not compress");

        let consumer_dir = TempDir::new().unwrap();
        let consumer = CompressingAccess::new(
            tiered(&consumer_dir, Some(Arc::clone(&remote)), settings()),
            CodecChain::from_config(&[codec]),
        );
        assert_eq!(
            load_one(&consumer, key).await.as_deref(),
            Some(content.as_slice()),
            "{codec}"
        );
        // Mirrored copy is still compressed and still decodes
        assert_eq!(
            load_one(&consumer, key).await.as_deref(),
            Some(content.as_slice()),
            "{codec}"
        );
        assert_eq!(remote.loads.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn undecodable_remote_entry_is_not_mirrored() {
    let remote = MemoryRemote::new();
    let key = CacheKey::from_content(b"k");
    remote.insert(key, &b"definitely not gzip"[..]);

    let dir = TempDir::new().unwrap();
    let access = CompressingAccess::new(
        tiered(&dir, Some(Arc::clone(&remote)), settings()),
        CodecChain::from_config(&[Compression::Gzip]),
    );

    let handler = load_keys(&access, [key]).await;
    assert!(handler.loaded(&key).is_none());
    assert_eq!(handler.hit_tier(&key), None);
    assert_eq!(handler.unpack_failures.load(Ordering::SeqCst), 1);
    assert!(!access.delegate().local().contains(&key));
}

#[tokio::test]
async fn truncated_remote_stream_is_not_a_hit() {
    let content = b"0123456789abcdef".repeat(512);
    let remote = MemoryRemote::new();
    let producer_dir = TempDir::new().unwrap();
    let producer = CompressingAccess::new(
        tiered(&producer_dir, Some(Arc::clone(&remote)), settings()),
        CodecChain::from_config(&[Compression::Lzf]),
    );
    let key = store_content(&producer, &content).await;

    // Drop the end chunk: every data chunk is still intact
    let stored = remote.get(&key).unwrap();
    remote.insert(key, stored.slice(..stored.len() - 11));

    let consumer_dir = TempDir::new().unwrap();
    let consumer = CompressingAccess::new(
        tiered(&consumer_dir, Some(Arc::clone(&remote)), settings()),
        CodecChain::from_config(&[Compression::Lzf]),
    );
    let handler = load_keys(&consumer, [key]).await;
    assert_eq!(handler.hit_tier(&key), None);
    assert_eq!(handler.unpack_failures.load(Ordering::SeqCst), 1);
    assert!(!consumer.delegate().local().contains(&key));
}

#[tokio::test]
async fn uncompressed_local_entry_read_through_codec_is_corruption() {
    let dir = TempDir::new().unwrap();
    let raw = tiered(&dir, None, settings());
    let key = store_content(&raw, b"stored before compression was enabled").await;
    raw.close().await.unwrap();

    let access = CompressingAccess::new(
        tiered(&dir, None, settings()),
        CodecChain::from_config(&[Compression::Gzip]),
    );
    let handler = common::RecordingLoad::default();
    let err = access
        .load(HashMap::from([(key, key)]), &handler)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LocalCorruption { .. }), "unexpected {err:?}");
    assert_eq!(handler.hit_tier(&key), None);
}
