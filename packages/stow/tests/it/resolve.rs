use clients::{
    ErrorKind,
    larder::v1::{CacheVersion, ObjectKey},
};
use pretty_assertions::assert_eq as pretty_assert_eq;
use stow::{
    CompressionMethod, KeyResolver, Resolution, TransferOptions, backend::MemoryBackend,
    compute_version,
};

use crate::{Faulty, context};

const PATHS: [&str; 2] = ["/a", "/b"];

fn options() -> TransferOptions {
    TransferOptions::builder()
        .compression(CompressionMethod::Zstd)
        .build()
}

fn version() -> CacheVersion {
    compute_version(&PATHS, Some(CompressionMethod::Zstd), false)
}

#[test_log::test(tokio::test)]
async fn stops_at_first_hit() {
    let backend = Faulty::new(MemoryBackend::new());
    backend
        .inner
        .insert(ObjectKey::new("caches/r/main/h/k2"), Some(version()), "two");
    backend
        .inner
        .insert(ObjectKey::new("caches/r/main/h/k3"), Some(version()), "three");

    let resolution = KeyResolver::new(backend.clone(), context(options()))
        .resolve(&["k1", "k2", "k3"], &PATHS)
        .await
        .unwrap();

    let entry = resolution.entry().expect("k2 should match");
    pretty_assert_eq!(entry.cache_key, "k2");
    pretty_assert_eq!(entry.object_key.as_str(), "caches/r/main/h/k2");
    pretty_assert_eq!(entry.archive_size, Some(3));
    pretty_assert_eq!(
        backend.faults.heads(),
        vec!["caches/r/main/h/k1", "caches/r/main/h/k2"]
    );
    pretty_assert_eq!(backend.faults.lists(), Vec::<String>::new());
}

#[test_log::test(tokio::test)]
async fn miss_carries_computed_version() {
    let backend = Faulty::new(MemoryBackend::new());
    let resolution = KeyResolver::new(backend.clone(), context(options()))
        .resolve(&["k1", "k2"], &PATHS)
        .await
        .unwrap();

    let Resolution::Miss(miss) = resolution else {
        panic!("expected a miss, got {resolution:?}");
    };
    pretty_assert_eq!(miss.cache_version, version());
    pretty_assert_eq!(miss.cache_version.as_str().len(), 64);
    pretty_assert_eq!(miss.attempted_keys, vec!["k1", "k2"]);
    assert!(miss.near_misses.is_empty());

    // Restore keys fall back to a prefix listing; the primary key doesn't.
    pretty_assert_eq!(backend.faults.lists(), vec!["caches/r/main/h/k2"]);
}

#[test_log::test(tokio::test)]
async fn restore_key_exact_match() {
    let backend = MemoryBackend::new();
    backend.insert(ObjectKey::new("caches/r/main/h/lock-"), Some(version()), "archive");

    let resolution = KeyResolver::new(backend, context(options()))
        .resolve(&["lock-abc", "lock-"], &PATHS)
        .await
        .unwrap();

    let entry = resolution.entry().expect("restore key should match");
    pretty_assert_eq!(entry.cache_key, "lock-");
    pretty_assert_eq!(entry.object_key.as_str(), "caches/r/main/h/lock-");
    pretty_assert_eq!(entry.cache_version, version());
    assert!(entry.creation_time.is_some());
}

#[test_log::test(tokio::test)]
async fn other_scopes_are_invisible() {
    let backend = MemoryBackend::new();
    backend.insert(ObjectKey::new("caches/r/dev/h/k"), Some(version()), "dev");
    backend.insert(ObjectKey::new("caches/other/main/h/k"), Some(version()), "other");

    let resolution = KeyResolver::new(backend, context(options()))
        .resolve(&["k"], &PATHS)
        .await
        .unwrap();
    assert!(!resolution.is_hit());
}

#[test_log::test(tokio::test)]
async fn lookup_failures_are_not_misses() {
    let backend = Faulty::new(MemoryBackend::new());
    backend
        .faults
        .fail_heads
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = KeyResolver::new(backend.clone(), context(options()))
        .resolve(&["k1", "k2"], &PATHS)
        .await
        .unwrap_err();
    pretty_assert_eq!(ErrorKind::of(&err), ErrorKind::Transient);

    // Lookups aren't retried, and the failure ends the scan.
    pretty_assert_eq!(backend.faults.heads(), vec!["caches/r/main/h/k1"]);
}

#[test_log::test(tokio::test)]
async fn too_many_keys_are_rejected() {
    let keys = (0..11).map(|i| format!("k{i}")).collect::<Vec<_>>();
    let err = KeyResolver::new(MemoryBackend::new(), context(options()))
        .resolve(&keys, &PATHS)
        .await
        .unwrap_err();
    pretty_assert_eq!(ErrorKind::of(&err), ErrorKind::Permanent);
}
