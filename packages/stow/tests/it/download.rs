use std::sync::atomic::Ordering;

use clients::{
    ErrorKind,
    larder::v1::{CacheVersion, ObjectKey},
};
use pretty_assertions::assert_eq as pretty_assert_eq;
use simple_test_case::test_case;
use stow::{
    DownloadStrategy, RetryPolicy, TransferEngine, TransferOptions,
    backend::{DiskStore, MemoryBackend, NoReservations},
};

use crate::{Faulty, content, context, write_archive};

fn options(strategy: DownloadStrategy) -> TransferOptions {
    TransferOptions::builder()
        .download_strategy(strategy)
        .download_chunk_size(1000)
        .download_concurrency(4)
        .retry(RetryPolicy::none())
        .build()
}

#[test_case(DownloadStrategy::DirectStream; "direct_stream")]
#[test_case(DownloadStrategy::ConcurrentRange; "concurrent_range")]
#[tokio::test]
async fn short_body_fails_and_leaves_no_file(strategy: DownloadStrategy) {
    let backend = Faulty::new(MemoryBackend::new());
    let key = ObjectKey::new("caches/r/main/h/k");
    backend
        .inner
        .insert(&key, Some(CacheVersion::from_digest([7; 32])), content(10_000));
    backend.faults.truncate_reads.store(true, Ordering::SeqCst);

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("archive");
    let err = TransferEngine::new(backend.clone(), NoReservations, context(options(strategy)))
        .download(&key, &destination)
        .await
        .unwrap_err();

    pretty_assert_eq!(ErrorKind::of(&err), ErrorKind::Integrity);
    assert!(!destination.exists(), "partial file should be removed");
}

#[test_case(DownloadStrategy::DirectStream; "direct_stream")]
#[test_case(DownloadStrategy::ConcurrentRange; "concurrent_range")]
#[test_case(DownloadStrategy::NativeSdk; "native_sdk")]
#[tokio::test]
async fn downloads_from_disk(strategy: DownloadStrategy) {
    let root = tempfile::tempdir().unwrap();
    let store = DiskStore::new(root.path());
    let dir = tempfile::tempdir().unwrap();
    let (source, content) = write_archive(dir.path(), "source", 12_345);
    let key = ObjectKey::new("caches/r/main/h/k");
    stow::ObjectStore::put_from_file(&store, &key, None, &source)
        .await
        .unwrap();

    let destination = dir.path().join("restored").join("archive");
    let written = TransferEngine::new(store, NoReservations, context(options(strategy)))
        .download(&key, &destination)
        .await
        .unwrap();

    pretty_assert_eq!(written, 12_345);
    pretty_assert_eq!(std::fs::read(&destination).unwrap(), content);
}

#[test_log::test(tokio::test)]
async fn replaces_existing_destination() {
    let backend = MemoryBackend::new();
    let key = ObjectKey::new("caches/r/main/h/k");
    backend.insert(&key, None, "fresh");

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("archive");
    std::fs::write(&destination, "stale content that is longer").unwrap();

    TransferEngine::new(
        backend,
        NoReservations,
        context(options(DownloadStrategy::ConcurrentRange)),
    )
    .download(&key, &destination)
    .await
    .unwrap();
    pretty_assert_eq!(std::fs::read(&destination).unwrap(), b"fresh");
}
