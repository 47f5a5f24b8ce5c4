use std::{sync::atomic::Ordering, time::Duration};

use bytes::Bytes;
use clients::{ErrorKind, larder::v1::ByteRange};
use pretty_assertions::assert_eq as pretty_assert_eq;
use stow::{
    Cache, CommitCoordinator, ReservationCoordinator, RetryPolicy, Saved, TransferEngine,
    TransferOptions, backend::MemoryBackend,
};

use crate::{Faulty, context, write_archive};

const KIB: u64 = 1024;

fn range(start: u64, end: u64) -> ByteRange {
    ByteRange::new(start, end).unwrap()
}

fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .initial_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(5))
        .build()
}

#[test_log::test(tokio::test)]
async fn chunks_reassemble_in_offset_order() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, content) = write_archive(dir.path(), "archive", 100_000);
    let backend = Faulty::new(MemoryBackend::new());
    backend.faults.shuffle_chunks.store(true, Ordering::SeqCst);

    let options = TransferOptions::builder()
        .upload_chunk_size(4 * KIB)
        .upload_concurrency(6)
        .build();
    let cache = Cache::new(backend.clone(), backend.clone(), context(options));
    let saved = cache.save("k", &["/a"], &archive).await.unwrap();
    pretty_assert_eq!(
        saved,
        Saved::Committed {
            key: String::from("k"),
            size: 100_000
        }
    );

    pretty_assert_eq!(backend.faults.chunks().len(), 25);
    pretty_assert_eq!(backend.faults.commits(), 1);
    let stored = backend
        .inner
        .content(&cache.context().scope.object_key("k"))
        .unwrap();
    pretty_assert_eq!(stored, Bytes::from(content));
}

/// A 250 MiB archive in 64 MiB chunks, scaled down to KiB.
#[test_log::test(tokio::test)]
async fn last_chunk_is_clamped_to_archive_size() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, _) = write_archive(dir.path(), "archive", 250 * 1024);
    let backend = Faulty::new(MemoryBackend::new());
    let options = TransferOptions::builder()
        .upload_chunk_size(64 * KIB)
        .upload_concurrency(4)
        .build();
    let context = context(options);

    let reservation = ReservationCoordinator::new(backend.clone(), context.clone())
        .reserve("k", &["/a"])
        .await
        .unwrap();
    let size = TransferEngine::new(backend.clone(), backend.clone(), context)
        .upload(&reservation, &archive)
        .await
        .unwrap();

    pretty_assert_eq!(size, 256_000);
    pretty_assert_eq!(
        backend.faults.chunks(),
        vec![
            range(0, 65535),
            range(65536, 131071),
            range(131072, 196607),
            range(196608, 255999),
        ]
    );
}

#[test_log::test(tokio::test)]
async fn small_archive_is_one_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, _) = write_archive(dir.path(), "archive", 1000);
    let backend = Faulty::new(MemoryBackend::new());
    let options = TransferOptions::builder()
        .upload_chunk_size(256)
        .upload_chunk_threshold(4 * KIB)
        .build();

    Cache::new(backend.clone(), backend.clone(), context(options))
        .save("k", &["/a"], &archive)
        .await
        .unwrap();
    pretty_assert_eq!(backend.faults.chunks(), vec![range(0, 999)]);
}

#[test_log::test(tokio::test)]
async fn empty_archive_sends_no_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, _) = write_archive(dir.path(), "archive", 0);
    let backend = Faulty::new(MemoryBackend::new());
    let cache = Cache::new(backend.clone(), backend.clone(), context(TransferOptions::default()));

    let saved = cache.save("k", &["/a"], &archive).await.unwrap();
    pretty_assert_eq!(
        saved,
        Saved::Committed {
            key: String::from("k"),
            size: 0
        }
    );
    pretty_assert_eq!(backend.faults.chunks(), Vec::<ByteRange>::new());
    pretty_assert_eq!(backend.faults.commits(), 1);
}

#[test_log::test(tokio::test)]
async fn transient_chunk_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, content) = write_archive(dir.path(), "archive", 10_000);
    let backend = Faulty::new(MemoryBackend::new());
    backend.faults.fail_chunks.store(3, Ordering::SeqCst);
    let options = TransferOptions::builder()
        .upload_chunk_size(1000)
        .retry(fast_retries(5))
        .build();

    let cache = Cache::new(backend.clone(), backend.clone(), context(options));
    cache.save("k", &["/a"], &archive).await.unwrap();
    let stored = backend
        .inner
        .content(&cache.context().scope.object_key("k"))
        .unwrap();
    pretty_assert_eq!(stored, Bytes::from(content));
}

#[test_log::test(tokio::test)]
async fn exhausted_chunk_fails_upload_without_commit() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, _) = write_archive(dir.path(), "archive", 10_000);
    let backend = Faulty::new(MemoryBackend::new());
    backend.faults.fail_chunks.store(usize::MAX, Ordering::SeqCst);
    let options = TransferOptions::builder()
        .upload_chunk_size(1000)
        .upload_concurrency(4)
        .retry(fast_retries(3))
        .build();

    let cache = Cache::new(backend.clone(), backend.clone(), context(options));
    let err = cache.save("k", &["/a"], &archive).await.unwrap_err();

    pretty_assert_eq!(ErrorKind::of(&err), ErrorKind::Transient);
    assert!(
        format!("{err:?}").contains("after 3 attempts"),
        "error should report the attempt count: {err:?}"
    );
    pretty_assert_eq!(backend.faults.commits(), 0);
    pretty_assert_eq!(backend.inner.open_reservations(), 1);
    assert!(
        backend
            .inner
            .content(&cache.context().scope.object_key("k"))
            .is_none()
    );
}

#[test_log::test(tokio::test)]
async fn rejected_chunk_stops_upload_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, _) = write_archive(dir.path(), "archive", 10_000);
    let backend = Faulty::new(MemoryBackend::new());
    *backend.faults.reject_chunk.lock().unwrap() = Some(0);
    backend.faults.stall_chunks.store(true, Ordering::SeqCst);
    let options = TransferOptions::builder()
        .upload_chunk_size(1000)
        .upload_concurrency(4)
        .retry(fast_retries(5))
        .build();

    let cache = Cache::new(backend.clone(), backend.clone(), context(options));
    let err = tokio::time::timeout(
        Duration::from_secs(30),
        cache.save("k", &["/a"], &archive),
    )
    .await
    .expect("stalled workers should be cancelled")
    .unwrap_err();

    pretty_assert_eq!(ErrorKind::of(&err), ErrorKind::Permanent);
    pretty_assert_eq!(backend.faults.attempts_at(0), 1);
    pretty_assert_eq!(backend.faults.chunks(), Vec::<ByteRange>::new());
    pretty_assert_eq!(backend.faults.commits(), 0);
    assert!(
        backend
            .inner
            .content(&cache.context().scope.object_key("k"))
            .is_none()
    );
}

#[test_log::test(tokio::test)]
async fn failed_upload_reservation_commits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, _) = write_archive(dir.path(), "archive", 2000);
    let backend = Faulty::new(MemoryBackend::new());
    backend.faults.fail_chunks.store(usize::MAX, Ordering::SeqCst);
    let options = TransferOptions::builder()
        .upload_chunk_size(1000)
        .retry(RetryPolicy::none())
        .build();
    let context = context(options);

    let reservation = ReservationCoordinator::new(backend.clone(), context.clone())
        .reserve("k", &["/a"])
        .await
        .unwrap();
    let engine = TransferEngine::new(backend.clone(), backend.clone(), context.clone());
    let commits = CommitCoordinator::new(backend.clone(), backend.clone(), context);

    let upload = engine.upload(&reservation, &archive).await;
    assert!(upload.is_err());

    // Committing what was uploaded so far is rejected: the chunks don't cover
    // the archive.
    let err = commits.commit(reservation, 2000).await.unwrap_err();
    pretty_assert_eq!(ErrorKind::of(&err), ErrorKind::Permanent);
}
