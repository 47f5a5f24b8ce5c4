//! Chunked uploads and strategy-selected downloads.

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use clients::{
    CacheError,
    larder::v1::{ByteRange, ObjectKey},
};
use color_eyre::{
    Report, Result,
    eyre::{Context, eyre},
};
use derive_more::Debug;
use humansize::{DECIMAL, format_size};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, trace};

use crate::{
    backend::{ObjectStore, ReservationService},
    config::{CacheContext, DownloadStrategy, ReservationMode},
    fs::{self, PartialFile},
    reserve::Reservation,
};

/// Split an archive of `size` bytes into upload chunks.
///
/// An empty archive has no chunks. An archive no larger than `threshold` is
/// sent as one chunk; anything larger is split into `chunk_size` pieces with
/// the last one ending at the final byte.
pub fn plan_chunks(size: u64, chunk_size: u64, threshold: u64) -> Vec<ByteRange> {
    if size == 0 {
        return Vec::new();
    }
    if size <= threshold {
        return ByteRange::spanning(0, size).into_iter().collect();
    }

    let chunk_size = chunk_size.max(1);
    std::iter::successors(Some(0u64), |start| {
        start.checked_add(chunk_size).filter(|next| *next < size)
    })
    .filter_map(|start| ByteRange::spanning(start, start.saturating_add(chunk_size).min(size)))
    .collect()
}

/// Moves archives between local files and a backend.
///
/// Transfers fan out over a fixed pool of workers draining a queue of byte
/// ranges. Workers share one file handle and use positional I/O, so ranges
/// complete in any order without coordination. The first fatal error aborts
/// the remaining workers.
#[derive(Clone, Debug)]
pub struct TransferEngine<S, R> {
    #[debug(skip)]
    store: S,

    #[debug(skip)]
    reservations: R,

    context: Arc<CacheContext>,
}

impl<S: ObjectStore, R: ReservationService> TransferEngine<S, R> {
    pub fn new(store: S, reservations: R, context: Arc<CacheContext>) -> Self {
        Self {
            store,
            reservations,
            context,
        }
    }

    /// Upload `archive` into a reservation, returning its size.
    #[instrument(name = "TransferEngine::upload", skip(self))]
    pub async fn upload(&self, reservation: &Reservation, archive: &Path) -> Result<u64> {
        let options = &self.context.options;
        let size = fs::file_size(archive).await?;
        if size > options.max_archive_size {
            return Err(Report::new(CacheError::permanent(format!(
                "archive size {} exceeds the maximum of {}",
                format_size(size, DECIMAL),
                format_size(options.max_archive_size, DECIMAL),
            ))));
        }

        match reservation.mode {
            ReservationMode::Native => self.upload_chunks(reservation, archive, size).await?,
            ReservationMode::StorageDirect => options
                .retry
                .run("put object", || {
                    self.store.put_from_file(
                        &reservation.object_key,
                        Some(&reservation.version),
                        archive,
                    )
                })
                .await
                .with_context(|| format!("upload {archive:?} to {}", reservation.object_key))?,
        }

        info!(
            key = %reservation.key,
            size = %format_size(size, DECIMAL),
            "uploaded archive"
        );
        Ok(size)
    }

    async fn upload_chunks(&self, reservation: &Reservation, archive: &Path, size: u64) -> Result<()> {
        let options = &self.context.options;
        let chunks = plan_chunks(size, options.upload_chunk_size, options.upload_chunk_threshold());
        if chunks.is_empty() {
            debug!("archive is empty; nothing to upload");
            return Ok(());
        }

        let file = fs::open_shared(archive).await?;
        let worker_count = options.upload_concurrency.min(chunks.len());
        debug!(chunks = chunks.len(), worker_count, "uploading chunks");
        let rx = queue(chunks)?;

        let uploaded = Arc::new(AtomicU64::new(0));
        let mut workers = JoinSet::<Result<()>>::new();
        for worker in 0..worker_count {
            let rx = rx.clone();
            let file = file.clone();
            let service = self.reservations.clone();
            let retry = options.retry.clone();
            let cache_id = reservation.cache_id.clone();
            let uploaded = uploaded.clone();
            workers.spawn(async move {
                while let Ok(range) = rx.recv_async().await {
                    let len = usize::try_from(range.len()).context("chunk length")?;
                    let content = fs::read_at(file.clone(), range.start(), len).await?;
                    retry
                        .run("upload chunk", || {
                            service.upload_chunk(&cache_id, range, content.clone())
                        })
                        .await
                        .with_context(|| format!("upload chunk {range}"))?;
                    uploaded.fetch_add(range.len(), Ordering::Relaxed);
                    trace!(worker, %range, "uploaded chunk");
                }
                Ok(())
            });
        }
        drop(rx);

        join_workers(workers, "upload").await?;
        trace!(uploaded = uploaded.load(Ordering::Relaxed), "uploaded all chunks");
        Ok(())
    }

    /// Download the object at `key` to `destination`, returning its size.
    ///
    /// `destination` is removed if the download fails or is cancelled.
    #[instrument(name = "TransferEngine::download", skip(self))]
    pub async fn download(&self, key: &ObjectKey, destination: &Path) -> Result<u64> {
        let strategy = self.context.options.download_strategy;
        let guard = PartialFile::new(destination);
        let written = match strategy {
            DownloadStrategy::DirectStream => self.download_stream(key, destination).await,
            DownloadStrategy::ConcurrentRange => self.download_ranges(key, destination).await,
            DownloadStrategy::NativeSdk => self.download_native(key, destination).await,
        }
        .with_context(|| format!("download {key} to {destination:?}"))?;
        guard.finish();

        info!(%key, %strategy, size = %format_size(written, DECIMAL), "downloaded archive");
        Ok(written)
    }

    async fn download_stream(&self, key: &ObjectKey, destination: &Path) -> Result<u64> {
        self.context
            .options
            .retry
            .run("stream object", || async move {
                let body = self
                    .store
                    .open_read(key)
                    .await?
                    .ok_or_else(|| not_found(key))?;
                let declared = body.length;
                let written = fs::write_stream(body.reader, destination).await?;
                match declared {
                    Some(declared) if declared != written => Err(Report::new(CacheError::integrity(
                        format!("expected {declared} bytes but received {written}"),
                    ))),
                    _ => Ok(written),
                }
            })
            .await
    }

    async fn download_ranges(&self, key: &ObjectKey, destination: &Path) -> Result<u64> {
        let options = &self.context.options;
        let size = self
            .store
            .head(key)
            .await?
            .ok_or_else(|| not_found(key))?
            .size;
        let file = fs::create_shared(destination, size).await?;
        let ranges = plan_chunks(size, options.download_chunk_size, options.download_chunk_size);
        if ranges.is_empty() {
            return Ok(0);
        }

        let worker_count = options.download_concurrency.min(ranges.len());
        debug!(ranges = ranges.len(), worker_count, "downloading ranges");
        let rx = queue(ranges)?;

        let written = Arc::new(AtomicU64::new(0));
        let mut workers = JoinSet::<Result<()>>::new();
        for worker in 0..worker_count {
            let rx = rx.clone();
            let file = file.clone();
            let store = self.store.clone();
            let retry = options.retry.clone();
            let key = key.clone();
            let written = written.clone();
            workers.spawn(async move {
                while let Ok(range) = rx.recv_async().await {
                    let content = retry
                        .run("read range", || store.read_range(&key, range))
                        .await
                        .with_context(|| format!("read range {range}"))?;
                    let received = content.len() as u64;
                    if received != range.len() {
                        return Err(Report::new(CacheError::integrity(format!(
                            "range {range} returned {received} of {} bytes",
                            range.len()
                        ))));
                    }
                    fs::write_at(file.clone(), range.start(), content).await?;
                    written.fetch_add(received, Ordering::Relaxed);
                    trace!(worker, %range, "downloaded range");
                }
                Ok(())
            });
        }
        drop(rx);

        join_workers(workers, "download").await?;
        let total = written.load(Ordering::Relaxed);
        if total != size {
            return Err(Report::new(CacheError::integrity(format!(
                "expected {size} bytes but wrote {total}"
            ))));
        }
        Ok(total)
    }

    async fn download_native(&self, key: &ObjectKey, destination: &Path) -> Result<u64> {
        let written = self
            .context
            .options
            .retry
            .run("get object", || self.store.get_to_file(key, destination))
            .await?;
        let expected = self
            .store
            .head(key)
            .await?
            .ok_or_else(|| not_found(key))?
            .size;
        let on_disk = fs::file_size(destination).await?;
        if on_disk != expected {
            return Err(Report::new(CacheError::integrity(format!(
                "expected {expected} bytes but found {on_disk} on disk"
            ))));
        }
        trace!(written, on_disk, "verified downloaded size");
        Ok(on_disk)
    }
}

/// Fill a queue with every range up front; workers drain it until empty.
fn queue(ranges: Vec<ByteRange>) -> Result<flume::Receiver<ByteRange>> {
    let (tx, rx) = flume::bounded(ranges.len());
    for range in ranges {
        tx.send(range)
            .map_err(|err| eyre!("queue range {}", err.into_inner()))?;
    }
    Ok(rx)
}

/// Wait for every worker, aborting the rest on the first failure.
///
/// Aborted workers are drained before returning, so none of them touches the
/// file after the caller gives up on it.
async fn join_workers(mut workers: JoinSet<Result<()>>, name: &str) -> Result<()> {
    while let Some(joined) = workers.join_next().await {
        let result = joined
            .with_context(|| format!("join {name} worker"))
            .and_then(|result| result);
        if let Err(err) = result {
            debug!(remaining = workers.len(), "aborting {name} workers");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
            return Err(err);
        }
    }
    Ok(())
}

fn not_found(key: &ObjectKey) -> Report {
    Report::new(CacheError::not_found(format!("object {key} does not exist")))
}
