//! Configuration and the immutable context shared by cache operations.
//!
//! Configuration is read once, at the edge, into [`CacheConfig`] and
//! [`StorageConfig`] (both `clap` argument groups with environment fallbacks).
//! It's then validated into a [`CacheContext`] which every component holds
//! behind an `Arc`; nothing below this module reads the environment.

use std::{path::PathBuf, sync::Arc, time::Duration};

use bon::Builder;
use clap::Args;
use clients::{CacheError, Token};
use color_eyre::{Report, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use strum::{EnumString, IntoStaticStr};
use tracing::instrument;
use url::Url;

use crate::{
    backend::{AnyBackend, DiskStore, LarderBackend},
    retry::RetryPolicy,
    scope::Scope,
    version::CompressionMethod,
};

/// Default size of upload and download chunks.
pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Default number of concurrent range downloads.
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 8;

/// Largest default number of concurrent chunk uploads.
pub const MAX_DEFAULT_UPLOAD_CONCURRENCY: usize = 8;

/// Default largest archive that may be saved.
pub const DEFAULT_MAX_ARCHIVE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// How archives are downloaded.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Debug,
    Default,
    Display,
    EnumString,
    IntoStaticStr,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DownloadStrategy {
    /// Stream the whole object in one request.
    #[default]
    #[display("direct-stream")]
    DirectStream,

    /// Fetch disjoint ranges in parallel and write them at their offsets.
    #[display("concurrent-range")]
    ConcurrentRange,

    /// Let the backend's own SDK transfer the object.
    #[display("native-sdk")]
    NativeSdk,
}

/// How cache slots are reserved before uploading.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Debug,
    Default,
    Display,
    EnumString,
    IntoStaticStr,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ReservationMode {
    /// Use the backend's reservation service, which guarantees one writer
    /// per slot.
    #[default]
    #[display("native")]
    Native,

    /// Synthesize reservations locally and write straight to object storage.
    ///
    /// Concurrent writers of the same slot may both upload; the last write
    /// wins.
    #[display("storage-direct")]
    StorageDirect,
}

/// Tunables for transfers and lookups.
#[derive(Clone, Debug, Builder)]
#[non_exhaustive]
pub struct TransferOptions {
    /// Compression used to build archives; part of the cache version.
    pub compression: Option<CompressionMethod>,

    /// Whether archives built on Windows may be restored elsewhere; part of
    /// the cache version.
    #[builder(default)]
    pub cross_os_archive: bool,

    /// Number of chunks uploaded at once.
    #[builder(default = default_upload_concurrency())]
    pub upload_concurrency: usize,

    /// Size of each uploaded chunk.
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    pub upload_chunk_size: u64,

    /// Archives up to this size are uploaded as a single chunk.
    ///
    /// Defaults to the chunk size.
    upload_chunk_threshold: Option<u64>,

    /// Number of ranges downloaded at once.
    #[builder(default = DEFAULT_DOWNLOAD_CONCURRENCY)]
    pub download_concurrency: usize,

    /// Size of each downloaded range.
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    pub download_chunk_size: u64,

    #[builder(default)]
    pub download_strategy: DownloadStrategy,

    #[builder(default)]
    pub reservation_mode: ReservationMode,

    /// List the repository namespace on a miss to report near misses.
    #[builder(default)]
    pub lookup_diagnostics: bool,

    /// Archives larger than this are never saved.
    #[builder(default = DEFAULT_MAX_ARCHIVE_SIZE)]
    pub max_archive_size: u64,

    #[builder(default)]
    pub retry: RetryPolicy,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TransferOptions {
    /// Archives up to this size are uploaded as a single chunk.
    pub fn upload_chunk_threshold(&self) -> u64 {
        self.upload_chunk_threshold.unwrap_or(self.upload_chunk_size)
    }

    /// Ensure every size and concurrency is usable.
    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("upload concurrency", self.upload_concurrency as u64),
            ("upload chunk size", self.upload_chunk_size),
            ("download concurrency", self.download_concurrency as u64),
            ("download chunk size", self.download_chunk_size),
            ("retry attempts", u64::from(self.retry.max_attempts)),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(Report::new(CacheError::permanent(format!(
                    "{name} must be greater than zero"
                ))));
            }
        }
        Ok(())
    }
}

/// The available parallelism, clamped to `1..=8`.
pub fn default_upload_concurrency() -> usize {
    num_cpus::get().clamp(1, MAX_DEFAULT_UPLOAD_CONCURRENCY)
}

/// Everything cache operations need to know about where they run.
///
/// Immutable once built; shared behind an `Arc`.
#[derive(Clone, Debug, Display, Builder)]
#[display("{scope}")]
#[non_exhaustive]
pub struct CacheContext {
    pub scope: Scope,

    #[builder(default)]
    pub options: TransferOptions,
}

impl CacheContext {
    /// Validate the context and wrap it for sharing.
    pub fn shared(self) -> Result<Arc<Self>> {
        self.scope.validate()?;
        self.options.validate()?;
        Ok(Arc::new(self))
    }
}

/// Cache settings, usually read from the CI environment.
#[derive(Clone, Args, Debug)]
pub struct CacheConfig {
    /// The repository the caches belong to, e.g. `acme/widgets`.
    #[arg(long, env = "GITHUB_REPOSITORY")]
    pub repository: String,

    /// The branch or tag the caches belong to.
    #[arg(long, env = "GITHUB_REF")]
    pub git_ref: String,

    /// A digest identifying the workflow the caches belong to.
    #[arg(long, env = "STOW_WORKFLOW_HASH")]
    pub workflow_hash: String,

    /// Compression used to build archives.
    #[arg(long, env = "STOW_COMPRESSION_METHOD", value_enum)]
    pub compression_method: Option<CompressionMethod>,

    /// Allow archives built on Windows to be restored on other platforms.
    #[arg(long, env = "STOW_ENABLE_CROSS_OS_ARCHIVE", default_value_t = false)]
    pub enable_cross_os_archive: bool,

    /// Number of chunks uploaded at once [default: available parallelism, at most 8].
    #[arg(long, env = "STOW_UPLOAD_CONCURRENCY")]
    pub upload_concurrency: Option<usize>,

    /// Size in bytes of each uploaded chunk.
    #[arg(long, env = "STOW_UPLOAD_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub upload_chunk_size: u64,

    /// Archives up to this many bytes are uploaded as one chunk [default: the chunk size].
    #[arg(long, env = "STOW_UPLOAD_CHUNK_THRESHOLD")]
    pub upload_chunk_threshold: Option<u64>,

    /// Number of ranges downloaded at once.
    #[arg(long, env = "STOW_DOWNLOAD_CONCURRENCY", default_value_t = DEFAULT_DOWNLOAD_CONCURRENCY)]
    pub download_concurrency: usize,

    /// Size in bytes of each downloaded range.
    #[arg(long, env = "STOW_DOWNLOAD_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub download_chunk_size: u64,

    /// How archives are downloaded.
    #[arg(long, env = "STOW_DOWNLOAD_STRATEGY", value_enum, default_value_t = DownloadStrategy::DirectStream)]
    pub download_strategy: DownloadStrategy,

    /// Shorthand for `--download-strategy concurrent-range`.
    #[arg(long, env = "STOW_USE_CONCURRENT_RANGE_DOWNLOAD", default_value_t = false)]
    pub use_concurrent_range_download: bool,

    /// How cache slots are reserved before uploading.
    #[arg(long, env = "STOW_RESERVATION_MODE", value_enum, default_value_t = ReservationMode::Native)]
    pub reservation_mode: ReservationMode,

    /// On a miss, list the repository's caches and report near misses.
    #[arg(long, env = "STOW_LOOKUP_DIAGNOSTICS", default_value_t = false)]
    pub lookup_diagnostics: bool,

    /// Largest archive in bytes that may be saved.
    #[arg(long, env = "STOW_MAX_ARCHIVE_SIZE", default_value_t = DEFAULT_MAX_ARCHIVE_SIZE)]
    pub max_archive_size: u64,

    /// Total attempts for each transfer operation.
    #[arg(long, env = "STOW_RETRY_MAX_ATTEMPTS", default_value_t = 5)]
    pub retry_max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[arg(long, env = "STOW_RETRY_INITIAL_BACKOFF_MS", default_value_t = 250)]
    pub retry_initial_backoff_ms: u64,

    /// Upper bound on any retry delay, in milliseconds.
    #[arg(long, env = "STOW_RETRY_MAX_BACKOFF_MS", default_value_t = 10_000)]
    pub retry_max_backoff_ms: u64,
}

impl CacheConfig {
    /// Validate the configuration into a shared context.
    #[instrument(name = "CacheConfig::into_context", skip_all)]
    pub fn into_context(self) -> Result<Arc<CacheContext>> {
        let scope = Scope::builder()
            .repository(self.repository)
            .git_ref(self.git_ref)
            .workflow_hash(self.workflow_hash)
            .build();

        let download_strategy = if self.use_concurrent_range_download {
            DownloadStrategy::ConcurrentRange
        } else {
            self.download_strategy
        };

        let retry = RetryPolicy::builder()
            .max_attempts(self.retry_max_attempts)
            .initial_backoff(Duration::from_millis(self.retry_initial_backoff_ms))
            .max_backoff(Duration::from_millis(self.retry_max_backoff_ms))
            .build();

        let options = TransferOptions::builder()
            .maybe_compression(self.compression_method)
            .cross_os_archive(self.enable_cross_os_archive)
            .upload_concurrency(
                self.upload_concurrency
                    .unwrap_or_else(default_upload_concurrency),
            )
            .upload_chunk_size(self.upload_chunk_size)
            .maybe_upload_chunk_threshold(self.upload_chunk_threshold)
            .download_concurrency(self.download_concurrency)
            .download_chunk_size(self.download_chunk_size)
            .download_strategy(download_strategy)
            .reservation_mode(self.reservation_mode)
            .lookup_diagnostics(self.lookup_diagnostics)
            .max_archive_size(self.max_archive_size)
            .retry(retry)
            .build();

        CacheContext::builder()
            .scope(scope)
            .options(options)
            .build()
            .shared()
    }
}

/// Where caches are stored.
///
/// Exactly one backend must be configured.
#[derive(Clone, Args, Debug)]
pub struct StorageConfig {
    /// Base URL of the Larder cache service.
    #[arg(long, env = "STOW_LARDER_URL", requires = "larder_token")]
    pub larder_url: Option<Url>,

    /// Token for the Larder cache service.
    #[arg(long, env = "STOW_LARDER_TOKEN")]
    pub larder_token: Option<Token>,

    /// Directory holding caches on a local or shared filesystem.
    #[arg(long, env = "STOW_DISK_ROOT")]
    pub disk_root: Option<PathBuf>,

    /// S3 bucket holding caches.
    #[cfg(feature = "s3")]
    #[arg(long, env = "STOW_S3_BUCKET")]
    pub s3_bucket: Option<String>,
}

impl StorageConfig {
    /// Connect to the configured backend.
    #[instrument(name = "StorageConfig::open", skip_all)]
    pub async fn open(self) -> Result<AnyBackend> {
        let mut backends = Vec::new();
        if let Some(url) = self.larder_url {
            let token = self
                .larder_token
                .ok_or_else(|| invalid("a Larder URL requires a Larder token"))?;
            backends.push(BackendChoice::Larder(url, token));
        }
        if let Some(root) = self.disk_root {
            backends.push(BackendChoice::Disk(root));
        }
        #[cfg(feature = "s3")]
        if let Some(bucket) = self.s3_bucket {
            backends.push(BackendChoice::S3(bucket));
        }

        let choice = match backends.len() {
            0 => return Err(invalid("no cache storage is configured")),
            1 => backends.remove(0),
            _ => return Err(invalid("configure exactly one cache storage backend")),
        };
        match choice {
            BackendChoice::Larder(url, token) => {
                LarderBackend::new(url, token).await.map(AnyBackend::Larder)
            }
            BackendChoice::Disk(root) => Ok(AnyBackend::Disk(DiskStore::new(root))),
            #[cfg(feature = "s3")]
            BackendChoice::S3(bucket) => {
                crate::backend::S3Store::new(bucket).await.map(AnyBackend::S3)
            }
        }
    }
}

enum BackendChoice {
    Larder(Url, Token),
    Disk(PathBuf),
    #[cfg(feature = "s3")]
    S3(String),
}

fn invalid(message: &str) -> Report {
    Report::new(CacheError::permanent(message))
}
