//! Restore and save flows over the individual components.

use std::{path::Path, sync::Arc};

use clients::{CacheError, ErrorKind};
use color_eyre::{Report, Result, Section};
use derive_more::{Debug, Display};
use tracing::{info, instrument};

use crate::{
    backend::{AnyBackend, ObjectStore, ReservationService},
    commit::CommitCoordinator,
    config::{CacheConfig, CacheContext, ReservationMode, StorageConfig},
    fs,
    reserve::ReservationCoordinator,
    resolve::{ArtifactCacheEntry, CacheMiss, KeyResolver, Resolution},
    transfer::TransferEngine,
};

/// The outcome of [`Cache::restore`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Restored {
    /// An entry was found and downloaded.
    Hit {
        entry: ArtifactCacheEntry,
        size: u64,
    },

    /// No key matched; nothing was written.
    Miss(CacheMiss),
}

impl Restored {
    pub fn entry(&self) -> Option<&ArtifactCacheEntry> {
        match self {
            Self::Hit { entry, .. } => Some(entry),
            Self::Miss(_) => None,
        }
    }
}

/// The outcome of [`Cache::save`].
#[derive(Clone, PartialEq, Eq, Debug, Display)]
pub enum Saved {
    /// The archive was uploaded and committed.
    #[display("saved {key} ({size} bytes)")]
    Committed { key: String, size: u64 },

    /// Another writer holds the slot, so nothing was uploaded.
    #[display("skipped {key}: another writer holds the slot")]
    Skipped { key: String },
}

/// The cache operations, wired to one backend.
///
/// `S` provides object storage and `R` the reservation service; for backends
/// that do both they are the same value.
#[derive(Clone, Debug)]
pub struct Cache<S, R> {
    context: Arc<CacheContext>,
    resolver: KeyResolver<S>,
    reservations: ReservationCoordinator<R>,
    transfers: TransferEngine<S, R>,
    commits: CommitCoordinator<S, R>,
}

impl Cache<AnyBackend, AnyBackend> {
    /// Open the configured backend and build a cache over it.
    #[instrument(name = "Cache::open", skip_all)]
    pub async fn open(config: CacheConfig, storage: StorageConfig) -> Result<Self> {
        let context = config.into_context()?;
        let backend = storage.open().await?;
        if context.options.reservation_mode == ReservationMode::Native
            && !backend.supports_reservations()
        {
            return Err(Report::new(CacheError::permanent(format!(
                "{backend} has no reservation service"
            ))))
            .suggestion("use the storage-direct reservation mode with this backend");
        }
        info!(%backend, scope = %context.scope, "opened cache");
        Ok(Self::new(backend.clone(), backend, context))
    }
}

impl<S: ObjectStore, R: ReservationService> Cache<S, R> {
    pub fn new(store: S, reservations: R, context: Arc<CacheContext>) -> Self {
        Self {
            resolver: KeyResolver::new(store.clone(), context.clone()),
            reservations: ReservationCoordinator::new(reservations.clone(), context.clone()),
            transfers: TransferEngine::new(store.clone(), reservations.clone(), context.clone()),
            commits: CommitCoordinator::new(store, reservations, context.clone()),
            context,
        }
    }

    pub fn context(&self) -> &CacheContext {
        &self.context
    }

    pub fn resolver(&self) -> &KeyResolver<S> {
        &self.resolver
    }

    pub fn reservations(&self) -> &ReservationCoordinator<R> {
        &self.reservations
    }

    pub fn transfers(&self) -> &TransferEngine<S, R> {
        &self.transfers
    }

    pub fn commits(&self) -> &CommitCoordinator<S, R> {
        &self.commits
    }

    /// Resolve `keys` and, on a hit, download the archive to `destination`.
    #[instrument(name = "Cache::restore", skip(self, keys, paths))]
    pub async fn restore(
        &self,
        keys: &[impl AsRef<str>],
        paths: &[impl AsRef<str>],
        destination: &Path,
    ) -> Result<Restored> {
        match self.resolver.resolve(keys, paths).await? {
            Resolution::Found(entry) => {
                let size = self
                    .transfers
                    .download(&entry.object_key, destination)
                    .await?;
                Ok(Restored::Hit { entry, size })
            }
            Resolution::Miss(miss) => Ok(Restored::Miss(miss)),
        }
    }

    /// Reserve `key`, upload `archive` and commit it.
    ///
    /// Losing the reservation to another writer is not an error: the other
    /// writer is saving the same entry.
    #[instrument(name = "Cache::save", skip(self, paths))]
    pub async fn save(
        &self,
        key: &str,
        paths: &[impl AsRef<str>],
        archive: &Path,
    ) -> Result<Saved> {
        let size = fs::file_size(archive).await?;
        let reservation = match self
            .reservations
            .reserve_with_size(key, paths, Some(size))
            .await
        {
            Ok(reservation) => reservation,
            Err(err) if ErrorKind::of(&err) == ErrorKind::Conflict => {
                info!(%key, "cache is already being saved; skipping");
                return Ok(Saved::Skipped {
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(err),
        };

        let size = self.transfers.upload(&reservation, archive).await?;
        self.commits.commit(reservation, size).await?;
        Ok(Saved::Committed {
            key: key.to_string(),
            size,
        })
    }
}
