//! Claim a cache slot before writing to it.

use std::sync::Arc;

use clients::{
    CacheError, ErrorKind,
    larder::v1::{CacheId, CacheVersion, ObjectKey, cache::ReserveCacheRequest},
};
use color_eyre::{Report, Result, eyre::Context};
use derive_more::{Debug, Display};
use humansize::{DECIMAL, format_size};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    backend::ReservationService,
    config::{CacheContext, ReservationMode},
    scope::validate_key,
    version::compute_version,
};

/// A claim on a cache slot.
///
/// Deliberately not `Clone`: committing consumes the reservation, so a
/// reservation is committed at most once.
#[derive(PartialEq, Eq, Debug, Display)]
#[display("{key} ({cache_id})")]
#[non_exhaustive]
pub struct Reservation {
    pub cache_id: CacheId,
    pub key: String,
    pub version: CacheVersion,

    /// The archive size declared when reserving, if it was known.
    pub cache_size: Option<u64>,

    /// The address at which the entry becomes visible once committed.
    pub object_key: ObjectKey,

    pub mode: ReservationMode,
}

/// Reserves cache slots.
///
/// In [`ReservationMode::Native`] the reservation service guarantees a single
/// writer per `(object_key, version)`: the second reservation for a slot
/// fails with [`ErrorKind::Conflict`].
///
/// In [`ReservationMode::StorageDirect`] there is no service to ask. Every
/// call is granted with a fresh random id and the backend is never contacted,
/// so concurrent writers of the same slot may both upload and the last
/// write wins. Only use it with backends where that is acceptable.
///
/// Reservations are not retried: a reservation that was granted by the
/// service but whose response was lost would conflict with itself.
#[derive(Clone, Debug)]
pub struct ReservationCoordinator<R> {
    #[debug(skip)]
    service: R,
    context: Arc<CacheContext>,
}

impl<R: ReservationService> ReservationCoordinator<R> {
    pub fn new(service: R, context: Arc<CacheContext>) -> Self {
        Self { service, context }
    }

    /// Reserve the slot for `key` without declaring a size.
    pub async fn reserve(&self, key: &str, paths: &[impl AsRef<str>]) -> Result<Reservation> {
        self.reserve_with_size(key, paths, None).await
    }

    /// Reserve the slot for `key`, declaring the archive size up front.
    #[instrument(name = "ReservationCoordinator::reserve", skip(self, paths))]
    pub async fn reserve_with_size(
        &self,
        key: &str,
        paths: &[impl AsRef<str>],
        cache_size: Option<u64>,
    ) -> Result<Reservation> {
        validate_key(key)?;
        let options = &self.context.options;
        if let Some(size) = cache_size.filter(|size| *size > options.max_archive_size) {
            return Err(Report::new(CacheError::permanent(format!(
                "archive size {} exceeds the maximum of {}",
                format_size(size, DECIMAL),
                format_size(options.max_archive_size, DECIMAL),
            ))));
        }

        let version = compute_version(paths, options.compression, options.cross_os_archive);
        let object_key = self.context.scope.object_key(key);
        let mode = options.reservation_mode;
        let cache_id = match mode {
            ReservationMode::Native => {
                let request = ReserveCacheRequest::builder()
                    .key(key)
                    .version(version.clone())
                    .object_key(object_key.clone())
                    .maybe_cache_size(cache_size)
                    .build();
                match self.service.reserve(&request).await {
                    Ok(cache_id) => cache_id,
                    Err(err) if ErrorKind::of(&err) == ErrorKind::Conflict => {
                        info!(%key, %version, %object_key, "reservation conflict");
                        return Err(err);
                    }
                    Err(err) => return Err(err).with_context(|| format!("reserve cache {key}")),
                }
            }
            ReservationMode::StorageDirect => {
                let cache_id = CacheId::new(Uuid::new_v4().to_string());
                debug!(%cache_id, "granted storage-direct reservation");
                cache_id
            }
        };

        info!(%key, %cache_id, %version, %mode, "reserved cache");
        Ok(Reservation {
            cache_id,
            key: key.to_string(),
            version,
            cache_size,
            object_key,
            mode,
        })
    }
}
