//! Make an uploaded entry visible.

use std::sync::Arc;

use clients::{CacheError, ErrorKind};
use color_eyre::{Report, Result, eyre::Context};
use derive_more::Debug;
use tracing::{info, instrument, warn};

use crate::{
    backend::{ObjectStore, ReservationService},
    config::{CacheContext, ReservationMode},
    reserve::Reservation,
};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Finalizes reservations.
///
/// Native reservations are committed through the reservation service.
/// Storage-direct reservations have nothing to commit: the upload already
/// wrote the object in place, so the coordinator only confirms that it is
/// visible at the expected size.
#[derive(Clone, Debug)]
pub struct CommitCoordinator<S, R> {
    #[debug(skip)]
    store: S,

    #[debug(skip)]
    reservations: R,

    context: Arc<CacheContext>,
}

impl<S: ObjectStore, R: ReservationService> CommitCoordinator<S, R> {
    pub fn new(store: S, reservations: R, context: Arc<CacheContext>) -> Self {
        Self {
            store,
            reservations,
            context,
        }
    }

    /// Commit `reservation` with the final archive size.
    #[instrument(name = "CommitCoordinator::commit", skip(self), fields(scope = %self.context.scope))]
    pub async fn commit(&self, reservation: Reservation, size: u64) -> Result<()> {
        match reservation.mode {
            ReservationMode::Native => self
                .reservations
                .commit(&reservation.cache_id, size)
                .await
                .inspect_err(|error| {
                    if ErrorKind::of(error) == ErrorKind::Conflict {
                        warn!(key = %reservation.key, "commit rejected: slot already taken");
                    }
                })
                .with_context(|| format!("commit cache {}", reservation.cache_id))?,
            ReservationMode::StorageDirect => self.verify_visible(&reservation, size).await?,
        }

        let size_mb = (size as f64 / BYTES_PER_MB).round() as u64;
        info!(
            key = %reservation.key,
            cache_id = %reservation.cache_id,
            size_mb,
            "committed cache"
        );
        Ok(())
    }

    async fn verify_visible(&self, reservation: &Reservation, size: u64) -> Result<()> {
        let key = &reservation.object_key;
        let meta = self
            .store
            .head(key)
            .await
            .with_context(|| format!("look up {key}"))?
            .ok_or_else(|| {
                Report::new(CacheError::not_found(format!(
                    "object {key} is not visible after upload"
                )))
            })?;
        if meta.size != size {
            return Err(Report::new(CacheError::integrity(format!(
                "object {key} has {} bytes, expected {size}",
                meta.size
            ))));
        }
        Ok(())
    }
}
