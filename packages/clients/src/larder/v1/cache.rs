//! Reservation API types.

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::larder::v1::{CacheId, CacheVersion, ObjectKey};

/// Request to reserve a cache slot for writing.
///
/// The service rejects a reservation with `409 Conflict` if another
/// reservation for the same object address and version is open or has
/// already been committed.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct ReserveCacheRequest {
    /// The caller-chosen cache key.
    #[builder(into)]
    pub key: String,

    /// The version of the archive that will be written.
    #[builder(into)]
    pub version: CacheVersion,

    /// The scoped address at which the entry becomes visible once committed.
    #[builder(into)]
    pub object_key: ObjectKey,

    /// The size of the archive, if known up front.
    pub cache_size: Option<u64>,
}

/// Response to a successful reservation.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ReserveCacheResponse {
    pub cache_id: CacheId,
}

impl ReserveCacheResponse {
    pub fn new(cache_id: CacheId) -> Self {
        Self { cache_id }
    }
}

/// Request to commit a reservation once every chunk is written.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CommitCacheRequest {
    /// The final size of the archive in bytes.
    pub size: u64,
}

impl CommitCacheRequest {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

/// Query for listing objects by address prefix.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ListObjectsQuery {
    pub prefix: String,
}

impl ListObjectsQuery {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}
