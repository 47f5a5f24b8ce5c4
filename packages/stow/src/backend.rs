//! Storage capabilities and the backends that provide them.
//!
//! Cache operations are written against two capabilities:
//!
//! - [`ObjectStore`]: addressable blob storage (every backend has this).
//! - [`ReservationService`]: the reserve/upload-chunk/commit protocol that
//!   enforces a single writer per cache slot. Only some backends have this;
//!   the rest are used in storage-direct mode with [`NoReservations`].
//!
//! Backends never retry; callers wrap operations in a
//! [`RetryPolicy`](crate::RetryPolicy). Backends classify their failures with
//! [`CacheError`](clients::CacheError) so that the policy can tell transient
//! failures apart from fatal ones.

use std::{future::Future, path::Path, pin::Pin};

use bytes::Bytes;
use clients::{
    CacheError,
    larder::v1::{ByteRange, CacheId, CacheVersion, ObjectKey, ObjectMeta, cache::ReserveCacheRequest},
};
use color_eyre::{Report, Result};
use derive_more::{Debug, Display};
use tokio::io::AsyncRead;

mod disk;
mod larder;
mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use disk::DiskStore;
pub use larder::LarderBackend;
pub use memory::MemoryBackend;
#[cfg(feature = "s3")]
pub use s3::S3Store;

/// A streaming object body.
#[derive(Debug)]
pub struct ObjectBody {
    /// The length declared by the backend, if it declared one.
    ///
    /// Not verified by the backend; readers count what they receive.
    pub length: Option<u64>,

    #[debug(skip)]
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl ObjectBody {
    pub fn new(length: Option<u64>, reader: impl AsyncRead + Send + 'static) -> Self {
        Self {
            length,
            reader: Box::pin(reader),
        }
    }
}

/// Addressable blob storage.
pub trait ObjectStore: Clone + Send + Sync + 'static {
    /// Look up an object's metadata; `None` if it doesn't exist.
    fn head(&self, key: &ObjectKey) -> impl Future<Output = Result<Option<ObjectMeta>>> + Send;

    /// List the objects whose address starts with `prefix`.
    fn list(&self, prefix: &str) -> impl Future<Output = Result<Vec<ObjectMeta>>> + Send;

    /// Open an object for streaming; `None` if it doesn't exist.
    fn open_read(&self, key: &ObjectKey) -> impl Future<Output = Result<Option<ObjectBody>>> + Send;

    /// Read a single range of an object.
    ///
    /// The result may be shorter than requested if the object is shorter;
    /// callers compare lengths.
    fn read_range(
        &self,
        key: &ObjectKey,
        range: ByteRange,
    ) -> impl Future<Output = Result<Bytes>> + Send;

    /// Download an object to `destination` using the backend's own transfer
    /// logic, returning the number of bytes written.
    ///
    /// A missing object is an error classified
    /// [`ErrorKind::NotFound`](clients::ErrorKind::NotFound).
    fn get_to_file(
        &self,
        key: &ObjectKey,
        destination: &Path,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Upload the file at `source` as an object, replacing any existing one.
    fn put_from_file(
        &self,
        key: &ObjectKey,
        version: Option<&CacheVersion>,
        source: &Path,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// The reserve, upload-chunk, commit protocol.
pub trait ReservationService: Clone + Send + Sync + 'static {
    /// Reserve a cache slot. A slot that is already reserved or committed for
    /// the same address and version is a conflict.
    fn reserve(
        &self,
        request: &ReserveCacheRequest,
    ) -> impl Future<Output = Result<CacheId>> + Send;

    /// Upload one chunk of the archive into a reservation.
    fn upload_chunk(
        &self,
        id: &CacheId,
        range: ByteRange,
        content: Bytes,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Commit a reservation, making it visible to lookups.
    fn commit(&self, id: &CacheId, size: u64) -> impl Future<Output = Result<()>> + Send;
}

/// A reservation service for backends that don't have one.
///
/// Every operation fails as permanent; use it with
/// [`ReservationMode::StorageDirect`](crate::ReservationMode::StorageDirect),
/// which never calls the service.
#[derive(Copy, Clone, Default, Debug, Display)]
#[display("no reservations")]
pub struct NoReservations;

impl NoReservations {
    fn unsupported() -> Report {
        Report::new(CacheError::permanent(
            "backend has no reservation service; use storage-direct reservations",
        ))
    }
}

impl ReservationService for NoReservations {
    async fn reserve(&self, _request: &ReserveCacheRequest) -> Result<CacheId> {
        Err(Self::unsupported())
    }

    async fn upload_chunk(&self, _id: &CacheId, _range: ByteRange, _content: Bytes) -> Result<()> {
        Err(Self::unsupported())
    }

    async fn commit(&self, _id: &CacheId, _size: u64) -> Result<()> {
        Err(Self::unsupported())
    }
}

/// A backend chosen at runtime from configuration.
///
/// See [`StorageConfig::open`](crate::StorageConfig::open).
#[derive(Clone, Debug, Display)]
pub enum AnyBackend {
    #[display("larder: {_0}")]
    Larder(LarderBackend),

    #[display("disk: {_0}")]
    Disk(DiskStore),

    #[cfg(feature = "s3")]
    #[display("s3: {_0}")]
    S3(S3Store),
}

impl AnyBackend {
    /// Whether the backend has a native reservation service.
    pub fn supports_reservations(&self) -> bool {
        matches!(self, Self::Larder(_))
    }
}

/// Forward a call to whichever backend is active.
macro_rules! dispatch {
    ($self:ident, $backend:ident => $call:expr) => {
        match $self {
            AnyBackend::Larder($backend) => $call,
            AnyBackend::Disk($backend) => $call,
            #[cfg(feature = "s3")]
            AnyBackend::S3($backend) => $call,
        }
    };
}

impl ObjectStore for AnyBackend {
    async fn head(&self, key: &ObjectKey) -> Result<Option<ObjectMeta>> {
        dispatch!(self, backend => backend.head(key).await)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        dispatch!(self, backend => backend.list(prefix).await)
    }

    async fn open_read(&self, key: &ObjectKey) -> Result<Option<ObjectBody>> {
        dispatch!(self, backend => backend.open_read(key).await)
    }

    async fn read_range(&self, key: &ObjectKey, range: ByteRange) -> Result<Bytes> {
        dispatch!(self, backend => backend.read_range(key, range).await)
    }

    async fn get_to_file(&self, key: &ObjectKey, destination: &Path) -> Result<u64> {
        dispatch!(self, backend => backend.get_to_file(key, destination).await)
    }

    async fn put_from_file(
        &self,
        key: &ObjectKey,
        version: Option<&CacheVersion>,
        source: &Path,
    ) -> Result<()> {
        dispatch!(self, backend => backend.put_from_file(key, version, source).await)
    }
}

impl ReservationService for AnyBackend {
    async fn reserve(&self, request: &ReserveCacheRequest) -> Result<CacheId> {
        match self {
            Self::Larder(backend) => backend.reserve(request).await,
            _ => NoReservations.reserve(request).await,
        }
    }

    async fn upload_chunk(&self, id: &CacheId, range: ByteRange, content: Bytes) -> Result<()> {
        match self {
            Self::Larder(backend) => backend.upload_chunk(id, range, content).await,
            _ => NoReservations.upload_chunk(id, range, content).await,
        }
    }

    async fn commit(&self, id: &CacheId, size: u64) -> Result<()> {
        match self {
            Self::Larder(backend) => backend.commit(id, size).await,
            _ => NoReservations.commit(id, size).await,
        }
    }
}
