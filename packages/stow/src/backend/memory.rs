//! In-process backend with native reservations.
//!
//! Holds everything in memory; it exists for tests and local experiments,
//! and as the storage behind test doubles of the Larder service.

use std::{
    collections::{BTreeMap, HashMap},
    io::Cursor,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::{Bytes, BytesMut};
use clients::{
    CacheError,
    larder::v1::{
        ByteRange, CacheId, CacheVersion, ObjectKey, ObjectMeta, cache::ReserveCacheRequest,
    },
};
use color_eyre::{Report, Result, eyre::Context};
use derive_more::Debug;
use jiff::Timestamp;
use tap::Pipe;
use tracing::{debug, instrument};

use super::{ObjectBody, ObjectStore, ReservationService};

/// In-memory object store and reservation service.
///
/// Enforces the single-writer rule: a reservation for an address and version
/// conflicts with any open or committed reservation for the same pair. On
/// commit, uploaded chunks are assembled in offset order; gaps, overlaps, and
/// size mismatches reject the commit.
///
/// ## Cloning
///
/// Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    #[debug(skip)]
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, StoredObject>,
    reservations: HashMap<CacheId, PendingReservation>,
    next_id: u64,
}

struct StoredObject {
    content: Bytes,
    version: Option<CacheVersion>,
    created_at: Timestamp,
}

impl StoredObject {
    fn meta(&self, key: &ObjectKey) -> ObjectMeta {
        ObjectMeta::builder()
            .key(key)
            .size(self.content.len() as u64)
            .maybe_version(self.version.clone())
            .created_at(self.created_at)
            .build()
    }
}

struct PendingReservation {
    request: ReserveCacheRequest,
    chunks: BTreeMap<u64, Bytes>,
    committed: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock can't leave the maps half-updated in
        // a way that matters for a test double, so poisoning is ignored.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store an object directly, bypassing reservations.
    pub fn insert(
        &self,
        key: impl Into<ObjectKey>,
        version: Option<CacheVersion>,
        content: impl Into<Bytes>,
    ) {
        let object = StoredObject {
            content: content.into(),
            version,
            created_at: Timestamp::now(),
        };
        self.state().objects.insert(key.into(), object);
    }

    /// The content of an object, if it exists.
    pub fn content(&self, key: &ObjectKey) -> Option<Bytes> {
        self.state()
            .objects
            .get(key)
            .map(|object| object.content.clone())
    }

    /// The number of reservations that are open (not yet committed).
    pub fn open_reservations(&self) -> usize {
        self.state()
            .reservations
            .values()
            .filter(|reservation| !reservation.committed)
            .count()
    }

    /// Write `content` as an object.
    pub fn put(&self, key: &ObjectKey, version: Option<&CacheVersion>, content: Bytes) {
        self.insert(key, version.cloned(), content);
    }

    fn not_found(key: &ObjectKey) -> Report {
        Report::new(CacheError::not_found(format!("object {key} does not exist")))
    }
}

impl ObjectStore for MemoryBackend {
    #[instrument(name = "MemoryBackend::head")]
    async fn head(&self, key: &ObjectKey) -> Result<Option<ObjectMeta>> {
        Ok(self.state().objects.get(key).map(|object| object.meta(key)))
    }

    #[instrument(name = "MemoryBackend::list")]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.state()
            .objects
            .iter()
            .filter(|(key, _)| key.as_str().starts_with(prefix))
            .map(|(key, object)| object.meta(key))
            .collect::<Vec<_>>()
            .pipe(Ok)
    }

    #[instrument(name = "MemoryBackend::open_read")]
    async fn open_read(&self, key: &ObjectKey) -> Result<Option<ObjectBody>> {
        Ok(self.content(key).map(|content| {
            let length = content.len() as u64;
            ObjectBody::new(Some(length), Cursor::new(content))
        }))
    }

    #[instrument(name = "MemoryBackend::read_range")]
    async fn read_range(&self, key: &ObjectKey, range: ByteRange) -> Result<Bytes> {
        let content = self.content(key).ok_or_else(|| Self::not_found(key))?;
        let len = content.len() as u64;
        if range.start() >= len {
            return Ok(Bytes::new());
        }
        let end = range.end().min(len - 1);
        Ok(content.slice(range.start() as usize..=end as usize))
    }

    #[instrument(name = "MemoryBackend::get_to_file")]
    async fn get_to_file(&self, key: &ObjectKey, destination: &Path) -> Result<u64> {
        let content = self.content(key).ok_or_else(|| Self::not_found(key))?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create directory {parent:?}"))?;
        }
        tokio::fs::write(destination, &content)
            .await
            .with_context(|| format!("write file {destination:?}"))?;
        Ok(content.len() as u64)
    }

    #[instrument(name = "MemoryBackend::put_from_file")]
    async fn put_from_file(
        &self,
        key: &ObjectKey,
        version: Option<&CacheVersion>,
        source: &Path,
    ) -> Result<()> {
        let content = tokio::fs::read(source)
            .await
            .with_context(|| format!("read file {source:?}"))?;
        self.put(key, version, Bytes::from(content));
        Ok(())
    }
}

impl ReservationService for MemoryBackend {
    #[instrument(name = "MemoryBackend::reserve")]
    async fn reserve(&self, request: &ReserveCacheRequest) -> Result<CacheId> {
        let mut state = self.state();
        let taken = state.reservations.values().any(|existing| {
            existing.request.object_key == request.object_key
                && existing.request.version == request.version
        });
        if taken {
            return Err(Report::new(CacheError::conflict(format!(
                "cache slot {} is already reserved for version {}",
                request.object_key, request.version
            ))));
        }

        state.next_id += 1;
        let id = CacheId::new(state.next_id.to_string());
        state.reservations.insert(
            id.clone(),
            PendingReservation {
                request: request.clone(),
                chunks: BTreeMap::new(),
                committed: false,
            },
        );
        debug!(%id, "reserved");
        Ok(id)
    }

    #[instrument(name = "MemoryBackend::upload_chunk", skip(content))]
    async fn upload_chunk(&self, id: &CacheId, range: ByteRange, content: Bytes) -> Result<()> {
        if content.len() as u64 != range.len() {
            return Err(Report::new(CacheError::permanent(format!(
                "chunk {range} declares {} bytes but carries {}",
                range.len(),
                content.len()
            ))));
        }

        let mut state = self.state();
        let reservation = state
            .reservations
            .get_mut(id)
            .ok_or_else(|| Report::new(CacheError::not_found(format!("no reservation {id}"))))?;
        if reservation.committed {
            return Err(Report::new(CacheError::conflict(format!(
                "reservation {id} is already committed"
            ))));
        }
        reservation.chunks.insert(range.start(), content);
        Ok(())
    }

    #[instrument(name = "MemoryBackend::commit")]
    async fn commit(&self, id: &CacheId, size: u64) -> Result<()> {
        let mut state = self.state();
        let reservation = state
            .reservations
            .get_mut(id)
            .ok_or_else(|| Report::new(CacheError::not_found(format!("no reservation {id}"))))?;
        if reservation.committed {
            return Err(Report::new(CacheError::conflict(format!(
                "reservation {id} is already committed"
            ))));
        }
        if let Some(declared) = reservation.request.cache_size.filter(|declared| *declared != size) {
            return Err(Report::new(CacheError::permanent(format!(
                "reservation {id} declared {declared} bytes but commit reports {size}"
            ))));
        }

        let mut content = BytesMut::with_capacity(size as usize);
        for (offset, chunk) in &reservation.chunks {
            if *offset != content.len() as u64 {
                return Err(Report::new(CacheError::permanent(format!(
                    "reservation {id} has a gap or overlap at offset {offset}"
                ))));
            }
            content.extend_from_slice(chunk);
        }
        if content.len() as u64 != size {
            return Err(Report::new(CacheError::permanent(format!(
                "reservation {id} holds {} bytes but commit reports {size}",
                content.len()
            ))));
        }

        reservation.committed = true;
        let key = reservation.request.object_key.clone();
        let object = StoredObject {
            content: content.freeze(),
            version: Some(reservation.request.version.clone()),
            created_at: Timestamp::now(),
        };
        reservation.chunks.clear();
        state.objects.insert(key, object);
        debug!(%id, size, "committed");
        Ok(())
    }
}
