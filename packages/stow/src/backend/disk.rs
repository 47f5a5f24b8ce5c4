//! Object store on a local or shared filesystem.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use clients::{
    CacheError,
    larder::v1::{ByteRange, CacheVersion, ObjectKey, ObjectMeta},
};
use color_eyre::{Report, Result, eyre::Context};
use derive_more::{Debug, Display};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{
    fs::{File, create_dir_all, remove_file, rename},
    io::BufReader,
};
use tracing::{instrument, trace, warn};
use uuid::Uuid;

use super::{ObjectBody, ObjectStore};
use crate::fs;

/// Implements the object store interface on disk.
///
/// ## File structure
///
/// Object addresses contain arbitrary characters (including `/` and `..`), so
/// they aren't used as paths directly. Each address maps to a `.meta` JSON
/// sidecar named for the hex encoded SHA-256 digest of the address, prefixed
/// with one level of folders computed from the first two characters of that
/// digest. The sidecar records the address, cache version, creation time, and
/// the name of the generation file holding the archive:
///
/// ```not_rust
/// caches/r/main/h/key -> root/3f/3fa9....meta
///                        root/3f/3fa9....<generation>
/// ```
///
/// Listing walks the sidecars.
///
/// ## Atomic writes
///
/// Every write copies its archive into a fresh generation file, then renames
/// a new sidecar into place. The sidecar rename is the only step visible to
/// readers, so a version is always paired with the archive written alongside
/// it. Concurrent writers of the same address race; the last rename wins and
/// the replaced generation is removed.
///
/// ## Reservations
///
/// There is no reservation service; use the store in storage-direct mode.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display)]
#[debug("DiskStore(root = {})", self.root.display())]
#[display("{}", root.display())]
pub struct DiskStore {
    root: PathBuf,
}

/// The content of a `.meta` sidecar.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Sidecar {
    key: ObjectKey,
    version: Option<CacheVersion>,
    created_at: Timestamp,
    generation: String,
}

impl Sidecar {
    /// The generation file this sidecar points at.
    fn object_path(&self, sidecar_path: &Path) -> PathBuf {
        sidecar_path.with_file_name(&self.generation)
    }
}

impl DiskStore {
    const META_EXTENSION: &str = "meta";

    /// Create a new instance in the provided directory.
    ///
    /// If the directory does not already exist, it is created when the first
    /// object is written.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the path to the sidecar for the given address.
    fn sidecar_path(&self, key: &ObjectKey) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_str().as_bytes()));
        self.root
            .join(&digest[..2])
            .join(digest)
            .with_extension(Self::META_EXTENSION)
    }

    #[instrument(name = "DiskStore::read_sidecar")]
    async fn read_sidecar(path: &Path) -> Result<Option<Sidecar>> {
        match tokio::fs::read(path).await {
            Ok(content) => serde_json::from_slice(&content)
                .with_context(|| format!("parse sidecar {path:?}"))
                .map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("read sidecar {path:?}")),
        }
    }

    /// Find the generation file and metadata for an address.
    async fn locate(&self, key: &ObjectKey) -> Result<Option<(PathBuf, ObjectMeta)>> {
        let sidecar_path = self.sidecar_path(key);
        match Self::read_sidecar(&sidecar_path).await? {
            Some(sidecar) => Self::meta(&sidecar_path, sidecar).await,
            None => Ok(None),
        }
    }

    /// Build the metadata of the object described by the sidecar at `path`.
    ///
    /// Returns `None` if the generation file is missing.
    async fn meta(path: &Path, sidecar: Sidecar) -> Result<Option<(PathBuf, ObjectMeta)>> {
        let object = sidecar.object_path(path);
        let size = match tokio::fs::metadata(&object).await {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context(format!("stat object {object:?}")),
        };
        let meta = ObjectMeta::builder()
            .key(sidecar.key)
            .size(size)
            .maybe_version(sidecar.version)
            .created_at(sidecar.created_at)
            .build();
        Ok(Some((object, meta)))
    }

    /// Write `content` to `path` through a temporary file.
    async fn write_atomic(path: &Path, content: impl AsRef<[u8]>) -> Result<()> {
        let temp = temp_path(path);
        tokio::fs::write(&temp, content)
            .await
            .with_context(|| format!("write temporary file {temp:?}"))?;
        if let Err(err) = rename(&temp, path).await {
            remove_quietly(&temp).await;
            return Err(err).context(format!("rename {temp:?} to {path:?}"));
        }
        Ok(())
    }
}

impl ObjectStore for DiskStore {
    #[instrument(name = "DiskStore::head")]
    async fn head(&self, key: &ObjectKey) -> Result<Option<ObjectMeta>> {
        Ok(self.locate(key).await?.map(|(_, meta)| meta))
    }

    #[instrument(name = "DiskStore::list")]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut shards = match tokio::fs::read_dir(&self.root).await {
            Ok(shards) => shards,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).context(format!("read directory {:?}", self.root)),
        };

        let mut objects = Vec::new();
        while let Some(shard) = shards.next_entry().await.context("read shard entry")? {
            if !shard.file_type().await.context("stat shard")?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(shard.path())
                .await
                .with_context(|| format!("read directory {:?}", shard.path()))?;
            while let Some(entry) = entries.next_entry().await.context("read entry")? {
                let path = entry.path();
                if path.extension().is_none_or(|ext| ext != Self::META_EXTENSION) {
                    continue;
                }
                let Some(sidecar) = Self::read_sidecar(&path).await? else {
                    continue;
                };
                if !sidecar.key.as_str().starts_with(prefix) {
                    continue;
                }
                if let Some((_, meta)) = Self::meta(&path, sidecar).await? {
                    objects.push(meta);
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        trace!(count = objects.len(), "listed objects");
        Ok(objects)
    }

    #[instrument(name = "DiskStore::open_read")]
    async fn open_read(&self, key: &ObjectKey) -> Result<Option<ObjectBody>> {
        let Some((path, meta)) = self.locate(key).await? else {
            return Ok(None);
        };
        match File::open(&path).await {
            Ok(file) => Ok(Some(ObjectBody::new(Some(meta.size), BufReader::new(file)))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("open object {path:?}")),
        }
    }

    #[instrument(name = "DiskStore::read_range")]
    async fn read_range(&self, key: &ObjectKey, range: ByteRange) -> Result<Bytes> {
        let Some((path, meta)) = self.locate(key).await? else {
            return Err(not_found(key));
        };
        if range.start() >= meta.size {
            return Ok(Bytes::new());
        }
        let end = range.end().min(meta.size - 1);
        let len = usize::try_from(end - range.start() + 1).context("range length")?;
        let file = fs::open_shared(&path).await?;
        fs::read_at(file, range.start(), len).await
    }

    #[instrument(name = "DiskStore::get_to_file")]
    async fn get_to_file(&self, key: &ObjectKey, destination: &Path) -> Result<u64> {
        let Some((path, _)) = self.locate(key).await? else {
            return Err(not_found(key));
        };
        if let Some(parent) = destination.parent() {
            create_dir_all(parent)
                .await
                .with_context(|| format!("create directory {parent:?}"))?;
        }
        tokio::fs::copy(&path, destination)
            .await
            .with_context(|| format!("copy object to {destination:?}"))
    }

    #[instrument(name = "DiskStore::put_from_file")]
    async fn put_from_file(
        &self,
        key: &ObjectKey,
        version: Option<&CacheVersion>,
        source: &Path,
    ) -> Result<()> {
        let sidecar_path = self.sidecar_path(key);
        if let Some(parent) = sidecar_path.parent() {
            create_dir_all(parent).await.with_context(|| {
                format!("create parent directory {parent:?} for {sidecar_path:?}")
            })?;
        }

        let sidecar = Sidecar {
            key: key.clone(),
            version: version.cloned(),
            created_at: Timestamp::now(),
            generation: generation_name(&sidecar_path),
        };
        let object = sidecar.object_path(&sidecar_path);
        let size = match tokio::fs::copy(source, &object).await {
            Ok(size) => size,
            Err(err) => {
                remove_quietly(&object).await;
                return Err(err).context(format!("copy {source:?} to {object:?}"));
            }
        };

        let replaced = Self::read_sidecar(&sidecar_path).await.ok().flatten();
        let content = serde_json::to_vec(&sidecar).context("encode sidecar")?;
        if let Err(err) = Self::write_atomic(&sidecar_path, content).await {
            remove_quietly(&object).await;
            return Err(err);
        }
        if let Some(replaced) = replaced.filter(|old| old.generation != sidecar.generation) {
            remove_quietly(&replaced.object_path(&sidecar_path)).await;
        }

        trace!(?object, size, "stored object");
        Ok(())
    }
}

fn not_found(key: &ObjectKey) -> Report {
    Report::new(CacheError::not_found(format!("object {key} does not exist")))
}

/// A unique generation file name next to the sidecar at `sidecar_path`.
fn generation_name(sidecar_path: &Path) -> String {
    let mut name = sidecar_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(&Uuid::new_v4().simple().to_string());
    name
}

async fn remove_quietly(path: &Path) {
    match remove_file(path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
            warn!("failed to remove {path:?}: {err}");
        }
        _ => {}
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(Uuid::new_v4().to_string());
    PathBuf::from(temp)
}
