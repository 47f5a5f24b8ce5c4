//! Resolve lookup keys to an existing cache entry.

use std::{cmp::Reverse, sync::Arc};

use clients::larder::v1::{CacheVersion, ObjectKey, ObjectMeta};
use color_eyre::{Result, eyre::Context};
use derive_more::Debug;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    backend::ObjectStore,
    config::CacheContext,
    scope::{Scope, validate_keys},
    version::compute_version,
};

/// An existing cache entry matching a lookup.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ArtifactCacheEntry {
    /// The key the entry was found under.
    ///
    /// For a prefix match this is the full key of the entry, which starts
    /// with the restore key that matched it.
    pub cache_key: String,

    pub scope: Scope,

    /// The version the lookup was made for.
    pub cache_version: CacheVersion,

    /// When the entry was written, if the backend records it.
    pub creation_time: Option<Timestamp>,

    /// The address to download the entry from.
    pub object_key: ObjectKey,

    /// The size of the archive, if the backend reported it.
    pub archive_size: Option<u64>,
}

/// The outcome of a lookup that found nothing.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CacheMiss {
    /// The version the lookup was made for.
    pub cache_version: CacheVersion,

    /// Every key that was tried, in order.
    pub attempted_keys: Vec<String>,

    /// Entries sharing the primary key in other scopes or with other
    /// versions; only collected when lookup diagnostics are enabled.
    pub near_misses: Vec<ObjectMeta>,
}

/// The outcome of a lookup.
///
/// Failures to look up are the `Err` side of the surrounding `Result`; a
/// miss is never an error.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Resolution {
    Found(ArtifactCacheEntry),
    Miss(CacheMiss),
}

impl Resolution {
    /// The version the lookup was made for.
    pub fn cache_version(&self) -> &CacheVersion {
        match self {
            Self::Found(entry) => &entry.cache_version,
            Self::Miss(miss) => &miss.cache_version,
        }
    }

    pub fn entry(&self) -> Option<&ArtifactCacheEntry> {
        match self {
            Self::Found(entry) => Some(entry),
            Self::Miss(_) => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Finds the best existing entry for an ordered list of keys.
///
/// The first key is the primary key and only matches exactly. Later keys are
/// restore keys: they match exactly, or failing that, as a prefix of the
/// newest compatible entry in the scope. The first hit wins and no later key
/// is queried.
///
/// Lookups are never retried: a failure to query the backend is surfaced as
/// is, since treating it as a miss would make the hit rate lie.
#[derive(Clone, Debug)]
pub struct KeyResolver<S> {
    #[debug(skip)]
    store: S,
    context: Arc<CacheContext>,
}

impl<S: ObjectStore> KeyResolver<S> {
    pub fn new(store: S, context: Arc<CacheContext>) -> Self {
        Self { store, context }
    }

    /// Resolve `keys` for an archive of `paths`.
    #[instrument(name = "KeyResolver::resolve", skip_all, fields(scope = %self.context.scope))]
    pub async fn resolve(
        &self,
        keys: &[impl AsRef<str>],
        paths: &[impl AsRef<str>],
    ) -> Result<Resolution> {
        validate_keys(keys)?;
        let options = &self.context.options;
        let version = compute_version(paths, options.compression, options.cross_os_archive);

        let mut attempted_keys = Vec::with_capacity(keys.len());
        for (position, key) in keys.iter().map(AsRef::as_ref).enumerate() {
            attempted_keys.push(key.to_string());

            let mut entry = self.probe_exact(key, &version).await?;
            if entry.is_none() && position > 0 {
                entry = self.probe_prefix(key, &version).await?;
            }
            if let Some(entry) = entry {
                info!(
                    key = %entry.cache_key,
                    object_key = %entry.object_key,
                    %version,
                    restore_key = position > 0,
                    "cache hit"
                );
                return Ok(Resolution::Found(entry));
            }
        }

        info!(?attempted_keys, %version, "cache miss");
        let near_misses = if options.lookup_diagnostics {
            self.near_misses(keys[0].as_ref(), &version).await
        } else {
            Vec::new()
        };
        Ok(Resolution::Miss(CacheMiss {
            cache_version: version,
            attempted_keys,
            near_misses,
        }))
    }

    /// Look for an entry stored exactly under `key`.
    async fn probe_exact(
        &self,
        key: &str,
        version: &CacheVersion,
    ) -> Result<Option<ArtifactCacheEntry>> {
        let object_key = self.context.scope.object_key(key);
        let Some(meta) = self
            .store
            .head(&object_key)
            .await
            .with_context(|| format!("look up {object_key}"))?
        else {
            debug!(%object_key, "not found");
            return Ok(None);
        };

        if let Some(recorded) = meta.version.as_ref().filter(|recorded| *recorded != version) {
            info!(%object_key, %recorded, expected = %version, "version mismatch");
            return Ok(None);
        }
        Ok(Some(self.entry(key, version, meta)))
    }

    /// Look for the newest compatible entry whose key starts with `key`.
    async fn probe_prefix(
        &self,
        key: &str,
        version: &CacheVersion,
    ) -> Result<Option<ArtifactCacheEntry>> {
        let exact = self.context.scope.object_key(key);
        let mut candidates = self
            .store
            .list(exact.as_str())
            .await
            .with_context(|| format!("list entries with prefix {exact}"))?
            .into_iter()
            .filter(|meta| meta.key != exact)
            .collect::<Vec<_>>();
        candidates.sort_by_key(|meta| Reverse(meta.created_at));
        debug!(prefix = %exact, candidates = candidates.len(), "prefix lookup");

        for candidate in candidates {
            let recorded = match candidate.version.clone() {
                Some(recorded) => Some(recorded),
                None => match self.store.head(&candidate.key).await? {
                    Some(meta) => meta.version,
                    None => continue,
                },
            };
            if recorded.as_ref().is_some_and(|recorded| recorded != version) {
                debug!(object_key = %candidate.key, "prefix candidate has another version");
                continue;
            }

            let cache_key = self
                .context
                .scope
                .cache_key_of(&candidate.key)
                .unwrap_or(key)
                .to_string();
            return Ok(Some(self.entry(&cache_key, version, candidate)));
        }
        Ok(None)
    }

    /// Find entries that share the primary key but not the scope or version.
    ///
    /// Best effort: a failure to list is logged and reported as no near
    /// misses.
    async fn near_misses(&self, primary: &str, version: &CacheVersion) -> Vec<ObjectMeta> {
        let scope = &self.context.scope;
        let prefix = scope.repository_prefix();
        let listed = match self.store.list(&prefix).await {
            Ok(listed) => listed,
            Err(error) => {
                warn!(?error, %prefix, "unable to list caches for diagnostics");
                return Vec::new();
            }
        };

        let exact = scope.object_key(primary);
        let suffix = format!("/{primary}");
        let near_misses = listed
            .into_iter()
            .filter(|meta| meta.key.as_str().ends_with(&suffix))
            .filter(|meta| {
                meta.key != exact || meta.version.as_ref().is_some_and(|recorded| recorded != version)
            })
            .collect::<Vec<_>>();
        for meta in &near_misses {
            info!(
                object_key = %meta.key,
                version = ?meta.version,
                created_at = ?meta.created_at,
                "near miss"
            );
        }
        near_misses
    }

    fn entry(&self, key: &str, version: &CacheVersion, meta: ObjectMeta) -> ArtifactCacheEntry {
        ArtifactCacheEntry {
            cache_key: key.to_string(),
            scope: self.context.scope.clone(),
            cache_version: version.clone(),
            creation_time: meta.created_at,
            object_key: meta.key,
            archive_size: Some(meta.size),
        }
    }
}
