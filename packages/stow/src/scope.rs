//! Cache scopes and the namespace addressing built on them.
//!
//! Every cache line lives under
//! `caches/{repository}/{git_ref}/{workflow_hash}/{cache_key}`. The scope
//! parts are opaque identifiers supplied by the environment; they're not
//! escaped beyond what a transport requires. Two scopes that differ in any
//! part never share an address, even for identical cache keys and versions.

use bon::Builder;
use clients::{CacheError, larder::v1::ObjectKey};
use color_eyre::{Report, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// The root of the cache namespace.
pub const NAMESPACE: &str = "caches";

/// The longest cache key accepted.
pub const MAX_KEY_LENGTH: usize = 512;

/// The most keys (primary plus restore keys) accepted by a single lookup.
pub const MAX_KEYS: usize = 10;

/// The (repository, ref, workflow) tuple isolating one pipeline's caches.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Serialize, Deserialize, Builder)]
#[display("{repository}/{git_ref}/{workflow_hash}")]
#[non_exhaustive]
pub struct Scope {
    /// The repository identity, e.g. `acme/widgets`.
    #[builder(into)]
    pub repository: String,

    /// The branch or tag, e.g. `refs/heads/main`.
    #[builder(into)]
    pub git_ref: String,

    /// A digest identifying the workflow the run belongs to.
    #[builder(into)]
    pub workflow_hash: String,
}

impl Scope {
    /// The address of `cache_key` within this scope.
    pub fn object_key(&self, cache_key: &str) -> ObjectKey {
        ObjectKey::new(format!("{}{cache_key}", self.key_prefix()))
    }

    /// The address prefix shared by every entry of this scope.
    pub fn key_prefix(&self) -> String {
        format!(
            "{NAMESPACE}/{}/{}/{}/",
            self.repository, self.git_ref, self.workflow_hash
        )
    }

    /// The cache key of an address inside this scope.
    pub fn cache_key_of<'a>(&self, key: &'a ObjectKey) -> Option<&'a str> {
        key.as_str().strip_prefix(&self.key_prefix())
    }

    /// The address prefix shared by every scope of this repository.
    pub fn repository_prefix(&self) -> String {
        format!("{NAMESPACE}/{}/", self.repository)
    }

    /// Ensure no part of the scope is empty.
    ///
    /// An empty part would collapse two levels of the namespace into one
    /// and let unrelated scopes share addresses.
    pub fn validate(&self) -> Result<()> {
        let parts = [
            ("repository", &self.repository),
            ("git ref", &self.git_ref),
            ("workflow hash", &self.workflow_hash),
        ];
        for (name, value) in parts {
            if value.is_empty() {
                return Err(invalid(format!("scope {name} cannot be empty")));
            }
        }
        Ok(())
    }
}

/// Ensure a cache key can be used in an address.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(invalid("cache key cannot be empty"));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(invalid(format!(
            "cache key is {} characters; the limit is {MAX_KEY_LENGTH}",
            key.len()
        )));
    }
    if key.contains(',') {
        return Err(invalid(format!("cache key cannot contain commas: {key:?}")));
    }
    Ok(())
}

/// Ensure a list of lookup keys is usable.
pub fn validate_keys(keys: &[impl AsRef<str>]) -> Result<()> {
    if keys.is_empty() {
        return Err(invalid("at least one cache key is required"));
    }
    if keys.len() > MAX_KEYS {
        return Err(invalid(format!(
            "{} cache keys were given; the limit is {MAX_KEYS}",
            keys.len()
        )));
    }
    keys.iter().try_for_each(|key| validate_key(key.as_ref()))
}

fn invalid(message: impl Into<String>) -> Report {
    Report::new(CacheError::permanent(message))
}
