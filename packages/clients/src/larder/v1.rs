//! Larder v1 API types and client.

use std::str::FromStr;

use bon::Builder;
use color_eyre::{
    Result,
    eyre::{Context, OptionExt, bail},
};
use derive_more::{AsRef, Debug, Display};
use http::HeaderName;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tap::Pipe;
use tracing::{instrument, trace};

pub mod cache;

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::Client;

/// Header carrying the cache version recorded for an object.
pub const CACHE_VERSION_HEADER: HeaderName = HeaderName::from_static("x-cache-version");

/// Header carrying the creation time (RFC 3339) of an object.
pub const CREATED_AT_HEADER: HeaderName = HeaderName::from_static("x-created-at");

/// Header carrying the size in bytes of an object on `HEAD` responses.
///
/// `Content-Length` isn't reliable on `HEAD` responses across HTTP stacks, so
/// the service reports the stored size explicitly.
pub const OBJECT_SIZE_HEADER: HeaderName = HeaderName::from_static("x-object-size");

/// The fingerprint of everything that affects archive compatibility.
///
/// Always a lowercase hex-encoded SHA-256 digest.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, AsRef, Serialize, Deserialize,
)]
#[display("{_0}")]
#[debug("{_0}")]
#[serde(try_from = "String", into = "String")]
pub struct CacheVersion(#[as_ref(str)] String);

impl CacheVersion {
    /// Create a version from a raw SHA-256 digest.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(hex::encode(digest))
    }

    /// Parse a version from its hex representation.
    #[instrument(fields(hex = hex.as_ref()))]
    pub fn from_hex(hex: impl AsRef<str>) -> Result<Self> {
        let hex = hex.as_ref();
        let bytes = hex::decode(hex).context("decode hex")?;
        trace!(len = bytes.len(), "decoded hex");
        if bytes.len() != 32 {
            bail!("invalid cache version length: expected 32 bytes, got {}", bytes.len());
        }
        hex.to_ascii_lowercase().pipe(Self).pipe(Ok)
    }

    /// View the version as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CacheVersion {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for CacheVersion {
    type Error = color_eyre::Report;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(value)
    }
}

impl From<CacheVersion> for String {
    fn from(version: CacheVersion) -> Self {
        version.0
    }
}

impl From<&CacheVersion> for CacheVersion {
    fn from(version: &CacheVersion) -> Self {
        version.clone()
    }
}

/// Identifies a reservation on the cache service.
///
/// Opaque: the service may hand out numeric or textual identifiers, and
/// locally synthesized reservations use UUIDs.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0}")]
#[debug("{_0}")]
#[serde(transparent)]
pub struct CacheId(String);

impl CacheId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The full address of an object in the cache namespace.
///
/// Addresses are `/`-separated and treated as opaque: the only escaping
/// applied is whatever the transport requires (e.g. percent-encoding each
/// URL path segment).
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, AsRef, Serialize, Deserialize,
)]
#[display("{_0}")]
#[debug("{_0}")]
#[serde(transparent)]
pub struct ObjectKey(#[as_ref(str)] String);

impl ObjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The final `/`-separated segment of the address.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl From<&ObjectKey> for ObjectKey {
    fn from(key: &ObjectKey) -> Self {
        key.clone()
    }
}

/// What a backend knows about a stored object.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct ObjectMeta {
    /// The address of the object.
    #[builder(into)]
    pub key: ObjectKey,

    /// The size of the object in bytes.
    pub size: u64,

    /// The cache version recorded when the object was written, if the backend
    /// records one.
    #[builder(into)]
    pub version: Option<CacheVersion>,

    /// When the object was written, if the backend records it.
    pub created_at: Option<Timestamp>,
}

/// An inclusive byte range, as used by `Range` and `Content-Range` headers.
///
/// `end` never precedes `start`, so a range covers at least one byte.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("{start}-{end}")]
pub struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    /// Create a new range; `end` is inclusive and must not precede `start`.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if end < start {
            bail!("invalid byte range: end {end} precedes start {start}");
        }
        Ok(Self { start, end })
    }

    /// The range of bytes from `start` up to but excluding `end`.
    ///
    /// Returns `None` if the span is empty.
    pub fn spanning(start: u64, end: u64) -> Option<Self> {
        (end > start).then(|| Self { start, end: end - 1 })
    }

    /// The offset of the first byte.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The offset of the last byte (inclusive).
    pub fn end(&self) -> u64 {
        self.end
    }

    /// The number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Ranges always cover at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Render the range for a `Content-Range` header on an upload.
    ///
    /// The total size isn't known when chunks are sent, so it is always `*`:
    /// `bytes {start}-{end}/*`.
    pub fn to_content_range(&self) -> String {
        format!("bytes {}-{}/*", self.start, self.end)
    }

    /// Render the range for a `Range` header on a read: `bytes={start}-{end}`.
    pub fn to_range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// Parse a `Content-Range` header value.
    ///
    /// Accepts both an unknown total (`*`) and a concrete one.
    pub fn parse_content_range(value: &str) -> Result<Self> {
        let rest = value
            .trim()
            .strip_prefix("bytes ")
            .ok_or_eyre("content range must use the bytes unit")?;
        let (range, _total) = rest
            .split_once('/')
            .ok_or_eyre("content range must include a total")?;
        Self::parse_pair(range)
    }

    /// Parse a `Range` header value holding a single closed range.
    pub fn parse_range_header(value: &str) -> Result<Self> {
        let range = value
            .trim()
            .strip_prefix("bytes=")
            .ok_or_eyre("range must use the bytes unit")?;
        if range.contains(',') {
            bail!("multiple ranges are not supported");
        }
        Self::parse_pair(range)
    }

    fn parse_pair(range: &str) -> Result<Self> {
        let (start, end) = range
            .split_once('-')
            .ok_or_eyre("range must be of the form start-end")?;
        let start = start.parse::<u64>().context("parse range start")?;
        let end = end.parse::<u64>().context("parse range end")?;
        Self::new(start, end)
    }
}
