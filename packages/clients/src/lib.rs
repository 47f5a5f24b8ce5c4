//! Shared client library for the artifact cache service.
//!
//! This library provides the wire types for the Larder cache service, the
//! classification used for transport failures, and (behind the `client`
//! feature) the HTTP client for the service. Types are always available so
//! that servers and test doubles can share them without pulling in `reqwest`.
//!
//! ## Use of `#[non_exhaustive]`
//!
//! We use `#[non_exhaustive]` on structs and enums to prevent users manually
//! constructing the types while still allowing their fields to be `pub` for
//! reading. Users must generally construct the types either by:
//! - Using constructors on the types
//! - Using builder methods
//! - Using deserialization
//!
//! Some types in this library carry invariants (for example a cache version
//! is always a SHA-256 hex digest), and it's easier to uphold them in one
//! place than piecemeal at every call site.

use std::{fmt, str::FromStr};

use color_eyre::eyre::bail;
use derive_more::Display;
use enum_assoc::Assoc;
use http::header::{self, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tap::Pipe;

mod error;
pub mod larder;

pub use error::{CacheError, ErrorKind};

/// A bearer token for the cache service.
///
/// The wrapped string is never printed by `Debug` or `Display`; call
/// [`Token::expose`] to get at the raw value when building a request.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    /// Expose the raw token value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl FromStr for Token {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("token cannot be empty");
        }
        String::from(s).pipe(Self).pipe(Ok)
    }
}

impl<S: Into<String>> From<S> for Token {
    fn from(s: S) -> Self {
        Self(s.into())
    }
}

/// The buffer size used when streaming archives over the network.
///
/// Archives are typically tens of megabytes to several gigabytes, so a large
/// buffer keeps the number of syscalls and body frames down.
pub const NETWORK_BUFFER_SIZE: usize = 1024 * 1024;

/// The latest Larder client version.
#[cfg(feature = "client")]
pub type Larder = larder::v1::Client;

/// Larder v1 client.
#[cfg(feature = "client")]
pub type LarderV1 = larder::v1::Client;

/// Content types used by the library.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Assoc)]
#[func(pub const fn value(&self) -> HeaderValue)]
#[func(pub const fn to_str(&self) -> &'static str)]
#[display("{}", self.to_str())]
pub enum ContentType {
    #[assoc(to_str = "application/octet-stream")]
    #[assoc(value = HeaderValue::from_static(self.to_str()))]
    Bytes,

    #[assoc(to_str = "application/json")]
    #[assoc(value = HeaderValue::from_static(self.to_str()))]
    Json,
}

impl ContentType {
    pub const HEADER: HeaderName = header::CONTENT_TYPE;
    pub const ACCEPT: HeaderName = header::ACCEPT;
}

impl PartialEq<ContentType> for HeaderValue {
    fn eq(&self, other: &ContentType) -> bool {
        self == other.value()
    }
}

impl PartialEq<HeaderValue> for ContentType {
    fn eq(&self, other: &HeaderValue) -> bool {
        self.value() == other
    }
}
