//! Classification of cache and transport failures.
//!
//! Most code in this workspace reports errors as [`color_eyre::Report`]. When
//! a caller needs to react differently to different failures (retry a 503,
//! skip saving on a conflict, treat a 404 as a miss) the failure is created as
//! a [`CacheError`] and placed at the root of the report; context added on
//! top of it doesn't hide it, since [`ErrorKind::of`] walks the whole chain.

use std::error::Error as StdError;

use color_eyre::Report;
use derive_more::Display;
use http::StatusCode;

/// How a failure should be treated.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum ErrorKind {
    /// The addressed object or reservation does not exist.
    ///
    /// Lookups turn this into a negative result instead of an error.
    #[display("not found")]
    NotFound,

    /// Another writer already holds or committed the cache slot.
    #[display("conflict")]
    Conflict,

    /// Timeouts, 5xx responses, rate limiting and connection resets.
    #[display("transient")]
    Transient,

    /// Authorization failures, malformed requests and other 4xx responses.
    #[display("permanent")]
    Permanent,

    /// Transferred bytes don't match the declared length.
    #[display("integrity")]
    Integrity,
}

impl ErrorKind {
    /// Classify an HTTP status code.
    ///
    /// Only meaningful for non-success codes; success codes classify as
    /// [`ErrorKind::Permanent`] because receiving one where another was
    /// expected means the client and server disagree about the protocol.
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::NOT_FOUND => Self::NotFound,
            StatusCode::CONFLICT => Self::Conflict,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Self::Transient,
            status if status.is_server_error() => Self::Transient,
            _ => Self::Permanent,
        }
    }

    /// Find the classification of a report.
    ///
    /// Reports that don't carry a [`CacheError`] anywhere in their chain are
    /// unknown failures and classify as [`ErrorKind::Permanent`] so that they
    /// are never retried.
    pub fn of(report: &Report) -> Self {
        report
            .chain()
            .find_map(|cause| cause.downcast_ref::<CacheError>())
            .map(|err| err.kind)
            .unwrap_or(Self::Permanent)
    }

    /// Whether an operation failing this way may succeed if attempted again.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// A classified failure.
#[derive(Debug, Display)]
#[display("{message} ({kind})")]
#[non_exhaustive]
pub struct CacheError {
    pub kind: ErrorKind,
    pub message: String,
    cause: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl CacheError {
    /// Create a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the underlying error that caused this one.
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity, message)
    }
}

impl StdError for CacheError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}
