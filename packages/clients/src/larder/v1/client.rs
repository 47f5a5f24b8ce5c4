//! HTTP client for the Larder v1 API.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use color_eyre::{
    Report, Result, Section, SectionExt,
    eyre::{Context, OptionExt, eyre},
};
use derive_more::{Debug, Display};
use futures::TryStreamExt;
use http::{HeaderMap, header};
use jiff::Timestamp;
use reqwest::{RequestBuilder, Response, StatusCode};
use tap::Pipe;
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{instrument, trace};
use url::Url;

use super::{
    ByteRange, CACHE_VERSION_HEADER, CREATED_AT_HEADER, CacheId, CacheVersion, OBJECT_SIZE_HEADER,
    ObjectKey, ObjectMeta,
    cache::{CommitCacheRequest, ListObjectsQuery, ReserveCacheRequest, ReserveCacheResponse},
};
use crate::{CacheError, ContentType, ErrorKind, NETWORK_BUFFER_SIZE, Token};

/// How long to wait for a connection to the service to be established.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the Larder API.
///
/// The client never retries: failures are returned classified (see
/// [`ErrorKind::of`]) so that the caller's retry policy can decide what to do.
///
/// ## Cloning
///
/// This type is cheaply cloneable, and clones share the underlying HTTP
/// connection pool.
#[derive(Clone, Debug, Display)]
#[display("{base}")]
pub struct Client {
    #[debug("{:?}", base.as_str())]
    base: Arc<Url>,

    #[debug(skip)]
    http: reqwest::Client,

    token: Token,
}

impl Client {
    /// Create a new client with the given base URL and authentication token.
    pub fn new(base: Url, token: Token) -> Result<Self> {
        // Archives are already compressed; transparent decompression would
        // also hide the real `Content-Length` of downloads.
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .no_zstd()
            .build()
            .context("build http client")?;

        Ok(Self {
            base: Arc::new(base),
            http,
            token,
        })
    }

    /// Check that the service is reachable.
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<()> {
        let url = self.base.join("api/v1/health")?;
        let response = self.http.get(url).send().await.map_err(send_error)?;
        match response.status() {
            StatusCode::OK => Ok(()),
            _ => Err(unexpected_status(response).await),
        }
    }

    /// Look up the metadata of an object.
    ///
    /// Returns `None` if the object doesn't exist.
    #[instrument(skip(self))]
    pub async fn object_head(&self, key: &ObjectKey) -> Result<Option<ObjectMeta>> {
        let url = self.object_url(key)?;
        let response = self.send(self.http.head(url)).await?;
        match response.status() {
            StatusCode::OK => object_meta(key, response.headers()).map(Some),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(unexpected_status(response).await),
        }
    }

    /// List the objects whose address starts with `prefix`.
    #[instrument(skip(self))]
    pub async fn object_list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let url = self.base.join("api/v1/objects")?;
        let query = ListObjectsQuery::new(prefix);
        let response = self.send(self.http.get(url).query(&query)).await?;
        match response.status() {
            StatusCode::OK => response
                .json::<Vec<ObjectMeta>>()
                .await
                .map_err(body_error)
                .context("parse JSON response"),
            _ => Err(unexpected_status(response).await),
        }
    }

    /// Stream the content of an object.
    ///
    /// Returns the length declared by the service (if any) along with a
    /// reader over the body, or `None` if the object doesn't exist. The
    /// declared length isn't verified here; readers are expected to count.
    #[instrument(skip(self))]
    pub async fn object_read(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<(Option<u64>, impl AsyncRead + Unpin + Send + 'static)>> {
        let url = self.object_url(key)?;
        let request = self
            .http
            .get(url)
            .header(ContentType::ACCEPT, ContentType::Bytes.value());
        let response = self.send(request).await?;
        match response.status() {
            StatusCode::OK => {
                let length = header_u64(response.headers(), &header::CONTENT_LENGTH)?;
                trace!(?length, "streaming object");
                response
                    .bytes_stream()
                    .map_err(std::io::Error::other)
                    .pipe(StreamReader::new)
                    .pipe(|reader| Some((length, reader)))
                    .pipe(Ok)
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(unexpected_status(response).await),
        }
    }

    /// Read a single range of an object into memory.
    ///
    /// The returned buffer isn't checked against the requested range; callers
    /// compare lengths so that short reads are reported as integrity failures.
    #[instrument(skip(self))]
    pub async fn object_read_range(&self, key: &ObjectKey, range: ByteRange) -> Result<Bytes> {
        let url = self.object_url(key)?;
        let request = self
            .http
            .get(url)
            .header(header::RANGE, range.to_range_header());
        let response = self.send(request).await?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT | StatusCode::OK => {
                response.bytes().await.map_err(body_error).context("read range body")
            }
            _ => Err(unexpected_status(response).await),
        }
    }

    /// Write an object, replacing any existing object at the same address.
    #[instrument(skip(self, content))]
    pub async fn object_write(
        &self,
        key: &ObjectKey,
        version: Option<&CacheVersion>,
        content: impl AsyncRead + Send + 'static,
    ) -> Result<()> {
        let url = self.object_url(key)?;
        let stream = ReaderStream::with_capacity(content, NETWORK_BUFFER_SIZE);
        let mut request = self
            .http
            .put(url)
            .header(ContentType::HEADER, ContentType::Bytes.value())
            .body(reqwest::Body::wrap_stream(stream));
        if let Some(version) = version {
            request = request.header(CACHE_VERSION_HEADER, version.as_str());
        }

        let response = self.send(request).await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(unexpected_status(response).await),
        }
    }

    /// Reserve a cache slot for writing.
    ///
    /// A `409 Conflict` from the service is returned as an error classified
    /// [`ErrorKind::Conflict`].
    #[instrument(skip(self))]
    pub async fn cache_reserve(&self, body: &ReserveCacheRequest) -> Result<ReserveCacheResponse> {
        let url = self.base.join("api/v1/caches")?;
        let response = self.send(self.http.post(url).json(body)).await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => response
                .json::<ReserveCacheResponse>()
                .await
                .map_err(body_error)
                .context("parse JSON response"),
            _ => Err(unexpected_status(response).await),
        }
    }

    /// Upload one chunk of an archive into a reservation.
    #[instrument(skip(self, content), fields(content = content.len()))]
    pub async fn cache_upload_chunk(
        &self,
        id: &CacheId,
        range: ByteRange,
        content: Bytes,
    ) -> Result<()> {
        let url = self.cache_url(id)?;
        let request = self
            .http
            .patch(url)
            .header(ContentType::HEADER, ContentType::Bytes.value())
            .header(header::CONTENT_RANGE, range.to_content_range())
            .body(content);
        let response = self.send(request).await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            _ => Err(unexpected_status(response).await),
        }
    }

    /// Commit a reservation, making the entry visible to lookups.
    #[instrument(skip(self))]
    pub async fn cache_commit(&self, id: &CacheId, body: &CommitCacheRequest) -> Result<()> {
        let url = self.cache_url(id)?;
        let response = self.send(self.http.post(url).json(body)).await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK | StatusCode::CREATED => Ok(()),
            _ => Err(unexpected_status(response).await),
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        request
            .bearer_auth(self.token.expose())
            .send()
            .await
            .map_err(send_error)
    }

    /// Build the URL of an object.
    ///
    /// Each `/`-separated segment of the address is pushed separately so that
    /// it is percent-encoded on its own; the service decodes the path back to
    /// the original address.
    fn object_url(&self, key: &ObjectKey) -> Result<Url> {
        let mut url = self.base.join("api/v1/objects")?;
        url.path_segments_mut()
            .map_err(|()| eyre!("base url cannot be a base: {}", self.base))?
            .pop_if_empty()
            .extend(key.as_str().split('/'));
        Ok(url)
    }

    fn cache_url(&self, id: &CacheId) -> Result<Url> {
        let mut url = self.base.join("api/v1/caches")?;
        url.path_segments_mut()
            .map_err(|()| eyre!("base url cannot be a base: {}", self.base))?
            .pop_if_empty()
            .push(id.as_str());
        Ok(url)
    }
}

/// Parse the object metadata headers of a `HEAD` response.
fn object_meta(key: &ObjectKey, headers: &HeaderMap) -> Result<ObjectMeta> {
    let size = header_u64(headers, &OBJECT_SIZE_HEADER)?.ok_or_eyre("missing object size")?;
    let version = header_str(headers, &CACHE_VERSION_HEADER)?
        .map(CacheVersion::from_hex)
        .transpose()
        .context("parse cache version")?;
    let created_at = header_str(headers, &CREATED_AT_HEADER)?
        .map(|value| value.parse::<Timestamp>())
        .transpose()
        .context("parse creation time")?;

    ObjectMeta::builder()
        .key(key)
        .size(size)
        .maybe_version(version)
        .maybe_created_at(created_at)
        .build()
        .pipe(Ok)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &header::HeaderName) -> Result<Option<&'a str>> {
    headers
        .get(name)
        .map(|value| value.to_str().with_context(|| format!("read header {name}")))
        .transpose()
}

fn header_u64(headers: &HeaderMap, name: &header::HeaderName) -> Result<Option<u64>> {
    header_str(headers, name)?
        .map(|value| {
            value
                .parse::<u64>()
                .with_context(|| format!("parse header {name}"))
        })
        .transpose()
}

/// Classify a failure to send a request or receive its response head.
fn send_error(err: reqwest::Error) -> Report {
    let kind = if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    };
    Report::new(CacheError::new(kind, "send request").with_cause(err))
}

/// Classify a failure while reading a response body.
fn body_error(err: reqwest::Error) -> Report {
    let kind = if err.is_decode() {
        ErrorKind::Permanent
    } else {
        ErrorKind::Transient
    };
    Report::new(CacheError::new(kind, "read response body").with_cause(err))
}

/// Build a classified error for a response with an unexpected status code.
async fn unexpected_status(response: Response) -> Report {
    let status = response.status();
    let url = response.url().to_string();
    let request_id = request_id(&response);
    let body = response.text().await.unwrap_or_default();
    let kind = ErrorKind::from_status(status);
    Report::new(CacheError::new(kind, format!("unexpected status code: {status}")))
        .with_section(|| url.header("Url:"))
        .with_section(|| body.header("Body:"))
        .with_section(|| request_id.header("Request ID:"))
}

/// Extract the request ID from a response header.
fn request_id(response: &Response) -> String {
    response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| String::from("<not set>"))
}
