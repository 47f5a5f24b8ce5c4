//! Object store on S3 or an S3-compatible service.

use std::{error::Error as StdError, path::Path};

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    error::SdkError,
    primitives::{ByteStream, DateTime},
};
use bytes::Bytes;
use clients::{
    CacheError, ErrorKind,
    larder::v1::{ByteRange, CacheVersion, ObjectKey, ObjectMeta},
};
use color_eyre::{Report, Result, eyre::Context};
use derive_more::{Debug, Display};
use jiff::Timestamp;
use tracing::{instrument, trace, warn};

use super::{ObjectBody, ObjectStore};
use crate::fs;

/// The user metadata entry holding the cache version of an object.
const VERSION_METADATA: &str = "cache-version";

/// Object store backed by an S3 bucket.
///
/// Objects are stored under their address as-is. The cache version is
/// recorded as user metadata and reported by `head`; listings don't include
/// user metadata, so listed objects carry no version.
///
/// There is no reservation service; use the store in storage-direct mode.
/// Multipart uploads and retries inside a single request are left to the SDK.
#[derive(Clone, Debug, Display)]
#[display("s3://{bucket}")]
pub struct S3Store {
    #[debug(skip)]
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Create a store for `bucket` using credentials and region from the
    /// environment.
    #[instrument(name = "S3Store::new")]
    pub async fn new(bucket: impl Into<String> + std::fmt::Debug) -> Result<Self> {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Ok(Self::from_client(Client::new(&config), bucket))
    }

    /// Create a store from an existing client.
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

impl ObjectStore for S3Store {
    #[instrument(name = "S3Store::head")]
    async fn head(&self, key: &ObjectKey) -> Result<Option<ObjectMeta>> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await;
        let output = match result {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|err| err.is_not_found()) => {
                return Ok(None);
            }
            Err(err) => return Err(sdk_error(err, "head object")),
        };

        let version = output
            .metadata()
            .and_then(|metadata| metadata.get(VERSION_METADATA))
            .map(CacheVersion::from_hex)
            .transpose()
            .context("parse cache version metadata")?;
        let meta = ObjectMeta::builder()
            .key(key)
            .size(size(output.content_length())?)
            .maybe_version(version)
            .maybe_created_at(output.last_modified().and_then(timestamp))
            .build();
        Ok(Some(meta))
    }

    #[instrument(name = "S3Store::list")]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut continuation = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation)
                .send()
                .await
                .map_err(|err| sdk_error(err, "list objects"))?;

            for object in output.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                let meta = ObjectMeta::builder()
                    .key(ObjectKey::new(key))
                    .size(size(object.size())?)
                    .maybe_created_at(object.last_modified().and_then(timestamp))
                    .build();
                objects.push(meta);
            }

            continuation = output.next_continuation_token().map(String::from);
            if continuation.is_none() {
                break;
            }
        }

        trace!(count = objects.len(), "listed objects");
        Ok(objects)
    }

    #[instrument(name = "S3Store::open_read")]
    async fn open_read(&self, key: &ObjectKey) -> Result<Option<ObjectBody>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await;
        match result {
            Ok(output) => {
                let length = output.content_length().map(|len| size(Some(len))).transpose()?;
                Ok(Some(ObjectBody::new(length, output.body.into_async_read())))
            }
            Err(err) if err.as_service_error().is_some_and(|err| err.is_no_such_key()) => Ok(None),
            Err(err) => Err(sdk_error(err, "get object")),
        }
    }

    #[instrument(name = "S3Store::read_range")]
    async fn read_range(&self, key: &ObjectKey, range: ByteRange) -> Result<Bytes> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .range(range.to_range_header())
            .send()
            .await;
        let output = match result {
            Ok(output) => output,
            Err(err) if status(&err) == Some(416) => return Ok(Bytes::new()),
            Err(err) => return Err(sdk_error(err, "get object range")),
        };
        output
            .body
            .collect()
            .await
            .map(|data| data.into_bytes())
            .map_err(|err| Report::new(CacheError::transient("read object range").with_cause(err)))
    }

    #[instrument(name = "S3Store::get_to_file")]
    async fn get_to_file(&self, key: &ObjectKey, destination: &Path) -> Result<u64> {
        let Some(body) = self.open_read(key).await? else {
            return Err(Report::new(CacheError::not_found(format!(
                "object {key} does not exist"
            ))));
        };
        fs::write_stream(body.reader, destination).await
    }

    #[instrument(name = "S3Store::put_from_file")]
    async fn put_from_file(
        &self,
        key: &ObjectKey,
        version: Option<&CacheVersion>,
        source: &Path,
    ) -> Result<()> {
        let body = ByteStream::from_path(source)
            .await
            .with_context(|| format!("open file: {source:?}"))?;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .body(body);
        if let Some(version) = version {
            request = request.metadata(VERSION_METADATA, version.as_str());
        }
        request
            .send()
            .await
            .map_err(|err| sdk_error(err, "put object"))?;
        Ok(())
    }
}

fn size(len: Option<i64>) -> Result<u64> {
    let len = len.unwrap_or_default();
    u64::try_from(len).with_context(|| format!("invalid object size: {len}"))
}

fn timestamp(time: &DateTime) -> Option<Timestamp> {
    Timestamp::from_second(time.secs())
        .inspect_err(|err| warn!(?err, "invalid object timestamp"))
        .ok()
}

/// The HTTP status of a failed request, if a response was received.
fn status<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

/// Classify an SDK failure.
fn sdk_error<E>(err: SdkError<E>, message: &str) -> Report
where
    E: StdError + Send + Sync + 'static,
{
    let kind = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ErrorKind::Transient
        }
        _ => status(&err)
            .and_then(|code| http::StatusCode::from_u16(code).ok())
            .map(ErrorKind::from_status)
            .unwrap_or(ErrorKind::Permanent),
    };
    Report::new(CacheError::new(kind, message).with_cause(err))
}
