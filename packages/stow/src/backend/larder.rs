//! Backend for the Larder cache service.
//!
//! Larder offers both capabilities: object reads and writes, and native
//! reservations with chunked uploads.

use std::path::Path;

use bytes::Bytes;
use clients::{
    CacheError, Larder, Token,
    larder::v1::{
        ByteRange, CacheId, CacheVersion, ObjectKey, ObjectMeta,
        cache::{CommitCacheRequest, ReserveCacheRequest},
    },
};
use color_eyre::{Report, Result, eyre::Context};
use derive_more::{Debug, Display};
use tracing::instrument;
use url::Url;

use super::{ObjectBody, ObjectStore, ReservationService};
use crate::fs;

/// Backend using the remote Larder HTTP API.
#[derive(Clone, Debug, Display)]
#[display("{client}")]
pub struct LarderBackend {
    #[debug("{:?}", client)]
    client: Larder,
}

impl LarderBackend {
    /// Create a new backend with the given URL and token, checking that the
    /// service is reachable.
    #[instrument(name = "LarderBackend::new", skip(token))]
    pub async fn new(url: Url, token: Token) -> Result<Self> {
        let client = Larder::new(url, token)?;
        client.ping().await.context("ping cache service")?;
        Ok(Self { client })
    }

    /// Create a backend from an existing client.
    pub fn from_client(client: Larder) -> Self {
        Self { client }
    }
}

impl ObjectStore for LarderBackend {
    #[instrument(name = "LarderBackend::head")]
    async fn head(&self, key: &ObjectKey) -> Result<Option<ObjectMeta>> {
        self.client.object_head(key).await
    }

    #[instrument(name = "LarderBackend::list")]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.client.object_list(prefix).await
    }

    #[instrument(name = "LarderBackend::open_read")]
    async fn open_read(&self, key: &ObjectKey) -> Result<Option<ObjectBody>> {
        let body = self.client.object_read(key).await?;
        Ok(body.map(|(length, reader)| ObjectBody::new(length, reader)))
    }

    #[instrument(name = "LarderBackend::read_range")]
    async fn read_range(&self, key: &ObjectKey, range: ByteRange) -> Result<Bytes> {
        self.client.object_read_range(key, range).await
    }

    #[instrument(name = "LarderBackend::get_to_file")]
    async fn get_to_file(&self, key: &ObjectKey, destination: &Path) -> Result<u64> {
        let Some((_, reader)) = self.client.object_read(key).await? else {
            return Err(Report::new(CacheError::not_found(format!("object {key} does not exist"))));
        };
        fs::write_stream(reader, destination).await
    }

    #[instrument(name = "LarderBackend::put_from_file")]
    async fn put_from_file(
        &self,
        key: &ObjectKey,
        version: Option<&CacheVersion>,
        source: &Path,
    ) -> Result<()> {
        let file = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("open file: {source:?}"))?;
        self.client.object_write(key, version, file).await
    }
}

impl ReservationService for LarderBackend {
    #[instrument(name = "LarderBackend::reserve")]
    async fn reserve(&self, request: &ReserveCacheRequest) -> Result<CacheId> {
        let response = self.client.cache_reserve(request).await?;
        Ok(response.cache_id)
    }

    #[instrument(name = "LarderBackend::upload_chunk", skip(content))]
    async fn upload_chunk(&self, id: &CacheId, range: ByteRange, content: Bytes) -> Result<()> {
        self.client.cache_upload_chunk(id, range, content).await
    }

    #[instrument(name = "LarderBackend::commit")]
    async fn commit(&self, id: &CacheId, size: u64) -> Result<()> {
        self.client
            .cache_commit(id, &CommitCacheRequest::new(size))
            .await
    }
}
