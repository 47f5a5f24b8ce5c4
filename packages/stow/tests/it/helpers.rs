//! Shared test infrastructure: fixtures, a fault-injecting backend wrapper,
//! and a Larder v1 server over the in-memory backend.

use std::{
    path::{Path as FsPath, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clients::{
    CacheError, ErrorKind, Larder, Token,
    larder::v1::{
        ByteRange, CACHE_VERSION_HEADER, CREATED_AT_HEADER, CacheId, CacheVersion,
        OBJECT_SIZE_HEADER, ObjectKey, ObjectMeta,
        cache::{CommitCacheRequest, ListObjectsQuery, ReserveCacheRequest, ReserveCacheResponse},
    },
};
use color_eyre::{Report, Result, eyre::Context};
use stow::{
    CacheContext, ObjectStore, ReservationService, Scope, TransferOptions,
    backend::{LarderBackend, MemoryBackend, ObjectBody},
};
use tokio::io::AsyncReadExt;
use url::Url;

pub const TOKEN: &str = "test-token";

/// A context scoped to `r/main/h`.
#[track_caller]
pub fn context(options: TransferOptions) -> Arc<CacheContext> {
    let scope = Scope::builder()
        .repository("r")
        .git_ref("main")
        .workflow_hash("h")
        .build();
    CacheContext::builder()
        .scope(scope)
        .options(options)
        .build()
        .shared()
        .unwrap_or_else(|err| panic!("build context: {err:?}"))
}

/// Deterministic content that doesn't repeat on chunk boundaries.
pub fn content(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8)
        .collect()
}

/// Write an archive of `len` bytes into `dir`.
#[track_caller]
pub fn write_archive(dir: &FsPath, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let path = dir.join(name);
    let content = content(len);
    std::fs::write(&path, &content).unwrap_or_else(|err| panic!("write {path:?}: {err:?}"));
    (path, content)
}

/// Knobs and counters shared by clones of a [`Faulty`] backend.
#[derive(Default)]
pub struct Faults {
    /// Chunk uploads left to fail; `usize::MAX` fails forever.
    pub fail_chunks: AtomicUsize,

    /// Reject the chunk starting at this offset as a permanent failure.
    pub reject_chunk: Mutex<Option<u64>>,

    /// Hold every other chunk upload until it is cancelled.
    pub stall_chunks: AtomicBool,

    /// Fail lookups as transient.
    pub fail_heads: AtomicBool,

    /// Deliver only half of every object body and range.
    pub truncate_reads: AtomicBool,

    /// Delay chunk uploads by an amount that varies with their offset, so
    /// they complete out of order.
    pub shuffle_chunks: AtomicBool,

    pub heads: Mutex<Vec<ObjectKey>>,
    pub lists: Mutex<Vec<String>>,
    pub chunks: Mutex<Vec<ByteRange>>,
    pub chunk_attempts: Mutex<Vec<ByteRange>>,
    pub commits: AtomicUsize,
}

impl Faults {
    pub fn heads(&self) -> Vec<String> {
        lock(&self.heads).iter().map(|key| key.to_string()).collect()
    }

    pub fn lists(&self) -> Vec<String> {
        lock(&self.lists).clone()
    }

    /// Chunk ranges that reached the inner backend, sorted by offset.
    pub fn chunks(&self) -> Vec<ByteRange> {
        let mut chunks = lock(&self.chunks).clone();
        chunks.sort();
        chunks
    }

    /// How many times the chunk starting at `offset` was sent, including
    /// failed attempts.
    pub fn attempts_at(&self, offset: u64) -> usize {
        lock(&self.chunk_attempts)
            .iter()
            .filter(|range| range.start() == offset)
            .count()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wraps a backend, recording calls and injecting failures.
#[derive(Clone)]
pub struct Faulty<B> {
    pub inner: B,
    pub faults: Arc<Faults>,
}

impl<B> Faulty<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            faults: Arc::default(),
        }
    }
}

fn half(content: Bytes) -> Bytes {
    content.slice(..content.len() / 2)
}

impl<B: ObjectStore> ObjectStore for Faulty<B> {
    async fn head(&self, key: &ObjectKey) -> Result<Option<ObjectMeta>> {
        lock(&self.faults.heads).push(key.clone());
        if self.faults.fail_heads.load(Ordering::SeqCst) {
            return Err(Report::new(CacheError::transient("injected lookup failure")));
        }
        self.inner.head(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        lock(&self.faults.lists).push(prefix.to_string());
        self.inner.list(prefix).await
    }

    async fn open_read(&self, key: &ObjectKey) -> Result<Option<ObjectBody>> {
        let Some(body) = self.inner.open_read(key).await? else {
            return Ok(None);
        };
        if !self.faults.truncate_reads.load(Ordering::SeqCst) {
            return Ok(Some(body));
        }

        let mut content = Vec::new();
        let mut reader = body.reader;
        reader.read_to_end(&mut content).await?;
        let truncated = half(Bytes::from(content));
        Ok(Some(ObjectBody::new(body.length, std::io::Cursor::new(truncated))))
    }

    async fn read_range(&self, key: &ObjectKey, range: ByteRange) -> Result<Bytes> {
        let content = self.inner.read_range(key, range).await?;
        if self.faults.truncate_reads.load(Ordering::SeqCst) {
            return Ok(half(content));
        }
        Ok(content)
    }

    async fn get_to_file(&self, key: &ObjectKey, destination: &FsPath) -> Result<u64> {
        self.inner.get_to_file(key, destination).await
    }

    async fn put_from_file(
        &self,
        key: &ObjectKey,
        version: Option<&CacheVersion>,
        source: &FsPath,
    ) -> Result<()> {
        self.inner.put_from_file(key, version, source).await
    }
}

impl<B: ReservationService> ReservationService for Faulty<B> {
    async fn reserve(&self, request: &ReserveCacheRequest) -> Result<CacheId> {
        self.inner.reserve(request).await
    }

    async fn upload_chunk(&self, id: &CacheId, range: ByteRange, content: Bytes) -> Result<()> {
        lock(&self.faults.chunk_attempts).push(range);
        if *lock(&self.faults.reject_chunk) == Some(range.start()) {
            return Err(Report::new(CacheError::permanent("injected chunk rejection")));
        }
        if self.faults.stall_chunks.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }

        let fail = self
            .faults
            .fail_chunks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                left => Some(left - 1),
            })
            .is_ok();
        if fail {
            return Err(Report::new(CacheError::transient("injected chunk failure")));
        }
        if self.faults.shuffle_chunks.load(Ordering::SeqCst) {
            let delay = range.start().wrapping_mul(2_654_435_761) % 20;
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.inner.upload_chunk(id, range, content).await?;
        lock(&self.faults.chunks).push(range);
        Ok(())
    }

    async fn commit(&self, id: &CacheId, size: u64) -> Result<()> {
        self.faults.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit(id, size).await
    }
}

/// A Larder v1 server over an in-memory backend, bound to a random port.
pub struct TestServer {
    pub base_url: Url,
    pub backend: MemoryBackend,
    pub faults: Arc<ServerFaults>,
}

/// Failures the test server injects.
#[derive(Default)]
pub struct ServerFaults {
    /// Chunk uploads left to reject with `503 Service Unavailable`.
    pub unavailable_chunks: AtomicUsize,

    /// Chunk uploads received, including rejected ones.
    pub chunk_requests: AtomicUsize,

    /// Label whole-object reads as `Content-Encoding: gzip`.
    pub label_gzip: AtomicBool,
}

#[derive(Clone)]
struct ServerState {
    backend: MemoryBackend,
    faults: Arc<ServerFaults>,
}

impl TestServer {
    pub async fn spawn() -> Result<Self> {
        let backend = MemoryBackend::new();
        let faults = Arc::new(ServerFaults::default());
        let state = ServerState {
            backend: backend.clone(),
            faults: faults.clone(),
        };
        let router = Router::new()
            .route("/api/v1/objects", get(list_objects))
            .route(
                "/api/v1/objects/{*key}",
                get(read_object).head(head_object).put(write_object),
            )
            .route("/api/v1/caches", post(reserve))
            .route("/api/v1/caches/{id}", post(commit).patch(upload_chunk))
            .route_layer(middleware::from_fn(authorize))
            .route("/api/v1/health", get(|| async { StatusCode::OK }))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind test server")?;
        let local_addr = listener.local_addr().context("get local addr")?;
        let base_url = Url::parse(&format!("http://{local_addr}")).context("parse base URL")?;
        tokio::task::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("test server failed");
        });

        Ok(Self {
            base_url,
            backend,
            faults,
        })
    }

    pub fn client_with_token(&self, token: &str) -> Result<Larder> {
        Larder::new(self.base_url.clone(), Token::from(token))
    }

    pub async fn larder(&self) -> Result<LarderBackend> {
        LarderBackend::new(self.base_url.clone(), Token::from(TOKEN)).await
    }
}

async fn authorize(request: Request, next: Next) -> Response {
    let expected = format!("Bearer {TOKEN}");
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .is_some_and(|value| value.as_bytes() == expected.as_bytes());
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(request).await
}

/// Render a classified failure the way the service does.
fn failure(err: Report) -> Response {
    let status = match ErrorKind::of(&err) {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Permanent | ErrorKind::Integrity => StatusCode::BAD_REQUEST,
    };
    (status, format!("{err:?}")).into_response()
}

async fn list_objects(
    State(state): State<ServerState>,
    Query(query): Query<ListObjectsQuery>,
) -> Response {
    match state.backend.list(&query.prefix).await {
        Ok(objects) => Json(objects).into_response(),
        Err(err) => failure(err),
    }
}

async fn head_object(State(state): State<ServerState>, Path(key): Path<String>) -> Response {
    let key = ObjectKey::new(key);
    let meta = match state.backend.head(&key).await {
        Ok(Some(meta)) => meta,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return failure(err),
    };

    let mut headers = HeaderMap::new();
    headers.insert(OBJECT_SIZE_HEADER, meta.size.into());
    let version = meta
        .version
        .as_ref()
        .and_then(|version| version.as_str().parse().ok());
    if let Some(value) = version {
        headers.insert(CACHE_VERSION_HEADER, value);
    }
    let created_at = meta
        .created_at
        .and_then(|created_at| created_at.to_string().parse().ok());
    if let Some(value) = created_at {
        headers.insert(CREATED_AT_HEADER, value);
    }
    (StatusCode::OK, headers).into_response()
}

async fn read_object(
    State(state): State<ServerState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    let key = ObjectKey::new(key);
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(ByteRange::parse_range_header);
    match range {
        Some(Ok(range)) => match state.backend.read_range(&key, range).await {
            Ok(content) => (StatusCode::PARTIAL_CONTENT, content).into_response(),
            Err(err) => failure(err),
        },
        Some(Err(err)) => (StatusCode::BAD_REQUEST, format!("{err:?}")).into_response(),
        None => match state.backend.content(&key) {
            Some(content) if state.faults.label_gzip.load(Ordering::SeqCst) => (
                StatusCode::OK,
                [(header::CONTENT_ENCODING, "gzip")],
                Body::from(content),
            )
                .into_response(),
            Some(content) => (StatusCode::OK, Body::from(content)).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
    }
}

async fn write_object(
    State(state): State<ServerState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let version = headers
        .get(CACHE_VERSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(CacheVersion::from_hex);
    let version = match version.transpose() {
        Ok(version) => version,
        Err(err) => return (StatusCode::BAD_REQUEST, format!("{err:?}")).into_response(),
    };
    state
        .backend
        .put(&ObjectKey::new(key), version.as_ref(), body);
    StatusCode::CREATED.into_response()
}

async fn reserve(
    State(state): State<ServerState>,
    Json(request): Json<ReserveCacheRequest>,
) -> Response {
    match state.backend.reserve(&request).await {
        Ok(cache_id) => (
            StatusCode::CREATED,
            Json(ReserveCacheResponse::new(cache_id)),
        )
            .into_response(),
        Err(err) => failure(err),
    }
}

async fn upload_chunk(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.faults.chunk_requests.fetch_add(1, Ordering::SeqCst);
    let unavailable = state
        .faults
        .unavailable_chunks
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok();
    if unavailable {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let range = headers
        .get(header::CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .map(ByteRange::parse_content_range);
    let range = match range {
        Some(Ok(range)) => range,
        _ => return (StatusCode::BAD_REQUEST, "invalid content range").into_response(),
    };
    match state
        .backend
        .upload_chunk(&CacheId::new(id), range, body)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => failure(err),
    }
}

async fn commit(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(request): Json<CommitCacheRequest>,
) -> Response {
    match state.backend.commit(&CacheId::new(id), request.size).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => failure(err),
    }
}
