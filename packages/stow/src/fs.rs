//! Filesystem helpers used by transfers.
//!
//! Concurrent transfers share a single `std::fs::File` per archive and access
//! it with positional reads and writes, so workers never contend on a seek
//! cursor or a lock. Positional I/O is blocking and always runs on
//! `spawn_blocking`.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use clients::{CacheError, NETWORK_BUFFER_SIZE};
use color_eyre::{Report, Result, eyre::Context};
use derive_more::Debug;
use tap::TapFallible;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    task::spawn_blocking,
};
use tracing::{debug, instrument, trace, warn};

/// Get the size of a file in bytes.
#[instrument]
pub async fn file_size(path: &Path) -> Result<u64> {
    tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat file: {path:?}"))
        .map(|metadata| metadata.len())
}

/// Create the parent directory of `path` if it has one.
async fn create_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create directory: {parent:?}")),
        _ => Ok(()),
    }
}

/// Open a file for shared positional reads.
#[instrument]
pub async fn open_shared(path: &Path) -> Result<Arc<std::fs::File>> {
    let owned = path.to_path_buf();
    spawn_blocking(move || std::fs::File::open(&owned))
        .await
        .context("join task")?
        .with_context(|| format!("open file: {path:?}"))
        .map(Arc::new)
        .tap_ok(|_| trace!(?path, "open file"))
}

/// Create a file of `len` bytes for shared positional writes.
///
/// Any existing file at `path` is truncated first.
#[instrument]
pub async fn create_shared(path: &Path, len: u64) -> Result<Arc<std::fs::File>> {
    create_parent(path).await?;
    let owned = path.to_path_buf();
    spawn_blocking(move || -> std::io::Result<_> {
        let file = std::fs::File::create(&owned)?;
        file.set_len(len)?;
        Ok(file)
    })
    .await
    .context("join task")?
    .with_context(|| format!("create file: {path:?}"))
    .map(Arc::new)
    .tap_ok(|_| trace!(?path, len, "create file"))
}

/// Read exactly `len` bytes starting at `offset`.
pub async fn read_at(file: Arc<std::fs::File>, offset: u64, len: usize) -> Result<Bytes> {
    spawn_blocking(move || -> std::io::Result<_> {
        let mut buf = vec![0; len];
        positional::read_exact_at(&file, &mut buf, offset)?;
        Ok(Bytes::from(buf))
    })
    .await
    .context("join task")?
    .with_context(|| format!("read {len} bytes at offset {offset}"))
}

/// Write all of `content` starting at `offset`.
pub async fn write_at(file: Arc<std::fs::File>, offset: u64, content: Bytes) -> Result<()> {
    let len = content.len();
    spawn_blocking(move || positional::write_all_at(&file, &content, offset))
        .await
        .context("join task")?
        .with_context(|| format!("write {len} bytes at offset {offset}"))
}

/// Stream `reader` into a new file at `destination`.
///
/// Returns the number of bytes written. Failures reading from `reader` are
/// classified as transient, since the reader is normally a network body.
#[instrument(skip(reader))]
pub async fn write_stream(
    mut reader: impl AsyncRead + Unpin,
    destination: &Path,
) -> Result<u64> {
    create_parent(destination).await?;
    let mut file = tokio::fs::File::create(destination)
        .await
        .with_context(|| format!("create file: {destination:?}"))?;

    let mut buf = vec![0; NETWORK_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let read = reader
            .read(&mut buf)
            .await
            .map_err(|err| Report::new(CacheError::transient("read object body").with_cause(err)))?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read])
            .await
            .with_context(|| format!("write file: {destination:?}"))?;
        written += read as u64;
    }
    file.flush()
        .await
        .with_context(|| format!("flush file: {destination:?}"))?;

    trace!(?destination, written, "wrote stream to file");
    Ok(written)
}

/// Removes a file when dropped, unless [`PartialFile::finish`] was called.
///
/// Guards download destinations so that a failed or cancelled transfer never
/// leaves a truncated archive behind.
#[derive(Debug)]
pub struct PartialFile {
    path: PathBuf,

    #[debug(skip)]
    armed: bool,
}

impl PartialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    /// Keep the file.
    pub fn finish(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "removed partial file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = ?self.path, ?err, "unable to remove partial file"),
        }
    }
}

#[cfg(unix)]
mod positional {
    use std::{fs::File, io::Result, os::unix::fs::FileExt};

    pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
        file.read_exact_at(buf, offset)
    }

    pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
        file.write_all_at(buf, offset)
    }
}

#[cfg(windows)]
mod positional {
    use std::{
        fs::File,
        io::{Error, ErrorKind, Result},
        os::windows::fs::FileExt,
    };

    pub fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            match file.seek_read(buf, offset) {
                Ok(0) => return Err(Error::from(ErrorKind::UnexpectedEof)),
                Ok(n) => {
                    buf = &mut std::mem::take(&mut buf)[n..];
                    offset += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            match file.seek_write(buf, offset) {
                Ok(0) => return Err(Error::from(ErrorKind::WriteZero)),
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
