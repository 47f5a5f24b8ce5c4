//! Cache versions: fingerprints of everything that affects whether an archive
//! can be restored on this runner.
//!
//! A version is computed from:
//! - The caller's path list, in the order given.
//! - The compression method used to build the archive, if any.
//! - A `windows-only` marker, added only when running on Windows with
//!   cross-OS archiving disabled (archives built on Windows use different
//!   path separators and tar flavors).
//! - [`VERSION_SALT`], which is bumped whenever the layout of cache entries
//!   changes incompatibly.
//!
//! The components are joined with `|` and hashed with SHA-256. Computing a
//! version is pure: it performs no I/O and never fails.

use clients::larder::v1::CacheVersion;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString, IntoStaticStr};
use tracing::trace;

/// Salt mixed into every version.
///
/// Bump this whenever the binary layout of cache entries changes in a way
/// that makes older entries unusable.
pub const VERSION_SALT: &str = "1.0";

/// Separator placed between version components; not expected in paths.
const COMPONENT_SEPARATOR: &str = "|";

/// Marker added for archives that can only be restored on Windows.
const WINDOWS_ONLY_MARKER: &str = "windows-only";

/// The compression applied to an archive.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Debug,
    Display,
    EnumString,
    IntoStaticStr,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum CompressionMethod {
    Gzip,
    ZstdWithoutLong,
    Zstd,
}

impl CompressionMethod {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// The operating system family a version is computed for.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum Platform {
    Windows,
    Other,
}

impl Platform {
    /// The platform this process is running on.
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Other
        }
    }
}

/// Compute the cache version for the current platform.
pub fn compute_version(
    paths: &[impl AsRef<str>],
    compression: Option<CompressionMethod>,
    cross_os_archive: bool,
) -> CacheVersion {
    compute_version_for(Platform::current(), paths, compression, cross_os_archive)
}

/// Compute the cache version as if running on `platform`.
///
/// The caller's path list is only read; the components are assembled into a
/// new sequence owned by this function.
pub fn compute_version_for(
    platform: Platform,
    paths: &[impl AsRef<str>],
    compression: Option<CompressionMethod>,
    cross_os_archive: bool,
) -> CacheVersion {
    let mut components = paths.iter().map(|path| path.as_ref()).collect::<Vec<&str>>();
    if let Some(compression) = compression {
        components.push(compression.as_str());
    }
    if platform == Platform::Windows && !cross_os_archive {
        components.push(WINDOWS_ONLY_MARKER);
    }
    components.push(VERSION_SALT);

    let joined = components.join(COMPONENT_SEPARATOR);
    trace!(?components, "compute cache version");
    let digest: [u8; 32] = Sha256::digest(joined.as_bytes()).into();
    CacheVersion::from_digest(digest)
}
