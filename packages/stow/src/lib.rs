//! Client for a remote build-artifact cache.
//!
//! A CI job restores a cache entry at the start of a run and saves one at the
//! end. Both sides go through the same steps:
//!
//! - Restore: [`KeyResolver`] finds the best entry for an ordered list of
//!   keys, then [`TransferEngine::download`] fetches the archive.
//! - Save: [`ReservationCoordinator`] claims the slot,
//!   [`TransferEngine::upload`] sends the archive in chunks, and
//!   [`CommitCoordinator`] makes it visible.
//!
//! [`Cache`] wires these together for the common case. Entries are namespaced
//! by [`Scope`] and fingerprinted by a cache version (see [`version`]) so
//! that archives from incompatible configurations never match.
//!
//! Everything a component needs to know about where it runs is passed in as
//! a shared [`CacheContext`]; nothing is read from the environment after
//! configuration is parsed.
//!
//! Errors are [`color_eyre::Report`]s. Failures that callers react to carry a
//! [`CacheError`] whose [`ErrorKind`] can be read with [`ErrorKind::of`].

pub mod backend;
pub mod cache;
pub mod commit;
pub mod config;
pub mod fs;
pub mod reserve;
pub mod resolve;
pub mod retry;
pub mod scope;
pub mod transfer;
pub mod version;

pub use backend::{AnyBackend, NoReservations, ObjectStore, ReservationService};
pub use cache::{Cache, Restored, Saved};
pub use clients::{CacheError, ErrorKind};
pub use commit::CommitCoordinator;
pub use config::{
    CacheConfig, CacheContext, DownloadStrategy, ReservationMode, StorageConfig, TransferOptions,
};
pub use reserve::{Reservation, ReservationCoordinator};
pub use resolve::{ArtifactCacheEntry, CacheMiss, KeyResolver, Resolution};
pub use retry::RetryPolicy;
pub use scope::Scope;
pub use transfer::{TransferEngine, plan_chunks};
pub use version::{CompressionMethod, compute_version};
