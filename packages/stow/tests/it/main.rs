//! Integration tests for the cache client.
//!
//! Most tests drive the components against the in-memory backend, wrapped
//! to record calls and inject failures. The `larder` tests go through the
//! Larder client against a local test server.

mod download;
mod helpers;
mod reserve;
mod resolve;
mod upload;

pub use helpers::*;
