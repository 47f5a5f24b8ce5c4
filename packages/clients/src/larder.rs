//! Types and clients for the Larder artifact cache service.

pub mod v1;
