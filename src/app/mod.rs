//! Core application logic for the artifact fetcher
//!
//! This module contains the functional components of the crate:
//!
//! - [`coordinator`] - public fetch surface, single-flight gating, and
//!   bootstrap of the on-disk layout
//! - [`cache`] - in-memory index over the bounded on-disk cache
//! - [`downloader`] - conditional HTTP downloader with retries and
//!   cancellation
//! - [`transform`] - pluggable post-download transformers
//! - [`handle`] - read handles that release cache pins on close
//! - [`fingerprint`] - cache-key fingerprinting
//! - [`models`] - shared data types

pub mod cache;
pub mod coordinator;
pub mod downloader;
pub mod fingerprint;
pub mod handle;
pub mod models;
pub mod transform;

// Re-export main public API
pub use cache::CacheIndex;
pub use coordinator::{CachedFetcher, FetcherConfig};
pub use downloader::Downloader;
pub use fingerprint::Fingerprint;
pub use handle::CachedFile;
pub use models::CachingInfo;
pub use transform::{IdentityTransformer, TarTransformer, Transformer};
