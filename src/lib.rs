//! Artifact Fetcher Library
//!
//! A content cache with a coordinated conditional downloader for
//! immutable-by-version remote artifacts. The fetcher sits between an
//! application and an upstream HTTP origin, returning a readable handle
//! to an artifact's bytes (or an expanded directory tree for archive
//! artifacts) while keeping a bounded on-disk cache of previously
//! fetched, still-referenced entries.
//!
//! # Key Features
//!
//! - **Conditional downloads** with `ETag` / `Last-Modified` round-trips
//!   and automatic retries
//! - **Per-key single-flight** so concurrent demand for one key produces
//!   at most one origin request at a time
//! - **LRU eviction over a byte budget** with in-use refcounts that pin
//!   entries against eviction
//! - **Generation-suffixed replacement** so open readers keep stable
//!   bytes while newer callers see fresh content
//! - **Streaming MD5 verification** when the origin's `ETag` is an MD5
//!   checksum (the S3 convention)
//! - **Cooperative cancellation** at every suspension point, reporting
//!   the phase that was interrupted
//!
//! # Architecture Overview
//!
//! - [`app::coordinator`] - the public [`app::CachedFetcher`] surface and
//!   per-key single-flight gate
//! - [`app::cache`] - the in-memory index over the on-disk cache
//! - [`app::downloader`] - the conditional HTTP downloader
//! - [`app::transform`] - pluggable post-download transformers
//! - [`errors`] - error types and result aliases
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use artifact_fetcher::prelude::*;
//! use tokio::io::AsyncReadExt;
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = FetcherConfig::new("/var/cache/artifacts", "/var/cache/artifacts-tmp")
//!         .with_max_size_in_bytes(512 * 1024 * 1024);
//!     let fetcher = CachedFetcher::new(config, Arc::new(IdentityTransformer))?;
//!
//!     let url = Url::parse("https://artifacts.example.com/build/rootfs.bin").expect("static url");
//!     let cancel = CancellationToken::new();
//!     let (mut stream, size) = fetcher.fetch(&url, "rootfs-v42", &cancel).await?;
//!     println!("fetched {} bytes", size);
//!
//!     let mut contents = Vec::new();
//!     stream.read_to_end(&mut contents).await?;
//!     stream.close();
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod constants;
pub mod errors;
pub mod prelude;
