//! Prelude module for the artifact fetcher
//!
//! Re-exports the most commonly used items so typical integrations need
//! a single `use artifact_fetcher::prelude::*;` statement.

// Core result types
pub use crate::errors::{CacheError, DownloadError, FetchError, Phase, Result};

// Public fetcher surface
pub use crate::app::{
    CachedFetcher, CachedFile, CachingInfo, FetcherConfig, Fingerprint, IdentityTransformer,
    TarTransformer, Transformer,
};

// The cancel signal accepted by every fetch operation
pub use tokio_util::sync::CancellationToken;
