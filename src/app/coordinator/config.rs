//! Fetcher configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`super::CachedFetcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Directory for cached artifacts; wiped and recreated at construction
    pub cached_path: PathBuf,
    /// Directory for ephemeral temp files
    pub uncached_path: PathBuf,
    /// Cache byte budget
    pub max_size_in_bytes: u64,
    /// Overall HTTP request timeout
    pub download_timeout: Duration,
    /// Cap on parallel origin requests
    pub max_concurrent_downloads: usize,
    /// Accept any TLS certificate
    pub skip_ssl_verification: bool,
}

impl FetcherConfig {
    /// Configuration with defaults for everything but the two
    /// directories.
    pub fn new(cached_path: impl Into<PathBuf>, uncached_path: impl Into<PathBuf>) -> Self {
        Self {
            cached_path: cached_path.into(),
            uncached_path: uncached_path.into(),
            max_size_in_bytes: 10 * 1024 * 1024 * 1024,
            download_timeout: Duration::from_secs(60),
            max_concurrent_downloads: 5,
            skip_ssl_verification: false,
        }
    }

    /// Set the cache byte budget.
    pub fn with_max_size_in_bytes(mut self, max_size_in_bytes: u64) -> Self {
        self.max_size_in_bytes = max_size_in_bytes;
        self
    }

    /// Set the overall per-request timeout.
    pub fn with_download_timeout(mut self, download_timeout: Duration) -> Self {
        self.download_timeout = download_timeout;
        self
    }

    /// Set the cap on parallel origin requests.
    pub fn with_max_concurrent_downloads(mut self, max_concurrent_downloads: usize) -> Self {
        self.max_concurrent_downloads = max_concurrent_downloads;
        self
    }

    /// Accept any TLS certificate from the origin.
    pub fn with_skip_ssl_verification(mut self, skip_ssl_verification: bool) -> Self {
        self.skip_ssl_verification = skip_ssl_verification;
        self
    }
}
