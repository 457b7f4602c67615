//! Error types for the artifact fetcher
//!
//! This module defines the error types for all components of the crate.
//! Errors are split by domain so that each component has a narrow error
//! surface, with a top-level [`FetchError`] that callers of the public
//! API can match on.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Sentinel for "bytes written" in a [`DownloadError::Cancelled`] when no
/// body bytes were in flight at the time of cancellation.
pub const NO_BYTES_RECEIVED: i64 = -1;

/// The operation phase during which a download was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the per-key single-flight gate.
    AcquireLimiter,
    /// Waiting for a concurrent-download permit.
    DownloadBarrier,
    /// Performing the HTTP round-trip.
    FetchRequest,
    /// Streaming the response body to disk.
    CopyBody,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::AcquireLimiter => "acquire-limiter",
            Phase::DownloadBarrier => "download-barrier",
            Phase::FetchRequest => "fetch-request",
            Phase::CopyBody => "copy-body",
        };
        write!(f, "{}", name)
    }
}

/// Download and HTTP transfer errors
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Origin returned a status other than 200 or 304
    #[error("download failed: status code {status}")]
    DownloadFailed { status: u16 },

    /// Response ETag was an MD5 checksum and did not match the body
    #[error("download failed: checksum mismatch")]
    ChecksumMismatch,

    /// The caller's cancel signal fired mid-operation
    #[error("download cancelled: phase '{phase}', elapsed '{elapsed:?}', bytes '{written}'")]
    Cancelled {
        phase: Phase,
        elapsed: Duration,
        written: i64,
    },

    /// HTTP request failed
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// I/O error while writing the body to disk
    #[error("file I/O error during download")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Whether the retry loop should give up immediately on this error.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DownloadError::Cancelled { .. })
    }
}

/// Cache index errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// No entry exists for the fingerprint
    #[error("cache entry not found")]
    EntryNotFound,

    /// Evicting every unpinned entry still would not fit the artifact
    #[error("not enough space in cache")]
    NotEnoughSpace,

    /// Response carried no validator; directories require a cache slot
    #[error("response is not cacheable")]
    NotCacheable,

    /// I/O error manipulating cached files
    #[error("cache file I/O error")]
    Io(#[from] std::io::Error),
}

/// Top-level error for the public fetch API
#[derive(Error, Debug)]
pub enum FetchError {
    /// Download error
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Cache error
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Generic I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for the public API
pub type Result<T> = std::result::Result<T, FetchError>;

/// Download result type alias
pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

/// Cache result type alias
pub type CacheResult<T> = std::result::Result<T, CacheError>;
