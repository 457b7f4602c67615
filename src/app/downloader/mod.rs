//! Conditional HTTP downloader
//!
//! Performs one logical fetch per call: a conditional `GET` that either
//! streams fresh bytes into a caller-supplied temp file or reports "not
//! modified". Responsibilities:
//!
//! - **Concurrency barrier**: a process-wide semaphore bounds parallel
//!   origin requests; waiting for a permit is cancellable
//! - **Retries**: up to [`crate::constants::limits::MAX_DOWNLOAD_ATTEMPTS`]
//!   attempts with no backoff; cancellation breaks the loop immediately
//! - **Stall detection**: every body read is bounded by a 5 s deadline
//!   so a dead connection fails the attempt instead of hanging until
//!   the overall timeout
//! - **Checksum enforcement**: the body is fed to an MD5 hasher while
//!   streaming; when the response `ETag` is a 32-char lowercase hex
//!   string (the S3 convention) it must equal the computed digest

use std::io;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::app::models::CachingInfo;
use crate::constants::{http, limits};
use crate::errors::{DownloadError, DownloadResult, Phase, NO_BYTES_RECEIVED};

/// A fresh artifact produced by a download.
///
/// The caller owns `path` and must move or delete it.
#[derive(Debug)]
pub struct DownloadedFile {
    pub path: std::path::PathBuf,
    pub caching_info: CachingInfo,
}

/// HTTP downloader with bounded concurrency.
#[derive(Debug)]
pub struct Downloader {
    client: Client,
    download_barrier: Semaphore,
}

impl Downloader {
    /// Build the downloader and its HTTP client.
    ///
    /// `download_timeout` bounds each whole request; connect and
    /// keepalive deadlines come from [`crate::constants::http`]. With
    /// `skip_ssl_verification` the client accepts any certificate.
    pub fn new(
        download_timeout: Duration,
        max_concurrent_downloads: usize,
        skip_ssl_verification: bool,
    ) -> DownloadResult<Self> {
        let client = Client::builder()
            .timeout(download_timeout)
            .connect_timeout(http::CONNECT_TIMEOUT)
            .tcp_keepalive(http::TCP_KEEPALIVE_INTERVAL)
            .danger_accept_invalid_certs(skip_ssl_verification)
            .build()?;

        Ok(Self {
            client,
            download_barrier: Semaphore::new(max_concurrent_downloads),
        })
    }

    /// Execute one logical fetch.
    ///
    /// Conditional headers are derived from `caching_info`. Returns
    /// `Ok(None)` on `304 Not Modified`, `Ok(Some(_))` with the temp
    /// path and new validator on `200 OK`. Each attempt writes to a
    /// fresh file from `make_destination`; failed attempts delete
    /// their partial output.
    pub async fn download<F>(
        &self,
        url: &Url,
        make_destination: F,
        caching_info: &CachingInfo,
        cancel: &CancellationToken,
    ) -> DownloadResult<Option<DownloadedFile>>
    where
        F: Fn() -> io::Result<NamedTempFile>,
    {
        let started = Instant::now();
        let _permit = tokio::select! {
            permit = self.download_barrier.acquire() => permit.map_err(|_| {
                io::Error::new(io::ErrorKind::Other, "download barrier closed")
            })?,
            _ = cancel.cancelled() => {
                return Err(DownloadError::Cancelled {
                    phase: Phase::DownloadBarrier,
                    elapsed: started.elapsed(),
                    written: NO_BYTES_RECEIVED,
                });
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self
                .fetch_to_file(url, &make_destination, caching_info, cancel)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };

            if err.is_cancellation() || attempt >= limits::MAX_DOWNLOAD_ATTEMPTS {
                return Err(err);
            }
            warn!(%url, attempt, error = %err, "download attempt failed, retrying");
        }
    }

    async fn fetch_to_file<F>(
        &self,
        url: &Url,
        make_destination: &F,
        caching_info: &CachingInfo,
        cancel: &CancellationToken,
    ) -> DownloadResult<Option<DownloadedFile>>
    where
        F: Fn() -> io::Result<NamedTempFile>,
    {
        let mut request = self.client.get(url.clone());
        if !caching_info.etag.is_empty() {
            request = request.header(IF_NONE_MATCH, &caching_info.etag);
        }
        if !caching_info.last_modified.is_empty() {
            request = request.header(IF_MODIFIED_SINCE, &caching_info.last_modified);
        }

        let started = Instant::now();
        let response = tokio::select! {
            response = request.send() => response?,
            _ = cancel.cancelled() => {
                return Err(DownloadError::Cancelled {
                    phase: Phase::FetchRequest,
                    elapsed: started.elapsed(),
                    written: NO_BYTES_RECEIVED,
                });
            }
        };

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                debug!(%url, "origin reports not modified");
                return Ok(None);
            }
            StatusCode::OK => {}
            status => {
                return Err(DownloadError::DownloadFailed {
                    status: status.as_u16(),
                });
            }
        }

        let caching_info_out = CachingInfo {
            etag: header_value(&response, ETAG),
            last_modified: header_value(&response, LAST_MODIFIED),
        };

        let (file, temp_path) = make_destination()?.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut hasher = md5::Context::new();
        let mut written: i64 = 0;
        let mut stream = response.bytes_stream();

        let copy_started = Instant::now();
        loop {
            let next = tokio::select! {
                next = timeout(http::READ_STALL_TIMEOUT, stream.next()) => next,
                _ = cancel.cancelled() => {
                    return Err(DownloadError::Cancelled {
                        phase: Phase::CopyBody,
                        elapsed: copy_started.elapsed(),
                        written,
                    });
                }
            };
            let chunk = match next {
                Ok(Some(chunk)) => chunk?,
                Ok(None) => break,
                Err(_) => {
                    return Err(stall_error("body read stalled").into());
                }
            };
            hasher.consume(&chunk);
            timeout(http::READ_STALL_TIMEOUT, file.write_all(&chunk))
                .await
                .map_err(|_| stall_error("body write stalled"))??;
            written += chunk.len() as i64;
        }
        file.flush().await?;

        if let Some(expected) = etag_md5(&caching_info_out.etag) {
            let digest = hasher.compute();
            if digest.0 != expected {
                return Err(DownloadError::ChecksumMismatch);
            }
        }

        // Detach the temp path; ownership of the file passes to the
        // caller. Error paths above drop `temp_path`, deleting the
        // partial file.
        let path = temp_path.keep().map_err(|err| err.error)?;
        debug!(%url, bytes = written, "download complete");
        Ok(Some(DownloadedFile {
            path,
            caching_info: caching_info_out,
        }))
    }
}

fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn stall_error(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, message.to_string())
}

/// Decode an `ETag` that encodes an MD5 checksum.
///
/// Returns the digest when the tag (after trimming surrounding quotes)
/// is exactly 32 lowercase hex characters; anything else means the tag
/// is opaque and no checksum was intended.
fn etag_md5(etag: &str) -> Option<[u8; 16]> {
    let hex = etag.trim_matches('"');
    if hex.len() != 32 {
        return None;
    }
    if !hex
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return None;
    }

    let mut digest = [0u8; 16];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk).ok()?;
        digest[i] = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(digest)
}
