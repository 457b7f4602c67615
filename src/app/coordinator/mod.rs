//! Fetch orchestration
//!
//! The coordinator owns the public fetch surface. A fetch acquires the
//! per-key single-flight gate, probes the cache for the current
//! validator, performs a conditional download, applies the transformer,
//! and installs the result — falling back to an uncached delete-on-close
//! handle when the artifact cannot be admitted.
//!
//! # Module Organization
//!
//! - [`config`] - constructor parameters
//! - [`gate`] - per-fingerprint single-flight gate
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use artifact_fetcher::app::{CachedFetcher, FetcherConfig, IdentityTransformer};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! # async fn example() -> artifact_fetcher::errors::Result<()> {
//! let config = FetcherConfig::new("/var/cache/artifacts", "/var/cache/artifacts-tmp");
//! let fetcher = CachedFetcher::new(config, Arc::new(IdentityTransformer))?;
//!
//! let url = Url::parse("https://artifacts.example.com/layer.tgz").expect("static url");
//! let (handle, size) = fetcher.fetch(&url, "layer-v3", &CancellationToken::new()).await?;
//! println!("have {size} bytes at {}", handle.path().display());
//! handle.close();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub(crate) mod gate;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::app::cache::CacheIndex;
use crate::app::downloader::Downloader;
use crate::app::fingerprint::Fingerprint;
use crate::app::handle::CachedFile;
use crate::app::models::CachingInfo;
use crate::app::transform::{TarTransformer, Transformer};
use crate::constants::files;
use crate::errors::{CacheError, CacheResult, DownloadError, Result};

pub use config::FetcherConfig;

use gate::SingleFlight;

/// Content cache with a coordinated conditional downloader.
///
/// Shared across concurrent callers; all operations take `&self`.
pub struct CachedFetcher {
    downloader: Downloader,
    cache: CacheIndex,
    uncached_path: PathBuf,
    transformer: Arc<dyn Transformer>,
    flights: SingleFlight,
}

/// Result of one download-and-transform round.
struct Populated {
    path: PathBuf,
    transformed_size: u64,
    downloaded_size: u64,
    caching_info: CachingInfo,
}

impl CachedFetcher {
    /// Build the fetcher, wiping and recreating the cache directory.
    ///
    /// There is no persistent index, so stale artifacts on disk would
    /// be unreachable; the cache directory is recreated empty (mode
    /// 0770 on unix) and the uncached directory is created if missing.
    pub fn new(config: FetcherConfig, transformer: Arc<dyn Transformer>) -> Result<Self> {
        bootstrap(&config.cached_path, &config.uncached_path)?;
        let downloader = Downloader::new(
            config.download_timeout,
            config.max_concurrent_downloads,
            config.skip_ssl_verification,
        )?;
        info!(
            cached = %config.cached_path.display(),
            uncached = %config.uncached_path.display(),
            budget = config.max_size_in_bytes,
            "initialized artifact fetcher"
        );
        Ok(Self {
            downloader,
            cache: CacheIndex::new(config.cached_path, config.max_size_in_bytes),
            uncached_path: config.uncached_path,
            transformer,
            flights: SingleFlight::default(),
        })
    }

    /// Bytes currently admitted to the cache.
    pub fn cached_bytes(&self) -> u64 {
        self.cache.used_bytes()
    }

    /// Fetch the artifact at `url`, returning a readable handle and the
    /// downloaded byte count.
    ///
    /// Identity is the caller-supplied `cache_key` alone — the URL is
    /// not part of it, so two URLs fetched under one key collide and
    /// the most recent wins. An empty key skips the cache entirely and
    /// returns a delete-on-close handle.
    ///
    /// A size of `0` means the origin revalidated the cached entry
    /// (`304 Not Modified`) and the handle reads the previously cached
    /// bytes.
    pub async fn fetch(
        &self,
        url: &Url,
        cache_key: &str,
        cancel: &CancellationToken,
    ) -> Result<(CachedFile, u64)> {
        if cache_key.is_empty() {
            return self.fetch_uncached(url, cancel).await;
        }
        self.fetch_cached(url, Fingerprint::from_key(cache_key), cancel)
            .await
    }

    /// Fetch the tar artifact at `url` and return the path of its
    /// expanded directory tree.
    ///
    /// The directory stays pinned until the caller passes the same
    /// `cache_key` and path to [`CachedFetcher::close_directory`];
    /// every successful call must be paired with one close. Unlike
    /// [`CachedFetcher::fetch`] there is no uncached fallback:
    /// responses that do not fit return
    /// [`CacheError::NotEnoughSpace`] and responses without validators
    /// return [`CacheError::NotCacheable`].
    pub async fn fetch_as_directory(
        &self,
        url: &Url,
        cache_key: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let fingerprint = Fingerprint::from_key(cache_key);
        let _flight = self.flights.acquire(fingerprint, cancel).await?;

        let (current_dir, current_info) = match self.cache.get_directory(&fingerprint) {
            Some((dir, info)) => (Some(dir), info),
            None => (None, CachingInfo::default()),
        };

        let populated = match self
            .populate(
                url,
                &format!("{}-", fingerprint.to_hex()),
                &current_info,
                &TarTransformer,
                cancel,
            )
            .await
        {
            Ok(populated) => populated,
            Err(err) => {
                if let Some(dir) = current_dir {
                    let _ = self.cache.close_directory(&fingerprint, &dir);
                }
                return Err(err);
            }
        };

        let Some(populated) = populated else {
            // Origin revalidated the cached tree.
            return current_dir.ok_or_else(|| CacheError::EntryNotFound.into());
        };

        if let Some(dir) = current_dir {
            let _ = self.cache.close_directory(&fingerprint, &dir);
        }

        if populated.caching_info.is_cacheable() {
            match self.cache.add_directory(
                &fingerprint,
                &populated.path,
                populated.transformed_size,
                populated.caching_info,
            ) {
                Ok(dir) => Ok(dir),
                Err(err) => {
                    remove_tree_best_effort(&populated.path);
                    Err(err.into())
                }
            }
        } else {
            self.cache.remove(&fingerprint);
            remove_tree_best_effort(&populated.path);
            Err(CacheError::NotCacheable.into())
        }
    }

    /// Release the pin taken by a successful
    /// [`CachedFetcher::fetch_as_directory`].
    pub fn close_directory(&self, cache_key: &str, dir_path: &Path) -> CacheResult<()> {
        self.cache
            .close_directory(&Fingerprint::from_key(cache_key), dir_path)
    }

    async fn fetch_uncached(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<(CachedFile, u64)> {
        let populated = self
            .populate(
                url,
                files::UNCACHED_PREFIX,
                &CachingInfo::default(),
                self.transformer.as_ref(),
                cancel,
            )
            .await?;
        let Some(populated) = populated else {
            // A 304 with no validator to match is an origin defect.
            return Err(DownloadError::DownloadFailed { status: 304 }.into());
        };
        uncached_handle(populated.path, populated.downloaded_size)
    }

    async fn fetch_cached(
        &self,
        url: &Url,
        fingerprint: Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<(CachedFile, u64)> {
        let _flight = self.flights.acquire(fingerprint, cancel).await?;

        let (current_handle, current_info) = match self.cache.get(&fingerprint)? {
            Some((handle, info)) => (Some(handle), info),
            None => (None, CachingInfo::default()),
        };

        let populated = match self
            .populate(
                url,
                &format!("{}-", fingerprint.to_hex()),
                &current_info,
                self.transformer.as_ref(),
                cancel,
            )
            .await
        {
            Ok(populated) => populated,
            Err(err) => {
                if let Some(handle) = current_handle {
                    handle.close();
                }
                return Err(err);
            }
        };

        let Some(populated) = populated else {
            // Origin revalidated; the probe handle is the result.
            return match current_handle {
                Some(handle) => Ok((handle, 0)),
                None => Err(CacheError::EntryNotFound.into()),
            };
        };

        // Fresh bytes supersede whatever the probe was holding.
        if let Some(handle) = current_handle {
            handle.close();
        }

        if populated.caching_info.is_cacheable() {
            match self.cache.add(
                &fingerprint,
                &populated.path,
                populated.transformed_size,
                populated.caching_info,
            ) {
                Ok(handle) => Ok((handle, populated.downloaded_size)),
                Err(CacheError::NotEnoughSpace) => {
                    debug!(%fingerprint, "artifact does not fit the cache, serving uncached");
                    uncached_handle(populated.path, populated.downloaded_size)
                }
                Err(err) => {
                    remove_file_best_effort(&populated.path);
                    Err(err.into())
                }
            }
        } else {
            // The origin stopped serving validators; purge the stale
            // entry so it cannot revalidate against dead state.
            self.cache.remove(&fingerprint);
            uncached_handle(populated.path, populated.downloaded_size)
        }
    }

    /// Download with the given validator and run the transformer,
    /// staging both steps in the uncached directory. `Ok(None)` means
    /// the origin answered `304 Not Modified`.
    async fn populate(
        &self,
        url: &Url,
        temp_prefix: &str,
        caching_info: &CachingInfo,
        transformer: &dyn Transformer,
        cancel: &CancellationToken,
    ) -> Result<Option<Populated>> {
        let destination_dir = self.uncached_path.clone();
        let prefix = temp_prefix.to_string();
        let make_destination = move || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .tempfile_in(&destination_dir)
        };

        let downloaded = self
            .downloader
            .download(url, make_destination, caching_info, cancel)
            .await?;
        let Some(downloaded) = downloaded else {
            return Ok(None);
        };

        let downloaded_size = match tokio::fs::metadata(&downloaded.path).await {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                remove_file_best_effort(&downloaded.path);
                return Err(err.into());
            }
        };

        let staged = tempfile::Builder::new()
            .prefix(files::TRANSFORMED_PREFIX)
            .tempfile_in(&self.uncached_path)
            .map_err(|err| {
                remove_file_best_effort(&downloaded.path);
                err
            })?;
        let staged_path = match staged.into_temp_path().keep() {
            Ok(path) => path,
            Err(err) => {
                remove_file_best_effort(&downloaded.path);
                return Err(err.error.into());
            }
        };

        match transformer.transform(&downloaded.path, &staged_path).await {
            Ok(transformed_size) => Ok(Some(Populated {
                path: staged_path,
                transformed_size,
                downloaded_size,
                caching_info: downloaded.caching_info,
            })),
            Err(err) => {
                remove_file_best_effort(&downloaded.path);
                remove_tree_best_effort(&staged_path);
                Err(err.into())
            }
        }
    }
}

fn uncached_handle(path: PathBuf, size: u64) -> Result<(CachedFile, u64)> {
    match CachedFile::remove_on_close(path.clone()) {
        Ok(handle) => Ok((handle, size)),
        Err(err) => {
            remove_file_best_effort(&path);
            Err(err.into())
        }
    }
}

fn remove_file_best_effort(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to clean up temp file");
        }
    }
}

/// Remove a transformer staging path that may be a file or an already
/// expanded directory.
fn remove_tree_best_effort(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(err) = result {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to clean up staged artifact");
        }
    }
}

fn bootstrap(cached_path: &Path, uncached_path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(cached_path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    create_cache_dir(cached_path)?;
    std::fs::create_dir_all(uncached_path)
}

#[cfg(unix)]
fn create_cache_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(files::CACHED_DIR_MODE)
        .create(path)
}

#[cfg(not(unix))]
fn create_cache_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}
