//! Pluggable post-download transformers
//!
//! After the downloader produces a temp file, the coordinator hands it
//! to a [`Transformer`] which moves the artifact into its final shape
//! at a destination path and reports the size that the cache should
//! account for. Two built-ins cover the spec'd shapes: an identity
//! transform for plain files and a tar expansion for directory
//! artifacts.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Post-download step applied before an artifact is admitted.
///
/// Implementations consume `source` and own `destination` on success;
/// the returned size is what the cache budget will account for.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, source: &Path, destination: &Path) -> io::Result<u64>;
}

/// Moves the downloaded file to the destination unchanged and reports
/// its size.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

#[async_trait]
impl Transformer for IdentityTransformer {
    async fn transform(&self, source: &Path, destination: &Path) -> io::Result<u64> {
        replace(source, destination).await?;
        let metadata = tokio::fs::metadata(destination).await?;
        Ok(metadata.len())
    }
}

/// Expands a tar archive into a directory at the destination and
/// reports the summed size of the expanded files.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarTransformer;

#[async_trait]
impl Transformer for TarTransformer {
    async fn transform(&self, source: &Path, destination: &Path) -> io::Result<u64> {
        // The coordinator stages destinations as temp files; the
        // expanded tree replaces the placeholder.
        match tokio::fs::remove_file(destination).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        tokio::fs::create_dir_all(destination).await?;

        let archive_path = source.to_path_buf();
        let unpack_root = destination.to_path_buf();
        let size = tokio::task::spawn_blocking(move || -> io::Result<u64> {
            let archive_file = std::fs::File::open(&archive_path)?;
            let mut archive = tar::Archive::new(archive_file);
            archive.set_preserve_permissions(true);
            archive.unpack(&unpack_root)?;
            tree_size(&unpack_root)
        })
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))??;

        tokio::fs::remove_file(source).await?;
        Ok(size)
    }
}

/// Rename `source` over `destination`, copying across filesystems when
/// rename is not possible.
async fn replace(source: &Path, destination: &Path) -> io::Result<()> {
    match tokio::fs::rename(source, destination).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(source, destination).await?;
            tokio::fs::remove_file(source).await
        }
    }
}

/// Sum of file sizes under `root`.
fn tree_size(root: &Path) -> io::Result<u64> {
    let mut total = 0;
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}
