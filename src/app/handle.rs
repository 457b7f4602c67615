//! Read handles with release-on-close hooks
//!
//! Every byte-stream result of a fetch is a [`CachedFile`]: an async
//! reader over an on-disk file that runs a release hook exactly once
//! when the handle is closed or dropped. For uncached results the hook
//! deletes the temp file; for cached results it decrements the entry's
//! refcount so the index can unpin (and possibly delete) the
//! generation.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};

/// Hook invoked exactly once when the handle is released.
type ReleaseHook = Box<dyn FnOnce(&Path) + Send>;

/// A sequential read handle over an on-disk artifact.
///
/// While the handle is open, the backing bytes are guaranteed to stay
/// on disk and byte-identical, regardless of intervening cache
/// replacements or evictions. Closing consumes the handle, so a double
/// close is unrepresentable; dropping an unclosed handle runs the same
/// release hook.
pub struct CachedFile {
    file: File,
    path: PathBuf,
    release: Option<ReleaseHook>,
}

impl CachedFile {
    pub(crate) fn new(
        file: File,
        path: PathBuf,
        release: impl FnOnce(&Path) + Send + 'static,
    ) -> Self {
        Self {
            file,
            path,
            release: Some(Box::new(release)),
        }
    }

    /// Open `path` and wrap it in a handle that deletes the file on
    /// close. Used for uncached results and `NotEnoughSpace` fallbacks.
    pub(crate) fn remove_on_close(path: PathBuf) -> std::io::Result<Self> {
        let file = std::fs::File::open(&path)?;
        Ok(Self::new(File::from_std(file), path, |p| {
            if let Err(err) = std::fs::remove_file(p) {
                tracing::warn!(path = %p.display(), error = %err, "failed to remove temp file on close");
            }
        }))
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the handle, running its hook.
    pub fn close(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release(&self.path);
        }
    }
}

impl Drop for CachedFile {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl AsyncRead for CachedFile {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

impl std::fmt::Debug for CachedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedFile")
            .field("path", &self.path)
            .field("released", &self.release.is_none())
            .finish()
    }
}
