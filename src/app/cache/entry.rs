//! Cache entry bookkeeping types

use crate::app::models::CachingInfo;

/// Shape of the on-disk artifact behind an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A single file, handed out as a read handle.
    File,
    /// An expanded directory tree, handed out as a path and released
    /// explicitly via `close_directory`.
    Directory,
}

/// In-memory record for one cache key.
///
/// The on-disk artifact lives at `<fingerprint>-<generation>`; the
/// generation increments on every replacement so readers of a
/// superseded generation keep stable bytes.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    /// Bytes this entry counts against the budget (post-transform size;
    /// for directories, the sum of file sizes in the tree)
    pub size: u64,
    /// Validator stored for conditional revalidation
    pub validator: CachingInfo,
    /// Monotonic access stamp; smallest is least recently used
    pub access: u64,
    /// Current generation number
    pub generation: u64,
    /// Open readers (file handles, or unreleased directory pins) on the
    /// current generation; non-zero pins the entry against eviction
    pub readers: usize,
    pub kind: EntryKind,
}
