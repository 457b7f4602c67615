//! In-memory index over the bounded on-disk cache
//!
//! The index maps fingerprints to entries, enforces the byte budget
//! with LRU eviction among unpinned entries, and tracks superseded
//! generations whose bytes must outlive their eviction because readers
//! still hold them open.
//!
//! All state lives under one mutex with short, non-async critical
//! sections; release hooks run from `Drop` implementations and must be
//! able to take the lock synchronously.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::fs::File;
use tracing::{debug, warn};

use crate::app::fingerprint::Fingerprint;
use crate::app::handle::CachedFile;
use crate::app::models::CachingInfo;
use crate::errors::{CacheError, CacheResult};

use super::entry::{CacheEntry, EntryKind};

/// LRU cache index over a byte budget.
///
/// Entries count toward the budget only while indexed; a superseded or
/// evicted generation that readers still pin occupies disk without
/// counting, and is deleted when its last reader closes. Cloning is
/// cheap and clones share state, since release hooks inside handed-out
/// read handles keep the shared state alive on their own.
#[derive(Debug, Clone)]
pub struct CacheIndex {
    inner: Arc<IndexInner>,
}

#[derive(Debug)]
struct IndexInner {
    cached_path: PathBuf,
    max_size_in_bytes: u64,
    state: Mutex<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Superseded-but-pinned generation paths and their remaining readers
    orphans: HashMap<PathBuf, usize>,
    used_bytes: u64,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

impl CacheIndex {
    pub fn new(cached_path: PathBuf, max_size_in_bytes: u64) -> Self {
        Self {
            inner: Arc::new(IndexInner {
                cached_path,
                max_size_in_bytes,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// Bytes currently counted against the budget.
    pub fn used_bytes(&self) -> u64 {
        self.inner.locked().used_bytes
    }

    /// Look up the current generation for a file entry.
    ///
    /// A hit bumps the entry's recency, pins it with one more reader,
    /// and returns a handle plus the stored validator. A miss (no
    /// entry, or the key currently holds a directory) returns `None`.
    pub fn get(&self, fingerprint: &Fingerprint) -> CacheResult<Option<(CachedFile, CachingInfo)>> {
        let (path, generation, validator) = {
            let mut state = self.inner.locked();
            let access = state.tick();
            let Some(entry) = state.entries.get_mut(fingerprint) else {
                return Ok(None);
            };
            if entry.kind != EntryKind::File {
                return Ok(None);
            }
            entry.access = access;
            entry.readers += 1;
            (
                self.inner.entry_path(fingerprint, entry.generation),
                entry.generation,
                entry.validator.clone(),
            )
        };

        match std::fs::File::open(&path) {
            Ok(file) => Ok(Some((
                self.handle(file, path, *fingerprint, generation),
                validator,
            ))),
            Err(err) => {
                self.inner.release(fingerprint, generation);
                Err(err.into())
            }
        }
    }

    /// Admit a fresh artifact under the budget.
    ///
    /// Evicts least-recently-used unpinned entries as needed; if even
    /// then the artifact cannot fit, returns [`CacheError::NotEnoughSpace`]
    /// without evicting anything. On success the source file is renamed
    /// to the next generation, any previous generation is superseded
    /// (kept on disk only while pinned), and the returned handle holds
    /// the entry's first reader reference.
    pub fn add(
        &self,
        fingerprint: &Fingerprint,
        source: &Path,
        size: u64,
        validator: CachingInfo,
    ) -> CacheResult<CachedFile> {
        let (path, generation) =
            self.inner
                .install(fingerprint, source, size, validator, EntryKind::File)?;

        match std::fs::File::open(&path) {
            Ok(file) => Ok(self.handle(file, path, *fingerprint, generation)),
            Err(err) => {
                self.inner.release(fingerprint, generation);
                Err(err.into())
            }
        }
    }

    /// Unlink the entry from the index.
    ///
    /// Bytes are deleted immediately when unpinned, otherwise on the
    /// last reader's close. Idempotent.
    pub fn remove(&self, fingerprint: &Fingerprint) {
        let mut state = self.inner.locked();
        if let Some(entry) = state.entries.remove(fingerprint) {
            state.used_bytes -= entry.size;
            let path = self.inner.entry_path(fingerprint, entry.generation);
            if entry.readers > 0 {
                debug!(%fingerprint, readers = entry.readers, "removed entry is pinned, deferring deletion");
                state.orphans.insert(path, entry.readers);
            } else {
                remove_artifact(&path);
            }
        }
    }

    /// Look up the current generation for a directory entry and pin it.
    ///
    /// The pin is released only by [`CacheIndex::close_directory`].
    pub fn get_directory(&self, fingerprint: &Fingerprint) -> Option<(PathBuf, CachingInfo)> {
        let mut state = self.inner.locked();
        let access = state.tick();
        let entry = state.entries.get_mut(fingerprint)?;
        if entry.kind != EntryKind::Directory {
            return None;
        }
        entry.access = access;
        entry.readers += 1;
        Some((
            self.inner.entry_path(fingerprint, entry.generation),
            entry.validator.clone(),
        ))
    }

    /// Admit an expanded directory tree under the budget.
    ///
    /// Same contract as [`CacheIndex::add`]; the returned path carries
    /// one pin that the caller must release via
    /// [`CacheIndex::close_directory`].
    pub fn add_directory(
        &self,
        fingerprint: &Fingerprint,
        source: &Path,
        size: u64,
        validator: CachingInfo,
    ) -> CacheResult<PathBuf> {
        let (path, _generation) =
            self.inner
                .install(fingerprint, source, size, validator, EntryKind::Directory)?;
        Ok(path)
    }

    /// Release one pin on a directory previously returned by
    /// [`CacheIndex::get_directory`] or [`CacheIndex::add_directory`].
    pub fn close_directory(&self, fingerprint: &Fingerprint, dir_path: &Path) -> CacheResult<()> {
        let mut state = self.inner.locked();
        if let Some(entry) = state.entries.get_mut(fingerprint) {
            if entry.kind == EntryKind::Directory
                && self.inner.entry_path(fingerprint, entry.generation) == dir_path
            {
                entry.readers = entry.readers.saturating_sub(1);
                return Ok(());
            }
        }
        if state.orphans.contains_key(dir_path) {
            release_orphan(&mut state, dir_path);
            return Ok(());
        }
        Err(CacheError::EntryNotFound)
    }

    fn handle(
        &self,
        file: std::fs::File,
        path: PathBuf,
        fingerprint: Fingerprint,
        generation: u64,
    ) -> CachedFile {
        let inner = Arc::clone(&self.inner);
        CachedFile::new(File::from_std(file), path, move |_| {
            inner.release(&fingerprint, generation);
        })
    }
}

impl IndexInner {
    fn locked(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry_path(&self, fingerprint: &Fingerprint, generation: u64) -> PathBuf {
        self.cached_path
            .join(format!("{}-{}", fingerprint.to_hex(), generation))
    }

    /// Decrement the reader count for a generation handed out by
    /// `get`/`add`. Runs from handle release hooks.
    fn release(&self, fingerprint: &Fingerprint, generation: u64) {
        let mut state = self.locked();
        if let Some(entry) = state.entries.get_mut(fingerprint) {
            if entry.generation == generation {
                entry.readers = entry.readers.saturating_sub(1);
                return;
            }
        }
        // The generation was superseded or evicted while this reader
        // held it open.
        let path = self.entry_path(fingerprint, generation);
        release_orphan(&mut state, &path);
    }

    /// Locked core of `add`/`add_directory`: evict, rename into place,
    /// supersede the previous generation, index the new one.
    fn install(
        &self,
        fingerprint: &Fingerprint,
        source: &Path,
        size: u64,
        validator: CachingInfo,
        kind: EntryKind,
    ) -> CacheResult<(PathBuf, u64)> {
        let mut state = self.locked();

        let victims = self.select_victims(&state, fingerprint, size)?;
        for victim in victims {
            if let Some(entry) = state.entries.remove(&victim) {
                debug!(fingerprint = %victim, size = entry.size, "evicting least-recently-used entry");
                state.used_bytes -= entry.size;
                remove_artifact(&self.entry_path(&victim, entry.generation));
            }
        }

        let generation = state
            .entries
            .get(fingerprint)
            .map(|entry| entry.generation + 1)
            .unwrap_or(1);
        let path = self.entry_path(fingerprint, generation);
        std::fs::rename(source, &path)?;

        if let Some(old) = state.entries.remove(fingerprint) {
            state.used_bytes -= old.size;
            let old_path = self.entry_path(fingerprint, old.generation);
            if old.readers > 0 {
                debug!(%fingerprint, readers = old.readers, "superseded generation is pinned, deferring deletion");
                state.orphans.insert(old_path, old.readers);
            } else {
                remove_artifact(&old_path);
            }
        }

        let access = state.tick();
        state.entries.insert(
            *fingerprint,
            CacheEntry {
                size,
                validator,
                access,
                generation,
                readers: 1,
                kind,
            },
        );
        state.used_bytes += size;

        Ok((path, generation))
    }

    /// Choose eviction victims, least recently used first, fingerprint
    /// order breaking access ties. Pinned entries and the entry being
    /// replaced are never victims. Errs with `NotEnoughSpace` (and no
    /// victims chosen) when even a full sweep would not fit `size`.
    fn select_victims(
        &self,
        state: &CacheState,
        replacing: &Fingerprint,
        size: u64,
    ) -> CacheResult<Vec<Fingerprint>> {
        let replaced = state
            .entries
            .get(replacing)
            .map(|entry| entry.size)
            .unwrap_or(0);
        let mut remaining = state.used_bytes - replaced;
        if remaining + size <= self.max_size_in_bytes {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<(u64, Fingerprint, u64)> = state
            .entries
            .iter()
            .filter(|(fp, entry)| *fp != replacing && entry.readers == 0)
            .map(|(fp, entry)| (entry.access, *fp, entry.size))
            .collect();
        candidates.sort();

        let mut victims = Vec::new();
        for (_, fingerprint, victim_size) in candidates {
            victims.push(fingerprint);
            remaining -= victim_size;
            if remaining + size <= self.max_size_in_bytes {
                return Ok(victims);
            }
        }
        Err(CacheError::NotEnoughSpace)
    }
}

fn release_orphan(state: &mut CacheState, path: &Path) {
    if let Some(count) = state.orphans.get_mut(path) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            state.orphans.remove(path);
            remove_artifact(path);
        }
    }
}

fn remove_artifact(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(err) = result {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to delete cached artifact");
        }
    }
}
