//! Unit tests for the cache index
//!
//! These exercise the index contracts directly against a temp
//! directory, without HTTP: budget enforcement, LRU victim choice,
//! pinning, generation-safe replacement, and the directory variants.

use std::path::PathBuf;

use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use crate::app::fingerprint::Fingerprint;
use crate::app::models::CachingInfo;
use crate::errors::CacheError;

use super::CacheIndex;

struct Fixture {
    cached: TempDir,
    staging: TempDir,
    index: CacheIndex,
}

impl Fixture {
    fn new(max_size_in_bytes: u64) -> Self {
        let cached = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let index = CacheIndex::new(cached.path().to_path_buf(), max_size_in_bytes);
        Self {
            cached,
            staging,
            index,
        }
    }

    /// Stage a source file the way the coordinator's transformer would.
    fn stage(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.staging.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn stage_tree(&self, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let root = self.staging.path().join(name);
        std::fs::create_dir_all(&root).unwrap();
        for (file, contents) in files {
            std::fs::write(root.join(file), contents).unwrap();
        }
        root
    }

    fn cached_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.cached.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn validator(etag: &str) -> CachingInfo {
    CachingInfo {
        etag: etag.to_string(),
        last_modified: String::new(),
    }
}

#[tokio::test]
async fn add_then_get_round_trips_bytes_and_validator() {
    let fx = Fixture::new(1024);
    let fp = Fingerprint::from_key("round-trip");
    let source = fx.stage("source", b"cached bytes");

    let handle = fx
        .index
        .add(&fp, &source, 12, validator("\"abc\""))
        .unwrap();
    assert!(!source.exists(), "source must be renamed into the cache");
    handle.close();

    let (mut handle, info) = fx.index.get(&fp).unwrap().expect("entry must be present");
    assert_eq!(info, validator("\"abc\""));
    let mut contents = Vec::new();
    handle.read_to_end(&mut contents).await.unwrap();
    assert_eq!(contents, b"cached bytes");
    handle.close();
}

#[tokio::test]
async fn miss_returns_none() {
    let fx = Fixture::new(1024);
    let fp = Fingerprint::from_key("absent");
    assert!(fx.index.get(&fp).unwrap().is_none());
}

#[tokio::test]
async fn pinned_entries_are_never_evicted() {
    let fx = Fixture::new(100);
    let fp_a = Fingerprint::from_key("A");
    let fp_b = Fingerprint::from_key("B");

    let source_a = fx.stage("a", &[b'a'; 60]);
    let handle_a = fx.index.add(&fp_a, &source_a, 60, validator("a")).unwrap();

    // A is pinned by handle_a, so B cannot fit.
    let source_b = fx.stage("b", &[b'b'; 60]);
    let err = fx
        .index
        .add(&fp_b, &source_b, 60, validator("b"))
        .unwrap_err();
    assert!(matches!(err, CacheError::NotEnoughSpace));
    assert!(source_b.exists(), "rejected source must be left in place");
    assert_eq!(fx.index.used_bytes(), 60);

    // Unpin A; now B's admission evicts it.
    handle_a.close();
    fx.index.add(&fp_b, &source_b, 60, validator("b")).unwrap();
    assert!(fx.index.get(&fp_a).unwrap().is_none());
    assert_eq!(fx.index.used_bytes(), 60);
}

#[tokio::test]
async fn eviction_is_least_recently_used_first() {
    let fx = Fixture::new(1024);
    let keys = ["C", "A", "B"];
    for key in keys {
        let fp = Fingerprint::from_key(key);
        let source = fx.stage(key, &[b'x'; 256]);
        fx.index.add(&fp, &source, 256, validator(key)).unwrap().close();
    }

    // Refresh C's recency; A and B are now the two oldest.
    let (handle, _) = fx
        .index
        .get(&Fingerprint::from_key("C"))
        .unwrap()
        .expect("C cached");
    handle.close();

    let source = fx.stage("D", &[b'd'; 513]);
    fx.index
        .add(&Fingerprint::from_key("D"), &source, 513, validator("D"))
        .unwrap()
        .close();

    assert!(fx.index.get(&Fingerprint::from_key("A")).unwrap().is_none());
    assert!(fx.index.get(&Fingerprint::from_key("B")).unwrap().is_none());
    assert!(fx.index.get(&Fingerprint::from_key("C")).unwrap().is_some());
    assert!(fx.index.get(&Fingerprint::from_key("D")).unwrap().is_some());
}

#[tokio::test]
async fn replacement_keeps_old_generation_for_open_readers() {
    let fx = Fixture::new(1024);
    let fp = Fingerprint::from_key("generations");

    let v1 = fx.stage("v1", b"first generation");
    fx.index.add(&fp, &v1, 16, validator("g1")).unwrap().close();

    let (mut reader, _) = fx.index.get(&fp).unwrap().expect("cached");

    let v2 = fx.stage("v2", b"second generation");
    let new_handle = fx.index.add(&fp, &v2, 17, validator("g2")).unwrap();
    new_handle.close();

    // Both generations are on disk while the old reader lives.
    assert_eq!(fx.cached_names().len(), 2);
    // Only the new generation counts against the budget.
    assert_eq!(fx.index.used_bytes(), 17);

    let mut contents = Vec::new();
    reader.read_to_end(&mut contents).await.unwrap();
    assert_eq!(contents, b"first generation");
    reader.close();

    // Last pre-replacement reader closed: the old generation is gone.
    let names = fx.cached_names();
    assert_eq!(names, vec![format!("{}-2", fp.to_hex())]);
}

#[tokio::test]
async fn remove_defers_deletion_while_pinned() {
    let fx = Fixture::new(1024);
    let fp = Fingerprint::from_key("removed");
    let source = fx.stage("src", b"bytes");
    fx.index.add(&fp, &source, 5, validator("e")).unwrap().close();

    let (handle, _) = fx.index.get(&fp).unwrap().expect("cached");
    fx.index.remove(&fp);
    fx.index.remove(&fp); // idempotent

    assert!(fx.index.get(&fp).unwrap().is_none());
    assert_eq!(fx.index.used_bytes(), 0);
    assert_eq!(fx.cached_names().len(), 1, "pinned bytes must persist");

    handle.close();
    assert!(fx.cached_names().is_empty());
}

#[tokio::test]
async fn oversize_artifact_is_rejected_without_state_change() {
    let fx = Fixture::new(100);
    let fp_a = Fingerprint::from_key("resident");
    let source_a = fx.stage("a", &[b'a'; 40]);
    fx.index.add(&fp_a, &source_a, 40, validator("a")).unwrap().close();

    let fp_big = Fingerprint::from_key("big");
    let source_big = fx.stage("big", &[b'b'; 300]);
    let err = fx
        .index
        .add(&fp_big, &source_big, 300, validator("big"))
        .unwrap_err();
    assert!(matches!(err, CacheError::NotEnoughSpace));

    // The resident entry survived the failed admission.
    assert!(fx.index.get(&fp_a).unwrap().is_some());
    assert_eq!(fx.index.used_bytes(), 40);
}

#[tokio::test]
async fn directory_lifecycle_pins_and_releases() {
    let fx = Fixture::new(1024);
    let fp = Fingerprint::from_key("tree");
    let tree = fx.stage_tree("tree", &[("one", b"11"), ("two", b"222")]);

    let dir = fx.index.add_directory(&fp, &tree, 5, validator("t")).unwrap();
    assert!(dir.is_dir());
    assert_eq!(std::fs::read(dir.join("two")).unwrap(), b"222");

    // A second caller pins it again.
    let (dir_again, info) = fx.index.get_directory(&fp).expect("cached");
    assert_eq!(dir_again, dir);
    assert_eq!(info, validator("t"));

    fx.index.close_directory(&fp, &dir).unwrap();
    fx.index.close_directory(&fp, &dir).unwrap();

    // Unpinned now, so a big admission can evict the tree.
    let source = fx.stage("file", &[b'f'; 1024]);
    fx.index
        .add(&Fingerprint::from_key("file"), &source, 1024, validator("f"))
        .unwrap()
        .close();
    assert!(fx.index.get_directory(&fp).is_none());
    assert!(!dir.exists());
}

#[tokio::test]
async fn superseded_directory_survives_until_closed() {
    let fx = Fixture::new(1024);
    let fp = Fingerprint::from_key("tree-gen");

    let v1 = fx.stage_tree("v1", &[("data", b"old")]);
    let dir_v1 = fx.index.add_directory(&fp, &v1, 3, validator("1")).unwrap();

    let v2 = fx.stage_tree("v2", &[("data", b"new")]);
    let dir_v2 = fx.index.add_directory(&fp, &v2, 3, validator("2")).unwrap();

    assert_ne!(dir_v1, dir_v2);
    assert_eq!(std::fs::read(dir_v1.join("data")).unwrap(), b"old");
    assert_eq!(std::fs::read(dir_v2.join("data")).unwrap(), b"new");

    fx.index.close_directory(&fp, &dir_v1).unwrap();
    assert!(!dir_v1.exists());
    assert!(dir_v2.exists());

    fx.index.close_directory(&fp, &dir_v2).unwrap();
}

#[tokio::test]
async fn close_directory_rejects_unknown_paths() {
    let fx = Fixture::new(1024);
    let fp = Fingerprint::from_key("nope");
    let err = fx
        .index
        .close_directory(&fp, &fx.cached.path().join("made-up"))
        .unwrap_err();
    assert!(matches!(err, CacheError::EntryNotFound));
}

#[tokio::test]
async fn file_lookup_ignores_directory_entries() {
    let fx = Fixture::new(1024);
    let fp = Fingerprint::from_key("mixed");
    let tree = fx.stage_tree("tree", &[("data", b"d")]);
    let dir = fx.index.add_directory(&fp, &tree, 1, validator("t")).unwrap();
    fx.index.close_directory(&fp, &dir).unwrap();

    assert!(fx.index.get(&fp).unwrap().is_none());
    assert!(fx.index.get_directory(&fp).is_some());
}
