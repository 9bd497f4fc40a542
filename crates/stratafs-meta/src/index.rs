//! Persistent space index
//!
//! A two-level directory of small maps: `root/group/{index}.mpk`, each file
//! one encoded map of string keys to byte values. The file is the unit of
//! locking and atomicity: updates serialize on an exclusive companion
//! lockfile and commit through the atomic writer; reads take the shared
//! lock and are served through an mtime-keyed snapshot cache.

use crate::atomic;
use crate::cache::MtimeCache;
use crate::codec;
use crate::lockfile::{LockedFile, LOCK_FILE_SUFFIX};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratafs_common::{AttrMap, Result, META_FILE_MODE};
use tracing::debug;

/// Extension of index files.
pub const INDEX_FILE_EXT: &str = "mpk";

/// A group of persistent indexes below one root directory.
pub struct SpaceIndex {
    root: PathBuf,
    group: String,
    cache: MtimeCache<String, AttrMap>,
}

impl SpaceIndex {
    /// Create an index handle for `root/group`. Nothing is touched on disk
    /// until the first update.
    pub fn new(root: impl Into<PathBuf>, group: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            group: group.into(),
            cache: MtimeCache::new(),
        }
    }

    /// Read the map stored in `index`.
    ///
    /// The returned snapshot is shared with the cache; it is valid for the
    /// file mtime observed at call time and replaced on the next change.
    pub fn load(&self, index: &str) -> Result<Arc<AttrMap>> {
        let path = self.index_path(index);
        let mtime = fs::metadata(&path)?.modified()?;

        let cache_key = format!("{}:{}", self.group, index);
        self.cache.load_or_store(cache_key, mtime, || {
            let _lock = LockedFile::open_shared(lock_path(&path))?;
            let bytes = fs::read(&path)?;
            codec::decode(&bytes)
        })
    }

    /// Insert or overwrite one entry.
    pub fn add(&self, index: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut add_links = AttrMap::new();
        add_links.insert(key.to_string(), value.to_vec());
        self.update(index, add_links, &[])
    }

    /// Remove one entry.
    pub fn remove(&self, index: &str, key: &str) -> Result<()> {
        self.update(index, AttrMap::new(), &[key.to_string()])
    }

    /// Apply a batch of removals and additions to `index`.
    ///
    /// The whole read-modify-write cycle runs under the exclusive companion
    /// lock; the rewrite itself goes through the atomic writer, so readers
    /// and crashes only ever see complete index files. An absent file is an
    /// empty map.
    pub fn update(&self, index: &str, add_links: AttrMap, remove_links: &[String]) -> Result<()> {
        let path = self.index_path(index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _lock = LockedFile::open_exclusive(lock_path(&path))?;

        let mut links = match fs::read(&path) {
            Ok(bytes) => codec::decode(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AttrMap::new(),
            Err(e) => return Err(e.into()),
        };

        for key in remove_links {
            links.remove(key);
        }
        for (key, val) in add_links {
            links.insert(key, val);
        }

        atomic::write_atomic(&path, &codec::encode(&links)?, META_FILE_MODE)?;
        debug!(
            group = %self.group,
            index = %index,
            entries = links.len(),
            "rewrote index"
        );
        Ok(())
    }

    fn index_path(&self, index: &str) -> PathBuf {
        self.root
            .join(&self.group)
            .join(format!("{}.{}", index, INDEX_FILE_EXT))
    }
}

fn lock_path(index_path: &Path) -> PathBuf {
    let mut os = index_path.as_os_str().to_os_string();
    os.push(LOCK_FILE_SUFFIX);
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_add_remove_load() {
        let dir = tempdir().unwrap();
        let index = SpaceIndex::new(dir.path(), "by_owner");

        index.add("by_owner", "u1", b"v1").unwrap();
        index.add("by_owner", "u2", b"v2").unwrap();
        index.remove("by_owner", "u1").unwrap();

        let loaded = index.load("by_owner").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["u2"], b"v2".to_vec());
    }

    #[test]
    fn test_load_missing_index_fails() {
        let dir = tempdir().unwrap();
        let index = SpaceIndex::new(dir.path(), "by_owner");
        assert!(index.load("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_add_overwrites_existing_entry() {
        let dir = tempdir().unwrap();
        let index = SpaceIndex::new(dir.path(), "by_owner");

        index.add("links", "u1", b"old").unwrap();
        index.add("links", "u1", b"new").unwrap();

        let loaded = index.load("links").unwrap();
        assert_eq!(loaded["u1"], b"new".to_vec());
    }

    #[test]
    fn test_load_serves_snapshot_until_mtime_changes() {
        let dir = tempdir().unwrap();
        let index = SpaceIndex::new(dir.path(), "by_owner");
        index.add("links", "u1", b"v1").unwrap();

        let first = index.load("links").unwrap();
        let second = index.load("links").unwrap();
        // Unchanged mtime: same cached snapshot, no re-read
        assert!(Arc::ptr_eq(&first, &second));

        index.add("links", "u2", b"v2").unwrap();
        let third = index.load("links").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.len(), 2);
    }

    #[test]
    fn test_groups_are_isolated() {
        let dir = tempdir().unwrap();
        let by_owner = SpaceIndex::new(dir.path(), "by_owner");
        let by_type = SpaceIndex::new(dir.path(), "by_type");

        by_owner.add("links", "u1", b"v1").unwrap();
        by_type.add("links", "u1", b"other").unwrap();

        assert_eq!(by_owner.load("links").unwrap()["u1"], b"v1".to_vec());
        assert_eq!(by_type.load("links").unwrap()["u1"], b"other".to_vec());
        assert!(dir.path().join("by_owner/links.mpk").exists());
        assert!(dir.path().join("by_type/links.mpk").exists());
    }

    #[test]
    fn test_concurrent_updates_serialize() {
        let dir = tempdir().unwrap();
        let index = Arc::new(SpaceIndex::new(dir.path(), "by_owner"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for j in 0..4 {
                        let key = format!("u{}-{}", i, j);
                        index.add("links", &key, b"v").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let loaded = index.load("links").unwrap();
        assert_eq!(loaded.len(), 32);
    }

    #[test]
    fn test_update_batch() {
        let dir = tempdir().unwrap();
        let index = SpaceIndex::new(dir.path(), "by_owner");
        index.add("links", "gone", b"x").unwrap();

        let mut add_links = AttrMap::new();
        add_links.insert("a".into(), b"1".to_vec());
        add_links.insert("b".into(), b"2".to_vec());
        index
            .update("links", add_links, &["gone".to_string()])
            .unwrap();

        let loaded = index.load("links").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["a"], b"1".to_vec());
        assert_eq!(loaded["b"], b"2".to_vec());
    }
}
