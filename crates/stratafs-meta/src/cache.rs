//! Caches for the metadata core
//!
//! Two distinct caching contracts live here:
//!
//! - [`MtimeCache`]: an mtime-keyed snapshot cache used by the space index.
//!   An entry is valid exactly as long as the caller-observed file mtime
//!   matches the stored one; per-key slot locks coalesce concurrent loads.
//! - [`AttributeCache`]: the write-through capability consumed by the hybrid
//!   backend. It is not mtime-keyed; the backend keeps it coherent by
//!   pushing the merged view after every mutation.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use stratafs_common::{AttrMap, CacheConfig, Result};

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of entries evicted
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

/// Per-key slot of an [`MtimeCache`].
struct Slot<V> {
    state: Mutex<Option<(SystemTime, Arc<V>)>>,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }
}

/// Snapshot cache keyed by (key, mtime).
///
/// `load_or_store` returns the cached value iff the stored mtime equals the
/// given one exactly; otherwise the loader runs and replaces the entry.
/// The mtime is whatever the caller observed on the backing file; the cache
/// itself never stats anything. At most one loader runs per key at a time.
pub struct MtimeCache<K, V> {
    slots: Mutex<HashMap<K, Arc<Slot<V>>>>,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V> MtimeCache<K, V> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    /// Return the cached value for `key` if it was loaded at `mtime`,
    /// otherwise run `loader` and store its result.
    ///
    /// Concurrent calls for the same key serialize on the key's slot, so a
    /// value is loaded once per mtime change, not once per caller. A failed
    /// load leaves the previous entry in place.
    pub fn load_or_store<F>(&self, key: K, mtime: SystemTime, loader: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key).or_insert_with(|| Arc::new(Slot::new())))
        };

        let mut state = slot.state.lock();
        if let Some((cached_mtime, value)) = state.as_ref() {
            if *cached_mtime == mtime {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(value));
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let value = Arc::new(loader()?);
        *state = Some((mtime, Arc::clone(&value)));
        Ok(value)
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl<K: Eq + Hash + Clone, V> Default for MtimeCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Write-through cache capability consumed by the hybrid backend.
///
/// Keys are node identities (`"{space_id}/{node_id}"`), values are merged
/// attribute views. Implementations may be local, remote or no-op; the
/// backend trusts them only between its own invalidation points.
pub trait AttributeCache: Send + Sync {
    /// Fetch the merged attribute view for `key`, if cached.
    fn pull(&self, key: &str) -> Option<AttrMap>;
    /// Store the merged attribute view for `key`.
    fn push(&self, key: &str, attribs: &AttrMap) -> Result<()>;
    /// Drop the entry for `key`.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Entry of the in-memory attribute cache with LRU tracking
struct AttrEntry {
    attribs: AttrMap,
    last_access: AtomicU64,
}

/// In-memory LRU implementation of [`AttributeCache`]
pub struct InMemoryAttributeCache {
    entries: RwLock<HashMap<String, AttrEntry>>,
    /// Maximum number of entries (0 = unbounded)
    capacity: usize,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    stats: CacheStats,
}

impl InMemoryAttributeCache {
    /// Create a cache bounded to `capacity` entries (0 = unbounded)
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    /// Create a cache from configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity)
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Current number of entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn evict_lru(&self, entries: &mut HashMap<String, AttrEntry>) {
        let lru = entries
            .iter()
            .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
            .map(|(k, _)| k.clone());
        if let Some(key) = lru {
            entries.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl AttributeCache for InMemoryAttributeCache {
    fn pull(&self, key: &str) -> Option<AttrMap> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) => {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.attribs.clone())
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn push(&self, key: &str, attribs: &AttrMap) -> Result<()> {
        let mut entries = self.entries.write();
        while self.capacity > 0 && !entries.contains_key(key) && entries.len() >= self.capacity {
            self.evict_lru(&mut entries);
        }
        entries.insert(
            key.to_string(),
            AttrEntry {
                attribs: attribs.clone(),
                last_access: AtomicU64::new(self.tick()),
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// A cache that stores nothing. Every `pull` is a miss.
pub struct NoopAttributeCache;

impl AttributeCache for NoopAttributeCache {
    fn pull(&self, _key: &str) -> Option<AttrMap> {
        None
    }

    fn push(&self, _key: &str, _attribs: &AttrMap) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn attribs(pairs: &[(&str, &[u8])]) -> AttrMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn test_mtime_cache_serves_snapshot_for_same_mtime() {
        let cache: MtimeCache<String, u64> = MtimeCache::new();
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let loads = AtomicUsize::new(0);

        let load = |v: u64| {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(v)
        };

        let a = cache
            .load_or_store("k".to_string(), mtime, || load(1))
            .unwrap();
        let b = cache
            .load_or_store("k".to_string(), mtime, || load(2))
            .unwrap();

        assert_eq!(*a, 1);
        assert_eq!(*b, 1);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_mtime_cache_reloads_on_mtime_change() {
        let cache: MtimeCache<String, u64> = MtimeCache::new();
        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t2 = t1 + Duration::from_nanos(1);

        let a = cache.load_or_store("k".to_string(), t1, || Ok(1)).unwrap();
        let b = cache.load_or_store("k".to_string(), t2, || Ok(2)).unwrap();

        assert_eq!(*a, 1);
        assert_eq!(*b, 2);
    }

    #[test]
    fn test_mtime_cache_failed_load_keeps_previous_entry() {
        let cache: MtimeCache<String, u64> = MtimeCache::new();
        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t2 = t1 + Duration::from_secs(1);

        cache.load_or_store("k".to_string(), t1, || Ok(1)).unwrap();
        let err = cache.load_or_store("k".to_string(), t2, || {
            Err(stratafs_common::Error::Codec("boom".into()))
        });
        assert!(err.is_err());

        // The t1 snapshot is still served
        let v = cache
            .load_or_store("k".to_string(), t1, || Ok(99))
            .unwrap();
        assert_eq!(*v, 1);
    }

    #[test]
    fn test_mtime_cache_coalesces_concurrent_loads() {
        let cache: Arc<MtimeCache<String, u64>> = Arc::new(MtimeCache::new());
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        let loads = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let loads = Arc::clone(&loads);
                std::thread::spawn(move || {
                    let v = cache
                        .load_or_store("k".to_string(), mtime, || {
                            loads.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(10));
                            Ok(7u64)
                        })
                        .unwrap();
                    assert_eq!(*v, 7);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attribute_cache_pull_push_remove() {
        let cache = InMemoryAttributeCache::new(16);
        let view = attribs(&[("user.size", b"42")]);

        assert!(cache.pull("s1/n1").is_none());
        cache.push("s1/n1", &view).unwrap();
        assert_eq!(cache.pull("s1/n1").unwrap(), view);

        cache.remove("s1/n1").unwrap();
        assert!(cache.pull("s1/n1").is_none());
    }

    #[test]
    fn test_attribute_cache_evicts_lru() {
        let cache = InMemoryAttributeCache::new(2);
        cache.push("a", &attribs(&[("user.k", b"1")])).unwrap();
        cache.push("b", &attribs(&[("user.k", b"2")])).unwrap();

        // Touch "a" so "b" becomes the eviction candidate
        cache.pull("a");
        cache.push("c", &attribs(&[("user.k", b"3")])).unwrap();

        assert!(cache.pull("a").is_some());
        assert!(cache.pull("b").is_none());
        assert!(cache.pull("c").is_some());
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_noop_cache_never_hits() {
        let cache = NoopAttributeCache;
        cache.push("k", &attribs(&[("user.k", b"v")])).unwrap();
        assert!(cache.pull("k").is_none());
        cache.remove("k").unwrap();
    }
}
