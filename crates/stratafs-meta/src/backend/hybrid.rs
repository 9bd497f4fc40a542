//! Hybrid per-node metadata store
//!
//! Attributes live in extended attributes on the node's internal path.
//! Once the total size of grant attributes crosses the configured offload
//! limit, grants move to a MessagePack sidecar file and the reserved
//! offload marker xattr witnesses the transition. The move is one-way:
//! shrinking grants never migrate back.
//!
//! Mutations serialize across processes on a per-node substrate lockfile.
//! The merged view (xattrs plus sidecar) is pushed to the attribute cache
//! after every successful mutation, so reads are usually cache hits.

use crate::atomic;
use crate::cache::AttributeCache;
use crate::codec;
use crate::lockfile::{LockedFile, LOCK_FILE_SUFFIX};
use crate::prefixes::{
    is_grant_attribute, is_system_attribute, GRANTS_OFFLOADED, GRANTS_OFFLOADED_ATTR, ID_ATTR,
    META_FILE_SUFFIX, MTIME_ATTR, NODE_LOCK_SUFFIX, SPACE_ID_ATTR,
};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratafs_common::{AttrMap, Error, MetaConfig, Result, META_FILE_MODE};
use tracing::{debug, info, warn};

use super::{MetadataBackend, MetadataNode, MetadataPathFn, NodeIdentity, NodeLock};

#[cfg(target_os = "macos")]
const ENOATTR: i32 = libc::ENOATTR;
#[cfg(not(target_os = "macos"))]
const ENOATTR: i32 = libc::ENODATA;

/// Metadata store splitting attributes between xattrs and a sidecar file.
pub struct HybridBackend {
    offload_limit: usize,
    metadata_path_fn: MetadataPathFn,
    cache: Arc<dyn AttributeCache>,
}

impl HybridBackend {
    /// Create a backend with an explicit cache handle.
    ///
    /// `offload_limit` is the inclusive byte threshold for the sum of
    /// `len(name) + len(value)` over all grant attributes of a node;
    /// exceeding it triggers the offload. `metadata_path_fn` maps a node to
    /// its sidecar path and must be deterministic for the node's lifetime.
    pub fn new(
        offload_limit: usize,
        metadata_path_fn: MetadataPathFn,
        cache: Arc<dyn AttributeCache>,
    ) -> Self {
        Self {
            offload_limit,
            metadata_path_fn,
            cache,
        }
    }

    /// Create a backend with an in-memory cache built from configuration.
    pub fn with_config(config: &MetaConfig, metadata_path_fn: MetadataPathFn) -> Self {
        Self::new(
            config.offload_limit,
            metadata_path_fn,
            Arc::new(crate::cache::InMemoryAttributeCache::from_config(
                &config.cache,
            )),
        )
    }

    fn cache_key(&self, n: &dyn MetadataNode) -> String {
        // Cache keys must not begin with a slash; some stores drop it.
        format!("{}/{}", n.space_id(), n.node_id())
    }

    fn substrate_lock_path(&self, n: &dyn MetadataNode) -> PathBuf {
        path_with_suffix(n.internal_path(), LOCK_FILE_SUFFIX)
    }

    /// Whether the node's grants currently live in the sidecar. Any read
    /// failure counts as inline.
    fn is_offloaded(&self, n: &dyn MetadataNode) -> bool {
        matches!(
            xattr::get(n.internal_path(), GRANTS_OFFLOADED_ATTR),
            Ok(Some(v)) if v == GRANTS_OFFLOADED
        )
    }

    fn read_sidecar(&self, n: &dyn MetadataNode) -> Result<AttrMap> {
        let bytes = fs::read(self.sidecar_path(n))?;
        codec::decode(&bytes)
    }

    /// Like [`Self::read_sidecar`], but an absent sidecar is an empty map.
    fn read_sidecar_or_empty(&self, n: &dyn MetadataNode) -> Result<AttrMap> {
        match fs::read(self.sidecar_path(n)) {
            Ok(bytes) => codec::decode(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AttrMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn sidecar_path(&self, n: &dyn MetadataNode) -> PathBuf {
        (self.metadata_path_fn)(n)
    }

    fn list_names(&self, n: &dyn MetadataNode, acquire_lock: bool) -> Result<Vec<String>> {
        let path = n.internal_path();
        match xattr::list(path) {
            Ok(names) => Ok(collect_names(names)),
            Err(first) => {
                // A concurrent writer can make listing fail transiently;
                // retry once, serialized against writers when allowed.
                debug!(path = %path.display(), error = %first, "listing xattrs failed, retrying");
                let _lock = if acquire_lock {
                    Some(LockedFile::open_exclusive(self.substrate_lock_path(n))?)
                } else {
                    None
                };
                Ok(collect_names(xattr::list(path)?))
            }
        }
    }

    /// Read the full view of a node.
    ///
    /// `skip_cache` bypasses the attribute cache, `skip_offloaded` leaves
    /// sidecar content out (grants then come from xattrs only), and
    /// `acquire_lock` guards the listing retry. The assembled view is
    /// pushed to the cache before returning.
    fn get_all(
        &self,
        n: &dyn MetadataNode,
        skip_cache: bool,
        skip_offloaded: bool,
        acquire_lock: bool,
    ) -> Result<AttrMap> {
        if !skip_cache {
            if let Some(attribs) = self.cache.pull(&self.cache_key(n)) {
                return Ok(attribs);
            }
        }

        let names = self.list_names(n, acquire_lock)?;
        if names.is_empty() {
            return Ok(AttrMap::new());
        }

        let path = n.internal_path();
        let mut attribs = AttrMap::with_capacity(names.len());
        let mut failed = 0;
        let mut last = String::new();
        for name in &names {
            match xattr::get(path, name) {
                Ok(Some(val)) => {
                    attribs.insert(name.clone(), val);
                }
                // Unset between list and get; contributes nothing.
                Ok(None) => {}
                Err(e) => {
                    failed += 1;
                    last = e.to_string();
                }
            }
        }
        if failed > 0 {
            return Err(Error::PartialBatch {
                failed,
                total: names.len(),
                last,
            });
        }

        if !skip_offloaded && self.is_offloaded(n) {
            // Sidecar wins on key collision.
            attribs.extend(self.read_sidecar(n)?);
        }

        self.cache.push(&self.cache_key(n), &attribs)?;
        Ok(attribs)
    }

    /// Move all grant attributes from xattrs into the sidecar and set the
    /// offload marker. One-way; the public API never reverses it.
    fn offload_grants(&self, n: &dyn MetadataNode) -> Result<()> {
        let path = n.internal_path();
        let existing = self.get_all(n, true, true, false)?;

        let mut grants = AttrMap::new();
        let mut failed = 0;
        let mut last = String::new();
        for (key, val) in &existing {
            if !is_grant_attribute(key) {
                continue;
            }
            grants.insert(key.clone(), val.clone());
            match xattr::remove(path, key) {
                Ok(()) => {}
                Err(e) if is_attr_unset(&e) => {}
                Err(e) => {
                    failed += 1;
                    last = e.to_string();
                }
            }
        }

        let encoded = codec::encode(&grants)?;
        atomic::write_atomic(&self.sidecar_path(n), &encoded, META_FILE_MODE)?;
        xattr::set(path, GRANTS_OFFLOADED_ATTR, GRANTS_OFFLOADED)?;

        if failed > 0 {
            return Err(Error::PartialBatch {
                failed,
                total: grants.len(),
                last,
            });
        }

        // Refresh the cached view so it includes the marker and reflects
        // the new substrate split.
        self.get_all(n, true, false, false)?;

        info!(path = %path.display(), grants = grants.len(), "offloaded grants to sidecar");
        Ok(())
    }
}

impl MetadataBackend for HybridBackend {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn identify(&self, path: &Path) -> NodeIdentity {
        let mtime = read_string_attr(path, MTIME_ATTR)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc));
        NodeIdentity {
            space_id: read_string_attr(path, SPACE_ID_ATTR).unwrap_or_default(),
            node_id: read_string_attr(path, ID_ATTR).unwrap_or_default(),
            mtime,
        }
    }

    // No locking: reading a single xattr is atomic.
    fn get(&self, n: &dyn MetadataNode, key: &str) -> Result<Vec<u8>> {
        if let Some(attribs) = self.cache.pull(&self.cache_key(n)) {
            if let Some(val) = attribs.get(key) {
                if !val.is_empty() {
                    return Ok(val.clone());
                }
            }
        }

        if is_grant_attribute(key) && self.is_offloaded(n) {
            let sidecar = self.read_sidecar(n)?;
            return Ok(sidecar.get(key).cloned().unwrap_or_default());
        }

        match xattr::get(n.internal_path(), key)? {
            Some(val) => Ok(val),
            None => Err(Error::AttrUnset(key.to_string())),
        }
    }

    fn get_i64(&self, n: &dyn MetadataNode, key: &str) -> Result<i64> {
        let val = self.get(n, key)?;
        let s = std::str::from_utf8(&val)
            .map_err(|_| Error::parse(format!("{} is not valid UTF-8", key)))?;
        s.parse::<i64>()
            .map_err(|e| Error::parse(format!("{}: {}", key, e)))
    }

    fn list(&self, n: &dyn MetadataNode) -> Result<Vec<String>> {
        self.list_names(n, true)
    }

    fn all(&self, n: &dyn MetadataNode) -> Result<AttrMap> {
        self.get_all(n, false, false, true)
    }

    fn set(&self, n: &dyn MetadataNode, key: &str, val: &[u8]) -> Result<()> {
        let mut attribs = AttrMap::with_capacity(1);
        attribs.insert(key.to_string(), val.to_vec());
        self.set_multiple(n, attribs, true)
    }

    fn set_multiple(
        &self,
        n: &dyn MetadataNode,
        attribs: AttrMap,
        acquire_lock: bool,
    ) -> Result<()> {
        let path = n.internal_path();
        let _lock = if acquire_lock {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            Some(LockedFile::open_exclusive(self.substrate_lock_path(n))?)
        } else {
            None
        };

        let offloaded = self.is_offloaded(n);
        if offloaded {
            // Already offloaded: every write goes to the sidecar, grant or
            // not. The incoming attributes overlay the stored map.
            let mut current = self.read_sidecar_or_empty(n)?;
            for (key, val) in &attribs {
                current.insert(key.clone(), val.clone());
            }
            let encoded = codec::encode(&current)?;
            atomic::write_atomic(&self.sidecar_path(n), &encoded, META_FILE_MODE)?;
        } else {
            let total = attribs.len();
            let mut failed = 0;
            let mut last = String::new();
            for (key, val) in &attribs {
                if let Err(e) = xattr::set(path, key, val) {
                    warn!(path = %path.display(), key = %key, error = %e, "failed to set xattr");
                    failed += 1;
                    last = e.to_string();
                }
            }
            if failed > 0 {
                return Err(Error::PartialBatch {
                    failed,
                    total,
                    last,
                });
            }
        }

        let merged = self.get_all(n, true, false, false)?;

        if !offloaded {
            let grant_size: usize = merged
                .iter()
                .filter(|(key, _)| is_grant_attribute(key))
                .map(|(key, val)| key.len() + val.len())
                .sum();
            if grant_size > self.offload_limit {
                debug!(
                    path = %path.display(),
                    grant_size,
                    offload_limit = self.offload_limit,
                    "grant size exceeds limit"
                );
                self.offload_grants(n)?;
            }
        }

        Ok(())
    }

    fn remove(&self, n: &dyn MetadataNode, key: &str, acquire_lock: bool) -> Result<()> {
        let path = n.internal_path();
        let _lock = if acquire_lock {
            Some(LockedFile::open_exclusive(self.substrate_lock_path(n))?)
        } else {
            None
        };

        if self.is_offloaded(n) {
            let mut sidecar = self.read_sidecar_or_empty(n)?;
            let in_sidecar = sidecar.remove(key).is_some();
            if in_sidecar {
                let encoded = codec::encode(&sidecar)?;
                atomic::write_atomic(&self.sidecar_path(n), &encoded, META_FILE_MODE)?;
            }
            // A copy from before the offload may still exist as an xattr.
            let in_xattr = match xattr::remove(path, key) {
                Ok(()) => true,
                Err(e) if is_attr_unset(&e) => false,
                Err(e) => return Err(e.into()),
            };
            if !in_sidecar && !in_xattr {
                return Err(Error::AttrUnset(key.to_string()));
            }
        } else {
            xattr::remove(path, key).map_err(|e| {
                if is_attr_unset(&e) {
                    Error::AttrUnset(key.to_string())
                } else {
                    Error::Io(e)
                }
            })?;
        }

        self.get_all(n, true, false, false)?;
        Ok(())
    }

    fn purge(&self, n: &dyn MetadataNode) -> Result<()> {
        let path = n.internal_path();
        if path.exists() {
            let attribs = self.get_all(n, true, false, true)?;
            for name in attribs.keys() {
                if !is_system_attribute(name) {
                    continue;
                }
                match xattr::remove(path, name) {
                    Ok(()) => {}
                    // Offloaded entries are in the merged view but not on
                    // the inode.
                    Err(e) if is_attr_unset(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            // Drop the sidecar too; a node recreated at this path must not
            // resurrect stale grants.
            match fs::remove_file(self.sidecar_path(n)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            debug!(path = %path.display(), "purged node metadata");
        }

        self.cache.remove(&self.cache_key(n))
    }

    fn rename(&self, old_node: &dyn MetadataNode, new_node: &dyn MetadataNode) -> Result<()> {
        if let Some(attribs) = self.cache.pull(&self.cache_key(old_node)) {
            self.cache.push(&self.cache_key(new_node), &attribs)?;
        }
        self.cache.remove(&self.cache_key(old_node))
    }

    fn metadata_path(&self, n: &dyn MetadataNode) -> PathBuf {
        self.sidecar_path(n)
    }

    fn lockfile_path(&self, n: &dyn MetadataNode) -> PathBuf {
        path_with_suffix(n.internal_path(), NODE_LOCK_SUFFIX)
    }

    fn lock(&self, n: &dyn MetadataNode) -> Result<NodeLock> {
        let lock = LockedFile::open_exclusive(self.lockfile_path(n))?;
        Ok(NodeLock::new(lock))
    }

    fn is_meta_file(&self, path: &str) -> bool {
        path.ends_with(META_FILE_SUFFIX)
    }
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn collect_names(names: xattr::XAttrs) -> Vec<String> {
    names.map(|n| n.to_string_lossy().into_owned()).collect()
}

fn read_string_attr(path: &Path, name: &str) -> Option<String> {
    xattr::get(path, name)
        .ok()
        .flatten()
        .map(|v| String::from_utf8_lossy(&v).into_owned())
}

/// Check for the xattr-specific "no data" error.
fn is_attr_unset(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(ENOATTR)
}
