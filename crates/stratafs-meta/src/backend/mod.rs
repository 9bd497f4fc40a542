//! Metadata backend capability surface
//!
//! A backend attaches arbitrary key/value attributes to on-disk nodes. The
//! node itself is an opaque identity; backends only need its space id, node
//! id and internal filesystem path. Where a node's sidecar file lives is
//! decided by a path function supplied at construction, so the path layout
//! scheme stays outside this crate.

mod hybrid;

pub use hybrid::HybridBackend;

use crate::lockfile::LockedFile;
use chrono::{DateTime, Utc};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratafs_common::{AttrMap, Result};

/// The node capability consumed by backends.
pub trait MetadataNode: Send + Sync {
    /// Id of the space the node belongs to
    fn space_id(&self) -> &str;
    /// Id of the node itself
    fn node_id(&self) -> &str;
    /// Path of the node in the host filesystem, stable for its lifetime
    fn internal_path(&self) -> &Path;
}

/// Plain value implementation of [`MetadataNode`].
#[derive(Clone, Debug)]
pub struct NodeRef {
    pub space_id: String,
    pub node_id: String,
    pub internal_path: PathBuf,
}

impl NodeRef {
    pub fn new(
        space_id: impl Into<String>,
        node_id: impl Into<String>,
        internal_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            space_id: space_id.into(),
            node_id: node_id.into(),
            internal_path: internal_path.into(),
        }
    }
}

impl MetadataNode for NodeRef {
    fn space_id(&self) -> &str {
        &self.space_id
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn internal_path(&self) -> &Path {
        &self.internal_path
    }
}

/// Identity triple read from a node's reserved attributes.
///
/// Absent attributes yield empty strings and a `None` mtime; reading an
/// identity never fails.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeIdentity {
    pub space_id: String,
    pub node_id: String,
    pub mtime: Option<DateTime<Utc>>,
}

/// Maps a node to the path of its sidecar file.
///
/// Must be deterministic for the lifetime of the node.
pub type MetadataPathFn = Arc<dyn Fn(&dyn MetadataNode) -> PathBuf + Send + Sync>;

/// Scoped per-node lock for critical sections spanning multiple backend
/// calls.
///
/// Releasing closes the lock handle and removes the lockfile, unlike the
/// substrate locks the backend takes internally.
pub struct NodeLock {
    lock: Option<LockedFile>,
}

impl NodeLock {
    pub(crate) fn new(lock: LockedFile) -> Self {
        Self { lock: Some(lock) }
    }

    /// Release the lock and remove its lockfile.
    pub fn release(mut self) -> Result<()> {
        match self.lock.take() {
            Some(lock) => lock.unlock_and_remove(),
            None => Ok(()),
        }
    }
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            let _ = lock.unlock_and_remove();
        }
    }
}

/// Operations every metadata backend provides.
///
/// Modeled as a capability set so stores with different substrates can be
/// swapped behind one interface.
pub trait MetadataBackend: Send + Sync {
    /// Name of the backend implementation
    fn name(&self) -> &'static str;

    /// Read the identity triple from a path's reserved attributes
    fn identify(&self, path: &Path) -> NodeIdentity;

    /// Get a single attribute value
    fn get(&self, n: &dyn MetadataNode, key: &str) -> Result<Vec<u8>>;

    /// Get a single attribute value parsed as a decimal i64
    fn get_i64(&self, n: &dyn MetadataNode, key: &str) -> Result<i64>;

    /// List attribute names present on the node's xattr substrate
    fn list(&self, n: &dyn MetadataNode) -> Result<Vec<String>>;

    /// Read the full merged attribute view
    fn all(&self, n: &dyn MetadataNode) -> Result<AttrMap>;

    /// Set a single attribute
    fn set(&self, n: &dyn MetadataNode, key: &str, val: &[u8]) -> Result<()>;

    /// Set a batch of attributes. `acquire_lock` is false only when the
    /// caller already holds the node's substrate lock.
    fn set_multiple(
        &self,
        n: &dyn MetadataNode,
        attribs: AttrMap,
        acquire_lock: bool,
    ) -> Result<()>;

    /// Remove a single attribute
    fn remove(&self, n: &dyn MetadataNode, key: &str, acquire_lock: bool) -> Result<()>;

    /// Remove all node-managed metadata of a node
    fn purge(&self, n: &dyn MetadataNode) -> Result<()>;

    /// Move cached metadata from one node identity to another. The on-disk
    /// substrates are assumed to have been renamed by a higher layer.
    fn rename(&self, old_node: &dyn MetadataNode, new_node: &dyn MetadataNode) -> Result<()>;

    /// Path of the node's sidecar file
    fn metadata_path(&self, n: &dyn MetadataNode) -> PathBuf;

    /// Path of the node's scoped lockfile
    fn lockfile_path(&self, n: &dyn MetadataNode) -> PathBuf;

    /// Take the scoped per-node lock
    fn lock(&self, n: &dyn MetadataNode) -> Result<NodeLock>;

    /// Check whether a path denotes a meta file
    fn is_meta_file(&self, path: &str) -> bool;

    /// Read the merged view while the caller holds a lock on the source.
    /// Backends that do not read through the source reader delegate to
    /// [`MetadataBackend::all`].
    fn all_with_locked_source(
        &self,
        n: &dyn MetadataNode,
        _source: &mut dyn Read,
    ) -> Result<AttrMap> {
        self.all(n)
    }
}
