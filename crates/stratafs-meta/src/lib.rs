//! stratafs Metadata Core - Per-node attribute storage
//!
//! This crate implements the metadata layer of stratafs including:
//! - Hybrid attribute storage (xattrs with sidecar offload for grants)
//! - Inter-process file locking on per-node lockfiles
//! - MessagePack encoding of attribute maps
//! - Atomic sidecar and index replacement
//! - Write-through and mtime-keyed caching
//! - Persistent per-group space indexes

pub mod atomic;
pub mod backend;
pub mod cache;
pub mod codec;
pub mod index;
pub mod lockfile;
pub mod prefixes;

// Re-exports
pub use backend::{
    HybridBackend, MetadataBackend, MetadataNode, MetadataPathFn, NodeIdentity, NodeLock, NodeRef,
};
pub use cache::{AttributeCache, CacheStats, InMemoryAttributeCache, MtimeCache, NoopAttributeCache};
pub use index::{SpaceIndex, INDEX_FILE_EXT};
pub use lockfile::{LockedFile, LOCK_FILE_SUFFIX};
