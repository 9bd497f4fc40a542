//! Configuration types for stratafs
//!
//! This module defines configuration structures used across components.

use serde::{Deserialize, Serialize};

/// Configuration for the per-node metadata store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Inclusive byte threshold for the total grant size of a node.
    /// Once the sum of `len(name) + len(value)` over all grant attributes
    /// exceeds this limit, grants are offloaded to the sidecar file.
    pub offload_limit: usize,
    /// Attribute cache configuration
    pub cache: CacheConfig,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            offload_limit: 2048,
            cache: CacheConfig::default(),
        }
    }
}

/// Configuration for the in-memory attribute cache
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached node entries (0 = unbounded)
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 8192 }
    }
}
