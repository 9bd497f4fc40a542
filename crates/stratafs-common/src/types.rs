//! Shared type definitions for stratafs

use std::collections::HashMap;

/// Attribute map attached to a node: attribute name to raw value bytes.
///
/// The same shape is used for the merged per-node view, for sidecar files
/// and for space index files.
pub type AttrMap = HashMap<String, Vec<u8>>;

/// File mode for every file the metadata core creates (sidecars, lockfiles,
/// index files).
pub const META_FILE_MODE: u32 = 0o600;
