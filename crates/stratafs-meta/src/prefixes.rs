//! Reserved attribute names and path conventions
//!
//! All node-managed attributes live under the system prefix; grant
//! attributes form a sub-namespace of it and are the only class that can be
//! offloaded to the sidecar.

/// Prefix of every node-managed attribute. Purge removes everything below it.
pub const SYSTEM_PREFIX: &str = "user.";

/// Prefix of access-control grant attributes.
pub const GRANT_PREFIX: &str = "user.grant.";

/// Marker attribute: value `"1"` means grants live in the sidecar.
/// The marker itself is always an xattr, never in the sidecar.
pub const GRANTS_OFFLOADED_ATTR: &str = "user.grants_offloaded";

/// Value of [`GRANTS_OFFLOADED_ATTR`] that witnesses the offloaded state.
pub const GRANTS_OFFLOADED: &[u8] = b"1";

/// Space id of the node.
pub const SPACE_ID_ATTR: &str = "user.space_id";

/// Node id.
pub const ID_ATTR: &str = "user.id";

/// Node mtime as an RFC 3339 string with nanosecond precision.
pub const MTIME_ATTR: &str = "user.mtime";

/// Suffix of the scoped per-node lockfile handed out by `lock()`.
pub const NODE_LOCK_SUFFIX: &str = ".mlock";

/// Suffix marking a path as a meta file for higher-layer filtering.
pub const META_FILE_SUFFIX: &str = ".meta.lock";

/// Check whether an attribute name is a grant attribute.
#[must_use]
pub fn is_grant_attribute(name: &str) -> bool {
    name.starts_with(GRANT_PREFIX)
}

/// Check whether an attribute name is node-managed.
#[must_use]
pub fn is_system_attribute(name: &str) -> bool {
    name.starts_with(SYSTEM_PREFIX)
}
