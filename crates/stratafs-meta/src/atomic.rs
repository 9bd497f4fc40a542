//! Atomic file replacement
//!
//! Sidecar and index files are replaced by writing a temp file in the
//! destination directory, syncing it, and renaming it over the target.
//! Readers observe either the old or the new content, never a partial
//! write. On any failure the destination is left unchanged.

use std::fs::{self, File, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use stratafs_common::{Error, Result};
use tempfile::NamedTempFile;

/// Write `data` to `path` atomically with the given file mode.
///
/// Parent directories are created as needed. The rename is the commit
/// point; everything before it happens on a temp file.
pub fn write_atomic(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io(std::io::Error::other("destination path has no parent")))?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(mode))?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;

    // Make the rename itself durable. Failure here does not affect
    // visibility, only crash durability of the directory entry.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }

    Ok(())
}
