//! Filesystem helpers shared by the sync engine and the hardlink replicator
//!
//! Everything here works on a single entry: copy one file/directory/symlink
//! with its metadata, remove one entry (recursively for directories), or
//! apply captured metadata to an existing path.
//!
//! ## Metadata order
//!
//! Metadata is always applied as owner, then mode, then times. `chown` may
//! clear setuid/setgid bits, and both of the former bump `ctime` but leave
//! `mtime` alone, so times go last.
//!
//! Symlinks get their owner changed with `lchown` and their times set with
//! `lutimes`; their mode is left alone since Linux cannot change it.

use crate::error::{LinkbackError, Result};
use crate::types::{EntryKind, EntryMeta};
use filetime::FileTime;
use std::fs;
use std::os::unix::fs::{chown, lchown, symlink, PermissionsExt};
use std::path::Path;
use tracing::trace;

/// Apply owner, permission bits and timestamps from `meta` to `path`
pub fn apply_metadata(path: &Path, meta: &EntryMeta) -> Result<()> {
    match meta.kind {
        EntryKind::Symlink => {
            lchown(path, Some(meta.uid), Some(meta.gid))?;
            filetime::set_symlink_file_times(path, meta.accessed, meta.modified)?;
        }
        _ => {
            chown(path, Some(meta.uid), Some(meta.gid))?;
            set_mode(path, meta.mode)?;
            filetime::set_file_times(path, meta.accessed, meta.modified)?;
        }
    }
    Ok(())
}

/// Set permission bits on a non-symlink path
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Change owner and group without following symlinks
pub fn set_owner(path: &Path, uid: u32, gid: u32) -> Result<()> {
    lchown(path, Some(uid), Some(gid))?;
    Ok(())
}

/// Reset only the modification time, keeping the access time from `meta`
pub fn set_modified(path: &Path, meta: &EntryMeta) -> Result<()> {
    match meta.kind {
        EntryKind::Symlink => filetime::set_symlink_file_times(path, meta.accessed, meta.modified)?,
        _ => filetime::set_file_times(path, meta.accessed, meta.modified)?,
    }
    Ok(())
}

/// Modification time of `path` without following symlinks
pub fn modified_time(path: &Path) -> Result<FileTime> {
    let metadata = fs::symlink_metadata(path)?;
    Ok(FileTime::from_last_modification_time(&metadata))
}

/// Non-recursive copy of one entry from `src` to `dst`
///
/// Directories are created empty, symlinks are recreated with the same
/// target and files get their content copied. Full metadata from `meta` is
/// applied afterwards. `dst` must not exist.
pub fn copy_entry(src: &Path, meta: &EntryMeta, dst: &Path) -> Result<()> {
    match meta.kind {
        EntryKind::Directory => {
            fs::create_dir(dst)?;
        }
        EntryKind::Symlink => {
            let target = match &meta.symlink_target {
                Some(target) => target.clone(),
                None => fs::read_link(src)?,
            };
            symlink(&target, dst)?;
        }
        EntryKind::File => {
            fs::copy(src, dst)?;
        }
        EntryKind::Other => {
            return Err(LinkbackError::UnsupportedEntryType {
                path: src.to_path_buf(),
            });
        }
    }

    trace!("Copied {} {:?} -> {:?}", meta.kind, src, dst);
    apply_metadata(dst, meta)
}

/// Remove one entry, recursing into directories
///
/// Symlinks are removed, never followed.
pub fn remove_entry(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    trace!("Removed {:?}", path);
    Ok(())
}

/// Make `dst` the same entry as `src`: remove it, then copy `src` over
///
/// If `dst` is a directory its content is removed; the content of a source
/// directory is not copied.
pub fn replace_entry(src: &Path, meta: &EntryMeta, dst: &Path) -> Result<()> {
    remove_entry(dst)?;
    copy_entry(src, meta, dst)
}

/// Check whether a path exists without following a final symlink
pub fn lexists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
