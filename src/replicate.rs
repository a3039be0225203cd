//! Hardlink replication
//!
//! Clones directory trees cheaply by sharing inodes: every file and symlink
//! in the clone is a hardlink to the original, every directory is created
//! fresh (directories cannot be hardlinked) with owner, mode and timestamps
//! copied from the original.
//!
//! Editing a linked file in place through either tree is visible through the
//! other. That is why the sync engine replaces shared inodes instead of
//! editing them (see [`crate::sync`]).
//!
//! Two operations are provided:
//!
//! - [`replicate`] clones a whole tree; used to seed a new snapshot from the
//!   latest one.
//! - [`replicate_path`] links a single relative path and its ancestor
//!   directories into another tree; used to build a snapshot's delta
//!   directory one changed path at a time.

use crate::error::{LinkbackError, Result};
use crate::scan::{self, ScanOrder};
use crate::types::{EntryKind, EntryMeta};
use crate::utils;
use std::fs;
use std::path::{Component, Path};
use tracing::{debug, instrument, trace};

/// Counters describing one [`replicate`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicateStats {
    /// Directories recreated (root excluded)
    pub directories: usize,
    /// Files and symlinks hardlinked
    pub links: usize,
}

/// Clone `src` into `dst` by hardlinking every file and symlink
///
/// # Errors
///
/// - [`LinkbackError::InvalidSource`] if `src` is not an existing directory
/// - [`LinkbackError::InvalidDestination`] if `dst` already exists
/// - [`LinkbackError::UnsupportedEntryType`] if `src` contains anything that
///   is not a file, directory or symlink. Nothing is skipped silently.
/// - [`LinkbackError::Io`] for any failing link or directory creation
///
/// On error `dst` is left partially populated; the caller owns cleanup.
#[instrument]
pub fn replicate(src: &Path, dst: &Path) -> Result<ReplicateStats> {
    if !fs::metadata(src).map(|m| m.is_dir()).unwrap_or(false) {
        return Err(LinkbackError::invalid_source(src, "not an existing directory"));
    }
    if scan::exists(dst) {
        return Err(LinkbackError::invalid_destination(dst, "already exists"));
    }

    let root_meta = scan::root_meta(src)?;
    let entries = scan::scan_tree(src, ScanOrder::TopDown)?;
    if let Some(other) = entries.iter().find(|e| e.kind == EntryKind::Other) {
        return Err(LinkbackError::UnsupportedEntryType {
            path: src.join(&other.path),
        });
    }

    debug!("Hardlink, creating directory: {:?}", dst);
    fs::create_dir(dst)?;

    let mut stats = ReplicateStats::default();
    for entry in &entries {
        let src_path = src.join(&entry.path);
        let dst_path = dst.join(&entry.path);
        match entry.kind {
            EntryKind::Directory => {
                trace!("Hardlink, copying directory: {:?} -> {:?}", src_path, dst_path);
                fs::create_dir(&dst_path)?;
                stats.directories += 1;
            }
            EntryKind::File | EntryKind::Symlink => {
                trace!("Hardlink, linking: {:?} -> {:?}", src_path, dst_path);
                fs::hard_link(&src_path, &dst_path)?;
                stats.links += 1;
            }
            EntryKind::Other => {
                return Err(LinkbackError::UnsupportedEntryType { path: src_path });
            }
        }
    }

    // children are in place, directory times can no longer drift
    for entry in entries.iter().rev().filter(|e| e.kind == EntryKind::Directory) {
        utils::apply_metadata(&dst.join(&entry.path), entry)?;
    }
    utils::apply_metadata(dst, &root_meta)?;

    debug!(
        "Hardlinked {} entries and {} directories into {:?}",
        stats.links, stats.directories, dst
    );
    Ok(stats)
}

/// Link `ref_root/rel_path` into `delta_root/rel_path`, ancestors included
///
/// Only the path itself and its ancestor directories are touched; siblings
/// are never linked. Files and symlinks are hardlinked, directories are
/// created with metadata copied from `ref_root`.
///
/// If the destination already is the same inode as the source this is a
/// no-op. An existing destination directory for a source directory is kept
/// (with its metadata refreshed) so paths recorded below it survive. Any
/// other existing destination is removed and relinked.
///
/// # Errors
///
/// - [`LinkbackError::InvalidSource`] if the source path does not exist or
///   `rel_path` is not a plain relative path
/// - [`LinkbackError::InvalidDestination`] if `delta_root` exists and is not
///   a directory
#[instrument(level = "trace")]
pub fn replicate_path(ref_root: &Path, rel_path: &Path, delta_root: &Path) -> Result<()> {
    if rel_path.as_os_str().is_empty()
        || !rel_path.components().all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(LinkbackError::invalid_source(
            rel_path,
            "expected a non-empty relative path",
        ));
    }

    let src_full = ref_root.join(rel_path);
    let src_meta = match fs::symlink_metadata(&src_full) {
        Ok(metadata) => EntryMeta::from_metadata(&src_full, rel_path, &metadata)?,
        Err(e) => {
            return Err(LinkbackError::invalid_source(
                &src_full,
                format!("cannot read entity: {}", e),
            ))
        }
    };

    if scan::exists(delta_root) {
        if !scan::is_real_dir(delta_root) {
            return Err(LinkbackError::invalid_destination(
                delta_root,
                "not a directory",
            ));
        }
    } else {
        fs::create_dir(delta_root)?;
    }

    let dst_full = delta_root.join(rel_path);
    if let Ok(metadata) = fs::symlink_metadata(&dst_full) {
        let dst_meta = EntryMeta::from_metadata(&dst_full, rel_path, &metadata)?;
        if dst_meta.same_object(&src_meta) {
            return Ok(());
        }
        if src_meta.kind == EntryKind::Directory && dst_meta.kind == EntryKind::Directory {
            return utils::apply_metadata(&dst_full, &src_meta);
        }
        utils::remove_entry(&dst_full)?;
    }

    let mut src_cur = ref_root.to_path_buf();
    let mut dst_cur = delta_root.to_path_buf();
    for part in rel_path.components() {
        src_cur.push(part);
        dst_cur.push(part);
        if scan::exists(&dst_cur) {
            continue;
        }
        let meta = EntryMeta::read(&src_cur, src_cur.strip_prefix(ref_root).unwrap_or(rel_path))?;
        match meta.kind {
            EntryKind::Directory => {
                fs::create_dir(&dst_cur)?;
                utils::apply_metadata(&dst_cur, &meta)?;
            }
            EntryKind::File | EntryKind::Symlink => {
                fs::hard_link(&src_cur, &dst_cur)?;
            }
            EntryKind::Other => {
                return Err(LinkbackError::UnsupportedEntryType { path: src_cur });
            }
        }
    }

    trace!("Nested hardlink: {:?} -> {:?}", src_full, dst_full);
    Ok(())
}
