//! Directory traversal
//!
//! Walks a tree once with `walkdir` and captures an [`EntryMeta`] for every
//! entry below the root. Symlinks are never followed and entries are visited
//! in file-name order so runs are reproducible.
//!
//! Two orders are supported:
//!
//! - [`ScanOrder::TopDown`]: a directory is yielded before its children.
//!   Used for the source side and for creating entries.
//! - [`ScanOrder::BottomUp`]: children are yielded before their directory.
//!   Used for the destination side so deletions never hit a non-empty
//!   directory that still has unprocessed children.

use crate::error::{LinkbackError, Result};
use crate::types::EntryMeta;
use crate::utils;
use std::path::{Path, PathBuf};
use tracing::{trace, warn};
use walkdir::WalkDir;

/// Traversal order for [`scan_tree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    /// Parents before children
    TopDown,
    /// Children before parents
    BottomUp,
}

/// An entry below the scanned root that could not be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFailure {
    /// Path relative to the scanned root
    pub path: PathBuf,
    /// Error message
    pub message: String,
}

/// Result of [`scan_tree_lenient`]
#[derive(Debug, Clone, Default)]
pub struct TreeScan {
    /// Entries that were read
    pub entries: Vec<EntryMeta>,
    /// Entries (or directory listings) that could not be read
    pub failures: Vec<ScanFailure>,
}

/// Recursively enumerate everything below `root` (the root itself excluded)
///
/// Returned paths in [`EntryMeta::path`] are relative to `root`. The first
/// unreadable entry fails the whole scan.
pub fn scan_tree(root: &Path, order: ScanOrder) -> Result<Vec<EntryMeta>> {
    walk(root, order, |_, e| Err(e))
}

/// Like [`scan_tree`], but entries that cannot be read are collected as
/// [`ScanFailure`]s and the walk goes on
///
/// Only a root that cannot be read fails the scan.
pub fn scan_tree_lenient(root: &Path, order: ScanOrder) -> Result<TreeScan> {
    let mut failures = Vec::new();
    let entries = walk(root, order, |full_path, e| {
        let rel_path = match full_path.strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => return Err(e),
        };
        warn!("Cannot read {:?}: {}", full_path, e);
        failures.push(ScanFailure {
            path: rel_path.to_path_buf(),
            message: e.to_string(),
        });
        Ok(())
    })?;
    Ok(TreeScan { entries, failures })
}

fn walk<F>(root: &Path, order: ScanOrder, mut on_failure: F) -> Result<Vec<EntryMeta>>
where
    F: FnMut(&Path, LinkbackError) -> Result<()>,
{
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .contents_first(order == ScanOrder::BottomUp)
        .sort_by_file_name();

    let mut entries = Vec::new();
    for item in walker {
        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                let full_path = e.path().unwrap_or(root).to_path_buf();
                on_failure(&full_path, e.into())?;
                continue;
            }
        };
        let full_path = entry.path();
        let rel_path = full_path.strip_prefix(root).map_err(|_| {
            LinkbackError::internal(format!(
                "Path {:?} is not below {:?}",
                full_path, root
            ))
        })?;
        let meta = entry
            .metadata()
            .map_err(LinkbackError::from)
            .and_then(|metadata| EntryMeta::from_metadata(full_path, rel_path, &metadata));
        match meta {
            Ok(meta) => entries.push(meta),
            Err(e) => on_failure(full_path, e)?,
        }
    }

    trace!("Scanned {} entries under {:?}", entries.len(), root);
    Ok(entries)
}

/// Read metadata of the tree root itself
pub fn root_meta(root: &Path) -> Result<EntryMeta> {
    EntryMeta::read(root, Path::new(""))
}

/// Whether `path` is an existing directory (symlinks are not followed)
pub fn is_real_dir(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_dir())
        .unwrap_or(false)
}

/// Whether `path` exists at all (symlinks are not followed)
pub fn exists(path: &Path) -> bool {
    utils::lexists(path)
}
