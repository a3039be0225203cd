//! Tree synchronization engine
//!
//! Makes a destination tree structurally identical to a source tree and
//! reports what it did to every path, in the spirit of
//! `rsync -rlptgo --delete --itemize-changes`.
//!
//! ## Algorithm
//!
//! 1. The source tree is enumerated top-down into a map of relative path to
//!    [`EntryMeta`].
//! 2. The destination tree is walked bottom-up. Each entry is either absent
//!    from the source (deleted), or claims its source counterpart and is
//!    classified by [`classify`].
//! 3. Every unclaimed source entry is created, parents before children.
//! 4. Directory modification times that drifted while children were
//!    mutated are reset to the source values, root last.
//!
//! ## Quick-check
//!
//! Files are considered equal when size and modification time match. File
//! content is never read for comparison.
//!
//! ## Shared inodes
//!
//! A destination file that shares its inode with the source (or, in a
//! snapshot, with an older snapshot) is always replaced by a fresh copy, never
//! edited in place: editing it would silently change every other tree linking
//! the same inode. This covers metadata too: a permission or owner update on
//! a file or symlink with more than one link replaces it before the update.
//!
//! ## Example
//!
//! ```rust,no_run
//! use linkback::sync::TreeSync;
//!
//! # fn main() -> linkback::Result<()> {
//! let stats = TreeSync::new("/home/me/docs", "/backups/20240101_120000/docs")
//!     .run(|record| println!("{} {}", record.action, record.path.display()))?;
//! println!("{} entries changed", stats.total());
//! # Ok(())
//! # }
//! ```

use crate::error::{LinkbackError, Result};
use crate::scan::{self, ScanOrder, TreeScan};
use crate::types::{ActionRecord, EntryKind, EntryMeta, SyncAction, SyncStats};
use crate::utils;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// Why a destination entry has to be replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteReason {
    /// Source and destination are different kinds of entries
    KindMismatch,
    /// Destination is a hardlink to the source inode
    SharedInode,
    /// File sizes differ
    Size,
    /// File modification times differ
    Time,
    /// Symlinks point to different targets
    SymlinkTarget,
}

impl fmt::Display for RewriteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteReason::KindMismatch => write!(f, "different entry types"),
            RewriteReason::SharedInode => write!(f, "shared inode"),
            RewriteReason::Size => write!(f, "different size"),
            RewriteReason::Time => write!(f, "different time"),
            RewriteReason::SymlinkTarget => write!(f, "different symlink target"),
        }
    }
}

/// Result of comparing a source entry with the destination entry at the
/// same relative path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing to do
    NoChange,
    /// Destination must be removed and recreated from the source
    Rewrite(RewriteReason),
    /// Destination content is fine, metadata is not
    Update {
        /// Permission bits differ
        permission: bool,
        /// Owner or group differ
        owner: bool,
        /// Directory modification time differs
        time: bool,
    },
}

/// Compare one source entry against its destination counterpart
///
/// Checks run in this order: entry kind, shared inode, file size and time,
/// symlink target, then metadata. Permission and owner are checked
/// independently of each other so a single pass fixes both. Symlink modes
/// are never compared since they cannot be changed on Linux.
pub fn classify(src: &EntryMeta, dst: &EntryMeta) -> Verdict {
    if src.kind != dst.kind {
        return Verdict::Rewrite(RewriteReason::KindMismatch);
    }

    if src.kind != EntryKind::Directory && src.same_object(dst) {
        return Verdict::Rewrite(RewriteReason::SharedInode);
    }

    match src.kind {
        EntryKind::File => {
            if src.size != dst.size {
                return Verdict::Rewrite(RewriteReason::Size);
            }
            if src.modified != dst.modified {
                return Verdict::Rewrite(RewriteReason::Time);
            }
        }
        EntryKind::Symlink => {
            if src.symlink_target != dst.symlink_target {
                return Verdict::Rewrite(RewriteReason::SymlinkTarget);
            }
        }
        EntryKind::Directory | EntryKind::Other => {}
    }

    let permission = src.kind != EntryKind::Symlink && src.mode != dst.mode;
    let owner = src.owner_differs(dst);
    let time = src.kind == EntryKind::Directory && src.modified != dst.modified;

    if permission || owner || time {
        Verdict::Update {
            permission,
            owner,
            time,
        }
    } else {
        Verdict::NoChange
    }
}

/// One-shot synchronization of `src` into `dst`
///
/// Not restartable: every call rescans both trees.
#[derive(Debug, Clone)]
pub struct TreeSync {
    src: PathBuf,
    dst: PathBuf,
    dry_run: bool,
}

impl TreeSync {
    /// Prepare a sync of `src` into `dst`
    pub fn new(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            dry_run: false,
        }
    }

    /// Report actions without touching the destination
    ///
    /// The emitted stream is the one a real pass would have produced.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Source root
    pub fn src(&self) -> &Path {
        &self.src
    }

    /// Destination root
    pub fn dst(&self) -> &Path {
        &self.dst
    }

    /// Run the sync, handing every action to `on_action` as it happens
    ///
    /// Actions arrive in two phases: the bottom-up destination pass
    /// (deletions, rewrites, metadata updates), then the top-down creation
    /// pass. Per-entry failures arrive as [`SyncAction::Error`], unreadable
    /// entries found while scanning first of all; only a bad source or
    /// destination root fails the whole call. Destination entries below an
    /// unreadable source entry are left alone.
    ///
    /// # Errors
    ///
    /// - [`LinkbackError::InvalidSource`] if `src` is missing or not a directory
    /// - [`LinkbackError::InvalidDestination`] if `dst` exists and is not a
    ///   directory, or cannot be created
    /// - [`LinkbackError::WalkDir`] if either root cannot be listed
    #[instrument(skip(self, on_action), fields(src = ?self.src, dst = ?self.dst, dry_run = self.dry_run))]
    pub fn run<F>(&self, mut on_action: F) -> Result<SyncStats>
    where
        F: FnMut(&ActionRecord),
    {
        let src_root = self.src.as_path();
        let dst_root = self.dst.as_path();

        if !fs::metadata(src_root).map(|m| m.is_dir()).unwrap_or(false) {
            return Err(LinkbackError::invalid_source(
                src_root,
                "not an existing directory",
            ));
        }

        let dst_exists = scan::exists(dst_root);
        if dst_exists && !scan::is_real_dir(dst_root) {
            return Err(LinkbackError::invalid_destination(
                dst_root,
                "exists and is not a directory",
            ));
        }
        if !dst_exists && !self.dry_run {
            fs::create_dir(dst_root).map_err(|e| {
                LinkbackError::invalid_destination(dst_root, format!("cannot create: {}", e))
            })?;
        }

        let src_root_meta = scan::root_meta(src_root)?;
        let src_scan = scan::scan_tree_lenient(src_root, ScanOrder::TopDown)?;
        let src_entries = src_scan.entries;
        let index: HashMap<PathBuf, usize> = src_entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.path.clone(), i))
            .collect();
        let mut claimed = vec![false; src_entries.len()];

        let dst_scan = if dst_exists {
            scan::scan_tree_lenient(dst_root, ScanOrder::BottomUp)?
        } else {
            TreeScan::default()
        };
        let dst_entries = dst_scan.entries;

        let mut stats = SyncStats::default();
        let mut emit = |path: &Path, action: SyncAction| {
            debug!("Sync, {}: {:?}", action, path);
            stats.record(&action);
            on_action(&ActionRecord::new(path, action));
        };

        // Unreadable entries on either side
        for failure in src_scan.failures.iter().chain(&dst_scan.failures) {
            emit(&failure.path, SyncAction::Error(failure.message.clone()));
        }

        // Destination pass, children before parents
        for dst_entry in &dst_entries {
            let rel_path = dst_entry.path.as_path();
            let dst_path = dst_root.join(rel_path);

            let Some(&idx) = index.get(rel_path) else {
                // what the source cannot show us is kept, not deleted
                if src_scan.failures.iter().any(|f| rel_path.starts_with(&f.path)) {
                    continue;
                }
                let action = self.mutate(|| utils::remove_entry(&dst_path), SyncAction::Delete);
                emit(rel_path, action);
                continue;
            };
            claimed[idx] = true;
            let src_entry = &src_entries[idx];
            let src_path = src_root.join(rel_path);

            if src_entry.kind == EntryKind::Other {
                emit(rel_path, unsupported(&src_path));
                continue;
            }

            match classify(src_entry, dst_entry) {
                Verdict::NoChange => {}
                Verdict::Rewrite(reason) => {
                    debug!("Sync, rewriting ({}): {:?}", reason, rel_path);
                    let action = self.mutate(
                        || utils::replace_entry(&src_path, src_entry, &dst_path),
                        SyncAction::Rewrite,
                    );
                    emit(rel_path, action);
                }
                Verdict::Update {
                    permission,
                    owner,
                    time,
                } => {
                    // a linked inode is shared with older snapshots; give
                    // this path its own copy (with source metadata) first
                    let detach = dst_entry.is_shared();
                    if permission {
                        let action = self.mutate(
                            || {
                                if detach {
                                    utils::replace_entry(&src_path, src_entry, &dst_path)
                                } else {
                                    utils::set_mode(&dst_path, src_entry.mode)
                                }
                            },
                            SyncAction::UpdatePermission,
                        );
                        emit(rel_path, action);
                    }
                    if owner {
                        let action = self.mutate(
                            || {
                                if detach && !permission {
                                    utils::replace_entry(&src_path, src_entry, &dst_path)
                                } else {
                                    utils::set_owner(&dst_path, src_entry.uid, src_entry.gid)
                                }
                            },
                            SyncAction::UpdateOwner,
                        );
                        emit(rel_path, action);
                    }
                    if time {
                        // applied by the restore pass below
                        emit(rel_path, SyncAction::UpdateTime);
                    }
                }
            }
        }

        // Creation pass, parents before children
        for (src_entry, _) in src_entries.iter().zip(&claimed).filter(|(_, c)| !**c) {
            let rel_path = src_entry.path.as_path();
            let src_path = src_root.join(rel_path);
            if src_entry.kind == EntryKind::Other {
                emit(rel_path, unsupported(&src_path));
                continue;
            }
            let dst_path = dst_root.join(rel_path);
            let action = self.mutate(
                || utils::copy_entry(&src_path, src_entry, &dst_path),
                SyncAction::Create,
            );
            emit(rel_path, action);
        }

        if !self.dry_run {
            let dirs = src_entries
                .iter()
                .filter(|e| e.kind == EntryKind::Directory);
            for src_dir in dirs {
                restore_dir_time(&dst_root.join(&src_dir.path), src_dir);
            }
            restore_dir_time(dst_root, &src_root_meta);
        }

        Ok(stats)
    }

    /// Run `op` unless in dry-run mode and map its outcome to an action
    fn mutate<F>(&self, op: F, on_success: SyncAction) -> SyncAction
    where
        F: FnOnce() -> Result<()>,
    {
        if self.dry_run {
            return on_success;
        }
        match op() {
            Ok(()) => on_success,
            Err(e) => SyncAction::Error(e.to_string()),
        }
    }
}

/// Sync `src` into `dst` and collect the full action stream
pub fn sync_tree(src: &Path, dst: &Path, dry_run: bool) -> Result<Vec<ActionRecord>> {
    let mut records = Vec::new();
    TreeSync::new(src, dst)
        .dry_run(dry_run)
        .run(|record| records.push(record.clone()))?;
    Ok(records)
}

fn unsupported(path: &Path) -> SyncAction {
    SyncAction::Error(
        LinkbackError::UnsupportedEntryType {
            path: path.to_path_buf(),
        }
        .to_string(),
    )
}

fn restore_dir_time(dst_dir: &Path, src_meta: &EntryMeta) {
    match utils::modified_time(dst_dir) {
        Ok(current) if current == src_meta.modified => {}
        Ok(_) => {
            debug!("Sync, restoring directory mtime: {:?}", dst_dir);
            if let Err(e) = utils::set_modified(dst_dir, src_meta) {
                warn!("Cannot restore mtime of {:?}: {}", dst_dir, e);
            }
        }
        // creation of this directory already failed and was reported
        Err(e) => debug!("Skipping mtime restore of {:?}: {}", dst_dir, e),
    }
}
