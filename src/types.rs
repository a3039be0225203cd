//! Core data types used throughout the linkback library
//!
//! This module contains the data structures shared between the scanner, the
//! sync engine, the hardlink replicator and the orchestrator.
//!
//! ## Overview
//!
//! - **File System State**: [`EntryKind`], [`EntryMeta`] - one filesystem
//!   entry and the metadata captured for it at traversal time
//! - **Operations**: [`SyncAction`], [`ActionRecord`], [`SyncStats`] - what the
//!   sync engine did to each path
//!
//! ## Examples
//!
//! ```rust
//! use linkback::types::{SyncAction, SyncStats};
//!
//! let mut stats = SyncStats::default();
//! stats.record(&SyncAction::Create);
//! stats.record(&SyncAction::Error("permission denied".to_string()));
//!
//! assert_eq!(stats.created, 1);
//! assert_eq!(stats.errors, 1);
//! assert!(stats.has_changes());
//! ```

use crate::error::Result;
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Kind of a filesystem entry linkback knows how to back up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link (never followed)
    Symlink,
    /// Socket, fifo or device node; never backed up
    Other,
}

impl EntryKind {
    /// Classify an `lstat` result
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::File => write!(f, "file"),
            EntryKind::Directory => write!(f, "directory"),
            EntryKind::Symlink => write!(f, "symlink"),
            EntryKind::Other => write!(f, "special file"),
        }
    }
}

/// Metadata of one filesystem entry, captured once at traversal time
///
/// All comparisons made by the sync engine work on these values; nothing is
/// re-stat'ed lazily behind the caller's back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    /// Path relative to the tree root
    pub path: PathBuf,
    /// Entry kind
    pub kind: EntryKind,
    /// Size in bytes as reported by `lstat`
    pub size: u64,
    /// Last modification time
    pub modified: FileTime,
    /// Last access time
    pub accessed: FileTime,
    /// Permission bits (`st_mode & 0o7777`)
    pub mode: u32,
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
    /// Device the entry lives on
    pub dev: u64,
    /// Inode number
    pub ino: u64,
    /// Number of hard links to the inode
    pub nlink: u64,
    /// Target of symbolic link (if kind is Symlink)
    pub symlink_target: Option<PathBuf>,
}

impl EntryMeta {
    /// Read metadata for `full_path` without following symlinks
    pub fn read(full_path: &Path, rel_path: &Path) -> Result<Self> {
        let metadata = std::fs::symlink_metadata(full_path)?;
        Self::from_metadata(full_path, rel_path, &metadata)
    }

    /// Build from an already obtained `lstat` result
    pub fn from_metadata(full_path: &Path, rel_path: &Path, metadata: &Metadata) -> Result<Self> {
        let kind = EntryKind::from_metadata(metadata);
        let symlink_target = match kind {
            EntryKind::Symlink => Some(std::fs::read_link(full_path)?),
            _ => None,
        };

        Ok(Self {
            path: rel_path.to_path_buf(),
            kind,
            size: metadata.len(),
            modified: FileTime::from_last_modification_time(metadata),
            accessed: FileTime::from_last_access_time(metadata),
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
            dev: metadata.dev(),
            ino: metadata.ino(),
            nlink: metadata.nlink(),
            symlink_target,
        })
    }

    /// Whether both entries are the very same inode
    pub fn same_object(&self, other: &EntryMeta) -> bool {
        self.dev == other.dev && self.ino == other.ino
    }

    /// Whether another path links the same non-directory inode
    pub fn is_shared(&self) -> bool {
        self.kind != EntryKind::Directory && self.nlink > 1
    }

    /// Whether owner or group differ
    pub fn owner_differs(&self, other: &EntryMeta) -> bool {
        self.uid != other.uid || self.gid != other.gid
    }
}

/// Outcome of comparing one source entry against its destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncAction {
    /// Entries already match
    NoChange,
    /// Entry was missing in the destination and has been created
    Create,
    /// Destination entry was replaced with a fresh copy of the source
    Rewrite,
    /// Directory modification time differs from the source
    UpdateTime,
    /// Permission bits were changed to match the source
    UpdatePermission,
    /// Owner or group were changed to match the source
    UpdateOwner,
    /// Entry absent in the source has been removed from the destination
    Delete,
    /// Processing this entry failed
    Error(String),
}

impl SyncAction {
    /// Whether this path belongs in the snapshot's delta directory
    pub fn is_recordable(&self) -> bool {
        !matches!(
            self,
            SyncAction::NoChange | SyncAction::Delete | SyncAction::Error(_)
        )
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::NoChange => write!(f, "no-change"),
            SyncAction::Create => write!(f, "create"),
            SyncAction::Rewrite => write!(f, "rewrite"),
            SyncAction::UpdateTime => write!(f, "update-time"),
            SyncAction::UpdatePermission => write!(f, "update-permission"),
            SyncAction::UpdateOwner => write!(f, "update-owner"),
            SyncAction::Delete => write!(f, "delete"),
            SyncAction::Error(msg) => write!(f, "error ({})", msg),
        }
    }
}

/// One element of the sync engine's action stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRecord {
    /// Path relative to the synced roots
    pub path: PathBuf,
    /// What happened to it
    pub action: SyncAction,
}

impl ActionRecord {
    /// Create a new record
    pub fn new(path: impl Into<PathBuf>, action: SyncAction) -> Self {
        Self {
            path: path.into(),
            action,
        }
    }

    /// Diagnostic message (empty unless the action is an error)
    pub fn message(&self) -> &str {
        match &self.action {
            SyncAction::Error(msg) => msg,
            _ => "",
        }
    }
}

/// Per-kind counters for one sync call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Entries created
    pub created: usize,
    /// Entries rewritten
    pub rewritten: usize,
    /// Directory times flagged for update
    pub times_updated: usize,
    /// Permission updates
    pub permissions_updated: usize,
    /// Owner updates
    pub owners_updated: usize,
    /// Entries deleted
    pub deleted: usize,
    /// Per-entry failures
    pub errors: usize,
}

impl SyncStats {
    /// Count one action
    pub fn record(&mut self, action: &SyncAction) {
        match action {
            SyncAction::NoChange => {}
            SyncAction::Create => self.created += 1,
            SyncAction::Rewrite => self.rewritten += 1,
            SyncAction::UpdateTime => self.times_updated += 1,
            SyncAction::UpdatePermission => self.permissions_updated += 1,
            SyncAction::UpdateOwner => self.owners_updated += 1,
            SyncAction::Delete => self.deleted += 1,
            SyncAction::Error(_) => self.errors += 1,
        }
    }

    /// Total number of emitted actions
    pub fn total(&self) -> usize {
        self.created
            + self.rewritten
            + self.times_updated
            + self.permissions_updated
            + self.owners_updated
            + self.deleted
            + self.errors
    }

    /// Check if anything at all was reported
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }

    /// Add another set of counters to this one
    pub fn merge(&mut self, other: &SyncStats) {
        self.created += other.created;
        self.rewritten += other.rewritten;
        self.times_updated += other.times_updated;
        self.permissions_updated += other.permissions_updated;
        self.owners_updated += other.owners_updated;
        self.deleted += other.deleted;
        self.errors += other.errors;
    }
}
