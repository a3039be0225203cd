//! Error types for the linkback library
//!
//! This module defines all error types that can occur while syncing trees,
//! replicating snapshots, managing the backups lock or pruning old backups.
//!
//! Errors fall into two groups:
//!
//! - **Structural** errors (bad source, conflicting destination, unsupported
//!   entry type, failed replication) abort the current snapshot, which is
//!   then rolled back by deletion.
//! - **Environmental** errors (lock held, unsupported platform, invalid
//!   configuration) stop a run before anything under the backups root is
//!   touched.
//!
//! Per-entry failures during a sync are *not* errors at this level: they are
//! reported as [`SyncAction::Error`](crate::types::SyncAction::Error) records
//! and the sync carries on.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the linkback library
pub type Result<T> = std::result::Result<T, LinkbackError>;

/// Main error type for all linkback operations
#[derive(Debug, Error)]
pub enum LinkbackError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors while parsing or writing JSON configuration
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Source path is missing or not a directory
    #[error("Invalid source: {path:?} ({reason})")]
    InvalidSource {
        /// Offending source path
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// Destination exists but cannot be used as a target
    #[error("Invalid destination: {path:?} ({reason})")]
    InvalidDestination {
        /// Offending destination path
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// Filesystem object that is neither a file, a directory nor a symlink
    #[error("Unsupported entry type: {path:?}")]
    UnsupportedEntryType {
        /// Path to the unsupported entry
        path: PathBuf,
    },

    /// Another run holds the backups lock
    #[error("Backups lock is held by running process {pid} ({path:?})")]
    LockHeld {
        /// Process id recorded in the lock file
        pid: i32,
        /// Path of the lock file
        path: PathBuf,
    },

    /// Liveness of the lock owner could not be determined
    #[error("Cannot check lock owner {pid}: {errno}")]
    LockCheck {
        /// Process id recorded in the lock file
        pid: i32,
        /// Error returned by the system
        errno: nix::errno::Errno,
    },

    /// Seeding a new snapshot from the latest one failed
    #[error("Replication failed: {0}")]
    ReplicationFailure(String),

    /// Directory name is not a snapshot timestamp
    #[error("Invalid snapshot name: {0}")]
    InvalidSnapshot(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Running on a platform without hardlink/ownership semantics we rely on
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LinkbackError {
    /// Create an invalid source error
    pub fn invalid_source(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        LinkbackError::InvalidSource {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid destination error
    pub fn invalid_destination(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        LinkbackError::InvalidDestination {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        LinkbackError::InvalidConfiguration(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        LinkbackError::Internal(msg.into())
    }

    /// Check if this error aborts (and rolls back) the current snapshot
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            LinkbackError::InvalidSource { .. }
                | LinkbackError::InvalidDestination { .. }
                | LinkbackError::UnsupportedEntryType { .. }
                | LinkbackError::ReplicationFailure(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            LinkbackError::LockHeld { pid, .. } => {
                format!(
                    "Another backup (pid {}) is still running. Wait for it to finish \
                     or rerun with --force to terminate it.",
                    pid
                )
            }
            LinkbackError::UnsupportedEntryType { path } => {
                format!(
                    "{:?} is not a file, directory or symlink. Remove it from the source \
                     or exclude the source; backups never skip content silently.",
                    path
                )
            }
            LinkbackError::InvalidSource { path, .. } => {
                format!("Source {:?} does not exist or is not a directory.", path)
            }
            _ => self.to_string(),
        }
    }
}
