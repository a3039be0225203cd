//! # Linkback - hardlink snapshot backups
//!
//! Point-in-time snapshots of directory trees that share unchanged file
//! content with the previous snapshot through hardlinks, in the tradition of
//! rsync snapshot scripts and Time Machine.
//!
//! ## Overview
//!
//! Every run creates one snapshot directory under a backups root:
//!
//! 1. The latest finished snapshot is cloned by hardlinking every file
//!    ([`replicate`](mod@replicate)).
//! 2. Each source directory is synced into the clone ([`sync`]). Changed
//!    files are replaced by fresh copies, so older snapshots never change.
//! 3. Every created or changed path is also linked into the snapshot's
//!    delta directory, an inventory of what this run brought in.
//! 4. The snapshot is marked finished, or dropped if nothing changed.
//!
//! Old snapshots are thinned out by a tiered retention policy
//! ([`retention`]) and a lock file keeps runs from overlapping ([`lock`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use linkback::{BackupBuilder, BackupLock, RetentionPolicy};
//! use std::path::Path;
//!
//! # fn main() -> linkback::Result<()> {
//! let root = Path::new("/mnt/backups");
//! let lock = BackupLock::acquire(root, false)?;
//!
//! linkback::retention::prune(
//!     root,
//!     &RetentionPolicy::default(),
//!     chrono::Local::now().naive_local(),
//!     false,
//! )?;
//! let outcome = BackupBuilder::new(root)
//!     .source("/home/me/documents")
//!     .build()?
//!     .run()?;
//! println!("{} {}", outcome.name, outcome.fate);
//!
//! lock.release()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backups Root Layout
//!
//! ```text
//! /mnt/backups/
//! ├── .backups_lock
//! ├── 20240314_021500/
//! └── 20240315_021500/
//!     ├── .backup_finished-20240315_021500
//!     ├── .backup_delta/
//!     └── documents/
//! ```
//!
//! ## Module Organization
//!
//! - [`backup`]: one backup run, from seeding to marking
//! - [`sync`]: tree synchronization engine
//! - [`replicate`](mod@replicate): hardlink cloning of trees and single paths
//! - [`snapshot`]: snapshot naming, markers and discovery
//! - [`retention`]: tiered retention planning and pruning
//! - [`lock`]: backups root lock
//! - [`config`]: JSON configuration and platform checks
//! - [`types`]: entry metadata, sync actions and counters
//! - [`error`]: error types

pub mod backup;
pub mod config;
pub mod error;
pub mod lock;
pub mod replicate;
pub mod retention;
pub mod scan;
pub mod snapshot;
pub mod sync;
pub mod types;

mod utils;

pub use backup::{Backup, BackupBuilder, BackupOutcome, SnapshotFate, SourceReport};
pub use config::BackupConfig;
pub use error::{LinkbackError, Result};
pub use lock::{release_lock, BackupLock};
pub use replicate::{replicate, replicate_path};
pub use retention::{Cutoffs, RetentionPlan, RetentionPolicy};
pub use snapshot::Snapshot;
pub use sync::{sync_tree, TreeSync};
pub use types::*;
