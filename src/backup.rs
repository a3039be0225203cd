//! Snapshot orchestration
//!
//! Ties the pieces together into one backup run:
//!
//! 1. Derive the new snapshot name from the run's timestamp.
//! 2. Seed the new snapshot by hardlink-replicating the latest valid one
//!    (or start from an empty directory when there is none).
//! 3. Sync every source into `<snapshot>/<source basename>` and record each
//!    created or changed path into the snapshot's delta directory.
//! 4. Keep the snapshot and write its completion marker, or throw it away
//!    if this is a dry run or nothing changed since the latest snapshot.
//!
//! A snapshot only ever becomes valid through the marker written in the
//! last step. Any failure before that deletes the new directory, and a
//! crash leaves an unmarked directory that later runs ignore.
//!
//! # Examples
//!
//! ```rust,no_run
//! use linkback::BackupBuilder;
//!
//! # fn main() -> linkback::Result<()> {
//! let outcome = BackupBuilder::new("/mnt/backups")
//!     .source("/home/me/documents")
//!     .source("/home/me/photos")
//!     .build()?
//!     .run()?;
//! println!("{}: {}", outcome.name, outcome.fate);
//! # Ok(())
//! # }
//! ```

use crate::error::{LinkbackError, Result};
use crate::replicate::{replicate, replicate_path};
use crate::scan;
use crate::snapshot::{self, format_snapshot_name, Snapshot, DELTA_DIR, MARKER_PREFIX};
use crate::sync::TreeSync;
use crate::types::{SyncAction, SyncStats};
use chrono::{Local, NaiveDateTime};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// What happened to the snapshot created by a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFate {
    /// Marked complete and kept
    Completed,
    /// Deleted because nothing changed since the latest snapshot
    Discarded,
    /// Deleted because the run was a dry run
    DryRun,
}

impl fmt::Display for SnapshotFate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotFate::Completed => write!(f, "completed"),
            SnapshotFate::Discarded => write!(f, "discarded (no changes)"),
            SnapshotFate::DryRun => write!(f, "dry run"),
        }
    }
}

/// Sync counters of one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    /// Absolute source path
    pub source: PathBuf,
    /// Directory name inside the snapshot
    pub name: String,
    /// Actions reported while syncing it
    pub stats: SyncStats,
}

/// Result of [`Backup::run`]
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    /// Name of the snapshot this run created
    pub name: String,
    /// Its path (gone unless `fate` is [`SnapshotFate::Completed`])
    pub path: PathBuf,
    /// Whether it was kept
    pub fate: SnapshotFate,
    /// Snapshot the run was seeded from
    pub previous: Option<String>,
    /// Per-source sync counters
    pub sources: Vec<SourceReport>,
    /// Paths that could not be recorded into the delta directory
    pub delta_failures: usize,
    /// Wall time of the run
    pub elapsed: Duration,
}

impl BackupOutcome {
    /// Sum of all per-source counters
    pub fn totals(&self) -> SyncStats {
        let mut totals = SyncStats::default();
        for report in &self.sources {
            totals.merge(&report.stats);
        }
        totals
    }

    /// Whether any source reported any action
    pub fn changed(&self) -> bool {
        self.sources.iter().any(|r| r.stats.has_changes())
    }
}

/// Builder for a [`Backup`] run
///
/// # Default Values
///
/// - `sources`: none (at least one is required)
/// - `dry_run`: false
/// - `timestamp`: local time when [`BackupBuilder::build`] is called
#[derive(Debug, Clone)]
pub struct BackupBuilder {
    backups_root: PathBuf,
    sources: Vec<PathBuf>,
    dry_run: bool,
    timestamp: Option<NaiveDateTime>,
}

impl BackupBuilder {
    /// Start a run that stores snapshots under `backups_root`
    pub fn new(backups_root: impl Into<PathBuf>) -> Self {
        Self {
            backups_root: backups_root.into(),
            sources: Vec::new(),
            dry_run: false,
            timestamp: None,
        }
    }

    /// Add one source directory
    pub fn source(mut self, source: impl Into<PathBuf>) -> Self {
        self.sources.push(source.into());
        self
    }

    /// Add several source directories
    pub fn sources<I, P>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    /// Report what would change without keeping a snapshot
    ///
    /// The new snapshot is still seeded (so the report is accurate) and then
    /// deleted. Sources are never modified in any mode.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Use `timestamp` as the snapshot's creation time instead of now
    pub fn timestamp(mut self, timestamp: NaiveDateTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Validate the configuration and prepare the run
    ///
    /// # Errors
    ///
    /// - [`LinkbackError::InvalidDestination`] if the backups root is not an
    ///   existing directory
    /// - [`LinkbackError::InvalidSource`] if a source is not an existing
    ///   directory or has no usable name
    /// - [`LinkbackError::InvalidConfiguration`] if there are no sources, two
    ///   sources share a basename, a basename collides with a reserved
    ///   snapshot entry, or a source and the backups root contain each other
    pub fn build(self) -> Result<Backup> {
        if !fs::metadata(&self.backups_root).map(|m| m.is_dir()).unwrap_or(false) {
            return Err(LinkbackError::invalid_destination(
                &self.backups_root,
                "backups directory does not exist",
            ));
        }
        if self.sources.is_empty() {
            return Err(LinkbackError::config("No source directories given"));
        }

        let backups_root = std::path::absolute(&self.backups_root)?;
        let real_root = fs::canonicalize(&backups_root)?;
        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(self.sources.len());
        for raw in &self.sources {
            let source = Source::resolve(raw)?;
            if !seen.insert(source.name.clone()) {
                return Err(LinkbackError::config(format!(
                    "Two sources share the name {:?}",
                    source.name
                )));
            }

            let real_source = fs::canonicalize(&source.path)?;
            if real_root.starts_with(&real_source) || real_source.starts_with(&real_root) {
                return Err(LinkbackError::config(format!(
                    "Source {:?} and backups directory {:?} overlap",
                    source.path, backups_root
                )));
            }
            sources.push(source);
        }

        Ok(Backup {
            backups_root,
            sources,
            dry_run: self.dry_run,
            timestamp: self
                .timestamp
                .unwrap_or_else(|| Local::now().naive_local()),
        })
    }
}

/// One validated source directory
#[derive(Debug, Clone)]
struct Source {
    path: PathBuf,
    name: OsString,
}

impl Source {
    fn resolve(raw: &Path) -> Result<Self> {
        if !fs::metadata(raw).map(|m| m.is_dir()).unwrap_or(false) {
            return Err(LinkbackError::invalid_source(raw, "not an existing directory"));
        }
        let path = std::path::absolute(raw)?;
        let Some(name) = path.file_name().map(OsString::from) else {
            return Err(LinkbackError::invalid_source(raw, "cannot derive a name"));
        };

        let reserved = name == DELTA_DIR
            || name
                .to_str()
                .map(|n| n.starts_with(MARKER_PREFIX))
                .unwrap_or(false);
        if reserved {
            return Err(LinkbackError::config(format!(
                "Source name {:?} is reserved inside snapshots",
                name
            )));
        }
        Ok(Self { path, name })
    }

    fn display_name(&self) -> String {
        self.name.to_string_lossy().into_owned()
    }
}

/// A validated backup run, created by [`BackupBuilder::build`]
#[derive(Debug, Clone)]
pub struct Backup {
    backups_root: PathBuf,
    sources: Vec<Source>,
    dry_run: bool,
    timestamp: NaiveDateTime,
}

impl Backup {
    /// Backups root the run writes to
    pub fn backups_root(&self) -> &Path {
        &self.backups_root
    }

    /// Name the new snapshot will get
    pub fn snapshot_name(&self) -> String {
        format_snapshot_name(&self.timestamp)
    }

    /// Create one snapshot
    ///
    /// Callers are expected to hold the backups lock.
    ///
    /// # Errors
    ///
    /// - [`LinkbackError::InvalidDestination`] if a snapshot with the same
    ///   name already exists; nothing is touched in that case
    /// - [`LinkbackError::ReplicationFailure`] if seeding from the latest
    ///   snapshot fails
    /// - any structural sync error
    ///
    /// On every error after the new directory was created it is deleted
    /// again.
    #[instrument(skip(self), fields(root = %self.backups_root.display(), dry_run = self.dry_run))]
    pub fn run(&self) -> Result<BackupOutcome> {
        let start = Instant::now();
        let name = self.snapshot_name();
        let path = self.backups_root.join(&name);
        debug!("Current backup dir: {:?}", path);

        if scan::exists(&path) {
            return Err(LinkbackError::invalid_destination(
                &path,
                "a snapshot with this name already exists",
            ));
        }

        let latest = snapshot::latest_snapshot(&self.backups_root, !self.dry_run)?;
        match &latest {
            None => {
                info!("Creating empty directory for current backup: {}", name);
                fs::create_dir(&path)?;
            }
            Some(latest) => {
                info!(
                    "Copying data from latest backup {} to current backup {}",
                    latest.name, name
                );
                if let Err(e) = replicate(&latest.path, &path) {
                    error!(
                        "Copying data from latest backup failed, removing created {}: {}",
                        name, e
                    );
                    discard(&path);
                    return Err(LinkbackError::ReplicationFailure(format!(
                        "{} -> {}: {}",
                        latest.name, name, e
                    )));
                }
            }
        }

        let (mut current, sources, delta_failures) = match self.populate(&path) {
            Ok(populated) => populated,
            Err(e) => {
                error!("Backup {} failed, removing it: {}", name, e);
                discard(&path);
                return Err(e);
            }
        };

        let changed = sources.iter().any(|r| r.stats.has_changes());
        let fate = if self.dry_run {
            info!("Dry-run, removing created backup: {}", name);
            discard(&path);
            SnapshotFate::DryRun
        } else if let (Some(latest), false) = (&latest, changed) {
            info!(
                "Newly created backup {} is the same as previous one {}, removing",
                name, latest.name
            );
            discard(&path);
            SnapshotFate::Discarded
        } else {
            if let Err(e) = current.mark_complete() {
                error!("Cannot mark backup {} complete, removing it: {}", name, e);
                discard(&path);
                return Err(e);
            }
            info!("Backup created: {}", name);
            SnapshotFate::Completed
        };

        if delta_failures > 0 {
            warn!("{} path(s) could not be recorded in {}", delta_failures, DELTA_DIR);
        }

        Ok(BackupOutcome {
            name,
            path,
            fate,
            previous: latest.map(|l| l.name),
            sources,
            delta_failures,
            elapsed: start.elapsed(),
        })
    }

    /// Strip the seed's leftovers and sync every source into the snapshot
    fn populate(&self, path: &Path) -> Result<(Snapshot, Vec<SourceReport>, usize)> {
        let mut current = Snapshot::open(path)?.ok_or_else(|| {
            LinkbackError::internal(format!("{:?} is not a snapshot directory", path))
        })?;
        current.strip_inherited()?;

        let delta_root = current.delta_path();
        let mut delta_failures = 0;
        let mut reports = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let dst = path.join(&source.name);
            info!(
                "Backing up directory {:?} to {} backup",
                source.path, current.name
            );

            let stats = TreeSync::new(&source.path, &dst)
                .dry_run(self.dry_run)
                .run(|record| {
                    if let SyncAction::Error(msg) = &record.action {
                        warn!("Failed to back up {:?}: {}", record.path, msg);
                        return;
                    }
                    if self.dry_run || !record.action.is_recordable() {
                        return;
                    }
                    let rel_path = Path::new(&source.name).join(&record.path);
                    if let Err(e) = replicate_path(path, &rel_path, &delta_root) {
                        warn!("Cannot record {:?} in {}: {}", rel_path, DELTA_DIR, e);
                        delta_failures += 1;
                    }
                })?;

            debug!("{} actions for {:?}", stats.total(), source.path);
            reports.push(SourceReport {
                source: source.path.clone(),
                name: source.display_name(),
                stats,
            });
        }

        Ok((current, reports, delta_failures))
    }
}

/// Delete a snapshot directory created by this run
fn discard(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!("Cannot remove {:?}: {}", path, e);
        }
    }
}
