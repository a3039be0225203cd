//! Snapshot directories under the backups root
//!
//! A snapshot is a directory directly under the backups root whose name is
//! its creation time in `%Y%m%d_%H%M%S` format, for example
//! `20240315_021500`. Layout of one snapshot:
//!
//! ```text
//! 20240315_021500/
//! ├── .backup_finished-20240315_021500   completion marker (empty file)
//! ├── .backup_delta/                      paths created or changed by this run
//! ├── documents/                          one directory per source, named
//! └── photos/                             after the source's basename
//! ```
//!
//! Only snapshots carrying their own completion marker and at least one
//! other entry are *valid*: they are the only ones used as a replication
//! seed or considered by retention. Anything else with a timestamp name is
//! an unfinished run and ignored.

use crate::error::{LinkbackError, Result};
use chrono::NaiveDateTime;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Format of snapshot directory names
pub const SNAPSHOT_NAME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Accepted when parsing only; written names always carry seconds
const SHORT_NAME_FORMAT: &str = "%Y%m%d_%H%M";

/// Reserved name of the per-snapshot delta directory
pub const DELTA_DIR: &str = ".backup_delta";

/// Prefix of completion marker file names; the snapshot name follows it
pub const MARKER_PREFIX: &str = ".backup_finished-";

/// Parse a snapshot directory name into its creation time
///
/// # Errors
///
/// [`LinkbackError::InvalidSnapshot`] unless the name is `YYYYMMDD_HHMMSS`
/// or `YYYYMMDD_HHMM` denoting a real calendar time.
pub fn parse_snapshot_name(name: &str) -> Result<NaiveDateTime> {
    let bytes = name.as_bytes();
    let well_formed = matches!(bytes.len(), 13 | 15)
        && bytes[8] == b'_'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 8 || b.is_ascii_digit());
    if !well_formed {
        return Err(LinkbackError::InvalidSnapshot(name.to_string()));
    }

    let format = if bytes.len() == 15 {
        SNAPSHOT_NAME_FORMAT
    } else {
        SHORT_NAME_FORMAT
    };
    NaiveDateTime::parse_from_str(name, format)
        .map_err(|_| LinkbackError::InvalidSnapshot(name.to_string()))
}

/// Format a creation time as a snapshot directory name
pub fn format_snapshot_name(created: &NaiveDateTime) -> String {
    created.format(SNAPSHOT_NAME_FORMAT).to_string()
}

/// File name of the completion marker of snapshot `name`
pub fn marker_name(name: &str) -> String {
    format!("{}{}", MARKER_PREFIX, name)
}

/// One timestamp-named directory under the backups root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Directory name
    pub name: String,
    /// Full path
    pub path: PathBuf,
    /// Creation time parsed from the name
    pub created: NaiveDateTime,
    /// Own completion marker present
    pub has_marker: bool,
    /// Delta directory present
    pub has_delta: bool,
    /// Entries besides the own completion marker
    pub content_entries: usize,
}

impl Snapshot {
    /// Inspect the snapshot directory at `path`
    ///
    /// Returns `Ok(None)` if the file name is not a snapshot timestamp.
    pub fn open(path: &Path) -> Result<Option<Self>> {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let Ok(created) = parse_snapshot_name(name) else {
            return Ok(None);
        };

        let own_marker = marker_name(name);
        let mut has_marker = false;
        let mut has_delta = false;
        let mut content_entries = 0;
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let entry_name = entry.file_name();
            if entry_name == own_marker.as_str() {
                has_marker = true;
                continue;
            }
            if entry_name == DELTA_DIR {
                has_delta = true;
            }
            content_entries += 1;
        }

        Ok(Some(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            created,
            has_marker,
            has_delta,
            content_entries,
        }))
    }

    /// Finished successfully and holds something besides its marker
    pub fn is_valid(&self) -> bool {
        self.has_marker && self.content_entries > 0
    }

    /// Completely empty directory
    pub fn is_empty(&self) -> bool {
        !self.has_marker && self.content_entries == 0
    }

    /// Path of this snapshot's completion marker
    pub fn marker_path(&self) -> PathBuf {
        self.path.join(marker_name(&self.name))
    }

    /// Path of this snapshot's delta directory
    pub fn delta_path(&self) -> PathBuf {
        self.path.join(DELTA_DIR)
    }

    /// Write the completion marker
    pub fn mark_complete(&mut self) -> Result<()> {
        fs::File::create(self.marker_path())?;
        self.has_marker = true;
        Ok(())
    }

    /// Remove completion markers and the delta directory inherited from the
    /// snapshot this one was replicated from
    pub fn strip_inherited(&mut self) -> Result<()> {
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let is_marker = entry
                .file_name()
                .to_str()
                .map(|n| n.starts_with(MARKER_PREFIX))
                .unwrap_or(false);
            if is_marker && !entry.file_type()?.is_dir() {
                debug!("Removing inherited marker {:?}", entry.path());
                fs::remove_file(entry.path())?;
                self.content_entries = self.content_entries.saturating_sub(1);
            }
        }
        self.has_marker = false;

        let delta = self.delta_path();
        if delta.exists() {
            debug!("Removing inherited delta directory {:?}", delta);
            fs::remove_dir_all(&delta)?;
            self.content_entries = self.content_entries.saturating_sub(1);
        }
        self.has_delta = false;
        Ok(())
    }

    /// Delete the snapshot directory with everything in it
    pub fn remove(&self) -> Result<()> {
        fs::remove_dir_all(&self.path)?;
        Ok(())
    }
}

/// Every timestamp-named directory under `root`, oldest first
///
/// With `prune_empty`, completely empty snapshot directories are removed
/// on the way and not returned.
pub fn list_snapshots(root: &Path, prune_empty: bool) -> Result<Vec<Snapshot>> {
    let mut snapshots = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(snapshot) = Snapshot::open(&entry.path())? else {
            continue;
        };
        if prune_empty && snapshot.is_empty() {
            info!("Removing empty backup entity: {}", snapshot.name);
            fs::remove_dir(&snapshot.path)?;
            continue;
        }
        snapshots.push(snapshot);
    }

    snapshots.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
    Ok(snapshots)
}

/// Valid snapshots under `root`, oldest first
pub fn valid_snapshots(root: &Path, prune_empty: bool) -> Result<Vec<Snapshot>> {
    let all = list_snapshots(root, prune_empty)?;
    let total = all.len();
    let valid: Vec<Snapshot> = all.into_iter().filter(Snapshot::is_valid).collect();
    if valid.len() != total {
        debug!(
            "Ignoring {} unfinished snapshot(s) under {:?}",
            total - valid.len(),
            root
        );
    }
    Ok(valid)
}

/// Most recent valid snapshot under `root`
pub fn latest_snapshot(root: &Path, prune_empty: bool) -> Result<Option<Snapshot>> {
    Ok(valid_snapshots(root, prune_empty)?.pop())
}
