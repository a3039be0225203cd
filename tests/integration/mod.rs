//! Integration tests for complete backup runs
//!
//! Drives the public API the way the command line does: lock, prune,
//! back up, release, over several simulated days.

use ::linkback::*;
use chrono::{NaiveDate, NaiveDateTime};
use filetime::FileTime;
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// Backups root plus source directories in one temporary directory
pub struct BackupHarness {
    pub temp_dir: TempDir,
    pub root: PathBuf,
    pub sources: Vec<PathBuf>,
}

impl BackupHarness {
    /// Create an empty backups root without sources
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("backups");
        fs::create_dir(&root).unwrap();
        Self {
            temp_dir,
            root,
            sources: Vec::new(),
        }
    }

    /// Add a source directory named `name`
    pub fn add_source(&mut self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join("sources").join(name);
        fs::create_dir_all(&path).unwrap();
        self.sources.push(path.clone());
        path
    }

    /// Write a file below source `source`, creating parent directories
    pub fn write(&self, source: &str, rel: &str, content: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join("sources").join(source).join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    /// Write a file and stamp it with a modification time derived from `day`
    ///
    /// Keeps same-size rewrites visible to the size/time quick-check.
    pub fn write_on(&self, source: &str, rel: &str, content: &[u8], day: u32) -> PathBuf {
        let path = self.write(source, rel, content);
        let mtime = FileTime::from_unix_time(1_633_000_000 + i64::from(day) * 86_400, 0);
        filetime::set_file_mtime(&path, mtime).unwrap();
        path
    }

    /// Run one backup at 03:00 on October `day`, 2021
    pub fn run_at(&self, day: u32) -> Result<BackupOutcome> {
        self.builder(day).build()?.run()
    }

    pub fn builder(&self, day: u32) -> BackupBuilder {
        BackupBuilder::new(&self.root)
            .sources(&self.sources)
            .timestamp(day_at(day, 3))
    }

    /// Path of the snapshot taken by `run_at(day)`
    pub fn snapshot_path(&self, day: u32) -> PathBuf {
        self.root.join(format!("202110{:02}_030000", day))
    }

    /// Names of every entry in the backups root, sorted
    pub fn listing(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

impl Default for BackupHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn day_at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2021, 10, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn ino(path: &Path) -> u64 {
    fs::symlink_metadata(path).unwrap().ino()
}

#[test]
fn test_daily_backups_with_retention() {
    let mut harness = BackupHarness::new();
    harness.add_source("docs");
    harness.write("docs", "static.txt", b"never changes");

    for day in 1..=10 {
        harness.write_on("docs", "diary.txt", format!("day {:02}", day).as_bytes(), day);
        let lock = BackupLock::acquire(&harness.root, false).unwrap();
        let outcome = harness.run_at(day).unwrap();
        lock.release().unwrap();
        assert_eq!(outcome.fate, SnapshotFate::Completed, "day {}", day);
    }
    assert_eq!(snapshot::valid_snapshots(&harness.root, false).unwrap().len(), 10);

    let policy = RetentionPolicy {
        keep_all: Some(3),
        ..RetentionPolicy::disabled()
    };
    let plan = retention::prune(&harness.root, &policy, day_at(10, 12), false).unwrap();
    info!("Pruned {} snapshots", plan.remove.len());
    assert_eq!(plan.keep.len(), 4);
    assert_eq!(plan.remove.len(), 6);

    for day in 7..=10 {
        let diary = harness.snapshot_path(day).join("docs/diary.txt");
        assert_eq!(fs::read_to_string(diary).unwrap(), format!("day {:02}", day));
    }
    for day in 1..=6 {
        assert!(!harness.snapshot_path(day).exists());
    }

    // removing older snapshots does not touch shared content
    let static_file = harness.snapshot_path(7).join("docs/static.txt");
    assert_eq!(fs::read_to_string(&static_file).unwrap(), "never changes");
    assert_eq!(
        ino(&static_file),
        ino(&harness.snapshot_path(10).join("docs/static.txt"))
    );
}

#[test]
fn test_delta_holds_exactly_the_changes() {
    let mut harness = BackupHarness::new();
    let docs = harness.add_source("docs");
    harness.write("docs", "keep.txt", b"keep");
    harness.write("docs", "edit.txt", b"v1");
    harness.write("docs", "perm.txt", b"perm");
    harness.write("docs", "gone.txt", b"gone");
    harness.run_at(1).unwrap();

    harness.write("docs", "edit.txt", b"version 2");
    harness.write("docs", "new/deep/file.txt", b"new");
    fs::set_permissions(docs.join("perm.txt"), fs::Permissions::from_mode(0o600)).unwrap();
    fs::remove_file(docs.join("gone.txt")).unwrap();
    symlink("keep.txt", docs.join("alias")).unwrap();

    let outcome = harness.run_at(2).unwrap();
    assert_eq!(outcome.fate, SnapshotFate::Completed);
    let totals = outcome.totals();
    assert_eq!(totals.rewritten, 1);
    assert_eq!(totals.permissions_updated, 1);
    assert_eq!(totals.deleted, 1);
    assert_eq!(totals.created, 4);

    let snapshot = harness.snapshot_path(2);
    let delta = snapshot.join(snapshot::DELTA_DIR).join("docs");
    for changed in ["edit.txt", "perm.txt", "alias", "new/deep/file.txt"] {
        let in_delta = delta.join(changed);
        assert!(fs::symlink_metadata(&in_delta).is_ok(), "{} missing", changed);
        assert_eq!(ino(&in_delta), ino(&snapshot.join("docs").join(changed)));
    }
    assert!(!delta.join("keep.txt").exists());
    assert!(!delta.join("gone.txt").exists());
    assert_eq!(outcome.delta_failures, 0);
}

#[test]
fn test_crash_leftovers_and_stale_lock() {
    let mut harness = BackupHarness::new();
    harness.add_source("docs");
    harness.write("docs", "a.txt", b"a");
    harness.run_at(1).unwrap();

    // a run that died halfway: unmarked snapshot and a lock of a dead process
    let leftover = harness.snapshot_path(2);
    fs::create_dir_all(leftover.join("docs")).unwrap();
    fs::write(leftover.join("docs/partial"), b"x").unwrap();
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();
    fs::write(harness.root.join(lock::LOCK_FILE), dead_pid.to_string()).unwrap();

    let lock = BackupLock::acquire(&harness.root, false).unwrap();
    harness.write("docs", "b.txt", b"b");
    let outcome = harness.run_at(3).unwrap();
    lock.release().unwrap();

    assert_eq!(outcome.previous.as_deref(), Some("20211001_030000"));
    assert!(!harness.snapshot_path(3).join("docs/partial").exists());
    assert!(harness.snapshot_path(3).join("docs/b.txt").exists());
    assert!(!harness.root.join(lock::LOCK_FILE).exists());
}

#[test]
fn test_replication_failure_rolls_back() {
    let mut harness = BackupHarness::new();
    harness.add_source("docs");
    harness.write("docs", "a.txt", b"a");
    harness.run_at(1).unwrap();

    // something replication refuses to clone
    let socket = harness.snapshot_path(1).join("docs/socket");
    let _listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();

    let err = harness.run_at(2).unwrap_err();
    assert!(matches!(err, LinkbackError::ReplicationFailure(_)));
    assert!(!harness.snapshot_path(2).exists());
    assert!(harness.snapshot_path(1).join("docs/a.txt").exists());
}

#[test]
fn test_unsupported_source_entry_is_reported_not_fatal() {
    let mut harness = BackupHarness::new();
    let docs = harness.add_source("docs");
    harness.write("docs", "a.txt", b"a");
    let _listener = std::os::unix::net::UnixListener::bind(docs.join("socket")).unwrap();

    let outcome = harness.run_at(1).unwrap();
    assert_eq!(outcome.fate, SnapshotFate::Completed);
    assert_eq!(outcome.totals().errors, 1);
    assert!(harness.snapshot_path(1).join("docs/a.txt").exists());
    assert!(!harness.snapshot_path(1).join("docs/socket").exists());
}

#[test]
fn test_dry_run_cycle_changes_nothing() {
    let mut harness = BackupHarness::new();
    harness.add_source("docs");
    for day in 1..=3 {
        harness.write_on("docs", "diary.txt", format!("day {}", day).as_bytes(), day);
        harness.run_at(day).unwrap();
    }
    harness.write("docs", "diary.txt", b"day 4, not saved");
    let before = harness.listing();

    let policy = RetentionPolicy {
        keep_all: Some(1),
        ..RetentionPolicy::disabled()
    };
    let plan = retention::prune(&harness.root, &policy, day_at(4, 12), true).unwrap();
    assert_eq!(plan.remove.len(), 2);
    let outcome = harness.builder(4).dry_run(true).build().unwrap().run().unwrap();
    assert_eq!(outcome.fate, SnapshotFate::DryRun);
    assert_eq!(outcome.totals().rewritten, 1);

    assert_eq!(harness.listing(), before);
    let diary = harness.snapshot_path(3).join("docs/diary.txt");
    assert_eq!(fs::read_to_string(diary).unwrap(), "day 3");
}

#[test]
fn test_only_backup_survives_any_policy() {
    let mut harness = BackupHarness::new();
    harness.add_source("docs");
    harness.write("docs", "a.txt", b"a");
    harness.run_at(1).unwrap();

    let plan = retention::prune(
        &harness.root,
        &RetentionPolicy::disabled(),
        day_at(28, 0) + chrono::Duration::days(3650),
        false,
    )
    .unwrap();
    assert!(plan.remove.is_empty());
    assert!(harness.snapshot_path(1).exists());
}

#[test]
fn test_old_snapshots_never_change() {
    let mut harness = BackupHarness::new();
    let docs = harness.add_source("docs");
    let file = harness.write("docs", "report.txt", b"draft");
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
    let notes = harness.write("docs", "notes.txt", b"notes");
    fs::set_permissions(&notes, fs::Permissions::from_mode(0o644)).unwrap();
    harness.run_at(1).unwrap();

    // same size, new content and time
    fs::write(&file, b"final").unwrap();
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_600_000_100, 0)).unwrap();
    // permission-only change
    fs::set_permissions(&notes, fs::Permissions::from_mode(0o600)).unwrap();
    harness.run_at(2).unwrap();

    // replaced by a directory
    fs::remove_file(&file).unwrap();
    fs::create_dir(docs.join("report.txt")).unwrap();
    harness.run_at(3).unwrap();

    let first = harness.snapshot_path(1).join("docs/report.txt");
    let second = harness.snapshot_path(2).join("docs/report.txt");
    assert_eq!(fs::read_to_string(&first).unwrap(), "draft");
    assert_eq!(fs::read_to_string(&second).unwrap(), "final");
    assert!(harness.snapshot_path(3).join("docs/report.txt").is_dir());

    let mode = |day: u32| {
        let path = harness.snapshot_path(day).join("docs/notes.txt");
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    };
    assert_eq!(mode(1), 0o644);
    assert_eq!(mode(2), 0o600);
    assert_eq!(mode(3), 0o600);
}

#[test]
fn test_config_drives_a_run() {
    let mut harness = BackupHarness::new();
    harness.add_source("docs");
    harness.add_source("photos");
    harness.write("photos", "cat.jpg", b"meow");

    let config_path = harness.temp_dir.path().join("linkback.json");
    let config = BackupConfig {
        sources: harness.sources.clone(),
        ..BackupConfig::new(&harness.root)
    };
    fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let loaded = BackupConfig::load(&config_path).unwrap();
    loaded.validate().unwrap();
    let outcome = loaded
        .backup_builder()
        .timestamp(day_at(1, 3))
        .build()
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(outcome.sources.len(), 2);
    assert!(harness.snapshot_path(1).join("photos/cat.jpg").exists());
    assert!(harness.snapshot_path(1).join("docs").is_dir());
}
