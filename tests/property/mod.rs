//! Property-based testing for linkback
//!
//! Uses proptest to check sync and retention invariants over randomly
//! generated trees and snapshot histories.

use ::linkback::scan::{scan_tree, ScanOrder};
use ::linkback::retention::Tier;
use ::linkback::*;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use filetime::FileTime;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// One entry of a generated tree
#[derive(Debug, Clone)]
pub enum Node {
    File { content: Vec<u8>, mode: u32 },
    Dir,
    Link(String),
}

fn node_strategy() -> impl Strategy<Value = Node> {
    prop_oneof![
        3 => (
            prop::collection::vec(any::<u8>(), 0..48),
            prop_oneof![Just(0o644), Just(0o600), Just(0o755)],
        )
            .prop_map(|(content, mode)| Node::File { content, mode }),
        2 => Just(Node::Dir),
        1 => "[a-c]{1,2}".prop_map(Node::Link),
    ]
}

/// Short paths over a tiny alphabet so source and destination overlap a lot
fn rel_path_strategy() -> impl Strategy<Value = PathBuf> {
    prop::collection::vec(prop_oneof![Just("a"), Just("b"), Just("c")], 1..=3)
        .prop_map(|parts| parts.iter().collect())
}

fn tree_strategy() -> impl Strategy<Value = Vec<(PathBuf, Node)>> {
    prop::collection::vec((rel_path_strategy(), node_strategy()), 0..12)
}

/// Materialize `nodes` under `root`; entries that collide are skipped
pub fn build_tree(root: &Path, nodes: &[(PathBuf, Node)], mtime_base: i64) {
    fs::create_dir_all(root).unwrap();
    for (i, (rel, node)) in nodes.iter().enumerate() {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                continue;
            }
        }
        if fs::symlink_metadata(&path).is_ok() {
            continue;
        }
        match node {
            Node::File { content, mode } => {
                fs::write(&path, content).unwrap();
                fs::set_permissions(&path, fs::Permissions::from_mode(*mode)).unwrap();
                let mtime = FileTime::from_unix_time(mtime_base + i as i64, 0);
                filetime::set_file_mtime(&path, mtime).unwrap();
            }
            Node::Dir => fs::create_dir(&path).unwrap(),
            Node::Link(target) => symlink(target, &path).unwrap(),
        }
    }

    // fixed directory times so runs do not depend on the clock
    let dir_time = FileTime::from_unix_time(mtime_base - 1, 0);
    for meta in scan_tree(root, ScanOrder::BottomUp).unwrap() {
        if meta.kind == EntryKind::Directory {
            filetime::set_file_mtime(root.join(&meta.path), dir_time).unwrap();
        }
    }
    filetime::set_file_mtime(root, dir_time).unwrap();
}

/// Comparable view of a tree: kind, mode, content or target, and times
/// where they are synced
#[derive(Debug, PartialEq, Eq)]
struct Observed {
    kind: EntryKind,
    mode: u32,
    content: Option<Vec<u8>>,
    target: Option<PathBuf>,
    mtime: Option<FileTime>,
}

fn observe(root: &Path) -> BTreeMap<PathBuf, Observed> {
    scan_tree(root, ScanOrder::TopDown)
        .unwrap()
        .into_iter()
        .map(|meta| {
            let full = root.join(&meta.path);
            let observed = Observed {
                kind: meta.kind,
                mode: meta.mode,
                content: (meta.kind == EntryKind::File).then(|| fs::read(&full).unwrap()),
                target: meta.symlink_target.clone(),
                mtime: (meta.kind != EntryKind::Symlink).then_some(meta.modified),
            };
            (meta.path, observed)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// After a sync the destination mirrors the source
    #[test]
    fn prop_sync_mirrors_source(src_nodes in tree_strategy(), dst_nodes in tree_strategy()) {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        build_tree(&src, &src_nodes, 1_000_000);
        build_tree(&dst, &dst_nodes, 2_000_000);

        let records = sync_tree(&src, &dst, false).unwrap();
        prop_assert!(records.iter().all(|r| !matches!(r.action, SyncAction::Error(_))));
        prop_assert_eq!(observe(&src), observe(&dst));
    }

    /// A second sync of identical trees reports nothing
    #[test]
    fn prop_sync_is_idempotent(src_nodes in tree_strategy(), dst_nodes in tree_strategy()) {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        build_tree(&src, &src_nodes, 1_000_000);
        build_tree(&dst, &dst_nodes, 2_000_000);

        sync_tree(&src, &dst, false).unwrap();
        let second = sync_tree(&src, &dst, false).unwrap();
        prop_assert!(second.is_empty(), "unexpected actions: {:?}", second);
    }

    /// A dry run reports exactly what a real run does, and changes nothing
    #[test]
    fn prop_dry_run_matches_real_run(src_nodes in tree_strategy(), dst_nodes in tree_strategy()) {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        let dry = temp_dir.path().join("dry");
        let real = temp_dir.path().join("real");
        build_tree(&src, &src_nodes, 1_000_000);
        build_tree(&dry, &dst_nodes, 2_000_000);
        build_tree(&real, &dst_nodes, 2_000_000);

        let before = observe(&dry);
        let planned = sync_tree(&src, &dry, true).unwrap();
        let applied = sync_tree(&src, &real, false).unwrap();
        prop_assert_eq!(planned, applied);
        prop_assert_eq!(before, observe(&dry));
    }
}

fn base_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn history_strategy() -> impl Strategy<Value = Vec<NaiveDateTime>> {
    prop::collection::btree_set(0i64..(3 * 365 * 24), 0..40).prop_map(|hours| {
        hours
            .into_iter()
            .map(|h| base_time() + Duration::hours(h))
            .collect()
    })
}

fn policy_strategy() -> impl Strategy<Value = RetentionPolicy> {
    let tier = || prop::option::of(0u32..20);
    (tier(), tier(), tier(), tier(), tier()).prop_map(
        |(keep_all, keep_daily, keep_weekly, keep_monthly, keep_yearly)| RetentionPolicy {
            keep_all,
            keep_daily,
            keep_weekly,
            keep_monthly,
            keep_yearly,
        },
    )
}

fn as_snapshots(times: &[NaiveDateTime]) -> Vec<Snapshot> {
    times
        .iter()
        .map(|created| {
            let name = snapshot::format_snapshot_name(created);
            Snapshot {
                path: PathBuf::from(&name),
                name,
                created: *created,
                has_marker: true,
                has_delta: false,
                content_entries: 1,
            }
        })
        .collect()
}

proptest! {
    /// Planning partitions the input and never empties a non-empty history
    #[test]
    fn prop_retention_keeps_at_least_one(
        times in history_strategy(),
        policy in policy_strategy(),
        days_after in 0i64..400,
    ) {
        let snapshots = as_snapshots(&times);
        let now = base_time() + Duration::days(3 * 365 + days_after);
        let plan = retention::plan(&snapshots, &policy, now);

        prop_assert_eq!(plan.keep.len() + plan.remove.len(), snapshots.len());
        if !snapshots.is_empty() {
            prop_assert!(!plan.keep.is_empty());
        }
        if snapshots.len() < 2 {
            prop_assert!(plan.remove.is_empty());
        }
    }

    /// With every tier disabled only the newest snapshot survives
    #[test]
    fn prop_disabled_policy_keeps_only_newest(times in history_strategy()) {
        prop_assume!(!times.is_empty());
        let snapshots = as_snapshots(&times);
        let now = base_time() + Duration::days(4 * 365);
        let plan = retention::plan(&snapshots, &RetentionPolicy::disabled(), now);
        prop_assert_eq!(plan.keep.len(), 1);
    }
}

/// Policy with exactly one bucketed tier enabled
fn single_tier_strategy() -> impl Strategy<Value = (Tier, RetentionPolicy)> {
    (
        prop_oneof![
            Just(Tier::Daily),
            Just(Tier::Weekly),
            Just(Tier::Monthly),
            Just(Tier::Yearly),
        ],
        1u32..60,
    )
        .prop_map(|(tier, n)| {
            let mut policy = RetentionPolicy::disabled();
            match tier {
                Tier::Daily => policy.keep_daily = Some(n),
                Tier::Weekly => policy.keep_weekly = Some(n),
                Tier::Monthly => policy.keep_monthly = Some(n),
                Tier::Yearly => policy.keep_yearly = Some(n),
                Tier::All => policy.keep_all = Some(n),
            }
            (tier, policy)
        })
}

fn bucket_key(tier: Tier, created: &NaiveDateTime) -> (i32, u32, u32) {
    match tier {
        Tier::All => unreachable!("the all tier has no buckets"),
        Tier::Daily => (created.year(), created.ordinal(), 0),
        Tier::Weekly => (0, created.iso_week().week(), 0),
        Tier::Monthly => (created.year(), created.month(), 0),
        Tier::Yearly => (created.year(), 0, 0),
    }
}

proptest! {
    /// Planning again over the survivors removes nothing
    #[test]
    fn prop_retention_idempotent(
        times in history_strategy(),
        (_tier, policy) in single_tier_strategy(),
        days_after in 0i64..400,
    ) {
        let snapshots = as_snapshots(&times);
        let now = base_time() + Duration::days(3 * 365 + days_after);
        let first = retention::plan(&snapshots, &policy, now);
        let second = retention::plan(&first.keep, &policy, now);
        prop_assert!(second.remove.is_empty(), "second pass removed {:?}", second.remove);
    }

    /// Of every run of consecutive snapshots sharing a bucket only the
    /// oldest survives; snapshots outside the tier are removed
    #[test]
    fn prop_retention_oldest_in_bucket_survives(
        times in history_strategy(),
        (tier, policy) in single_tier_strategy(),
        days_after in 0i64..400,
    ) {
        prop_assume!(times.len() >= 2);
        let snapshots = as_snapshots(&times);
        let now = base_time() + Duration::days(3 * 365 + days_after);
        let cutoffs = Cutoffs::compute(&policy, now);
        let plan = retention::plan(&snapshots, &policy, now);

        // the newest always competes, whatever its age
        let newest = times[times.len() - 1];
        let tiered: Vec<NaiveDateTime> = times
            .iter()
            .copied()
            .filter(|t| *t == newest || cutoffs.tier_of(t).is_some())
            .collect();
        let expected: Vec<NaiveDateTime> = tiered
            .iter()
            .enumerate()
            .filter(|(i, t)| *i == 0 || bucket_key(tier, &tiered[i - 1]) != bucket_key(tier, t))
            .map(|(_, t)| *t)
            .collect();

        let kept: Vec<NaiveDateTime> = plan.keep.iter().map(|s| s.created).collect();
        prop_assert_eq!(kept, expected);
    }
}
