//! Retention of old snapshots
//!
//! Snapshots are thinned out by age into tiers, from newest to oldest:
//!
//! | Tier    | Snapshots newer than                        | Kept                 |
//! |---------|---------------------------------------------|----------------------|
//! | all     | midnight, `keep_all` days ago               | every one            |
//! | daily   | midnight, `keep_daily` days ago             | one per day          |
//! | weekly  | midnight on Monday, `keep_weekly` weeks ago | one per ISO week     |
//! | monthly | the 1st of the month, `30 * keep_monthly` days ago | one per month |
//! | yearly  | Jan 1st, `365 * keep_yearly` days ago       | one per year         |
//!
//! Anything older than the yearly cutoff is removed. Within a bucket the
//! oldest snapshot survives. A disabled tier (`None`) has its cutoff at
//! `now`, so it never matches. At least one snapshot always survives, and a
//! lone snapshot is never touched.
//!
//! Weekly buckets are keyed by ISO week number alone, so week 1 of two
//! different years falls into the same bucket.
//!
//! With a single bucketed tier a second pass removes nothing. When one
//! coarse bucket spans two tiers (a daily snapshot and a weekly one in the
//! same ISO week) a second pass can still merge the survivors.
//!
//! Planning is pure: [`plan`] takes the clock value as an argument and
//! never touches the filesystem. [`prune`] applies a plan.

use crate::error::Result;
use crate::snapshot::{self, Snapshot};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, instrument};

/// How many of each tier to keep; `None` disables the tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Days during which every snapshot is kept
    pub keep_all: Option<u32>,
    /// Days during which one snapshot per day is kept
    pub keep_daily: Option<u32>,
    /// Weeks during which one snapshot per week is kept
    pub keep_weekly: Option<u32>,
    /// Months (30 days each) during which one snapshot per month is kept
    pub keep_monthly: Option<u32>,
    /// Years (365 days each) during which one snapshot per year is kept
    pub keep_yearly: Option<u32>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_all: Some(7),
            keep_daily: Some(30),
            keep_weekly: Some(52),
            keep_monthly: Some(12),
            keep_yearly: Some(5),
        }
    }
}

impl RetentionPolicy {
    /// Policy with every tier disabled
    pub fn disabled() -> Self {
        Self {
            keep_all: None,
            keep_daily: None,
            keep_weekly: None,
            keep_monthly: None,
            keep_yearly: None,
        }
    }
}

/// Retention tier a snapshot falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Every snapshot is kept
    All,
    /// One per calendar day
    Daily,
    /// One per ISO week number
    Weekly,
    /// One per calendar month
    Monthly,
    /// One per calendar year
    Yearly,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::All => "all",
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
            Tier::Yearly => "yearly",
        };
        f.write_str(name)
    }
}

impl Tier {
    /// Whether `a` and `b` fall into the same bucket of this tier
    fn same_bucket(self, a: &NaiveDateTime, b: &NaiveDateTime) -> bool {
        match self {
            Tier::All => false,
            Tier::Daily => a.date() == b.date(),
            Tier::Weekly => a.iso_week().week() == b.iso_week().week(),
            Tier::Monthly => a.year() == b.year() && a.month() == b.month(),
            Tier::Yearly => a.year() == b.year(),
        }
    }
}

/// Lower bounds of every tier, computed from one clock value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cutoffs {
    /// Snapshots after this are all kept
    pub all: NaiveDateTime,
    /// Start of the daily tier
    pub daily: NaiveDateTime,
    /// Start of the weekly tier
    pub weekly: NaiveDateTime,
    /// Start of the monthly tier
    pub monthly: NaiveDateTime,
    /// Start of the yearly tier; anything older is removed
    pub yearly: NaiveDateTime,
}

impl Cutoffs {
    /// Compute the cutoffs of `policy` relative to `now`
    pub fn compute(policy: &RetentionPolicy, now: NaiveDateTime) -> Self {
        let all = policy
            .keep_all
            .map(|n| midnight(days_before(now, i64::from(n)).date()))
            .unwrap_or(now);

        let daily = policy
            .keep_daily
            .map(|n| midnight(days_before(now, i64::from(n)).date()))
            .unwrap_or(now);

        let weekly = policy
            .keep_weekly
            .map(|n| {
                let since_monday = i64::from(now.weekday().num_days_from_monday());
                midnight(days_before(now, 7 * i64::from(n) + since_monday).date())
            })
            .unwrap_or(now);

        let monthly = policy
            .keep_monthly
            .map(|n| {
                let date = days_before(now, 30 * i64::from(n)).date();
                midnight(date.with_day(1).unwrap_or(date))
            })
            .unwrap_or(now);

        let yearly = policy
            .keep_yearly
            .map(|n| {
                let date = days_before(now, 365 * i64::from(n)).date();
                midnight(date.with_ordinal(1).unwrap_or(date))
            })
            .unwrap_or(now);

        Self {
            all,
            daily,
            weekly,
            monthly,
            yearly,
        }
    }

    /// Newest tier whose cutoff `created` is strictly after
    pub fn tier_of(&self, created: &NaiveDateTime) -> Option<Tier> {
        [
            (Tier::All, self.all),
            (Tier::Daily, self.daily),
            (Tier::Weekly, self.weekly),
            (Tier::Monthly, self.monthly),
            (Tier::Yearly, self.yearly),
        ]
        .into_iter()
        .find(|(_, cutoff)| created > cutoff)
        .map(|(tier, _)| tier)
    }
}

fn days_before(now: NaiveDateTime, days: i64) -> NaiveDateTime {
    now.checked_sub_signed(Duration::days(days))
        .unwrap_or(NaiveDateTime::MIN)
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// Outcome of retention planning, both lists oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Snapshots that survive
    pub keep: Vec<Snapshot>,
    /// Snapshots to delete
    pub remove: Vec<Snapshot>,
}

/// Decide which of `snapshots` to keep under `policy` at time `now`
///
/// Input order does not matter. With fewer than two snapshots nothing is
/// removed.
pub fn plan(snapshots: &[Snapshot], policy: &RetentionPolicy, now: NaiveDateTime) -> RetentionPlan {
    let mut ordered: Vec<&Snapshot> = snapshots.iter().collect();
    ordered.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.name.cmp(&a.name)));

    if ordered.len() < 2 {
        if let Some(only) = ordered.first() {
            debug!("Only one backup ({}) exists, will not remove it", only.name);
        }
        return RetentionPlan {
            keep: snapshots.to_vec(),
            remove: Vec::new(),
        };
    }

    let cutoffs = Cutoffs::compute(policy, now);
    debug!("Retention cutoffs: {:?}", cutoffs);

    let mut doomed = vec![false; ordered.len()];
    let mut anchor = 0;
    for (i, snapshot) in ordered.iter().enumerate().skip(1) {
        match cutoffs.tier_of(&snapshot.created) {
            Some(tier) => {
                if tier.same_bucket(&ordered[anchor].created, &snapshot.created) {
                    debug!(
                        "{} shares a {} bucket with {}",
                        ordered[anchor].name, tier, snapshot.name
                    );
                    doomed[anchor] = true;
                }
                anchor = i;
            }
            None => doomed[i] = true,
        }
    }

    let mut result = RetentionPlan::default();
    for (snapshot, remove) in ordered.into_iter().zip(doomed).rev() {
        if remove {
            result.remove.push(snapshot.clone());
        } else {
            result.keep.push(snapshot.clone());
        }
    }
    result
}

/// Apply `policy` to the valid snapshots under `root`
///
/// Returns the plan that was applied. In dry-run mode nothing is deleted
/// and empty snapshot directories are left in place.
#[instrument(skip(root, policy), fields(root = %root.display()))]
pub fn prune(
    root: &Path,
    policy: &RetentionPolicy,
    now: NaiveDateTime,
    dry_run: bool,
) -> Result<RetentionPlan> {
    if dry_run {
        info!("Dry-run, no backups will be actually removed");
    }

    let snapshots = snapshot::valid_snapshots(root, !dry_run)?;
    if snapshots.is_empty() {
        debug!("No backups, nothing to prune");
        return Ok(RetentionPlan::default());
    }

    let plan = plan(&snapshots, policy, now);
    for doomed in &plan.remove {
        info!("Removing old backup {}", doomed.name);
        if !dry_run {
            doomed.remove()?;
        }
    }

    info!(
        "Retention kept {} and removed {} backup(s)",
        plan.keep.len(),
        plan.remove.len()
    );
    Ok(plan)
}
