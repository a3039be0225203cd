//! # linkback CLI
//!
//! Creates one hardlink snapshot per invocation and prunes old ones.
//!
//! ## Usage
//! ```bash
//! # Back up two directories
//! linkback -b /mnt/backups ~/documents ~/photos
//!
//! # See what would change, keep nothing
//! linkback -b /mnt/backups -n ~/documents
//!
//! # Settings from a file, one tier overridden
//! linkback -c ~/.config/linkback.json --keep-daily 14
//! ```
//!
//! A run checks sources and the backups root first, then takes the backups
//! lock, prunes snapshots the retention policy no longer wants, creates the
//! new snapshot and releases the lock again, also when the backup fails.
//! Exit status is 1 on any error.

use anyhow::{anyhow, Context};
use chrono::Local;
use clap::Parser;
use colored::*;
use humantime::format_duration;
use linkback::retention::{self, RetentionPlan};
use linkback::{Backup, BackupConfig, BackupLock, BackupOutcome, LinkbackError, SnapshotFate};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// linkback - hardlink snapshot backups
#[derive(Parser, Debug)]
#[command(name = "linkback")]
#[command(version)]
#[command(about = "Space-efficient point-in-time backups of directory trees")]
struct Cli {
    /// Directory where all backups are stored
    #[arg(short = 'b', long = "backups-dir", value_name = "BACKUPS_DIR")]
    backups_dir: Option<PathBuf>,

    /// JSON configuration file; flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Report what would change, keep no snapshot
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Terminate a backup that is still running and take over
    #[arg(short, long)]
    force: bool,

    /// Print verbose information
    #[arg(short, long)]
    verbose: bool,

    /// Days during which every backup is kept
    #[arg(long, value_name = "DAYS")]
    keep_all: Option<u32>,

    /// Days during which one backup per day is kept
    #[arg(long, value_name = "DAYS")]
    keep_daily: Option<u32>,

    /// Weeks during which one backup per week is kept
    #[arg(long, value_name = "WEEKS")]
    keep_weekly: Option<u32>,

    /// Months during which one backup per month is kept
    #[arg(long, value_name = "MONTHS")]
    keep_monthly: Option<u32>,

    /// Years during which one backup per year is kept
    #[arg(long, value_name = "YEARS")]
    keep_yearly: Option<u32>,

    /// Do not remove old backups
    #[arg(long)]
    no_prune: bool,

    /// Directories to back up
    #[arg(value_name = "SOURCE")]
    sources: Vec<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        let message = match e.downcast_ref::<LinkbackError>() {
            Some(err) => err.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "linkback=debug" } else { "linkback=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Merge the configuration file (if any) with the command line
fn resolve_config(cli: &Cli) -> anyhow::Result<BackupConfig> {
    let mut config = match &cli.config {
        Some(path) => BackupConfig::load(path)
            .with_context(|| format!("Cannot load configuration {}", path.display()))?,
        None => {
            let root = cli
                .backups_dir
                .clone()
                .ok_or_else(|| anyhow!("Either --backups-dir or --config is required"))?;
            BackupConfig::new(root)
        }
    };

    if let Some(root) = &cli.backups_dir {
        config.backups_root = root.clone();
    }
    if !cli.sources.is_empty() {
        config.sources = cli.sources.clone();
    }
    config.dry_run |= cli.dry_run;
    config.force |= cli.force;

    let retention = &mut config.retention;
    let overrides = [
        (&mut retention.keep_all, cli.keep_all),
        (&mut retention.keep_daily, cli.keep_daily),
        (&mut retention.keep_weekly, cli.keep_weekly),
        (&mut retention.keep_monthly, cli.keep_monthly),
        (&mut retention.keep_yearly, cli.keep_yearly),
    ];
    for (tier, value) in overrides {
        if value.is_some() {
            *tier = value;
        }
    }

    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let start = Instant::now();
    linkback::config::check_platform()?;

    let config = resolve_config(&cli)?;
    info!("Starting linkback: {:?}", config);
    // every path check happens here, before the backups root is touched
    let backup = config.backup_builder().build()?;

    let lock = BackupLock::acquire(backup.backups_root(), config.force)?;
    let result = backup_locked(&config, &backup, cli.no_prune);
    if let Err(e) = lock.release() {
        warn!("Cannot release backups lock: {}", e);
    }
    let (pruned, outcome) = result?;

    print_summary(&config, pruned.as_ref(), &outcome);
    let elapsed = Duration::from_millis(start.elapsed().as_millis() as u64);
    info!("Finished, time spent: {}", format_duration(elapsed));
    Ok(())
}

fn backup_locked(
    config: &BackupConfig,
    backup: &Backup,
    no_prune: bool,
) -> anyhow::Result<(Option<RetentionPlan>, BackupOutcome)> {
    let pruned = if no_prune {
        None
    } else {
        let now = Local::now().naive_local();
        let plan = retention::prune(backup.backups_root(), &config.retention, now, config.dry_run)
            .context("Removing old backups failed")?;
        Some(plan)
    };

    let outcome = backup.run()?;
    Ok((pruned, outcome))
}

fn print_summary(config: &BackupConfig, pruned: Option<&RetentionPlan>, outcome: &BackupOutcome) {
    let (mark, fate) = match outcome.fate {
        SnapshotFate::Completed => ("✓".green().bold(), "created".green()),
        SnapshotFate::Discarded => ("=".yellow().bold(), "unchanged, discarded".yellow()),
        SnapshotFate::DryRun => ("~".cyan().bold(), "dry run, discarded".cyan()),
    };
    println!("{} Backup {} {}", mark, outcome.name.bold(), fate);
    if let Some(previous) = &outcome.previous {
        println!("  Based on: {}", previous.cyan());
    }
    println!("  Location: {}", config.backups_root.display().to_string().cyan());

    for report in &outcome.sources {
        let stats = &report.stats;
        println!(
            "  {}: {} created, {} rewritten, {} metadata updates, {} deleted",
            report.name.bold(),
            stats.created,
            stats.rewritten,
            stats.times_updated + stats.permissions_updated + stats.owners_updated,
            stats.deleted
        );
        if stats.errors > 0 {
            println!("    {} {} entries failed", "!".red().bold(), stats.errors);
        }
    }

    if outcome.delta_failures > 0 {
        println!(
            "  {} {} paths missing from the delta inventory",
            "!".yellow().bold(),
            outcome.delta_failures
        );
    }
    if let Some(plan) = pruned {
        let verb = if config.dry_run { "would remove" } else { "removed" };
        println!("  Retention: kept {}, {} {}", plan.keep.len(), verb, plan.remove.len());
    }
}
