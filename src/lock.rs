//! Backups root lock
//!
//! Only one run may work on a backups root at a time. The lock is a plain
//! file named `.backups_lock` directly under the root that holds the pid of
//! its owner. It is created with exclusive-create semantics, so two runs
//! racing for it cannot both win.
//!
//! An existing lock is checked by probing its owner with the null signal:
//!
//! - owner gone: the lock is stale and replaced
//! - owner alive: [`LinkbackError::LockHeld`], unless `force` is set, in
//!   which case the owner receives `SIGTERM` and the lock is taken over
//!
//! A lock naming the current process is stale as well: this process has not
//! taken it yet, so the pid was reused.
//!
//! Dropping a [`BackupLock`] leaves the file in place. A run that dies
//! without calling [`BackupLock::release`] leaves a lock naming a dead pid,
//! which the next run detects as stale.

use crate::error::{LinkbackError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Name of the lock file under the backups root
pub const LOCK_FILE: &str = ".backups_lock";

/// State of the process recorded in a lock file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerState {
    /// Process exists (possibly owned by another user)
    Alive,
    /// No such process
    Gone,
}

/// Check `pid` with the null signal
pub fn owner_state(pid: i32) -> Result<OwnerState> {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => Ok(OwnerState::Alive),
        Err(Errno::ESRCH) => Ok(OwnerState::Gone),
        Err(Errno::EPERM) => Ok(OwnerState::Alive),
        Err(errno) => Err(LinkbackError::LockCheck { pid, errno }),
    }
}

/// Held lock on a backups root
#[derive(Debug)]
pub struct BackupLock {
    path: PathBuf,
    pid: i32,
}

impl BackupLock {
    /// Acquire the lock on `root`
    ///
    /// # Errors
    ///
    /// - [`LinkbackError::LockHeld`] if a live process owns the lock and
    ///   `force` is not set
    /// - [`LinkbackError::LockCheck`] if the owner cannot be checked
    #[instrument(skip(root), fields(root = %root.display()))]
    pub fn acquire(root: &Path, force: bool) -> Result<Self> {
        let path = root.join(LOCK_FILE);
        let pid = i32::try_from(std::process::id())
            .map_err(|_| LinkbackError::internal("Process id out of range"))?;

        match try_create(&path, pid) {
            Ok(()) => {
                debug!("Acquired lock {:?}", path);
                return Ok(Self { path, pid });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        match read_owner(&path)? {
            // a lock naming this very process predates it (pid reuse)
            Some(owner) if owner == pid => {
                info!("Removing stale lock naming our own pid {}", owner);
            }
            Some(owner) => match owner_state(owner)? {
                OwnerState::Gone => {
                    info!("Removing stale lock of finished process {}", owner);
                }
                OwnerState::Alive if force => {
                    warn!("Terminating running backup process {}", owner);
                    terminate(owner);
                }
                OwnerState::Alive => {
                    return Err(LinkbackError::LockHeld { pid: owner, path });
                }
            },
            None => {
                warn!("Lock file {:?} has no valid pid, treating it as stale", path);
            }
        }

        remove_lock_file(&path)?;
        match try_create(&path, pid) {
            Ok(()) => {
                debug!("Acquired lock {:?}", path);
                Ok(Self { path, pid })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let owner = read_owner(&path)?.unwrap_or_default();
                Err(LinkbackError::LockHeld { pid: owner, path })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid written into the lock file
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Remove the lock file
    pub fn release(self) -> Result<()> {
        remove_lock_file(&self.path)?;
        debug!("Released lock {:?}", self.path);
        Ok(())
    }
}

/// Remove the lock file under `root`, if any
pub fn release_lock(root: &Path) -> Result<()> {
    remove_lock_file(&root.join(LOCK_FILE))
}

fn try_create(path: &Path, pid: i32) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{}", pid)?;
    file.sync_all()
}

/// Pid recorded in the lock file; `None` when the content is not a pid
fn read_owner(path: &Path) -> Result<Option<i32>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == ErrorKind::InvalidData => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(content.trim().parse::<i32>().ok().filter(|pid| *pid > 0))
}

fn terminate(pid: i32) {
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => warn!("Failed to terminate process {}: {}", pid, errno),
    }
}

fn remove_lock_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
