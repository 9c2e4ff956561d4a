//! Per-package advisory lock serializing edit operations across processes.
//!
//! The lock record lives at `edits/<package>.lock` and holds JSON metadata
//! about the holder (pid, hostname, acquisition time).  Acquisition retries
//! until a timeout; records older than the stale-age threshold whose holder
//! cannot be confirmed alive are forcibly reclaimed.
//!
//! Liveness is best-effort: a pid can only be checked on the local host
//! (and only on Linux, via `/proc`).  For a different hostname, age alone
//! decides staleness.  Reclamation is therefore a heuristic, not a proof
//! that the holder is gone.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::fsutil::{fsync_parent_dir, read_json};

/// Tuning for lock acquisition.  Defaults: 30s timeout, 250ms poll, 4h
/// stale-age threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long an acquirer keeps retrying before giving up with a conflict.
    #[serde(with = "humantime_serde", default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,
    /// Wait between acquisition attempts.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// A lock younger than this is never reclaimed, even when the holder
    /// cannot be confirmed alive.
    #[serde(with = "humantime_serde", default = "default_stale_age")]
    pub stale_age: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: default_acquire_timeout(),
            poll_interval: default_poll_interval(),
            stale_age: default_stale_age(),
        }
    }
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_stale_age() -> Duration {
    Duration::from_secs(4 * 60 * 60)
}

/// Information stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID of the lock holder.
    pub pid: u32,
    /// Hostname where the lock was acquired.
    pub hostname: String,
    /// When the lock was acquired.
    pub created_at: DateTime<Utc>,
}

/// Failure surface of lock acquisition.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another process holds the lock and the acquisition timeout elapsed.
    #[error(
        "package {package} is locked by pid {pid} on {hostname} (held for {}); \
         another process is using this edit",
        humantime::format_duration(*held_for)
    )]
    Conflict {
        package: String,
        pid: u32,
        hostname: String,
        held_for: Duration,
    },
    #[error("lock acquisition cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Held lock handle; releases on [`EditLock::release`] or `Drop`.
#[derive(Debug)]
pub struct EditLock {
    path: PathBuf,
    released: bool,
}

/// The lock file path for a package inside `locks_dir`.
pub fn lock_path(locks_dir: &Path, package_name: &str) -> PathBuf {
    locks_dir.join(format!("{package_name}.lock"))
}

/// Read the current lock record, if any.  Corrupt records are errors.
pub fn read_lock_info(locks_dir: &Path, package_name: &str) -> Result<Option<LockInfo>> {
    read_json(&lock_path(locks_dir, package_name))
}

/// Whether a lock record currently exists for the package.
pub fn is_locked(locks_dir: &Path, package_name: &str) -> bool {
    lock_path(locks_dir, package_name).exists()
}

impl EditLock {
    /// Acquire the per-package lock, retrying every `poll_interval` until
    /// `acquire_timeout` elapses or `cancel` fires.  Stale and corrupt
    /// records are reclaimed along the way.
    pub async fn acquire(
        locks_dir: &Path,
        package_name: &str,
        config: &LockConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, LockError> {
        fs::create_dir_all(locks_dir)
            .with_context(|| format!("failed to create lock dir {}", locks_dir.display()))
            .map_err(LockError::Other)?;

        let path = lock_path(locks_dir, package_name);
        let deadline = Instant::now() + config.acquire_timeout;

        loop {
            match try_create_lock(&path) {
                Ok(()) => return Ok(Self {
                    path,
                    released: false,
                }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(LockError::Other(anyhow::Error::new(err).context(format!(
                        "failed to create lock file {}",
                        path.display()
                    ))));
                }
            }

            // Conflict: inspect the current holder.
            match read_json::<LockInfo>(&path) {
                Ok(Some(info)) => {
                    if is_stale(&info, config.stale_age) {
                        warn!(
                            package = package_name,
                            pid = info.pid,
                            hostname = %info.hostname,
                            "reclaiming stale edit lock"
                        );
                        remove_ignoring_absence(&path).map_err(LockError::Other)?;
                        continue;
                    }
                    if Instant::now() >= deadline {
                        let held_for = Utc::now()
                            .signed_duration_since(info.created_at)
                            .to_std()
                            .unwrap_or_default();
                        return Err(LockError::Conflict {
                            package: package_name.to_string(),
                            pid: info.pid,
                            hostname: info.hostname,
                            held_for,
                        });
                    }
                }
                // Holder released between our attempts; try again at once.
                Ok(None) => continue,
                Err(err) => {
                    // A lock file we cannot parse blocks everyone forever;
                    // reclaim it like a stale one.
                    warn!(
                        package = package_name,
                        error = %err,
                        "removing corrupt edit lock"
                    );
                    remove_ignoring_absence(&path).map_err(LockError::Other)?;
                    continue;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
    }

    /// Remove the lock record.  The holder is trusted to only release its
    /// own lock; absence is not an error.
    pub fn release(&mut self) -> Result<()> {
        if !self.released {
            remove_ignoring_absence(&self.path)?;
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for EditLock {
    fn drop(&mut self) {
        // Best effort to release the lock.
        let _ = self.release();
    }
}

/// Publish a lock record atomically and exclusively: the full record is
/// written to a unique temp file, then hard-linked into place.  The link
/// fails with `AlreadyExists` when another holder got there first, and a
/// reader never observes a partial record.
fn try_create_lock(path: &Path) -> io::Result<()> {
    let info = LockInfo {
        pid: std::process::id(),
        hostname: gethostname::gethostname().to_string_lossy().to_string(),
        created_at: Utc::now(),
    };
    let data = serde_json::to_vec_pretty(&info).map_err(io::Error::other)?;

    let tmp = path.with_extension(format!("tmp.{}", info.pid));
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&data)?;
        f.sync_all()?;
    }

    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    linked?;
    fsync_parent_dir(path);
    Ok(())
}

fn remove_ignoring_absence(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to remove lock file {}", path.display()))
        }
    }
}

/// A record is stale when it is older than `stale_age` AND its holder
/// cannot be confirmed alive.  A holder on another host can never be
/// checked, so age alone decides; a live local pid keeps its lock.
fn is_stale(info: &LockInfo, stale_age: Duration) -> bool {
    let age = Utc::now().signed_duration_since(info.created_at);
    // Clock skew can make the record look future-dated; treat it as fresh.
    let Ok(age) = age.to_std() else {
        return false;
    };
    if age <= stale_age {
        return false;
    }

    let local_host = gethostname::gethostname().to_string_lossy().to_string();
    if info.hostname != local_host {
        return true;
    }
    !process_alive(info.pid)
}

/// Best-effort local liveness check.  Only meaningful on Linux; elsewhere
/// the holder counts as unconfirmed (and an over-age lock is reclaimed).
fn process_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new(&format!("/proc/{pid}")).exists()
    } else {
        false
    }
}
