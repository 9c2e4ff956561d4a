//! Durable, TTL-bounded cache of previously uploaded artifacts, keyed by
//! content digest.
//!
//! A cache hit tells a caller that identical bytes were already uploaded
//! within the TTL window, so it can skip hashing-and-uploading the same
//! file again.  Entries live at `cache/<package>/<digest>.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::fsutil::{atomic_write_json, read_json};
use crate::idempotency::{StoreConfig, sweep_expired_records};

pub const CACHE_DIR: &str = "cache";

/// One previously uploaded artifact.  Invariant: `expires_at > cached_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Hex content digest; the cache key.
    pub digest: String,
    /// Local or remote reference to the stored artifact.
    pub path: String,
    pub size: u64,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Filesystem-backed artifact cache, one entry per digest per package.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ArtifactCache {
    /// `root` is the configured state root; entries live under
    /// `<root>/cache/<package>/`.
    pub fn new(root: &Path, config: StoreConfig) -> Self {
        Self {
            dir: root.join(CACHE_DIR),
            ttl: config.ttl,
        }
    }

    fn package_dir(&self, package_name: &str) -> PathBuf {
        self.dir.join(package_name)
    }

    fn entry_path(&self, package_name: &str, digest: &str) -> PathBuf {
        self.package_dir(package_name).join(format!("{digest}.json"))
    }

    /// Look up an unexpired entry for (package, digest).
    ///
    /// Expired entries read as `None`; a malformed entry file is surfaced
    /// as an error so operators notice corruption.
    pub fn cached_artifact(&self, package_name: &str, digest: &str) -> Result<Option<CacheEntry>> {
        match read_json::<CacheEntry>(&self.entry_path(package_name, digest))? {
            Some(entry) if !entry.is_expired_at(Utc::now()) => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    /// Record an uploaded artifact.  The empty digest is never a valid key.
    /// Distinct digests write distinct files and never interfere.
    pub fn cache_artifact(
        &self,
        package_name: &str,
        path: &Path,
        digest: &str,
        size: u64,
    ) -> Result<CacheEntry> {
        if digest.is_empty() {
            bail!("artifact digest must not be empty");
        }
        if self.ttl.is_zero() {
            bail!("cache ttl must be positive");
        }

        let package_dir = self.package_dir(package_name);
        fs::create_dir_all(&package_dir)
            .with_context(|| format!("failed to create cache dir {}", package_dir.display()))?;

        let now = Utc::now();
        let entry = CacheEntry {
            digest: digest.to_string(),
            path: path.display().to_string(),
            size,
            cached_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.ttl).context("cache ttl out of range")?,
        };
        atomic_write_json(&self.entry_path(package_name, digest), &entry)?;
        Ok(entry)
    }

    /// Sweep expired entries across all package directories.
    pub fn clean_expired(&self) -> Result<usize> {
        self.clean_expired_cancellable(&CancellationToken::new())
    }

    /// Same semantics as the idempotency sweep: best-effort, re-reads each
    /// entry before deciding, stops promptly on cancellation.
    pub fn clean_expired_cancellable(&self, cancel: &CancellationToken) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }

        let packages = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?;
        let mut removed = 0usize;

        for package in packages {
            if cancel.is_cancelled() {
                break;
            }
            let package = package.with_context(|| format!("failed to list {}", self.dir.display()))?;
            if !package.path().is_dir() {
                continue;
            }
            removed += sweep_expired_records::<CacheEntry>(&package.path(), cancel, |entry, now| {
                entry.is_expired_at(now)
            })?;
        }

        Ok(removed)
    }
}
