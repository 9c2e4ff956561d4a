//! Durable, TTL-bounded record of completed operations.
//!
//! Keys are content-addressed, not request-addressed: retrying the same
//! logical upload with the same bytes, even from a different process
//! invocation, collapses to the same key.  That is what makes the CLI safe
//! to re-run after a crash without duplicating server-side effects.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fsutil::{atomic_write_json, read_json};
use crate::types::{CommitReceipt, UploadResult};

/// Joins key components unambiguously; cannot occur in package names,
/// operation tags, or hex digests.
const KEY_SEPARATOR: u8 = 0x1f;

pub const IDEMPOTENCY_DIR: &str = "idempotency";

/// TTL configuration shared by the idempotency store and artifact cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How long a record stays valid.  Default 24h.
    #[serde(with = "humantime_serde", default = "default_ttl")]
    pub ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { ttl: default_ttl() }
    }
}

fn default_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

/// One completed-operation record, stored at `idempotency/<key>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Opaque result payload (an [`UploadResult`], a [`CommitReceipt`], ...).
    pub data: serde_json::Value,
}

impl IdempotencyRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Outcome of a key lookup.  `Expired` is treated as absent for decision
/// purposes but kept distinct for diagnostics.
#[derive(Debug, Clone)]
pub enum Lookup {
    Absent,
    Expired,
    Fresh(IdempotencyRecord),
}

impl Lookup {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Lookup::Fresh(_))
    }

    pub fn into_fresh(self) -> Option<IdempotencyRecord> {
        match self {
            Lookup::Fresh(record) => Some(record),
            _ => None,
        }
    }
}

/// Filesystem-backed idempotency store, one record per file.
#[derive(Debug, Clone)]
pub struct IdempotencyStore {
    dir: PathBuf,
    ttl: Duration,
}

impl IdempotencyStore {
    /// `root` is the configured state root; records live under
    /// `<root>/idempotency/`.
    pub fn new(root: &Path, config: StoreConfig) -> Self {
        Self {
            dir: root.join(IDEMPOTENCY_DIR),
            ttl: config.ttl,
        }
    }

    /// Derive the dedup key for one (operation, package, content) tuple.
    ///
    /// Deterministic, and distinct tuples produce distinct keys with
    /// overwhelming probability (SHA-256 over the separator-joined inputs).
    pub fn generate_key(operation: &str, package_name: &str, content_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update([KEY_SEPARATOR]);
        hasher.update(package_name.as_bytes());
        hasher.update([KEY_SEPARATOR]);
        hasher.update(content_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Existence check without exposing the payload; `false` once expired.
    pub fn check(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_fresh())
    }

    /// Look up a key.  A corrupt record file is an error, never a miss.
    pub fn get(&self, key: &str) -> Result<Lookup> {
        match read_json::<IdempotencyRecord>(&self.record_path(key))? {
            None => Ok(Lookup::Absent),
            Some(record) if record.is_expired_at(Utc::now()) => Ok(Lookup::Expired),
            Some(record) => Ok(Lookup::Fresh(record)),
        }
    }

    /// Persist a bare result payload under `key`.
    pub fn record(&self, key: &str, data: serde_json::Value) -> Result<IdempotencyRecord> {
        self.record_with_meta(key, "", None, None, data)
    }

    /// Persist a result payload with its operation metadata.
    pub fn record_with_meta(
        &self,
        key: &str,
        operation: &str,
        package_name: Option<&str>,
        content_id: Option<&str>,
        data: serde_json::Value,
    ) -> Result<IdempotencyRecord> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create idempotency dir {}", self.dir.display()))?;

        let now = Utc::now();
        let record = IdempotencyRecord {
            key: key.to_string(),
            operation: operation.to_string(),
            package_name: package_name.map(str::to_string),
            content_id: content_id.map(str::to_string),
            timestamp: now,
            expires_at: now
                + chrono::Duration::from_std(self.ttl).context("store ttl out of range")?,
            data,
        };
        atomic_write_json(&self.record_path(key), &record)?;
        Ok(record)
    }

    /// Record a completed upload so [`Self::check_upload_by_hash`] later
    /// finds a payload it can deserialize back into an [`UploadResult`].
    pub fn record_upload(
        &self,
        key: &str,
        package_name: &str,
        digest: &str,
        result: &UploadResult,
    ) -> Result<IdempotencyRecord> {
        let data = serde_json::to_value(result).context("failed to serialize upload result")?;
        self.record_with_meta(key, "upload", Some(package_name), Some(digest), data)
    }

    /// Record a completed commit; returns the receipt that was persisted.
    pub fn record_commit(
        &self,
        key: &str,
        package_name: &str,
        edit_id: &str,
    ) -> Result<CommitReceipt> {
        let receipt = CommitReceipt {
            package_name: package_name.to_string(),
            edit_id: edit_id.to_string(),
            committed_at: Utc::now(),
        };
        let data = serde_json::to_value(&receipt).context("failed to serialize commit receipt")?;
        self.record_with_meta(key, "commit", Some(package_name), Some(edit_id), data)?;
        Ok(receipt)
    }

    /// Compute the upload key for (package, digest) and look it up.  The key
    /// comes back so the caller can `record_upload` under it on first
    /// completion.
    pub fn check_upload_by_hash(
        &self,
        package_name: &str,
        digest: &str,
    ) -> Result<(String, Lookup)> {
        let key = Self::generate_key("upload", package_name, digest);
        let lookup = self.get(&key)?;
        Ok((key, lookup))
    }

    /// Compute the commit key for (package, edit, content) and look it up.
    pub fn check_commit(
        &self,
        package_name: &str,
        edit_id: &str,
        content_id: &str,
    ) -> Result<(String, Lookup)> {
        let content = format!("{edit_id}\u{1f}{content_id}");
        let key = Self::generate_key("commit", package_name, &content);
        let lookup = self.get(&key)?;
        Ok((key, lookup))
    }

    /// Remove a record; no-op when absent.
    pub fn clear(&self, key: &str) -> Result<()> {
        let path = self.record_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    /// Sweep expired records.  Returns the number removed.
    pub fn clean_expired(&self) -> Result<usize> {
        self.clean_expired_cancellable(&CancellationToken::new())
    }

    /// Best-effort sweep: each file's `expires_at` is re-read right before
    /// the decision, which narrows but does not close the window against a
    /// concurrent writer; a refresh landing between the re-read and the
    /// unlink is still lost.  Unreadable files are skipped with a warning
    /// rather than aborting the sweep.
    pub fn clean_expired_cancellable(&self, cancel: &CancellationToken) -> Result<usize> {
        sweep_expired_records::<IdempotencyRecord>(&self.dir, cancel, |record, now| {
            record.is_expired_at(now)
        })
    }
}

/// Shared sweep over a directory of one-record-per-file JSON entries.
pub(crate) fn sweep_expired_records<T: serde::de::DeserializeOwned>(
    dir: &Path,
    cancel: &CancellationToken,
    expired: impl Fn(&T, DateTime<Utc>) -> bool,
) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    let mut removed = 0usize;

    for entry in entries {
        if cancel.is_cancelled() {
            break;
        }
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match read_json::<T>(&path) {
            Ok(Some(record)) if expired(&record, Utc::now()) => {
                // A concurrent release may have beaten us to it.
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("failed to remove {}", path.display()));
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable record during sweep");
            }
        }
    }

    debug!(dir = %dir.display(), removed, "expired-record sweep complete");
    Ok(removed)
}
