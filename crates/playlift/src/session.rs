//! At-most-once workflow surface over the stores and the executor.
//!
//! This is what the rest of the CLI calls: open-or-load an edit, upload an
//! artifact by content hash, commit an edit — each step consulting the
//! idempotency store before touching the network, so a crashed or retried
//! invocation never repeats an expensive or non-idempotent remote effect.

use std::future::Future;
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::ArtifactCache;
use crate::edits::{EditError, EditManager};
use crate::executor::{ExecuteError, ExecutorConfig, RequestExecutor};
use crate::idempotency::{IdempotencyStore, Lookup, StoreConfig};
use crate::lock::LockConfig;
use crate::types::{CommitReceipt, Edit, EditState, RemoteError, UploadResult};

/// Aggregate configuration for a publish session.  Every knob is explicit;
/// nothing lives in process-wide state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Failure surface of session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Edit(#[from] EditError),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One publishing run's view of the local transaction state.
#[derive(Debug, Clone)]
pub struct PublishSession {
    edits: EditManager,
    idempotency: IdempotencyStore,
    cache: ArtifactCache,
    executor: RequestExecutor,
}

impl PublishSession {
    /// `root` is the state root directory; all durable records live under
    /// it (`edits/`, `cache/`, `idempotency/`).
    pub fn new(root: &Path, config: SessionConfig) -> Self {
        Self {
            edits: EditManager::new(root, config.lock),
            idempotency: IdempotencyStore::new(root, config.store.clone()),
            cache: ArtifactCache::new(root, config.store),
            executor: RequestExecutor::new(config.executor),
        }
    }

    pub fn edits(&self) -> &EditManager {
        &self.edits
    }

    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    /// Load the persisted edit for (package, handle), touching it, or open
    /// a new server-side edit via `opener` (run through the retry wrapper)
    /// and persist it in `Draft`.
    pub async fn open_or_load_edit<F, Fut>(
        &self,
        cancel: &CancellationToken,
        package_name: &str,
        handle: &str,
        opener: F,
    ) -> Result<Edit, SessionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String, RemoteError>>,
    {
        if let Some(mut edit) = self.edits.load_edit(package_name, handle)? {
            debug!(package = package_name, handle, "reusing persisted edit");
            edit.last_used_at = Utc::now();
            self.edits.save_edit(&edit)?;
            return Ok(edit);
        }

        let server_id = self.executor.execute(cancel, opener).await?;
        let now = Utc::now();
        let edit = Edit {
            handle: handle.to_string(),
            server_id,
            package_name: package_name.to_string(),
            created_at: now,
            last_used_at: now,
            state: EditState::Draft,
        };
        self.edits.save_edit(&edit)?;
        Ok(edit)
    }

    /// Upload an artifact at most once per (package, content digest).
    ///
    /// A fresh idempotency record short-circuits with the previously
    /// recorded [`UploadResult`] and zero remote calls.  Otherwise the
    /// upload runs under the exclusive permit set (uploads are serialized
    /// relative to all other remote traffic), and on success both the
    /// idempotency record and the cache entry are written.
    pub async fn upload_once_by_hash<F, Fut>(
        &self,
        cancel: &CancellationToken,
        package_name: &str,
        path: &Path,
        digest: &str,
        size: u64,
        uploader: F,
    ) -> Result<UploadResult, SessionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<UploadResult, RemoteError>>,
    {
        let (key, lookup) = self.idempotency.check_upload_by_hash(package_name, digest)?;
        if let Lookup::Fresh(record) = lookup {
            let result: UploadResult = serde_json::from_value(record.data)
                .with_context(|| format!("malformed upload record for key {key}"))?;
            debug!(
                package = package_name,
                digest, "upload already recorded, skipping remote call"
            );
            return Ok(result);
        }

        let _exclusive = self.executor.acquire_exclusive(cancel).await?;
        let result = self.executor.do_with_retry(cancel, uploader).await?;

        self.idempotency
            .record_upload(&key, package_name, digest, &result)?;
        self.cache.cache_artifact(package_name, path, digest, size)?;
        Ok(result)
    }

    /// Commit an edit at most once per (package, edit, content identifier).
    pub async fn commit_once<F, Fut>(
        &self,
        cancel: &CancellationToken,
        package_name: &str,
        edit_id: &str,
        content_id: &str,
        committer: F,
    ) -> Result<CommitReceipt, SessionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), RemoteError>>,
    {
        let (key, lookup) = self
            .idempotency
            .check_commit(package_name, edit_id, content_id)?;
        if let Lookup::Fresh(record) = lookup {
            let receipt: CommitReceipt = serde_json::from_value(record.data)
                .with_context(|| format!("malformed commit record for key {key}"))?;
            debug!(
                package = package_name,
                edit_id, "commit already recorded, skipping remote call"
            );
            return Ok(receipt);
        }

        self.executor.execute(cancel, committer).await?;
        let receipt = self.idempotency.record_commit(&key, package_name, edit_id)?;
        Ok(receipt)
    }

    /// The retry wrapper, exposed for every other remote call the CLI makes.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, ExecuteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.executor.execute(cancel, op).await
    }
}
