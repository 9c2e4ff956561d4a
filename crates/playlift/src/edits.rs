//! Edit transaction manager: persistence and locking for edit sessions.
//!
//! One record per (package, handle) at `edits/<package>/<handle>.json`;
//! the per-package lock record sits alongside at `edits/<package>.lock`.
//! The in-process manager is no substitute for the cross-process file
//! lock — every mutating workflow runs under [`EditManager::run_guarded`].

use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::fsutil::{atomic_write_json, read_json};
use crate::lock::{EditLock, LockConfig, LockError};
use crate::types::{Edit, EditState};

pub const EDITS_DIR: &str = "edits";

/// Failure surface of edit persistence and guarded execution.
#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error("edit {handle} for package {package} not found")]
    NotFound { package: String, handle: String },
    /// The requested state change is not in the legal transition table.
    #[error("illegal edit state transition {from:?} -> {to:?} for {package}/{handle}")]
    InvalidTransition {
        package: String,
        handle: String,
        from: EditState,
        to: EditState,
    },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Owns the lifecycle of locally tracked edit sessions.
#[derive(Debug, Clone)]
pub struct EditManager {
    edits_dir: PathBuf,
    lock: LockConfig,
}

impl EditManager {
    /// `root` is the configured state root; edits live under `<root>/edits/`.
    pub fn new(root: &Path, lock: LockConfig) -> Self {
        Self {
            edits_dir: root.join(EDITS_DIR),
            lock,
        }
    }

    fn package_dir(&self, package_name: &str) -> PathBuf {
        self.edits_dir.join(package_name)
    }

    fn edit_path(&self, package_name: &str, handle: &str) -> PathBuf {
        self.package_dir(package_name).join(format!("{handle}.json"))
    }

    /// Persist (create or overwrite) an edit record.
    pub fn save_edit(&self, edit: &Edit) -> Result<()> {
        let dir = self.package_dir(&edit.package_name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create edit dir {}", dir.display()))?;
        atomic_write_json(&self.edit_path(&edit.package_name, &edit.handle), edit)
    }

    /// Load an edit; absence is `Ok(None)`, corruption is an error.
    pub fn load_edit(&self, package_name: &str, handle: &str) -> Result<Option<Edit>> {
        read_json(&self.edit_path(package_name, handle))
    }

    /// Remove an edit record; idempotent.
    pub fn delete_edit(&self, package_name: &str, handle: &str) -> Result<()> {
        let path = self.edit_path(package_name, handle);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    /// All persisted edits for a package, in directory order (callers
    /// re-sort as needed).
    pub fn list_edits(&self, package_name: &str) -> Result<Vec<Edit>> {
        let dir = self.package_dir(package_name);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut edits = Vec::new();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))?
        {
            let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(edit) = read_json::<Edit>(&path)? {
                edits.push(edit);
            }
        }
        Ok(edits)
    }

    /// Advance an edit's state, enforcing the legal transition table, and
    /// refresh `last_used_at`.
    pub fn update_edit_state(
        &self,
        package_name: &str,
        handle: &str,
        new_state: EditState,
    ) -> Result<Edit, EditError> {
        let Some(mut edit) = self.load_edit(package_name, handle)? else {
            return Err(EditError::NotFound {
                package: package_name.to_string(),
                handle: handle.to_string(),
            });
        };

        if !edit.state.can_transition_to(new_state) {
            return Err(EditError::InvalidTransition {
                package: package_name.to_string(),
                handle: handle.to_string(),
                from: edit.state,
                to: new_state,
            });
        }

        debug!(
            package = package_name,
            handle,
            from = ?edit.state,
            to = ?new_state,
            "edit state transition"
        );
        edit.state = new_state;
        edit.last_used_at = Utc::now();
        self.save_edit(&edit)?;
        Ok(edit)
    }

    /// Refresh `last_used_at` only.
    pub fn touch_edit(&self, package_name: &str, handle: &str) -> Result<Edit, EditError> {
        let Some(mut edit) = self.load_edit(package_name, handle)? else {
            return Err(EditError::NotFound {
                package: package_name.to_string(),
                handle: handle.to_string(),
            });
        };
        edit.last_used_at = Utc::now();
        self.save_edit(&edit)?;
        Ok(edit)
    }

    /// Acquire the per-package edit lock.
    pub async fn acquire_lock(
        &self,
        package_name: &str,
        cancel: &CancellationToken,
    ) -> Result<EditLock, LockError> {
        EditLock::acquire(&self.edits_dir, package_name, &self.lock, cancel).await
    }

    /// Acquire the lock, run `fut`, and release the lock whether or not
    /// `fut` succeeded.
    pub async fn run_guarded<T, Fut>(
        &self,
        package_name: &str,
        cancel: &CancellationToken,
        fut: Fut,
    ) -> Result<T, EditError>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut lock = self.acquire_lock(package_name, cancel).await?;
        let outcome = fut.await;
        lock.release()?;
        outcome.map_err(EditError::Other)
    }
}
