//! BDD-style tests for the full publish-edit workflow.
//!
//! These tests describe the expected end-to-end behavior using
//! Given-When-Then style documentation: open an edit, lock the package,
//! upload an artifact, re-run without repeating remote work, and commit.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use playlift::lock::{self, LockConfig, LockError, LockInfo};
use playlift::session::{PublishSession, SessionConfig};
use playlift::types::{ArtifactKind, EditState, RemoteError, UploadResult};

const PKG: &str = "com.example.app";
const DIGEST: &str = "abc123";

/// A pid that no live process can have.
const DEAD_PID: u32 = u32::MAX;

fn fast_session(root: &Path) -> PublishSession {
    PublishSession::new(
        root,
        SessionConfig {
            lock: LockConfig {
                acquire_timeout: Duration::from_millis(300),
                poll_interval: Duration::from_millis(25),
                stale_age: Duration::from_secs(4 * 60 * 60),
            },
            ..SessionConfig::default()
        },
    )
}

fn sample_upload(edit_id: &str) -> UploadResult {
    UploadResult {
        version_code: 42,
        digest: DIGEST.to_string(),
        path: "release/app.aab".to_string(),
        size: 4096,
        kind: ArtifactKind::Bundle,
        edit_id: edit_id.to_string(),
    }
}

/// Given a fresh state root,
/// When a publish run opens an edit, uploads, and commits,
/// Then re-running every step performs zero additional remote calls and the
/// persisted edit ends in `committed`.
#[tokio::test]
async fn publish_run_is_resumable_end_to_end() {
    let td = tempdir().expect("tempdir");
    let session = fast_session(td.path());
    let cancel = CancellationToken::new();

    let opens = AtomicU32::new(0);
    let uploads = AtomicU32::new(0);
    let commits = AtomicU32::new(0);

    // Given: an edit opened for the package.
    let edit = session
        .open_or_load_edit(&cancel, PKG, "e1", || async {
            opens.fetch_add(1, Ordering::SeqCst);
            Ok("srv-edit-1".to_string())
        })
        .await
        .expect("open edit");
    assert_eq!(edit.state, EditState::Draft);

    // And: the per-package lock held for the run.
    let mut guard = session
        .edits()
        .acquire_lock(PKG, &cancel)
        .await
        .expect("acquire lock");
    assert!(lock::is_locked(&td.path().join("edits"), PKG));

    // When: the artifact is uploaded, twice.
    let upload = || {
        session.upload_once_by_hash(
            &cancel,
            PKG,
            Path::new("release/app.aab"),
            DIGEST,
            4096,
            || async {
                uploads.fetch_add(1, Ordering::SeqCst);
                Ok(sample_upload("srv-edit-1"))
            },
        )
    };
    let first = upload().await.expect("first upload");
    let second = upload().await.expect("second upload");

    // Then: one remote upload, identical results, a cache entry present.
    assert_eq!(uploads.load(Ordering::SeqCst), 1);
    assert_eq!(first, second);
    assert!(
        session
            .cache()
            .cached_artifact(PKG, DIGEST)
            .expect("cache lookup")
            .is_some()
    );

    // When: the edit is validated and committed, commit run twice.
    session
        .edits()
        .update_edit_state(PKG, "e1", EditState::Validating)
        .expect("draft -> validating");
    let commit = || {
        session.commit_once(&cancel, PKG, "srv-edit-1", DIGEST, || async {
            commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };
    let receipt = commit().await.expect("first commit");
    let replay = commit().await.expect("second commit");
    session
        .edits()
        .update_edit_state(PKG, "e1", EditState::Committed)
        .expect("validating -> committed");
    guard.release().expect("release lock");

    // Then: one remote commit, the same receipt both times, and the
    // persisted edit is terminal.
    assert_eq!(commits.load(Ordering::SeqCst), 1);
    assert_eq!(receipt, replay);
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    let stored = session
        .edits()
        .load_edit(PKG, "e1")
        .expect("load edit")
        .expect("edit exists");
    assert_eq!(stored.state, EditState::Committed);
    assert!(!lock::is_locked(&td.path().join("edits"), PKG));
}

/// Given a crashed run whose process is gone and whose lock is old,
/// When a new run acquires the lock,
/// Then the stale record is reclaimed instead of blocking the run.
#[tokio::test]
async fn stale_lock_from_a_dead_process_is_reclaimed() {
    let td = tempdir().expect("tempdir");
    let session = fast_session(td.path());
    let cancel = CancellationToken::new();
    let edits_dir = td.path().join("edits");

    std::fs::create_dir_all(&edits_dir).expect("mkdir");
    let stale = LockInfo {
        pid: DEAD_PID,
        hostname: gethostname::gethostname().to_string_lossy().into_owned(),
        created_at: Utc::now() - chrono::Duration::hours(5),
    };
    std::fs::write(
        lock::lock_path(&edits_dir, PKG),
        serde_json::to_vec_pretty(&stale).expect("serialize"),
    )
    .expect("write stale lock");

    let mut guard = session
        .edits()
        .acquire_lock(PKG, &cancel)
        .await
        .expect("reclaim stale lock");

    let info = lock::read_lock_info(&edits_dir, PKG)
        .expect("read lock")
        .expect("lock present");
    assert_eq!(info.pid, std::process::id());
    guard.release().expect("release");
}

/// Given another live process recently took the lock,
/// When a run tries to acquire it,
/// Then acquisition fails with a conflict naming the holder, and the
/// holder's record is untouched.
#[tokio::test]
async fn fresh_lock_is_never_stolen() {
    let td = tempdir().expect("tempdir");
    let session = fast_session(td.path());
    let cancel = CancellationToken::new();
    let edits_dir = td.path().join("edits");

    std::fs::create_dir_all(&edits_dir).expect("mkdir");
    let holder = LockInfo {
        pid: DEAD_PID,
        hostname: "other-host".to_string(),
        created_at: Utc::now(),
    };
    std::fs::write(
        lock::lock_path(&edits_dir, PKG),
        serde_json::to_vec_pretty(&holder).expect("serialize"),
    )
    .expect("write fresh lock");

    let err = session
        .edits()
        .acquire_lock(PKG, &cancel)
        .await
        .expect_err("fresh lock must conflict");
    match err {
        LockError::Conflict { pid, hostname, .. } => {
            assert_eq!(pid, DEAD_PID);
            assert_eq!(hostname, "other-host");
        }
        other => panic!("expected conflict, got {other}"),
    }

    let info = lock::read_lock_info(&edits_dir, PKG)
        .expect("read lock")
        .expect("lock still present");
    assert_eq!(info.pid, DEAD_PID);
}

/// Given a remote that fails transiently with a Retry-After hint,
/// When the executor runs the call,
/// Then it retries and eventually succeeds without caller involvement.
#[tokio::test]
async fn transient_remote_failures_are_absorbed() {
    let td = tempdir().expect("tempdir");
    let session = PublishSession::new(
        td.path(),
        SessionConfig {
            executor: playlift::executor::ExecutorConfig {
                permits: 3,
                retry: playlift::retry::RetryConfig {
                    max_attempts: 3,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(10),
                    jitter: 0.0,
                },
            },
            ..SessionConfig::default()
        },
    );
    let cancel = CancellationToken::new();
    let calls = AtomicU32::new(0);

    let version = session
        .execute(&cancel, || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RemoteError::new(429, "slow down")
                    .with_retry_after(Duration::from_millis(2)))
            } else {
                Ok(7i64)
            }
        })
        .await
        .expect("eventual success");

    assert_eq!(version, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
