//! Domain types: edit records, upload results, and remote failure
//! classification.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a server-side edit session.
///
/// Legal transitions: `Draft -> Validating -> Committed`, plus
/// `Draft -> Aborted` and `Validating -> Aborted`. `Committed` and
/// `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditState {
    Draft,
    Validating,
    Committed,
    Aborted,
}

impl EditState {
    /// Whether this state has no legal successors.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EditState::Committed | EditState::Aborted)
    }

    /// Whether the transition `self -> next` is in the legal transition table.
    pub fn can_transition_to(&self, next: EditState) -> bool {
        matches!(
            (self, next),
            (EditState::Draft, EditState::Validating)
                | (EditState::Draft, EditState::Aborted)
                | (EditState::Validating, EditState::Committed)
                | (EditState::Validating, EditState::Aborted)
        )
    }
}

/// One locally tracked edit session for a package.
///
/// `handle` is the caller-facing identifier of the local record;
/// `server_id` is the identity the remote API assigned to the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edit {
    pub handle: String,
    pub server_id: String,
    pub package_name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub state: EditState,
}

/// Kind of artifact uploaded into an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Bundle,
    Apk,
}

/// Payload recorded for a completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub version_code: i64,
    pub digest: String,
    pub path: String,
    pub size: u64,
    pub kind: ArtifactKind,
    /// Server-side edit the artifact was uploaded into.
    pub edit_id: String,
}

/// Confirmation recorded for a completed commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub package_name: String,
    pub edit_id: String,
    pub committed_at: DateTime<Utc>,
}

/// Coarse classification of a remote failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rate-limited or server-side failure; safe to retry.
    Retryable,
    /// Auth, validation, not-found, conflict; never retried.
    Permanent,
}

/// A classified failure from the remote publishing API.
///
/// Carries the HTTP-status-equivalent code and, when the server supplied
/// one, a parsed `Retry-After` hint.
#[derive(Debug, Clone, thiserror::Error)]
#[error("remote API error (status {status}): {message}")]
pub struct RemoteError {
    pub status: u16,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl RemoteError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, hint: Duration) -> Self {
        self.retry_after = Some(hint);
        self
    }

    /// Retryable iff the failure is a rate limit (429) or a server error (5xx).
    pub fn class(&self) -> ErrorClass {
        if self.status == 429 || (500..=599).contains(&self.status) {
            ErrorClass::Retryable
        } else {
            ErrorClass::Permanent
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}
