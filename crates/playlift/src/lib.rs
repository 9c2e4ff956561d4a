//! # Playlift
//!
//! A local resilience and transaction layer for store-publishing CLIs.
//!
//! Playlift makes a publish run safe to start and safe to re-run. Every
//! remote call goes through a bounded, retrying executor; every expensive
//! or non-idempotent effect (uploads, commits) is recorded durably so a
//! crashed or repeated invocation skips work it already finished.
//!
//! ## Features
//!
//! - **Bounded, retrying execution** — At most N remote calls in flight at
//!   once, with exponential backoff, jitter, and server `Retry-After`
//!   hints honored exactly (see [`executor::RequestExecutor`]).
//! - **Idempotency records** — Content-addressed SHA-256 keys tie an
//!   operation to its inputs; a fresh record short-circuits the remote
//!   call entirely ([`idempotency::IdempotencyStore`]).
//! - **Artifact cache** — Upload results cached per package and content
//!   digest with a TTL ([`cache::ArtifactCache`]).
//! - **Edit transactions** — Persisted edit records with an enforced
//!   `draft → validating → committed` state machine, guarded by a
//!   per-package advisory file lock with stale-lock reclamation
//!   ([`edits::EditManager`], [`lock::EditLock`]).
//! - **Cancellation everywhere** — Every blocking point races against a
//!   [`tokio_util::sync::CancellationToken`]; cancellation never leaks a
//!   permit or a lock.
//!
//! ## Flow
//!
//! The core flow is **open edit → lock → upload → commit**:
//!
//! 1. [`session::PublishSession::open_or_load_edit`] reuses a persisted
//!    edit or opens a new one remotely and records it in `Draft`.
//! 2. [`edits::EditManager::acquire_lock`] takes the per-package lock.
//! 3. [`session::PublishSession::upload_once_by_hash`] uploads under the
//!    exclusive permit set, at most once per (package, digest).
//! 4. [`session::PublishSession::commit_once`] commits at most once per
//!    (package, edit, content), advancing the edit state as it goes.
//!
//! ## Modules
//!
//! - [`session`] — At-most-once workflow surface tying the pieces together
//! - [`executor`] — Bounded permit pool and retry loop for remote calls
//! - [`retry`] — Backoff schedule, jitter, and `Retry-After` parsing
//! - [`idempotency`] — Content-addressed durable operation records
//! - [`cache`] — TTL'd artifact cache keyed by package and digest
//! - [`edits`] — Edit record persistence and state transitions
//! - [`lock`] — Per-package advisory file lock with staleness detection
//! - [`digest`] — Streaming SHA-256 file hashing with progress callbacks
//! - [`types`] — Domain types: edits, upload results, remote errors
//!
//! All durable state lives under a caller-chosen root directory:
//! `edits/<package>/<handle>.json`, `edits/<package>.lock`,
//! `cache/<package>/<digest>.json`, `idempotency/<key>.json`. Records are
//! written atomically (temp file + rename + parent fsync), so a crash
//! never leaves a half-written record behind.

/// TTL'd artifact cache keyed by package and content digest.
pub mod cache;

/// Streaming SHA-256 file hashing with progress callbacks.
pub mod digest;

/// Edit record persistence and state transitions.
pub mod edits;

/// Bounded permit pool and retry loop for remote calls.
pub mod executor;

/// Atomic JSON record I/O shared by the stores.
pub(crate) mod fsutil;

/// Content-addressed durable operation records.
pub mod idempotency;

/// Per-package advisory file lock with staleness detection.
pub mod lock;

/// Backoff schedule, jitter, and `Retry-After` parsing.
pub mod retry;

/// At-most-once workflow surface tying the pieces together.
pub mod session;

/// Domain types: edits, upload results, remote errors.
pub mod types;
