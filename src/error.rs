//! Error types for client operations.
//!
//! This module defines all error types that can occur when talking to a
//! CouchDB-style server. The [`Result`] type alias provides a convenient
//! shorthand for operations that may fail.
//!
//! # Error Categories
//!
//! | Category | Variants | Retryable |
//! |----------|----------|-----------|
//! | Protocol | `Unauthorized`, `NotFound`, `Conflict`, `Http` | Mostly no |
//! | Semantic | `ViewResult`, `MangoResult`, `ReplicatorAbsent` | No |
//! | Transport | `Transport`, `Io`, `Timeout` | Yes |
//! | Decode | `Json`, `Decode` | No |
//!
//! Transport errors are terminal for the affected operation; nothing in this
//! crate retries them except the change-feed subscriber, which retries every
//! non-cancellation error with exponential backoff.

use std::io;
use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, CouchError>;

/// Errors that can occur while talking to the database.
///
/// Use pattern matching to handle specific errors appropriately; the
/// predicate helpers ([`CouchError::is_retryable`], [`CouchError::is_conflict`])
/// cover the common branches.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CouchError {
    /// The server rejected the configured credentials (HTTP 401).
    #[error("unauthorized: check username/password")]
    Unauthorized,

    /// The requested resource does not exist (HTTP 404).
    ///
    /// Operations with null-if-404 semantics (single-document GET, existence
    /// probes) return `None` instead of this error.
    #[error("not found")]
    NotFound,

    /// A write carried a stale revision (HTTP 409).
    ///
    /// The caller holds an outdated `rev`; re-read the document and retry
    /// the update with the current revision.
    #[error("document update conflict")]
    Conflict,

    /// Any other non-2xx response.
    ///
    /// Carries the status code and the full error body as sent by the
    /// server (the server bounds its own error bodies).
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The server reported an error inside a view result stream.
    ///
    /// `key` is the row key the error was reported for, when the error was
    /// row-scoped; `None` for a top-level response error.
    #[error("view error for key {key:?}: {message}")]
    ViewResult {
        key: Option<serde_json::Value>,
        message: String,
    },

    /// A `_find` response carried an `error` field instead of results.
    #[error("mango query failed: {error}: {reason}")]
    MangoResult { error: String, reason: String },

    /// The `_replicator` database does not exist and could not be created.
    #[error("replicator database not found")]
    ReplicatorAbsent,

    /// The operation was cancelled by its consumer.
    ///
    /// Cancellation is distinguishable from failure: it never triggers a
    /// change-feed resubscribe.
    #[error("operation cancelled")]
    Cancelled,

    /// The transport failed before or while streaming the response.
    #[error("transport error: {0}")]
    Transport(String),

    /// Network I/O error surfaced by the byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No bytes (not even a heartbeat) arrived within the watchdog window.
    #[error("stream timed out")]
    Timeout,

    /// JSON (de)serialization failed.
    ///
    /// For row-scoped failures inside a view stream the message carries the
    /// offending document id.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The response body did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// Invalid client construction parameters.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CouchError {
    /// Whether a retry could plausibly succeed.
    ///
    /// True for transport-level failures and the transient 5xx/408/429
    /// status family. Semantic errors (conflicts, view errors) are never
    /// retryable as-is.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            CouchError::Transport(_) | CouchError::Io(_) | CouchError::Timeout => true,
            CouchError::Http { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }

    /// True for HTTP 409 update conflicts.
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, CouchError::Conflict)
    }

    /// True when the error represents a missing resource.
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, CouchError::NotFound)
    }

    /// True when the stream or operation was cancelled by its consumer.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CouchError::Cancelled)
    }
}

impl From<reqwest::Error> for CouchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CouchError::Timeout
        } else {
            CouchError::Transport(err.to_string())
        }
    }
}
