//! Error kinds the sync engine has to branch on
//!
//! Plumbing code uses `anyhow`; these types exist where the caller decides
//! between retrying, recording a per-item failure, or aborting a run.

use thiserror::Error;

/// Failure talking to the remote mail provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The provider asked us to slow down (HTTP 429 or a rateLimitExceeded reason)
    #[error("rate limit exceeded")]
    RateLimited,
    /// Timeouts, 5xx responses and network failures
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("remote entity not found: {0}")]
    NotFound(String),
    /// The provider answered with something we cannot use
    #[error("malformed remote response: {0}")]
    Fatal(String),
}

impl RemoteError {
    /// Whether one more attempt after a backoff may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::RateLimited | RemoteError::Transient(_))
    }
}

/// Failure while executing a sync run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Retryable condition that outlived its retry; the run stops with its cursor intact
    #[error("transient failure: {0}")]
    Transient(String),
    /// Failure scoped to one item (thread, attachment, page body)
    #[error("fatal failure: {0}")]
    Fatal(String),
    /// The local store rejected a write
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("sync run cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn persistence(err: anyhow::Error) -> Self {
        SyncError::Persistence(format!("{:#}", err))
    }

    /// Failures that abort the whole page rather than a single item
    pub fn aborts_page(&self) -> bool {
        !matches!(self, SyncError::Fatal(_))
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::RateLimited => {
                SyncError::Transient("rate limit persisted after retry".to_string())
            }
            RemoteError::Transient(msg) => SyncError::Transient(msg),
            RemoteError::NotFound(msg) => SyncError::Fatal(format!("not found: {}", msg)),
            RemoteError::Fatal(msg) => SyncError::Fatal(msg),
        }
    }
}
