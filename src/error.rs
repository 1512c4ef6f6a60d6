//! Error taxonomy shared by the controller, fetch client and coordinator.
use std::time::Duration;
use thiserror::Error;

/// 5xx statuses worth another attempt. Anything else in the 5xx range is final.
pub const RETRYABLE_SERVER_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Outcome of a single remote call that did not succeed.
///
/// The controller never fails a whole batch; each request resolves to either
/// a response or one of these values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<RemoteError>,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Timeout(_)
            | RemoteError::Connection(_)
            | RemoteError::RateLimited { .. } => true,
            RemoteError::Server { status, .. } => RETRYABLE_SERVER_STATUSES.contains(status),
            _ => false,
        }
    }

    /// True for a 404, including one that surfaced after retries.
    pub fn is_not_found(&self) -> bool {
        match self {
            RemoteError::NotFound(_) => true,
            RemoteError::RetriesExhausted { last, .. } => last.is_not_found(),
            _ => false,
        }
    }
}

/// Run-level failures of the sync coordinator.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another run holds a valid lock for this scope. Not exceptional: the
    /// caller should simply skip this run.
    #[error("sync already in progress for {database_id}")]
    AlreadyRunning { database_id: String },
    #[error("listing records of {database_id} failed: {source}")]
    Listing {
        database_id: String,
        #[source]
        source: RemoteError,
    },
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    pub fn is_already_running(&self) -> bool {
        matches!(self, SyncError::AlreadyRunning { .. })
    }
}
