// src/error.rs
use crate::SourceId;

/// Failure signaled by a source's search or detail-fetch call.
///
/// These never reach the caller of a federated query: a failed search turns
/// into an empty entry for that source, and a failed detail fetch leaves the
/// entity as it was.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("malformed response: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

/// Failure raised by the reconciliation store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("persist error: {0}")]
    Persist(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

/// A record that could not be reconciled against the store.
///
/// Fatal to that record only: it is dropped from its source's batch and
/// reported on the snapshot stream, while the query and every other record
/// keep going.
#[derive(Debug, thiserror::Error)]
#[error("failed to reconcile record '{url}' from source {source_id}: {source}")]
pub struct ReconciliationError {
    pub source_id: SourceId,
    pub url: String,
    #[source]
    pub source: StoreError,
}
