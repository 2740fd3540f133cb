//! Error types for quest-sync-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// A short code resolved to more than one quest. Callers must pick
    /// among the surfaced candidates; the engine never picks silently.
    #[error("Short code {code} is ambiguous ({} candidates)", candidates.len())]
    Ambiguous {
        code: String,
        candidates: Vec<crate::index::IndexEntry>,
    },

    /// A tier could not be reached. Recoverable: the coordinator absorbs
    /// this as long as the local cache succeeded, and marks the index
    /// entry pending for reconciliation.
    #[error("Tier unreachable: {0}")]
    TierUnreachable(String),

    /// A non-revoked badge already exists for this (principal, quest).
    /// Rejected, never retried.
    #[error("Badge already earned for quest {quest} by {principal}")]
    UniquenessViolation { principal: String, quest: String },

    #[error("Ledger confirmation timed out after {0:?}")]
    LedgerTimeout(std::time::Duration),

    #[error("Ledger reverted completion: {0}")]
    LedgerReverted(String),

    /// The ledger minted the badge but no durable tier accepted it. The
    /// badge is held in the local cache as unconfirmed-persisted and
    /// retried by reconciliation; it is never dropped.
    #[error("Ledger succeeded but persistence failed for badge {badge}: {detail}")]
    PersistencePartial { badge: String, detail: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the coordinator may absorb this error and converge later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::TierUnreachable(_)
                | SyncError::LedgerTimeout(_)
                | SyncError::LedgerReverted(_)
                | SyncError::PersistencePartial { .. }
        )
    }
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
