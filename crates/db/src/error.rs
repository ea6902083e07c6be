//! Store and repository error taxonomy.

use annotator_core::identity::IdentityError;

/// Errors surfaced by the document store adapter and the repositories
/// built on it.
///
/// `TransactionConflict` and `IdentifierCollision` are transient: the
/// caller may retry (the event pipeline translates them into a
/// redelivery). `InvalidKeyPart` and `InvalidDecrement` are caller
/// programming errors and must not be retried.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {path}")]
    NotFound { path: String },

    #[error("document already exists: {path}")]
    AlreadyExists { path: String },

    #[error(transparent)]
    InvalidKeyPart(#[from] IdentityError),

    #[error("decrement below zero on field {field:?}: {current} + ({delta})")]
    InvalidDecrement {
        field: String,
        current: i64,
        delta: i64,
    },

    #[error("transaction conflict after {attempts} attempt(s)")]
    TransactionConflict { attempts: u32 },

    #[error("generated identifier collision: {id}")]
    IdentifierCollision { id: String },

    #[error("transaction exceeds the write cap: {writes} > {cap}")]
    TransactionTooLarge { writes: usize, cap: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the operation may succeed if retried (or redelivered).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::TransactionConflict { .. } | StoreError::IdentifierCollision { .. }
        )
    }
}
