//! Error types for the Strata entity store.

use thiserror::Error;

use crate::entity::Revision;

/// Result type alias for entity store operations.
pub type EntityResult<T> = Result<T, EntityError>;

/// Errors that can occur during entity store operations.
#[derive(Debug, Error)]
pub enum EntityError {
    #[error("failed to open database: {0}")]
    Open(String),

    /// Transient storage failure. Callers retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("revision conflict on {id}: expected {expected}, actual {actual}")]
    Conflict {
        id: String,
        expected: Revision,
        actual: Revision,
    },

    #[error("invalid entity id: {0}")]
    InvalidId(String),

    #[error("entity {id} has kind {actual}, expected {expected}")]
    KindMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("attribute is not indexed: {0}")]
    NotIndexed(String),

    #[error("{kind} schema error: {msg}")]
    Schema { kind: String, msg: String },
}

impl EntityError {
    /// Whether the caller should re-read and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub(crate) fn schema(kind: &str, msg: impl Into<String>) -> Self {
        Self::Schema {
            kind: kind.to_string(),
            msg: msg.into(),
        }
    }
}
