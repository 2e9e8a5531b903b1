//! Reconcile error types.

use thiserror::Error;

use strata_entity::EntityError;

/// Errors returned from a reconcile step.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("entity store error: {0}")]
    Store(#[from] EntityError),

    #[error("gave up on {id} after {attempts} conflicting writes")]
    Contended { id: String, attempts: usize },

    #[error("{0}")]
    Failed(String),
}

impl ReconcileError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Whether the underlying cause was a revision conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict()) || matches!(self, Self::Contended { .. })
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
