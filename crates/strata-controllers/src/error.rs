//! Controller error types.

use thiserror::Error;

use strata_entity::EntityError;
use strata_reconcile::ReconcileError;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("entity store error: {0}")]
    Store(#[from] EntityError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("invalid subnet {subnet}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    #[error("no free address left in {0}")]
    AddressesExhausted(String),

    #[error("deployment of {app} failed: {reason}")]
    DeployFailed { app: String, reason: String },

    #[error("nothing to roll back to for {0}")]
    NoRollbackTarget(String),
}

impl ControllerError {
    /// Whether the underlying cause was a missing entity.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Store(e) => e.is_not_found(),
            Self::Reconcile(ReconcileError::Store(e)) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;

impl From<ControllerError> for ReconcileError {
    fn from(e: ControllerError) -> Self {
        match e {
            ControllerError::Store(e) => ReconcileError::Store(e),
            ControllerError::Reconcile(e) => e,
            other => ReconcileError::failed(other.to_string()),
        }
    }
}
