//! Scheduler error types.

use thiserror::Error;

use strata_entity::EntityError;
use strata_reconcile::ReconcileError;

/// Errors that can occur while placing a sandbox.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("entity store error: {0}")]
    Store(#[from] EntityError),

    #[error("reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl From<SchedulerError> for ReconcileError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Store(e) => ReconcileError::Store(e),
            SchedulerError::Reconcile(e) => e,
        }
    }
}
