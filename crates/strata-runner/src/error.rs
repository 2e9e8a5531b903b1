//! Runner error types.

use thiserror::Error;

use strata_entity::EntityError;
use strata_reconcile::ReconcileError;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("entity store error: {0}")]
    Store(#[from] EntityError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("sandbox {0} has no command")]
    EmptyCommand(String),

    #[error("failed to spawn sandbox {sandbox}: {source}")]
    Spawn {
        sandbox: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no free port on {host}: {source}")]
    Port {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

pub type RunnerResult<T> = Result<T, RunnerError>;

impl From<RunnerError> for ReconcileError {
    fn from(e: RunnerError) -> Self {
        match e {
            RunnerError::Store(e) => ReconcileError::Store(e),
            RunnerError::Reconcile(e) => e,
            other => ReconcileError::failed(other.to_string()),
        }
    }
}
