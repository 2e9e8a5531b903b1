//! Activator error types.

use std::time::Duration;

use thiserror::Error;

use strata_entity::EntityError;

/// Errors surfaced to the request path.
#[derive(Debug, Error)]
pub enum ActivatorError {
    #[error("entity store error: {0}")]
    Store(#[from] EntityError),

    #[error("app {0} has no active version")]
    NoActiveVersion(String),

    /// The bounded wait for a cold start expired.
    #[error("timed out after {waited:?} waiting for a sandbox of {app}")]
    Timeout { app: String, waited: Duration },

    /// Cold starts for the version are refused for now.
    #[error("no capacity for {version}: {reason}")]
    NoCapacity {
        version: String,
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("lease not found for sandbox {0}")]
    LeaseNotFound(String),
}

impl ActivatorError {
    /// Whether the caller may retry the request later (503-class).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::NoCapacity { .. } => true,
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Suggested delay before retrying, when one is known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::NoCapacity { retry_after, .. } => *retry_after,
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

pub type ActivatorResult<T> = Result<T, ActivatorError>;
