//! Ingress error types and their HTTP rendering.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use strata_activator::ActivatorError;
use strata_entity::EntityError;

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("entity store error: {0}")]
    Store(#[from] EntityError),

    #[error(transparent)]
    Activator(#[from] ActivatorError),

    #[error("request has no host")]
    MissingHost,

    #[error("no app serves host {0}")]
    NoRoute(String),

    #[error("upstream {address} failed: {reason}")]
    Upstream { address: String, reason: String },

    #[error("upstream {address} did not answer within {timeout:?}")]
    UpstreamTimeout { address: String, timeout: Duration },
}

pub type IngressResult<T> = Result<T, IngressError>;

impl IngressError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingHost => StatusCode::BAD_REQUEST,
            Self::NoRoute(_) => StatusCode::NOT_FOUND,
            Self::Activator(ActivatorError::NoActiveVersion(_)) => StatusCode::NOT_FOUND,
            Self::Activator(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whole seconds for the `Retry-After` header of 503 responses.
    pub fn retry_after_secs(&self) -> Option<u64> {
        if self.status() != StatusCode::SERVICE_UNAVAILABLE {
            return None;
        }
        let delay = match self {
            Self::Activator(e) => e.retry_after(),
            _ => None,
        }
        .unwrap_or(Duration::from_secs(1));
        Some(delay.as_secs_f64().ceil().max(1.0) as u64)
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.to_string()).into_response();
        if let Some(secs) = self.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
