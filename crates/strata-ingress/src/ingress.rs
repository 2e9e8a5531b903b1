//! Ingress server: resolves the request's host to an app, takes a lease
//! from the activator and proxies the request to the leased sandbox.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use strata_activator::{Activator, Lease};
use strata_entity::EntityStore;

use crate::error::{IngressError, IngressResult};
use crate::proxy::forward;
use crate::resolve::{request_host, resolve_app};

#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Longest a proxied request may take once a sandbox is leased.
    pub upstream_timeout: Duration,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(60),
        }
    }
}

/// Shared state for the ingress handlers.
#[derive(Clone)]
pub struct IngressState {
    pub store: EntityStore,
    pub activator: Arc<Activator>,
    pub config: IngressConfig,
}

/// Gives the lease back however the request ends.
struct LeaseGuard {
    activator: Arc<Activator>,
    lease: Lease,
}

impl LeaseGuard {
    fn address(&self) -> &str {
        self.lease
            .url
            .strip_prefix("http://")
            .unwrap_or(&self.lease.url)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.activator.release(&self.lease);
    }
}

/// Build the ingress router. Every path is proxied.
pub fn ingress_router(state: IngressState) -> Router {
    Router::new().fallback(proxy_request).with_state(state)
}

/// Serve ingress on `listener` until `shutdown` flips.
pub async fn serve(
    state: IngressState,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "ingress listening");
    }
    axum::serve(listener, ingress_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            debug!("ingress shutting down");
        })
        .await
}

async fn proxy_request(
    State(state): State<IngressState>,
    request: Request,
) -> IngressResult<Response> {
    let host = request_host(&request).ok_or(IngressError::MissingHost)?;
    let app = resolve_app(&state.store, &host)?;

    let lease = state.activator.acquire(&app).await.inspect_err(|e| {
        warn!(%host, %app, error = %e, "no sandbox for request");
    })?;
    let guard = LeaseGuard {
        activator: state.activator.clone(),
        lease,
    };
    debug!(%host, %app, sandbox = %guard.lease.sandbox, path = %request.uri().path(), "proxying");

    forward(guard.address(), request, state.config.upstream_timeout)
        .await
        .inspect_err(|e| {
            warn!(%host, sandbox = %guard.lease.sandbox, error = %e, "upstream request failed");
        })
}
