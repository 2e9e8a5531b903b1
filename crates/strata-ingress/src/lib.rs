//! Strata ingress — the HTTP front door for apps.
//!
//! # Components
//!
//! - **Resolution**: maps a request's host to an app through `http_route`
//!   entities, the host's first label, or the default route.
//! - **Ingress**: takes a lease from the activator (cold starting a
//!   sandbox when none is warm) and holds it for the request's lifetime.
//! - **Proxy**: forwards the request to the leased sandbox over HTTP/1.

pub mod error;
pub mod ingress;
pub mod proxy;
pub mod resolve;

pub use error::{IngressError, IngressResult};
pub use ingress::{ingress_router, serve, IngressConfig, IngressState};
pub use proxy::forward;
pub use resolve::{request_host, resolve_app};
