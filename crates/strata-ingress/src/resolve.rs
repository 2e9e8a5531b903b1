//! Host → app resolution.
//!
//! Order: an `http_route` whose host matches exactly, then an app named by
//! the first host label (`web.example.com` → `app/web`), then the default
//! route.

use axum::http::{header, Request};
use tracing::debug;

use strata_controllers::default_route_id;
use strata_entity::schema::HttpRoute;
use strata_entity::{EntityId, EntityStore, Filter, Value};

use crate::error::{IngressError, IngressResult};

/// The request's host, lowercased and without port.
pub fn request_host<B>(request: &Request<B>) -> Option<String> {
    let raw = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())?;
    let host = strip_port(raw.trim()).to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

pub fn resolve_app(store: &EntityStore, host: &str) -> IngressResult<EntityId> {
    let routes = store.list_as::<HttpRoute>(&Filter::attr("http_route.host", Value::string(host)))?;
    if let Some((route, value)) = routes.into_iter().next() {
        debug!(%host, route = %route.id, app = %value.app, "host matched route");
        return Ok(value.app);
    }

    let label = host.split('.').next().unwrap_or(host);
    if let Ok(app) = EntityId::new("app", label) {
        if store.try_get(&app)?.is_some() {
            debug!(%host, %app, "host label names an app");
            return Ok(app);
        }
    }

    if let Some(route) = store.try_get(&default_route_id()?)? {
        let value: HttpRoute = route.decode()?;
        debug!(%host, app = %value.app, "falling back to default route");
        return Ok(value.app);
    }
    Err(IngressError::NoRoute(host.to_string()))
}
