//! strata-api — REST API for Strata.
//!
//! Exposes the entity store over HTTP, plus the app status view and
//! deployment endpoints.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/entities` | List entities (`?kind=`, `?id=`, `?attr=&value=&type=`) |
//! | POST | `/api/v1/query` | List entities with a JSON filter |
//! | GET | `/api/v1/entities/{kind}/{name}` | Get an entity |
//! | PUT | `/api/v1/entities/{kind}/{name}` | Write an entity, optionally conditional |
//! | DELETE | `/api/v1/entities/{kind}/{name}` | Delete an entity (`?expected_revision=`) |
//! | GET | `/api/v1/kinds` | List registered kinds |
//! | GET | `/api/v1/kinds/{name}` | Look up a kind |
//! | GET | `/api/v1/watch` | Server-sent change stream, same filters as list |
//! | GET | `/api/v1/apps` | List apps |
//! | GET | `/api/v1/apps/{name}` | App status: versions, pool, sandboxes |
//! | GET | `/api/v1/apps/{name}/deployments` | Deployment history, newest first |
//! | POST | `/api/v1/apps/{name}/deployments` | Deploy a new version |
//! | POST | `/api/v1/apps/{name}/rollback` | Roll back to an earlier version |

pub mod app_handlers;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use strata_activator::Activator;
use strata_controllers::Deployer;
use strata_entity::EntityStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: EntityStore,
    pub activator: Arc<Activator>,
    pub deployer: Arc<Deployer>,
}

/// Build the API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/entities", get(handlers::list_entities))
        .route("/query", post(handlers::query_entities))
        .route(
            "/entities/{*id}",
            get(handlers::get_entity)
                .put(handlers::put_entity)
                .delete(handlers::delete_entity),
        )
        .route("/kinds", get(handlers::list_kinds))
        .route("/kinds/{name}", get(handlers::get_kind))
        .route("/watch", get(handlers::watch_entities))
        .route("/apps", get(app_handlers::list_apps))
        .route("/apps/{name}", get(app_handlers::app_status))
        .route(
            "/apps/{name}/deployments",
            get(app_handlers::list_deployments).post(app_handlers::deploy),
        )
        .route("/apps/{name}/rollback", post(app_handlers::rollback))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

#[cfg(test)]
pub(crate) fn test_state() -> ApiState {
    use strata_activator::ActivatorConfig;

    let store = EntityStore::open_in_memory().unwrap();
    ApiState {
        activator: Arc::new(Activator::new(store.clone(), ActivatorConfig::default())),
        deployer: Arc::new(Deployer::new(store.clone())),
        store,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use strata_controllers::DeployRequest;
    use strata_entity::schema::AppVersion;
    use strata_entity::EntityId;
    use tower::ServiceExt;

    #[tokio::test]
    async fn entity_round_trip_over_http() {
        let router = build_router(test_state());

        let body = serde_json::json!({
            "attrs": [{ "key": "app.name", "value": { "t": "str", "v": "web" } }],
            "expected_revision": 0
        });
        let req = Request::builder()
            .method("PUT")
            .uri("/api/v1/entities/app/web")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::builder()
            .uri("/api/v1/entities/app/web")
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["data"]["revision"], 1);
        assert_eq!(json["data"]["kind"], "app");

        let req = Request::builder()
            .method("DELETE")
            .uri("/api/v1/entities/app/web?expected_revision=1")
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::builder()
            .uri("/api/v1/entities/app/web")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn json_filter_query() {
        let state = test_state();
        let router = build_router(state.clone());
        let app = EntityId::parse("app/web").unwrap();
        let mut version = AppVersion::new(app.clone(), "v1");
        version.command = vec!["./server".into()];
        state
            .deployer
            .deploy(&app, DeployRequest { version, git: None })
            .unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/query")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"by":"attr","of":{"key":"deployment.status","value":{"t":"keyword","v":"active"}}}"#,
            ))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["data"].as_array().unwrap().len(), 1);
    }
}
