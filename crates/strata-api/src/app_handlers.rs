//! REST API handlers for apps and their deployments.
//!
//! Provides the app status view, deployment history, deploy and rollback.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use strata_activator::PoolStats;
use strata_controllers::{ControllerError, DeployRequest};
use strata_entity::schema::{
    App, AppVersion, Concurrency, Deployment, DeploymentStatus, GitInfo, Resources, Sandbox,
};
use strata_entity::{EntityId, EntityResult, Filter, Value};
use strata_reconcile::ReconcileError;

use crate::handlers::{error_response, store_error, ApiResponse};
use crate::ApiState;

fn app_id(name: &str) -> Result<EntityId, Response> {
    EntityId::new("app", name).map_err(|e| store_error(&e))
}

fn controller_error(e: &ControllerError) -> Response {
    match e {
        ControllerError::Store(e) | ControllerError::Reconcile(ReconcileError::Store(e)) => {
            store_error(e)
        }
        ControllerError::Reconcile(ReconcileError::Contended { .. }) => {
            error_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE)
        }
        ControllerError::DeployFailed { .. } => {
            error_response(&e.to_string(), StatusCode::UNPROCESSABLE_ENTITY)
        }
        ControllerError::NoRollbackTarget(_) => error_response(&e.to_string(), StatusCode::CONFLICT),
        _ => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

// ── Views ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct AppView {
    pub id: EntityId,
    pub name: String,
    pub active_version: Option<EntityId>,
    pub default: bool,
}

impl AppView {
    fn new(id: EntityId, app: App) -> Self {
        Self {
            id,
            name: app.name,
            active_version: app.active_version,
            default: app.default,
        }
    }
}

/// The status page of one app.
#[derive(Debug, Serialize)]
pub struct AppStatus {
    #[serde(flatten)]
    pub app: AppView,
    /// Activator window counts across tracked versions.
    pub pool: PoolStats,
    /// Sandbox count per status.
    pub sandboxes: BTreeMap<&'static str, usize>,
    pub latest_deployment: Option<DeploymentView>,
}

#[derive(Debug, Serialize)]
pub struct DeploymentView {
    pub id: EntityId,
    pub app_version: Option<EntityId>,
    pub status: DeploymentStatus,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<GitInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentView {
    fn new(id: EntityId, d: Deployment) -> Self {
        Self {
            id,
            app_version: d.app_version,
            status: d.status,
            started_at: d.started_at,
            completed_at: d.completed_at,
            git: d.git,
            error: d.error,
        }
    }
}

fn sandbox_counts(state: &ApiState, app: &EntityId) -> EntityResult<BTreeMap<&'static str, usize>> {
    let mut counts = BTreeMap::new();
    let filter = Filter::attr("sandbox.app", Value::Ref(app.clone()));
    for (_, sandbox) in state.store.list_as::<Sandbox>(&filter)? {
        *counts.entry(sandbox.status.as_str()).or_insert(0) += 1;
    }
    Ok(counts)
}

// ── Apps ───────────────────────────────────────────────────────

/// GET /api/v1/apps
pub async fn list_apps(State(state): State<ApiState>) -> Response {
    match state.store.list_as::<App>(&Filter::kind("app")) {
        Ok(apps) => {
            let mut views: Vec<_> = apps
                .into_iter()
                .map(|(entity, app)| AppView::new(entity.id, app))
                .collect();
            views.sort_by(|a, b| a.id.cmp(&b.id));
            ApiResponse::ok(views).into_response()
        }
        Err(e) => store_error(&e),
    }
}

/// GET /api/v1/apps/{name}
pub async fn app_status(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let id = match app_id(&name) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let (entity, app) = match state.store.get_as::<App>(&id) {
        Ok(found) => found,
        Err(e) => return store_error(&e),
    };
    let sandboxes = match sandbox_counts(&state, &id) {
        Ok(counts) => counts,
        Err(e) => return store_error(&e),
    };
    let latest_deployment = match state.deployer.history(&id) {
        Ok(history) => history
            .into_iter()
            .next()
            .map(|(entity, d)| DeploymentView::new(entity.id, d)),
        Err(e) => return controller_error(&e),
    };
    ApiResponse::ok(AppStatus {
        app: AppView::new(entity.id, app),
        pool: state.activator.pool_stats(&id),
        sandboxes,
        latest_deployment,
    })
    .into_response()
}

// ── Deployments ────────────────────────────────────────────────

/// GET /api/v1/apps/{name}/deployments
pub async fn list_deployments(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let id = match app_id(&name) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.deployer.history(&id) {
        Ok(history) => {
            let views: Vec<_> = history
                .into_iter()
                .map(|(entity, d)| DeploymentView::new(entity.id, d))
                .collect();
            ApiResponse::ok(views).into_response()
        }
        Err(e) => controller_error(&e),
    }
}

/// Deploy request body.
#[derive(Debug, Deserialize)]
pub struct DeployBody {
    pub version: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub port: u16,
    pub concurrency: Option<Concurrency>,
    #[serde(default)]
    pub min_instances: u32,
    #[serde(default)]
    pub max_instances: u32,
    pub git: Option<GitInfo>,
}

impl DeployBody {
    fn into_request(self, app: &EntityId) -> DeployRequest {
        let mut version = AppVersion::new(app.clone(), &self.version);
        version.command = self.command;
        version.resources = self.resources;
        version.port = self.port;
        version.concurrency = self.concurrency;
        version.min_instances = self.min_instances;
        version.max_instances = self.max_instances;
        DeployRequest {
            version,
            git: self.git,
        }
    }
}

/// POST /api/v1/apps/{name}/deployments
pub async fn deploy(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<DeployBody>,
) -> Response {
    let id = match app_id(&name) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if body.version.is_empty() || body.command.is_empty() {
        return error_response("version and command are required", StatusCode::BAD_REQUEST);
    }
    match state.deployer.deploy(&id, body.into_request(&id)) {
        Ok(outcome) => {
            info!(app = %id, version = %outcome.version, "deployed over api");
            (StatusCode::CREATED, ApiResponse::ok(outcome)).into_response()
        }
        Err(e) => controller_error(&e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackBody {
    /// Deployment to return to; the previous active one when absent.
    pub deployment: Option<String>,
}

/// POST /api/v1/apps/{name}/rollback
pub async fn rollback(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let id = match app_id(&name) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    // The body is optional.
    let body: RollbackBody = if body.is_empty() {
        RollbackBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST),
        }
    };
    let target = match body.deployment.as_deref().map(EntityId::parse).transpose() {
        Ok(target) => target,
        Err(e) => return store_error(&e),
    };
    match state.deployer.rollback(&id, target.as_ref()) {
        Ok(outcome) => {
            info!(app = %id, version = %outcome.version, "rolled back over api");
            ApiResponse::ok(outcome).into_response()
        }
        Err(e) => controller_error(&e),
    }
}
