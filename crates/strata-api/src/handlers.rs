//! Entity RPC handlers.
//!
//! Each handler reads or writes through `EntityStore` and answers with the
//! `{ success, data, error }` envelope.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream;
use serde::{Deserialize, Serialize};
use tracing::debug;

use strata_entity::{Attrs, Entity, EntityError, EntityId, Filter, Revision, Value};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

#[derive(Serialize)]
struct ConflictDetail<'a> {
    id: &'a str,
    expected: Revision,
    actual: Revision,
}

/// Map a store error onto its HTTP status.
pub(crate) fn store_error(e: &EntityError) -> Response {
    match e {
        EntityError::Conflict {
            id,
            expected,
            actual,
        } => (
            StatusCode::CONFLICT,
            Json(ApiResponse {
                success: false,
                data: Some(ConflictDetail {
                    id,
                    expected: *expected,
                    actual: *actual,
                }),
                error: Some(e.to_string()),
            }),
        )
            .into_response(),
        EntityError::NotFound(_) => error_response(&e.to_string(), StatusCode::NOT_FOUND),
        EntityError::Unavailable(_) => {
            error_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE)
        }
        EntityError::InvalidId(_)
        | EntityError::KindMismatch { .. }
        | EntityError::NotIndexed(_)
        | EntityError::Schema { .. }
        | EntityError::Deserialize(_) => error_response(&e.to_string(), StatusCode::BAD_REQUEST),
        _ => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

fn parse_id(raw: &str) -> Result<EntityId, Response> {
    EntityId::parse(raw.trim_start_matches('/')).map_err(|e| store_error(&e))
}

// ── Filters ────────────────────────────────────────────────────

/// Query-string filter shared by list and watch.
///
/// `?kind=sandbox`, `?id=app/web`, or `?attr=sandbox.app&value=app/web&type=ref`.
#[derive(Debug, Default, Deserialize)]
pub struct FilterQuery {
    pub kind: Option<String>,
    pub id: Option<String>,
    pub attr: Option<String>,
    pub value: Option<String>,
    /// Value type for `attr` filters: `str` (default), `keyword`, `ref`,
    /// `bool`, `int` or `time`.
    #[serde(rename = "type")]
    pub value_type: Option<String>,
}

impl FilterQuery {
    pub fn to_filter(&self) -> Result<Filter, String> {
        if let Some(id) = &self.id {
            return EntityId::parse(id).map(Filter::Id).map_err(|e| e.to_string());
        }
        if let Some(key) = &self.attr {
            let raw = self.value.as_deref().ok_or("attr filter needs a value")?;
            let value = parse_value(self.value_type.as_deref().unwrap_or("str"), raw)?;
            return Ok(Filter::attr(key, value));
        }
        Ok(match &self.kind {
            Some(kind) => Filter::kind(kind),
            None => Filter::All,
        })
    }
}

fn parse_value(ty: &str, raw: &str) -> Result<Value, String> {
    let bad = |e: &dyn std::fmt::Display| format!("invalid {ty} value {raw:?}: {e}");
    match ty {
        "str" => Ok(Value::string(raw)),
        "keyword" => Ok(Value::keyword(raw)),
        "ref" => EntityId::parse(raw).map(Value::Ref).map_err(|e| bad(&e)),
        "bool" => raw.parse().map(Value::Bool).map_err(|e| bad(&e)),
        "int" => raw.parse().map(Value::Int).map_err(|e| bad(&e)),
        "time" => raw.parse().map(Value::Time).map_err(|e| bad(&e)),
        other => Err(format!("unknown value type {other}")),
    }
}

// ── Entities ───────────────────────────────────────────────────

/// GET /api/v1/entities/{*id}
pub async fn get_entity(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store.get(&id) {
        Ok(entity) => ApiResponse::ok(entity).into_response(),
        Err(e) => store_error(&e),
    }
}

/// Body of a put.
#[derive(Debug, Deserialize)]
pub struct PutEntityRequest {
    #[serde(default)]
    pub attrs: Attrs,
    /// `0` means create only; absent means unconditional.
    pub expected_revision: Option<Revision>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResult {
    pub id: EntityId,
    pub revision: Revision,
}

/// PUT /api/v1/entities/{*id}
pub async fn put_entity(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<PutEntityRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let mut entity = Entity::new(id.clone());
    entity.attrs = req.attrs;
    match state.store.put(&entity, req.expected_revision) {
        Ok(revision) => {
            debug!(%id, revision, "entity written over api");
            ApiResponse::ok(WriteResult { id, revision }).into_response()
        }
        Err(e) => store_error(&e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    pub expected_revision: Option<Revision>,
}

/// DELETE /api/v1/entities/{*id}
pub async fn delete_entity(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store.delete(&id, query.expected_revision) {
        Ok(revision) => ApiResponse::ok(WriteResult { id, revision }).into_response(),
        Err(e) => store_error(&e),
    }
}

/// GET /api/v1/entities
pub async fn list_entities(
    State(state): State<ApiState>,
    Query(query): Query<FilterQuery>,
) -> Response {
    let filter = match query.to_filter() {
        Ok(filter) => filter,
        Err(msg) => return error_response(&msg, StatusCode::BAD_REQUEST),
    };
    match state.store.list(&filter) {
        Ok(entities) => ApiResponse::ok(entities).into_response(),
        Err(e) => store_error(&e),
    }
}

/// POST /api/v1/query — list with a JSON filter body.
pub async fn query_entities(State(state): State<ApiState>, Json(filter): Json<Filter>) -> Response {
    match state.store.list(&filter) {
        Ok(entities) => ApiResponse::ok(entities).into_response(),
        Err(e) => store_error(&e),
    }
}

// ── Kinds ──────────────────────────────────────────────────────

/// GET /api/v1/kinds
pub async fn list_kinds(State(state): State<ApiState>) -> Response {
    match state.store.list_kinds() {
        Ok(kinds) => ApiResponse::ok(kinds).into_response(),
        Err(e) => store_error(&e),
    }
}

/// GET /api/v1/kinds/{name}
pub async fn get_kind(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.store.lookup_kind(&name) {
        Ok(kind) => ApiResponse::ok(kind).into_response(),
        Err(e) => store_error(&e),
    }
}

// ── Watch ──────────────────────────────────────────────────────

/// GET /api/v1/watch — server-sent events.
///
/// The current matching entities arrive first as `put` events, followed
/// by live `put`/`delete` events whose id is the entity revision. The
/// stream ends when the watcher falls behind; clients reconnect and get a
/// fresh snapshot.
pub async fn watch_entities(
    State(state): State<ApiState>,
    Query(query): Query<FilterQuery>,
) -> Response {
    let filter = match query.to_filter() {
        Ok(filter) => filter,
        Err(msg) => return error_response(&msg, StatusCode::BAD_REQUEST),
    };
    let watch = match state.store.watch(filter) {
        Ok(watch) => watch,
        Err(e) => return store_error(&e),
    };
    debug!(snapshot = watch.snapshot_len(), "watch stream opened");

    let events = stream::unfold(watch, |mut watch| async move {
        let event = watch.recv().await?;
        let name = if event.is_delete() { "delete" } else { "put" };
        let sse = Event::default()
            .event(name)
            .id(event.revision().to_string())
            .json_data(&event.entity)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
        Some((Ok::<_, Infallible>(sse), watch))
    });

    Sse::new(events)
        .keep_alive(KeepAlive::default().interval(Duration::from_secs(15)))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_state;
    use axum::body::to_bytes;
    use strata_entity::schema::App;
    use strata_entity::EntityStore;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn put_app(store: &EntityStore, name: &str) {
        let id = EntityId::new("app", name).unwrap();
        store
            .put(&Entity::from_schema(id, &App::new(name)).unwrap(), None)
            .unwrap();
    }

    #[test]
    fn filter_query_forms() {
        let q = FilterQuery {
            attr: Some("sandbox.app".into()),
            value: Some("app/web".into()),
            value_type: Some("ref".into()),
            ..FilterQuery::default()
        };
        assert_eq!(
            q.to_filter().unwrap(),
            Filter::attr("sandbox.app", Value::Ref(EntityId::parse("app/web").unwrap()))
        );

        let q = FilterQuery {
            kind: Some("node".into()),
            ..FilterQuery::default()
        };
        assert_eq!(q.to_filter().unwrap(), Filter::kind("node"));
        assert_eq!(FilterQuery::default().to_filter().unwrap(), Filter::All);

        let q = FilterQuery {
            attr: Some("app.default".into()),
            value: Some("maybe".into()),
            value_type: Some("bool".into()),
            ..FilterQuery::default()
        };
        assert!(q.to_filter().is_err());
    }

    #[tokio::test]
    async fn get_missing_entity_is_404() {
        let state = test_state();
        let resp = get_entity(State(state), Path("app/nope".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn invalid_id_is_400() {
        let state = test_state();
        let resp = get_entity(State(state), Path("no-slash".to_string())).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stale_put_is_409_with_revisions() {
        let state = test_state();
        put_app(&state.store, "web");
        put_app(&state.store, "web");

        let req = PutEntityRequest {
            attrs: Attrs::new(),
            expected_revision: Some(1),
        };
        let resp = put_entity(State(state), Path("app/web".to_string()), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["expected"], 1);
        assert_eq!(body["data"]["actual"], 2);
    }

    #[tokio::test]
    async fn list_by_kind() {
        let state = test_state();
        put_app(&state.store, "web");
        put_app(&state.store, "api");
        let query = FilterQuery {
            kind: Some("app".into()),
            ..FilterQuery::default()
        };
        let resp = list_entities(State(state), Query(query)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unindexed_attr_filter_is_400() {
        let state = test_state();
        let query = FilterQuery {
            attr: Some("app.name".into()),
            value: Some("web".into()),
            ..FilterQuery::default()
        };
        let resp = list_entities(State(state), Query(query)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn kind_lookup() {
        let state = test_state();
        let resp = get_kind(State(state.clone()), Path("sandbox".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["name"], "sandbox");

        let resp = get_kind(State(state), Path("gadget".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
