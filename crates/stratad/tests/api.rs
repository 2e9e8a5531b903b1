//! The REST API served by a running daemon.

mod common;

use std::sync::Arc;

use hyper::{Method, StatusCode};

use common::{send_json, test_config, HttpDriver};
use strata_entity::schema::{Node, NodeStatus};
use stratad::Daemon;

async fn start() -> Daemon {
    let config = test_config();
    let store = stratad::open_store(&config).unwrap();
    Daemon::start(&config, store, Arc::new(HttpDriver::default()))
        .await
        .unwrap()
}

#[tokio::test]
async fn built_in_kinds_are_listed() {
    let daemon = start().await;
    let (status, json) = send_json(daemon.api_addr(), Method::GET, "/api/v1/kinds", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<_> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k["name"].as_str().unwrap().to_string())
        .collect();
    for kind in ["app", "app_version", "sandbox", "node", "http_route"] {
        assert!(names.iter().any(|n| n == kind), "missing kind {kind}");
    }
    daemon.shutdown().await;
}

#[tokio::test]
async fn local_node_registers_ready() {
    let daemon = start().await;
    let (_, node) = daemon.store().get_as::<Node>(daemon.node()).unwrap();
    assert_eq!(node.status, NodeStatus::Ready);

    let path = format!("/api/v1/entities/{}", daemon.node());
    let (status, json) = send_json(daemon.api_addr(), Method::GET, &path, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["kind"], "node");
    daemon.shutdown().await;
}

#[tokio::test]
async fn unknown_app_is_404() {
    let daemon = start().await;
    let (status, json) = send_json(daemon.api_addr(), Method::GET, "/api/v1/apps/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
    daemon.shutdown().await;
}

#[tokio::test]
async fn stale_write_is_409() {
    let daemon = start().await;
    let body = serde_json::json!({
        "attrs": [{ "key": "app.name", "value": { "t": "str", "v": "blog" } }],
        "expected_revision": 0
    });

    let (status, json) = send_json(
        daemon.api_addr(),
        Method::PUT,
        "/api/v1/entities/app/blog",
        Some(body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["revision"], 1);

    let (status, json) =
        send_json(daemon.api_addr(), Method::PUT, "/api/v1/entities/app/blog", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["data"]["expected"], 0);
    daemon.shutdown().await;
}

#[tokio::test]
async fn persistent_store_lives_in_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.store.in_memory = false;
    config.store.data_dir = dir.path().join("state");

    let store = stratad::open_store(&config).unwrap();
    assert!(config.store.db_path().exists());
    assert!(store.list_kinds().unwrap().iter().any(|k| k.name == "sandbox"));
}
