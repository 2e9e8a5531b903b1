//! Shared helpers for daemon tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;

use axum::Router;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use strata_entity::schema::SandboxSpec;
use strata_entity::EntityId;
use strata_runner::{RunnerError, RunnerResult, SandboxDriver, Started};
use stratad::DaemonConfig;

/// Runs every sandbox as an in-process HTTP server that greets with its id.
#[derive(Default)]
pub struct HttpDriver {
    servers: Mutex<HashMap<EntityId, JoinHandle<()>>>,
}

impl HttpDriver {
    pub fn running(&self) -> usize {
        self.servers.lock().unwrap().len()
    }
}

impl SandboxDriver for HttpDriver {
    async fn start(&self, sandbox: &EntityId, _spec: &SandboxSpec) -> RunnerResult<Started> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|source| RunnerError::Port {
                host: "127.0.0.1".to_string(),
                source,
            })?;
        let address = listener.local_addr().unwrap().to_string();
        let name = sandbox.to_string();
        let app = Router::new().fallback(move || {
            let name = name.clone();
            async move { format!("hello from {name}") }
        });
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        self.servers.lock().unwrap().insert(sandbox.clone(), handle);
        Ok(Started { address })
    }

    async fn stop(&self, sandbox: &EntityId) -> RunnerResult<()> {
        if let Some(handle) = self.servers.lock().unwrap().remove(sandbox) {
            handle.abort();
        }
        Ok(())
    }

    fn is_running(&self, sandbox: &EntityId) -> bool {
        self.servers.lock().unwrap().contains_key(sandbox)
    }
}

/// In-memory config with both listeners on ephemeral loopback ports.
pub fn test_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.store.in_memory = true;
    config.api.host = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.api.port = 0;
    config.ingress.host = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.ingress.port = 0;
    config
}

/// Send one HTTP/1 request and collect the response.
pub async fn send(
    addr: SocketAddr,
    method: Method,
    path: &str,
    host: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, Bytes) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let mut builder = Request::builder().method(method).uri(path).header(HOST, host);
    let body = match body {
        Some(json) => {
            builder = builder.header(CONTENT_TYPE, "application/json");
            Full::new(Bytes::from(json.to_string()))
        }
        None => Full::new(Bytes::new()),
    };
    let resp = sender.send_request(builder.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, bytes)
}

pub async fn send_json(
    addr: SocketAddr,
    method: Method,
    path: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let (status, bytes) = send(addr, method, path, "localhost", body).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}
