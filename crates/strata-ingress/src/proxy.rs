//! Reverse proxy: forwards one request to a sandbox over a fresh HTTP/1
//! connection and buffers the answer.

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::HeaderMap;
use axum::http::{Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{IngressError, IngressResult};

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Send `request` to `address` (`host:port`), bounded by `timeout`.
pub async fn forward(
    address: &str,
    request: Request<Body>,
    timeout: Duration,
) -> IngressResult<Response<Body>> {
    let upstream = |reason: String| IngressError::Upstream {
        address: address.to_string(),
        reason,
    };

    let exchange = async {
        let (mut parts, body) = request.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| upstream(format!("reading request body: {e}")))?
            .to_bytes();

        parts.uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse::<Uri>()
            .map_err(|e| upstream(e.to_string()))?;
        strip_hop_by_hop(&mut parts.headers);
        let outgoing = Request::from_parts(parts, Full::new(body));

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| upstream(format!("connect: {e}")))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| upstream(format!("handshake: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "upstream connection closed with error");
            }
        });

        let response = sender
            .send_request(outgoing)
            .await
            .map_err(|e| upstream(format!("request: {e}")))?;
        let (mut parts, body) = response.into_parts();
        let bytes: Bytes = body
            .collect()
            .await
            .map_err(|e| upstream(format!("reading response body: {e}")))?
            .to_bytes();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::from(bytes)))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(IngressError::UpstreamTimeout {
            address: address.to_string(),
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;

    async fn upstream() -> String {
        let router = Router::new().route(
            "/echo",
            post(|uri: Uri, body: String| async move { format!("{uri} {body}") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        address
    }

    #[tokio::test]
    async fn forwards_path_query_and_body() {
        let address = upstream().await;
        let request = Request::builder()
            .method("POST")
            .uri("http://web.example.com/echo?x=1")
            .header("host", "web.example.com")
            .header("connection", "keep-alive")
            .body(Body::from("hello"))
            .unwrap();

        let response = forward(&address, request, Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"/echo?x=1 hello");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let err = forward(&address, request, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
