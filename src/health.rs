//! HTTP health and status server.
//!
//! - `/healthz`: liveness, always 200 while the process serves requests.
//! - `/readyz`: 200 once the node has joined, 503 before that and from the
//!   moment shutdown begins.
//! - `/status`: JSON view of the node, its directory and the rebalancer.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::node::Node;

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    respond(status, "text/plain", body)
}

/// Routes a request against the node's current state.
pub async fn health_handler<B>(
    node: Arc<Node>,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" => text(StatusCode::OK, "ok"),
        "/readyz" if node.is_ready() => text(StatusCode::OK, "ok"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        "/status" => match serde_json::to_vec(&node.status()) {
            Ok(body) => respond(StatusCode::OK, "application/json", body),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode status");
                text(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        },
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

/// Binds `addr` and serves until `cancel` fires.
pub async fn start_health_server(
    addr: SocketAddr,
    node: Arc<Node>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "health server listening");
    serve(listener, node, cancel).await
}

/// Serves health requests on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    node: Arc<Node>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);
        let node = Arc::clone(&node);

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(Arc::clone(&node), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "health connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryNetwork, NodeId};
    use crate::config::Config;
    use crate::upstream::fill;

    fn node(id: &str) -> Arc<Node> {
        let network = MemoryNetwork::new();
        let mut config = Config::default();
        config.server.gossip_addr = "127.0.0.1:7201".to_string();
        config.server.grace_period_seconds = 1;
        let transport = network.bind(
            "127.0.0.1:7201".parse().unwrap(),
            NodeId::new(id),
            config.advertise_addr(),
        );
        Arc::new(Node::new(config, NodeId::new(id), Arc::new(transport)).unwrap())
    }

    /// Starts the server on an ephemeral port; the returned token stops it.
    async fn spawn_server(node: Arc<Node>) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, node, cancel.clone()));
        (addr, cancel)
    }

    // ========== Endpoints ==========

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let (addr, cancel) = spawn_server(node("a")).await;

        let response = get(addr, "/healthz").await;
        assert_eq!(response.0, 200);
        assert_eq!(response.1, "ok");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_readyz_tracks_join_and_shutdown() {
        let node = node("a");
        let (addr, cancel) = spawn_server(Arc::clone(&node)).await;

        assert_eq!(get(addr, "/readyz").await.0, 503);

        node.start().await.unwrap();
        let response = get(addr, "/readyz").await;
        assert_eq!(response.0, 200);
        assert_eq!(response.1, "ok");

        node.shutdown().await;
        assert_eq!(get(addr, "/readyz").await.0, 503);
        // Liveness is unaffected by shutdown.
        assert_eq!(get(addr, "/healthz").await.0, 200);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_status_returns_json() {
        let node = node("status-node");
        node.start().await.unwrap();
        fill(node.registry(), "tenant-a", 3);
        let (addr, cancel) = spawn_server(Arc::clone(&node)).await;

        let (code, body) = get(addr, "/status").await;
        assert_eq!(code, 200);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["node_id"], "status-node");
        assert_eq!(json["ready"], true);
        assert_eq!(json["local_connections"], 3);
        assert_eq!(json["tenants"]["tenant-a"], 3);
        assert!(json["members"].is_array());
        assert!(json["rebalancer"]["ticks"].is_u64());

        node.shutdown().await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let (addr, cancel) = spawn_server(node("a")).await;

        let response = get(addr, "/foo").await;
        assert_eq!(response.0, 404);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(serve(listener, node("a"), cancel.clone()));

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    /// Sends a bare HTTP/1.1 GET and returns the status code and body.
    async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
        let code = head[9..12].parse().unwrap();
        (code, body.to_string())
    }
}
