//! Liveness and readiness endpoints for the kubelet.

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tracing::info;

pub const LIVENESS_PATH: &str = "/healthz";
pub const READINESS_PATH: &str = "/readyz";

async fn ok() -> &'static str {
    "OK"
}

pub fn router() -> Router {
    Router::new()
        .route(LIVENESS_PATH, get(ok))
        .route(READINESS_PATH, get(ok))
}

/// Serve the health routes until the listener fails
pub async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;
    info!(address = %addr, "Starting health server");

    axum::serve(listener, router())
        .await
        .context("Health server stopped")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn get_path(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health_routes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router()).await });

        for path in [LIVENESS_PATH, READINESS_PATH] {
            let response = get_path(addr, path).await;
            assert!(response.starts_with("HTTP/1.1 200"), "{path}: {response}");
            assert!(response.ends_with("OK"));
        }

        let response = get_path(addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }
}
