//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gatekeeper::clock::SystemClock;
use gatekeeper::config::GatekeeperConfig;
use gatekeeper::guard::GuardRegistry;
use gatekeeper::http::GatewayServer;
use gatekeeper::lifecycle::Shutdown;
use gatekeeper::retry::Jitter;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

/// Start a simple mock backend that returns a fixed response.
pub async fn start_mock_backend(addr: SocketAddr, response: &'static str) {
    start_programmable_backend(addr, move || async move { (200, response.to_string()) }).await;
}

/// Start a programmable mock backend with async support.
pub async fn start_programmable_backend<F, Fut>(addr: SocketAddr, f: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await.unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let (status, body) = f().await;
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            429 => "429 Too Many Requests",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            504 => "504 Gateway Timeout",
                            _ => "200 OK",
                        };

                        let response_str = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    });
                }
                Err(_) => break,
            }
        }
    });
}

/// Gateway config pointing at `backend`, with fast, deterministic retries.
pub fn gateway_config(gateway: SocketAddr, backend: SocketAddr) -> GatekeeperConfig {
    let mut config = GatekeeperConfig::default();
    config.listener.bind_address = gateway.to_string();
    config.upstream.base_url = format!("http://{backend}");
    config.observability.metrics_enabled = false;
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 50;
    config.retry.max_delay_ms = 500;
    config.retry.jitter = Jitter::None;
    config
}

/// Run a gateway in the background; trigger the returned handle to stop it.
pub async fn start_gateway(config: GatekeeperConfig) -> Shutdown {
    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let registry = GuardRegistry::new(Arc::new(SystemClock::new()));
    let server = GatewayServer::new(config, registry).unwrap();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown
}

/// Non-pooled client so every request opens a fresh connection.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
