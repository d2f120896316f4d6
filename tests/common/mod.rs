//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use deferred_http::config::ServiceConfig;
use deferred_http::http::HttpServer;
use deferred_http::lifecycle::Shutdown;
use deferred_http::Coordinator;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Typical long-running operation duration used by the tests.
pub const OPERATION_DURATION_MS: u64 = 500;

/// A server running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub coordinator: Coordinator,
    pub config_updates: mpsc::UnboundedSender<ServiceConfig>,
    pub task: JoinHandle<Result<(), std::io::Error>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Config with short operation timings.
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.resources.operation_duration_ms = OPERATION_DURATION_MS;
    config.resources.timeout_ms = OPERATION_DURATION_MS;
    config.resources.slow_factor = 5;
    config
}

/// Start the HTTP server with `config`.
pub async fn start_server(config: ServiceConfig) -> TestServer {
    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let (config_updates, updates_rx) = mpsc::unbounded_channel();
    let server = HttpServer::new(config);
    let coordinator = server.coordinator().clone();
    let server_shutdown = shutdown.subscribe();

    let task = tokio::spawn(async move { server.run(listener, updates_rx, server_shutdown).await });

    // Give the accept loop a moment.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        shutdown,
        coordinator,
        config_updates,
        task,
    }
}

/// Client without connection pooling limits getting in the way.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
