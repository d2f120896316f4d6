//! Deferred HTTP server.
//!
//! # Architecture Overview
//!
//! ```text
//!   Client ──▶ listener ──▶ http (axum + tower-http) ──▶ resource handler
//!                                                          │ suspend
//!                                                          ▼
//!                                   ┌──────────── suspend::Coordinator ───────────┐
//!                                   │  DeferredResponse ◀── worker task            │
//!                                   │        ▲          ◀── TimeoutScheduler       │
//!                                   │        │          ◀── cancel / shutdown      │
//!                                   │  first claim wins → sink (oneshot)          │
//!                                   └──────────────────────────────────────────────┘
//!   Client ◀── response ◀── outcome rendered by http::response
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use deferred_http::config::{load_config, ConfigWatcher, ServiceConfig};
use deferred_http::lifecycle::{signals, Shutdown};
use deferred_http::observability::{logging, metrics};
use deferred_http::HttpServer;

#[derive(Parser)]
#[command(name = "deferred-http")]
#[command(about = "HTTP server with asynchronous, suspendable request handling", long_about = None)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long)]
    bind: Option<String>,

    /// Reload the configuration file when it changes.
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.listener.bind_address = bind;
    }

    logging::init(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "deferred-http starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        default_timeout_ms = config.suspend.default_timeout_ms,
        operation_duration_ms = config.resources.operation_duration_ms,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let (_watcher, config_updates) = match (&args.config, args.watch) {
        (Some(path), true) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (Some(watcher.with_current(config.clone()).run()?), updates)
        }
        _ => (None, mpsc::unbounded_channel().1),
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    signals::spawn_signal_listener(shutdown.clone());

    let server = HttpServer::new(config);
    server.run(listener, config_updates, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
