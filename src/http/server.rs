//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum router with the async resources and status endpoint
//! - Wire up middleware (request ID, tracing, body limit)
//! - Own the resolution coordinator for the server's lifetime
//! - Apply configuration updates to new requests
//! - Cancel in-flight requests on shutdown so no client hangs

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::{ResourceConfig, ServiceConfig};
use crate::http::{resources, status};
use crate::suspend::Coordinator;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub resources: Arc<ArcSwap<ResourceConfig>>,
}

/// HTTP server exposing the async resources.
pub struct HttpServer {
    router: Router,
    config: ServiceConfig,
    state: AppState,
}

impl HttpServer {
    /// Create a server. Starts the coordinator, so it must run inside a tokio runtime.
    pub fn new(config: ServiceConfig) -> Self {
        let state = AppState {
            coordinator: Coordinator::start(&config.suspend),
            resources: Arc::new(ArcSwap::from_pointee(config.resources.clone())),
        };
        let router = Self::build_router(&config, state.clone());
        Self {
            router,
            config,
            state,
        }
    }

    fn build_router(config: &ServiceConfig, state: AppState) -> Router {
        Router::new()
            .route("/async", post(resources::async_post))
            .route("/async/timeout", get(resources::async_get_with_timeout))
            .route("/status", get(status::get_status))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id())
                    .layer(RequestBodyLimitLayer::new(config.listener.max_body_bytes)),
            )
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.state.coordinator
    }

    /// The router, for driving the server without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until `shutdown` fires, applying `config_updates` as they arrive.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<ServiceConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let state = self.state.clone();
        let current = self.config.clone();
        let updater = tokio::spawn(async move {
            let mut current = current;
            while let Some(update) = config_updates.recv().await {
                apply_update(&state, &current, &update);
                current = update;
            }
        });

        let coordinator = self.state.coordinator.clone();
        let result = axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Stopping: cancelling suspended requests");
                coordinator.stop();
            })
            .await;

        updater.abort();
        // Covers the case where serving failed before shutdown was signalled.
        self.state.coordinator.stop();
        tracing::info!("HTTP server stopped");
        result
    }
}

fn apply_update(state: &AppState, current: &ServiceConfig, update: &ServiceConfig) {
    state.resources.store(Arc::new(update.resources.clone()));
    state
        .coordinator
        .set_default_timeout(Duration::from_millis(update.suspend.default_timeout_ms));

    if update.listener != current.listener || update.observability != current.observability {
        tracing::warn!("Listener and observability changes take effect after restart");
    }
    tracing::info!(
        default_timeout_ms = update.suspend.default_timeout_ms,
        operation_duration_ms = update.resources.operation_duration_ms,
        timeout_ms = update.resources.timeout_ms,
        "Configuration reloaded"
    );
}
