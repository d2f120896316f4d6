//! Asynchronous resources.
//!
//! - `POST /async`: long-running operation, answers `DONE-<id>` after
//!   `operation_duration_ms`
//! - `GET /async/timeout`: an operation slower than its own deadline; the
//!   timeout handler answers `503 Operation time out.`

use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use tokio::sync::oneshot;

use crate::http::request::request_id;
use crate::http::response::await_outcome;
use crate::http::server::AppState;
use crate::suspend::{worker, DeferredResponse, Entity, DEFAULT_TIMEOUT_BODY};

/// Long-running asynchronous post. The request body is the operation id.
pub async fn async_post(State(state): State<AppState>, headers: HeaderMap, id: String) -> Response {
    let duration = Duration::from_millis(state.resources.load().operation_duration_ms);
    let (tx, rx) = oneshot::channel();
    let response = state.coordinator.suspend_with_id(request_id(&headers), tx);

    tracing::info!(request_id = %response.id(), id = %id, "Long running post operation called");

    let worker = worker::dispatch(response.clone(), move |mut interrupt| async move {
        let result = tokio::select! {
            _ = tokio::time::sleep(duration) => format!("DONE-{id}"),
            _ = interrupt.interrupted() => format!("INTERRUPTED-{id}"),
        };
        tracing::info!(id = %id, "Long running post operation finished");
        Ok(Entity::ok(result))
    });
    // Stop the operation early when the request is cancelled or times out.
    response.on_complete(move |_| worker.interrupt());

    await_outcome(rx).await
}

/// Long-running get whose operation outlives its deadline.
pub async fn async_get_with_timeout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let resources = state.resources.load_full();
    let timeout = Duration::from_millis(resources.timeout_ms);
    let duration = Duration::from_millis(
        resources
            .operation_duration_ms
            .saturating_mul(u64::from(resources.slow_factor)),
    );

    let (tx, rx) = oneshot::channel();
    let response = state.coordinator.suspend_with_id(request_id(&headers), tx);

    tracing::info!(request_id = %response.id(), timeout_ms = resources.timeout_ms, "Async long-running get with timeout called");

    response.set_timeout_handler(|response: &DeferredResponse| {
        let _ = response.resume(Entity::service_unavailable(DEFAULT_TIMEOUT_BODY));
    });
    if let Err(e) = response.set_timeout(timeout) {
        tracing::warn!(request_id = %response.id(), error = %e, "Could not arm timeout");
    }

    worker::dispatch(response, move |_| async move {
        tokio::time::sleep(duration).await;
        tracing::info!("Async long-running get with timeout finished");
        Ok(Entity::ok("DONE"))
    });

    await_outcome(rx).await
}
