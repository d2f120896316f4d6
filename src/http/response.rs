//! Rendering outcomes as HTTP responses.
//!
//! ```text
//! Success(entity)   → entity status + body
//! TimedOut(entity)  → entity status + body
//! Failure(Interrupted) → 503
//! Failure(other)    → 500
//! Cancelled         → 503 (+ Retry-After)
//! ```

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::oneshot;

use crate::suspend::{Entity, Outcome, WorkerError};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

impl IntoResponse for Entity {
    fn into_response(self) -> Response {
        let content_type = self
            .content_type
            .as_deref()
            .and_then(|ct| HeaderValue::from_str(ct).ok())
            .unwrap_or_else(|| HeaderValue::from_static(TEXT_PLAIN));
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        response.headers_mut().insert(header::CONTENT_TYPE, content_type);
        response
    }
}

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        match self {
            Outcome::Success(entity) | Outcome::TimedOut(entity) => entity.into_response(),
            Outcome::Failure(error @ WorkerError::Interrupted) => {
                (StatusCode::SERVICE_UNAVAILABLE, error.to_string()).into_response()
            }
            Outcome::Failure(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
            }
            Outcome::Cancelled { retry_after } => {
                let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
                if let Some(after) = retry_after {
                    response
                        .headers_mut()
                        .insert(header::RETRY_AFTER, HeaderValue::from(after.as_secs()));
                }
                response
            }
        }
    }
}

/// Await the outcome of a suspended request and render it.
pub async fn await_outcome(rx: oneshot::Receiver<Outcome>) -> Response {
    match rx.await {
        Ok(outcome) => outcome.into_response(),
        Err(_) => {
            tracing::error!("Suspended request dropped without an outcome");
            (StatusCode::INTERNAL_SERVER_ERROR, "Request was abandoned").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn timeout_outcome_renders_503() {
        let response = Outcome::default_timeout().into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, "Operation time out.");
    }

    #[tokio::test]
    async fn entity_content_type_is_kept() {
        let entity = Entity::ok("{}").with_content_type("application/json");
        let response = Outcome::Success(entity).into_response();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn failures_map_to_status_codes() {
        let failed = Outcome::Failure(WorkerError::failed("boom")).into_response();
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(failed).await, "worker failed: boom");

        let interrupted = Outcome::Failure(WorkerError::Interrupted).into_response();
        assert_eq!(interrupted.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn cancel_sets_retry_after() {
        let response = Outcome::Cancelled {
            retry_after: Some(Duration::from_secs(7)),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "7");
    }

    #[tokio::test]
    async fn dropped_sender_is_internal_error() {
        let (tx, rx) = oneshot::channel::<Outcome>();
        drop(tx);
        assert_eq!(await_outcome(rx).await.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
