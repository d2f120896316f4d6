//! Terminal outcomes delivered to the transport.

use std::time::Duration;

use axum::body::Bytes;
use axum::http::StatusCode;

use crate::suspend::context::ResolutionState;
use crate::suspend::error::WorkerError;

/// Body delivered when a deadline passes without a custom timeout handler.
pub const DEFAULT_TIMEOUT_BODY: &str = "Operation time out.";

/// A response entity: status plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<String>,
}

impl Entity {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            content_type: None,
        }
    }

    /// `200 OK` with the given payload.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    /// `503 Service Unavailable` with the given payload.
    pub fn service_unavailable(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, body)
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Body as UTF-8 text, lossy.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl From<String> for Entity {
    fn from(body: String) -> Self {
        Entity::ok(body)
    }
}

impl From<&'static str> for Entity {
    fn from(body: &'static str) -> Self {
        Entity::ok(body)
    }
}

impl From<Bytes> for Entity {
    fn from(body: Bytes) -> Self {
        Entity::ok(body)
    }
}

/// The single final outcome of a suspended request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A worker produced a result.
    Success(Entity),
    /// The computation failed.
    Failure(WorkerError),
    /// The deadline passed; the entity comes from the timeout handler or the default.
    TimedOut(Entity),
    /// Explicitly cancelled.
    Cancelled { retry_after: Option<Duration> },
}

impl Outcome {
    /// The default timeout outcome: `503` with [`DEFAULT_TIMEOUT_BODY`].
    pub fn default_timeout() -> Self {
        Outcome::TimedOut(Entity::service_unavailable(DEFAULT_TIMEOUT_BODY))
    }

    /// Terminal state this outcome moves the request into.
    pub fn terminal_state(&self) -> ResolutionState {
        match self {
            Outcome::Success(_) => ResolutionState::Resolved,
            Outcome::Failure(_) => ResolutionState::Failed,
            Outcome::TimedOut(_) => ResolutionState::TimedOut,
            Outcome::Cancelled { .. } => ResolutionState::Cancelled,
        }
    }

    /// Label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        self.terminal_state().as_str()
    }

    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Outcome::Success(e) | Outcome::TimedOut(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_503() {
        let outcome = Outcome::default_timeout();
        let entity = outcome.entity().unwrap();
        assert_eq!(entity.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(entity.text(), "Operation time out.");
        assert_eq!(outcome.terminal_state(), ResolutionState::TimedOut);
    }

    #[test]
    fn outcome_kinds() {
        assert_eq!(Outcome::Success("x".into()).kind(), "resolved");
        assert_eq!(Outcome::Failure(WorkerError::Interrupted).kind(), "failed");
        assert_eq!(Outcome::Cancelled { retry_after: None }.kind(), "cancelled");
    }
}
