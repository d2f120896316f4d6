//! Error definitions for the suspension engine.

use thiserror::Error;

use crate::suspend::context::{RequestId, ResolutionState};

/// Errors reported to callers of [`DeferredResponse`](crate::suspend::DeferredResponse).
///
/// None of these are fatal. A worker that loses the race against a timeout
/// gets `AlreadyResolved` back and is expected to drop its result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SuspendError {
    /// Another source already claimed the request.
    #[error("request {id} already resolved (state: {state})")]
    AlreadyResolved { id: RequestId, state: ResolutionState },

    /// The timeout scheduler was stopped; no new deadlines can be armed.
    #[error("timeout scheduler is stopped")]
    SchedulerStopped,
}

/// Failure produced by a dispatched computation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// The computation returned an error.
    #[error("worker failed: {0}")]
    Failed(String),

    /// The worker was interrupted before it produced a result.
    #[error("worker interrupted")]
    Interrupted,

    /// The worker (or a timeout handler) panicked.
    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl WorkerError {
    /// Convenience constructor for [`WorkerError::Failed`].
    pub fn failed(msg: impl Into<String>) -> Self {
        WorkerError::Failed(msg.into())
    }

    /// Build a `Panicked` error from a panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        WorkerError::Panicked(msg)
    }
}
