//! Deferred response handle.
//!
//! A `DeferredResponse` is the token a handler keeps after suspending a
//! request. Any thread may resume, fail or cancel it; the first one to claim
//! the request wins and every later attempt gets [`SuspendError::AlreadyResolved`].

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::observability::metrics;
use crate::suspend::context::{RequestContext, RequestId, ResolutionState};
use crate::suspend::coordinator::{CoordinatorInner, ResponseSink};
use crate::suspend::error::{SuspendError, WorkerError};
use crate::suspend::outcome::{Entity, Outcome};
use crate::suspend::scheduler::{deadline_after, Expire, TimeoutEntry};

/// Callback deciding what a timed-out request answers.
///
/// The handler receives a timeout-side handle: `resume` on it produces a
/// [`Outcome::TimedOut`] with the given entity. Calling `set_timeout` extends
/// the deadline instead. If the handler does neither (and nothing else
/// resolved the request meanwhile) the default `503` outcome is delivered.
///
/// Handlers run on a runtime task and must not block.
pub trait TimeoutHandler: Send + Sync + 'static {
    fn handle_timeout(&self, response: &DeferredResponse);
}

impl<F> TimeoutHandler for F
where
    F: Fn(&DeferredResponse) + Send + Sync + 'static,
{
    fn handle_timeout(&self, response: &DeferredResponse) {
        self(response)
    }
}

type CompletionCallback = Box<dyn FnOnce(ResolutionState) + Send>;

/// Which side of the request a handle acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Handler,
    Timeout,
}

impl Origin {
    fn as_str(self) -> &'static str {
        match self {
            Origin::Handler => "handler",
            Origin::Timeout => "timeout",
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-request state shared by every clone of a handle.
pub(crate) struct Shared {
    context: RequestContext,
    sink: Mutex<Option<Box<dyn ResponseSink>>>,
    timeout_handler: Mutex<Option<Arc<dyn TimeoutHandler>>>,
    /// Generation of the armed deadline; 0 when none is armed.
    timer_generation: AtomicU64,
    completion: Mutex<Vec<CompletionCallback>>,
    resolved: Notify,
    coordinator: Arc<CoordinatorInner>,
}

impl Shared {
    pub(crate) fn new(
        context: RequestContext,
        sink: Box<dyn ResponseSink>,
        coordinator: Arc<CoordinatorInner>,
    ) -> Self {
        Self {
            context,
            sink: Mutex::new(Some(sink)),
            timeout_handler: Mutex::new(None),
            timer_generation: AtomicU64::new(0),
            completion: Mutex::new(Vec::new()),
            resolved: Notify::new(),
            coordinator,
        }
    }

    pub(crate) fn context(&self) -> &RequestContext {
        &self.context
    }

    fn already_resolved(&self, state: ResolutionState) -> SuspendError {
        SuspendError::AlreadyResolved {
            id: self.context.id(),
            state,
        }
    }

    fn arm(self: &Arc<Self>, after: Duration) -> Result<(), SuspendError> {
        let state = self.context.state();
        if state != ResolutionState::Suspended {
            return Err(self.already_resolved(state));
        }

        let scheduler = self.coordinator.scheduler();
        let generation = scheduler.next_generation();
        let previous = self.timer_generation.swap(generation, Ordering::AcqRel);
        let target: Arc<dyn Expire> = self.clone();
        let entry = TimeoutEntry::new(target, deadline_after(after), generation);
        scheduler.replace(previous, entry)?;

        // A claimant that disarmed before our entry reached the scheduler
        // cannot have removed it.
        let state = self.context.state();
        if state != ResolutionState::Suspended {
            let _ = self.timer_generation.compare_exchange(
                generation,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            scheduler.cancel(generation);
            return Err(self.already_resolved(state));
        }
        Ok(())
    }

    fn disarm(&self) {
        let previous = self.timer_generation.swap(0, Ordering::AcqRel);
        if previous != 0 {
            self.coordinator.scheduler().cancel(previous);
        }
    }

    /// The single resolution path. Exactly one call per request returns `Ok`.
    fn resolve(&self, outcome: Outcome, origin: Origin) -> Result<(), SuspendError> {
        if let Err(state) = self.context.try_claim() {
            tracing::debug!(
                request_id = %self.context.id(),
                state = %state,
                attempted = outcome.kind(),
                source = origin.as_str(),
                "Discarding resolution attempt on resolved request"
            );
            self.coordinator.record_discarded(origin.as_str());
            return Err(self.already_resolved(state));
        }

        self.disarm();
        let terminal = outcome.terminal_state();
        self.context.finish(terminal);
        self.coordinator.complete(self, &outcome);

        let sink = lock(&self.sink).take();
        if let Some(sink) = sink {
            sink.deliver(outcome);
        }

        let callbacks = std::mem::take(&mut *lock(&self.completion));
        for callback in callbacks {
            callback(terminal);
        }
        self.resolved.notify_waiters();
        Ok(())
    }
}

impl Expire for Shared {
    fn request_id(&self) -> RequestId {
        self.context.id()
    }

    fn expire(self: Arc<Self>, generation: u64) {
        if self.timer_generation.load(Ordering::Acquire) != generation
            || self.context.state() != ResolutionState::Suspended
        {
            return;
        }
        metrics::record_timeout_fired();
        tracing::debug!(
            request_id = %self.context.id(),
            elapsed_ms = u64::try_from(self.context.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Suspended request timed out"
        );

        let handler = lock(&self.timeout_handler).clone();
        if let Some(handler) = handler {
            let view = DeferredResponse {
                shared: self.clone(),
                origin: Origin::Timeout,
            };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.handle_timeout(&view))) {
                let error = WorkerError::from_panic(payload);
                tracing::error!(request_id = %self.context.id(), error = %error, "Timeout handler panicked");
                let _ = self.resolve(Outcome::Failure(error), Origin::Timeout);
                return;
            }
            // Resolved or re-armed by the handler (or by a racing worker).
            if self.timer_generation.load(Ordering::Acquire) != generation {
                return;
            }
        }

        let _ = self.resolve(Outcome::default_timeout(), Origin::Timeout);
    }
}

/// Handle to a suspended request.
///
/// Cheap to clone; all clones refer to the same request. Every operation is
/// safe to call from any thread and never panics on a resolved request.
#[derive(Clone)]
pub struct DeferredResponse {
    shared: Arc<Shared>,
    origin: Origin,
}

impl DeferredResponse {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            origin: Origin::Handler,
        }
    }

    pub fn id(&self) -> RequestId {
        self.shared.context.id()
    }

    pub fn state(&self) -> ResolutionState {
        self.shared.context.state()
    }

    /// Time since the request arrived.
    pub fn elapsed(&self) -> Duration {
        self.shared.context.elapsed()
    }

    pub fn is_suspended(&self) -> bool {
        self.state() == ResolutionState::Suspended
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == ResolutionState::Cancelled
    }

    /// True for the handle passed to a [`TimeoutHandler`].
    pub fn is_timeout_context(&self) -> bool {
        self.origin == Origin::Timeout
    }

    /// Resolve with a successful entity.
    pub fn resume(&self, entity: impl Into<Entity>) -> Result<(), SuspendError> {
        let entity = entity.into();
        let outcome = match self.origin {
            Origin::Handler => Outcome::Success(entity),
            Origin::Timeout => Outcome::TimedOut(entity),
        };
        self.shared.resolve(outcome, self.origin)
    }

    /// Resolve with a failure.
    pub fn resume_error(&self, error: WorkerError) -> Result<(), SuspendError> {
        self.shared.resolve(Outcome::Failure(error), self.origin)
    }

    /// Cancel the request. The client receives `503 Service Unavailable`.
    pub fn cancel(&self) -> Result<(), SuspendError> {
        self.shared
            .resolve(Outcome::Cancelled { retry_after: None }, self.origin)
    }

    /// Cancel the request, advising the client when to retry.
    pub fn cancel_with_retry_after(&self, retry_after: Duration) -> Result<(), SuspendError> {
        self.shared.resolve(
            Outcome::Cancelled {
                retry_after: Some(retry_after),
            },
            self.origin,
        )
    }

    /// Arm a deadline `after` from now, replacing any earlier deadline.
    pub fn set_timeout(&self, after: Duration) -> Result<(), SuspendError> {
        self.shared.arm(after)
    }

    /// Register the callback run when the deadline passes. Replaces any earlier one.
    pub fn set_timeout_handler(&self, handler: impl TimeoutHandler) {
        *lock(&self.shared.timeout_handler) = Some(Arc::new(handler));
    }

    /// Run `callback` once the request reaches a terminal state.
    ///
    /// Runs immediately on the calling thread if the request is already done.
    pub fn on_complete(&self, callback: impl FnOnce(ResolutionState) + Send + 'static) {
        let mut callbacks = lock(&self.shared.completion);
        let state = self.state();
        if state.is_terminal() {
            drop(callbacks);
            callback(state);
        } else {
            callbacks.push(Box::new(callback));
        }
    }

    /// Wait until the request reaches a terminal state.
    pub async fn resolved(&self) {
        loop {
            let notified = self.shared.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for DeferredResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredResponse")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("origin", &self.origin)
            .finish()
    }
}
