//! Resolution coordinator.
//!
//! # Responsibilities
//! - Create deferred responses and register them as in-flight
//! - Arm the mandatory default deadline for every suspended request
//! - Account for each terminal outcome and deliver it to the transport sink
//! - Cancel everything still in flight on stop
//!
//! # Data Flow
//! ```text
//! suspend(sink) → DeferredResponse ──┬── worker resume / resume_error
//!                                    ├── scheduler expire
//!                                    └── cancel
//!                                          ↓ (first claim wins)
//!                                    complete() → sink.deliver(outcome)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::SuspendConfig;
use crate::observability::metrics;
use crate::suspend::context::{RequestContext, RequestId};
use crate::suspend::handle::{DeferredResponse, Shared};
use crate::suspend::outcome::Outcome;
use crate::suspend::scheduler::{SchedulerHandle, TimeoutScheduler};

/// Receives the final outcome of a request. Invoked at most once.
pub trait ResponseSink: Send + 'static {
    fn deliver(self: Box<Self>, outcome: Outcome);
}

impl ResponseSink for oneshot::Sender<Outcome> {
    fn deliver(self: Box<Self>, outcome: Outcome) {
        if (*self).send(outcome).is_err() {
            tracing::debug!("Client went away before the outcome was delivered");
        }
    }
}

/// Sink backed by a closure. Built with [`sink_fn`].
pub struct FnSink<F>(F);

impl<F> ResponseSink for FnSink<F>
where
    F: FnOnce(Outcome) + Send + 'static,
{
    fn deliver(self: Box<Self>, outcome: Outcome) {
        (self.0)(outcome)
    }
}

/// Wrap a closure as a [`ResponseSink`].
pub fn sink_fn<F>(f: F) -> FnSink<F>
where
    F: FnOnce(Outcome) + Send + 'static,
{
    FnSink(f)
}

/// Snapshot of coordinator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub in_flight: usize,
    pub pending_timeouts: usize,
    pub resolved: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Resolution attempts that lost the race.
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    resolved: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    discarded: AtomicU64,
}

pub(crate) struct CoordinatorInner {
    scheduler: SchedulerHandle,
    registry: DashMap<RequestId, Arc<Shared>>,
    default_timeout_ms: AtomicU64,
    stopped: AtomicBool,
    counters: Counters,
}

impl CoordinatorInner {
    pub(crate) fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub(crate) fn record_discarded(&self, source: &'static str) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        metrics::record_discarded(source);
    }

    /// Bookkeeping for the claimant. Runs before the sink is invoked.
    pub(crate) fn complete(&self, shared: &Shared, outcome: &Outcome) {
        let context = shared.context();
        self.registry
            .remove_if(&context.id(), |_, registered| std::ptr::eq(registered.as_ref(), shared));

        let counter = match outcome {
            Outcome::Success(_) => &self.counters.resolved,
            Outcome::Failure(_) => &self.counters.failed,
            Outcome::TimedOut(_) => &self.counters.timed_out,
            Outcome::Cancelled { .. } => &self.counters.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let elapsed = context.elapsed();
        metrics::record_resolution(outcome.kind(), elapsed);
        metrics::set_in_flight(self.registry.len());

        tracing::debug!(
            request_id = %context.id(),
            outcome = outcome.kind(),
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Request resolved"
        );
    }
}

/// Arbitrates resolution of suspended requests.
///
/// Cloning is cheap; clones share the scheduler and registry.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// Start a coordinator and its timeout scheduler on the current runtime.
    pub fn start(config: &SuspendConfig) -> Self {
        let inner = CoordinatorInner {
            scheduler: TimeoutScheduler::start(),
            registry: DashMap::new(),
            default_timeout_ms: AtomicU64::new(config.default_timeout_ms),
            stopped: AtomicBool::new(false),
            counters: Counters::default(),
        };
        tracing::info!(
            default_timeout_ms = config.default_timeout_ms,
            "Resolution coordinator started"
        );
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Suspend a new request with a generated ID.
    pub fn suspend(&self, sink: impl ResponseSink) -> DeferredResponse {
        self.suspend_with_id(RequestId::new(), sink)
    }

    /// Suspend a request under the given ID.
    ///
    /// The request gets the default deadline; handlers may replace it with
    /// [`DeferredResponse::set_timeout`]. If the coordinator is already
    /// stopped the request is cancelled straight away.
    pub fn suspend_with_id(&self, id: RequestId, sink: impl ResponseSink) -> DeferredResponse {
        let shared = Arc::new(Shared::new(
            RequestContext::new(id),
            Box::new(sink),
            self.inner.clone(),
        ));
        if self.inner.registry.insert(id, shared.clone()).is_some() {
            tracing::warn!(request_id = %id, "Duplicate request ID suspended");
        }
        metrics::record_suspended();
        metrics::set_in_flight(self.inner.registry.len());

        let response = DeferredResponse::new(shared);
        // Either `stop` sees this registration or we see its flag.
        if self.inner.stopped.load(Ordering::SeqCst) {
            tracing::debug!(request_id = %id, "Coordinator stopped, cancelling");
            let _ = response.cancel();
            return response;
        }
        if let Err(e) = response.set_timeout(self.default_timeout()) {
            tracing::warn!(request_id = %id, error = %e, "Cannot arm default timeout, cancelling");
            let _ = response.cancel();
        }
        tracing::trace!(request_id = %id, "Request suspended");
        response
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.default_timeout_ms.load(Ordering::Relaxed))
    }

    /// Change the deadline applied to requests suspended from now on.
    pub fn set_default_timeout(&self, timeout: Duration) {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1);
        self.inner.default_timeout_ms.store(ms, Ordering::Relaxed);
    }

    /// Number of requests not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn pending_timeouts(&self) -> usize {
        self.inner.scheduler.pending()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst) && self.inner.scheduler.is_running()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.inner.counters;
        CoordinatorStats {
            in_flight: self.in_flight(),
            pending_timeouts: self.pending_timeouts(),
            resolved: c.resolved.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }

    /// Stop the scheduler and cancel every request still in flight.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.scheduler.stop();

        // Collect first: resolving removes from the registry.
        let in_flight: Vec<Arc<Shared>> = self
            .inner
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let count = in_flight.len();
        for shared in in_flight {
            let _ = DeferredResponse::new(shared).cancel();
        }
        tracing::info!(cancelled = count, "Resolution coordinator stopped");
    }
}
