//! Asynchronous request suspension engine.
//!
//! # Data Flow
//! ```text
//! transport handler
//!     → coordinator.rs (suspend: context + handle + default deadline)
//!     → worker.rs (computation off the I/O path)
//!
//! resolution sources (any thread):
//!     worker result  ─┐
//!     scheduler.rs   ─┼→ handle.rs (atomic claim on context.rs state)
//!     cancel         ─┘      → coordinator.rs (bookkeeping)
//!                            → sink (transport writes the response)
//! ```
//!
//! # Design Decisions
//! - Exactly one resolution per request: a compare-and-swap from
//!   `Suspended` to `Resolving` is the only way in
//! - Losing sources get `SuspendError::AlreadyResolved`, never a panic
//! - No priority between worker, timeout and cancel; first claim wins
//! - Every suspended request carries a deadline, so none can leak

pub mod context;
pub mod coordinator;
pub mod error;
pub mod handle;
pub mod outcome;
pub mod scheduler;
pub mod worker;

pub use context::{RequestContext, RequestId, ResolutionState};
pub use coordinator::{sink_fn, Coordinator, CoordinatorStats, ResponseSink};
pub use error::{SuspendError, WorkerError};
pub use handle::{DeferredResponse, TimeoutHandler};
pub use outcome::{Entity, Outcome, DEFAULT_TIMEOUT_BODY};
pub use scheduler::{SchedulerHandle, TimeoutScheduler};
pub use worker::{dispatch, dispatch_blocking, Interrupt, WorkerHandle};
