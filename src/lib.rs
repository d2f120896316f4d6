//! Deferred HTTP responses.
//!
//! A handler suspends a request, returns control to the I/O layer and lets a
//! worker, a deadline or an explicit cancel resolve it later from any
//! thread. Exactly one of them wins.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod suspend;

pub use config::ServiceConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use suspend::{Coordinator, DeferredResponse, Entity, Outcome};
