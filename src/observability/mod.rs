//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! suspend / http subsystems produce:
//!     → logging.rs (structured tracing events, request ID on every event)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout log lines
//!     → Prometheus scrape endpoint (optional)
//! ```

pub mod logging;
pub mod metrics;
