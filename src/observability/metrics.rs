//! Metrics collection and exposition.
//!
//! # Metrics
//! - `deferred_suspended_total` (counter): requests suspended
//! - `deferred_resolutions_total` (counter): terminal outcomes by `outcome`
//! - `deferred_discarded_total` (counter): losing resolution attempts by `source`
//! - `deferred_timeouts_fired_total` (counter): deadlines that reached a live request
//! - `deferred_in_flight` (gauge): suspended, unresolved requests
//! - `deferred_suspension_seconds` (histogram): suspend-to-resolution latency
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder with an HTTP scrape listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_suspended() {
    counter!("deferred_suspended_total").increment(1);
}

pub fn record_resolution(outcome: &'static str, elapsed: Duration) {
    counter!("deferred_resolutions_total", "outcome" => outcome).increment(1);
    histogram!("deferred_suspension_seconds", "outcome" => outcome).record(elapsed.as_secs_f64());
}

pub fn record_discarded(source: &'static str) {
    counter!("deferred_discarded_total", "source" => source).increment(1);
}

pub fn record_timeout_fired() {
    counter!("deferred_timeouts_fired_total").increment(1);
}

pub fn set_in_flight(count: usize) {
    gauge!("deferred_in_flight").set(count as f64);
}
