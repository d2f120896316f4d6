//! Status endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::http::server::AppState;
use crate::suspend::CoordinatorStats;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub status: &'static str,
    pub requests: CoordinatorStats,
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusReport> {
    let status = if state.coordinator.is_running() {
        "operational"
    } else {
        "stopping"
    };
    Json(StatusReport {
        version: env!("CARGO_PKG_VERSION"),
        status,
        requests: state.coordinator.stats(),
    })
}
