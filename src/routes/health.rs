//! Liveness endpoint
//!
//! `/health` returns 200 whenever the process is serving requests. The body
//! reports which store backs the service and whether purchase verification
//! is wired to a provider.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::json_response;
use crate::server::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    pub status: &'static str,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    /// `mongodb` or `memory`
    pub store: &'static str,
    pub dev_mode: bool,
    pub purchase_verification: bool,
    pub timestamp: String,
}

pub fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    let body = HealthResponse {
        healthy: true,
        status: "online",
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        store: state.verification.store_kind(),
        dev_mode: state.args.dev_mode,
        purchase_verification: state.verification.has_validator(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    json_response(StatusCode::OK, &body)
}
