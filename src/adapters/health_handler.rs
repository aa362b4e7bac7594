use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::registry::DescriptorStore;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthChecks {
    /// Resolved agents out of configured ones, e.g. `2/3`
    pub agents: String,
}

pub struct HealthHandler {
    store: Arc<DescriptorStore>,
    configured: usize,
    start_time: std::time::Instant,
}

impl HealthHandler {
    pub fn new(store: Arc<DescriptorStore>, configured: usize) -> Self {
        Self {
            store,
            configured,
            start_time: std::time::Instant::now(),
        }
    }

    /// Basic health check - returns 200 if server is running
    pub async fn health(&self) -> impl IntoResponse {
        let status = HealthStatus {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            checks: HealthChecks {
                agents: format!("{}/{}", self.store.len(), self.configured),
            },
        };

        (StatusCode::OK, Json(status))
    }

    /// Readiness check - returns 200 once at least one agent can be routed to
    pub async fn ready(&self) -> impl IntoResponse {
        let resolved = self.store.len();
        if resolved > 0 {
            (StatusCode::OK, Json(serde_json::json!({
                "status": "ready",
                "agents": resolved
            })))
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({
                "status": "not_ready",
                "message": "No remote agent has been discovered"
            })))
        }
    }

    /// Liveness check - returns 200 if server is alive
    pub async fn live(&self) -> impl IntoResponse {
        (StatusCode::OK, Json(serde_json::json!({
            "status": "alive"
        })))
    }
}
