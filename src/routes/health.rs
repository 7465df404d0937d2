// src/routes/health.rs
//! Health check endpoint for the telemetry bridge.
//!
//! This module defines the `/health` route used by container orchestrators
//! (e.g., Docker, Kubernetes) to verify that the bridge is up and that every
//! consumer instance is attached to its queue. It is a sibling module in the
//! `routes` directory and follows the Explicit Module Boundary Pattern (EMBP):
//! - Internal to this file: endpoint handler(s) and related types
//! - Exports to the gateway (`mod.rs`): a subrouter containing the `/health` route

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use crate::consumer::{ConsumerState, ConsumerStatus, StatusSnapshot};

/// JSON response body for the `/health` endpoint.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    consumers: Vec<StatusSnapshot>,
}

/// Handle `GET /health`.
///
/// Responds `200` with `"ok"` while every consumer instance is consuming, and
/// `503` with `"degraded"` otherwise, listing each instance's counters.
async fn health(
    State(consumers): State<Arc<Vec<Arc<ConsumerStatus>>>>,
) -> (StatusCode, Json<HealthResponse>) {
    // ---
    let snapshots: Vec<StatusSnapshot> = consumers.iter().map(|c| c.snapshot()).collect();
    let healthy = !snapshots.is_empty()
        && snapshots
            .iter()
            .all(|s| s.state == ConsumerState::Consuming);

    let (code, status) = if healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status,
            consumers: snapshots,
        }),
    )
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<Arc<Vec<Arc<ConsumerStatus>>>> {
    Router::new().route("/health", get(health))
}
