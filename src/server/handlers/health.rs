//! Health check handler.

use axum::Json;
use serde_json::{Value, json};

/// `GET /health` — liveness for load balancers and uptime probes.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}
