use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};

use crate::handlers::AppState;

pub async fn liveness() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let (status, store_status) = match state.ledger.store().ping().await {
        Ok(()) => (StatusCode::OK, "healthy"),
        Err(e) => {
            tracing::warn!("Balance store ping failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
        }
    };

    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ready" } else { "not_ready" },
            "checks": {
                "store": store_status,
                "backend": format!("{:?}", state.config.store_backend).to_lowercase()
            },
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}
