use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    match state.store.ping().await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "database": "connected"
        })),
        Err(e) => {
            tracing::warn!(error = %e, "health check failed");
            Json(json!({
                "status": "unhealthy",
                "database": "disconnected"
            }))
        }
    }
}
