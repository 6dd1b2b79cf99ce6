pub mod workflows;

use axum::Json;
use serde_json::{Value, json};

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "cadence-backend",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
