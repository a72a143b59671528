//! `GET /health` (§6). Deliberately outside the ingress middleware and the
//! request-logging span (mirrors this codebase's existing health-check
//! carve-out in `middleware::logging`).

use crate::AppState;
use axum::{extract::State, response::Json};
use serde_json::{json, Value};

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "serverInstanceId": state.server_instance_id,
    }))
}
