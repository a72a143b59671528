//! Host presence endpoint (§4.3). Not part of the distilled endpoint table
//! but required for `registerHeartbeat` to be reachable at all: a host
//! agent calls this on its own ping cadence to keep `lastSeenAt` current.

use crate::auth::models::Identity;
use crate::errors::ApiError;
use crate::models::PcStatus;
use crate::AppState;
use axum::{
    extract::{Extension, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub status: Option<PcStatus>,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<HeartbeatRequest>,
) -> Result<Json<Value>, ApiError> {
    state.heartbeat.register(&identity.user_id, body.status).await?;
    Ok(Json(json!({"ok": true})))
}
