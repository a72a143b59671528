//! Queue endpoints (§6): join / leave / status / cross-PC updates.

use crate::auth::middleware::DevBypassCredits;
use crate::auth::models::Identity;
use crate::errors::ApiError;
use crate::models::QueueEntry;
use crate::AppState;
use axum::{
    extract::{Extension, Path, State},
    response::Json,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinQueueRequest {
    pub minutes_purchased: i64,
}

pub async fn join_queue(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(bypass): Extension<DevBypassCredits>,
    Path(pc_id): Path<String>,
    Json(body): Json<JoinQueueRequest>,
) -> Result<Json<crate::queue::QueueStatusView>, ApiError> {
    if body.minutes_purchased > 240 {
        return Err(ApiError::BadRequest("minutesPurchased must be <= 240".into()));
    }
    let view = state
        .queue
        .join(&pc_id, &identity.user_id, body.minutes_purchased, bypass.0)
        .await?;
    Ok(Json(view))
}

pub async fn leave_queue(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(pc_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.queue.leave(&pc_id, &identity.user_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

pub async fn queue_status(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(pc_id): Path<String>,
) -> Result<Json<crate::queue::QueueStatusView>, ApiError> {
    let view = state.queue.status(&pc_id, Some(&identity.user_id)).await?;
    Ok(Json(view))
}

pub async fn my_queue_updates(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<QueueEntry>>, ApiError> {
    let entries = state.queue.my_updates(&identity.user_id).await?;
    Ok(Json(entries))
}
