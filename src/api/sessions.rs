//! Session endpoints (§6): create / start / end / get.

use crate::auth::models::Identity;
use crate::errors::ApiError;
use crate::models::{FailureReason, PcStatus, SessionStatus};
use crate::AppState;
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub pc_id: String,
    pub client_user_id: String,
    pub minutes_purchased: i64,
}

pub async fn create_session(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(bypass): Extension<crate::auth::middleware::DevBypassCredits>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if identity.user_id != body.client_user_id {
        return Err(ApiError::Forbidden);
    }
    let session = state
        .sessions
        .create_session(&body.pc_id, &body.client_user_id, body.minutes_purchased, bypass.0)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"session": session, "code": "SESSION_CREATED"})),
    ))
}

pub async fn start_session(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = state.sessions.start_session(&session_id, &identity.user_id).await?;
    Ok(Json(json!({"session": session})))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionRequest {
    pub failure_reason: Option<FailureReason>,
    pub host_fault: Option<bool>,
}

pub async fn end_session(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(session_id): Path<String>,
    Json(body): Json<EndSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = state.sessions.get_session(&session_id).await?;
    let pc = state
        .db
        .transaction({
            let pc_id = session.pc_id.clone();
            move |tx| crate::db::get_pc(tx, &pc_id).map_err(ApiError::from)
        })
        .await?;
    let is_host = pc.as_ref().map(|p| p.host_id == identity.user_id).unwrap_or(false);
    if session.client_user_id != identity.user_id && !is_host {
        return Err(ApiError::Forbidden);
    }

    let failure_reason = body
        .failure_reason
        .unwrap_or(if body.host_fault.unwrap_or(false) {
            FailureReason::Host
        } else {
            FailureReason::None
        });
    let release_status = (failure_reason == FailureReason::Host).then_some(PcStatus::Offline);

    let session = state
        .sessions
        .end_session(&session_id, failure_reason, release_status)
        .await?;
    Ok(Json(json!({"session": session})))
}

pub async fn get_session(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let mut session = state.sessions.get_session(&session_id).await?;
    if session.client_user_id != identity.user_id {
        return Err(ApiError::Forbidden);
    }
    if session.status == SessionStatus::Active {
        session.minutes_used = session.live_minutes_used(Utc::now());
    }
    Ok(Json(json!({"session": session})))
}
