//! Stream connect-token and pairing endpoints (§6, §4.4).

use crate::auth::middleware::ClientIp;
use crate::auth::models::Identity;
use crate::errors::ApiError;
use crate::stream_token::{IssuedToken, ResolvedConnection};
use crate::AppState;
use axum::{
    extract::{Extension, State},
    response::Json,
};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTokenRequest {
    pub pc_id: String,
}

pub async fn connect_token(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(client_ip): Extension<ClientIp>,
    Json(body): Json<ConnectTokenRequest>,
) -> Result<Json<IssuedToken>, ApiError> {
    let issued = state
        .stream_tokens
        .issue(&body.pc_id, &identity.user_id, Some(&client_ip.0))
        .await?;
    Ok(Json(issued))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveTokenRequest {
    pub token: String,
}

pub async fn resolve_token(
    State(state): State<AppState>,
    Json(body): Json<ResolveTokenRequest>,
) -> Result<Json<ResolvedConnection>, ApiError> {
    let resolved = state.stream_tokens.resolve(&body.token).await?;
    Ok(Json(resolved))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub pc_id: String,
    pub pin: String,
}

pub async fn pairing(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<PairingRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.pin.is_empty() || body.pin.len() > 12 || !body.pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::BadRequest("pin must be 1-12 digits".into()));
    }
    let pc_id = body.pc_id.clone();
    let pc = state
        .db
        .transaction(move |tx| crate::db::get_pc(tx, &pc_id).map_err(ApiError::from))
        .await?
        .ok_or(ApiError::PcNotFound)?;

    info!(pc_id = %pc.id, user_id = %identity.user_id, pin = "***redacted***", "stream pairing requested");
    Ok(Json(serde_json::json!({"ok": true})))
}
