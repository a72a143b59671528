//! PC listing/management endpoints (§6).

use crate::auth::models::Identity;
use crate::errors::ApiError;
use crate::models::{Pc, PcStatus};
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize, Default)]
pub struct ListPcsQuery {
    pub status: Option<String>,
    pub categories: Option<String>,
}

pub async fn list_pcs(
    State(state): State<AppState>,
    Query(query): Query<ListPcsQuery>,
) -> Result<Json<Vec<Pc>>, ApiError> {
    let status_filter = query
        .status
        .as_deref()
        .map(|s| PcStatus::from_str(s).ok_or_else(|| ApiError::BadRequest("invalid status".into())))
        .transpose()?;
    let category_filter: Vec<String> = query
        .categories
        .as_deref()
        .map(|s| s.split(',').map(|c| c.trim().to_string()).filter(|c| !c.is_empty()).collect())
        .unwrap_or_default();

    let pcs = state
        .db
        .transaction(move |tx| {
            crate::db::list_pcs(tx, status_filter, &category_filter).map_err(ApiError::from)
        })
        .await?;
    Ok(Json(pcs))
}

pub async fn get_pc(
    State(state): State<AppState>,
    Path(pc_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let pc_id_for_tx = pc_id.clone();
    let pc = state
        .db
        .transaction(move |tx| {
            crate::db::get_pc(tx, &pc_id_for_tx).map_err(ApiError::from)
        })
        .await?
        .ok_or(ApiError::PcNotFound)?;

    let host_profile = state
        .db
        .transaction({
            let host_id = pc.host_id.clone();
            move |tx| crate::db::get_host_profile_by_user(tx, &host_id).map_err(ApiError::from)
        })
        .await?;
    let badge = host_profile.as_ref().map(|p| p.badge());

    let queue_status = state.queue.status(&pc_id, None).await?;

    Ok(Json(json!({
        "pc": pc,
        "queueCount": queue_status.queue_count,
        "reliabilityBadge": badge,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePcRequest {
    pub cpu: String,
    pub gpu: String,
    pub ram_gb: i64,
    pub storage_gb: i64,
    pub uplink_mbps: i64,
    pub price_per_hour_cents: i64,
    pub connection_host: String,
    pub connection_port: Option<i64>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub software_tags: Vec<String>,
}

pub async fn create_pc(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CreatePcRequest>,
) -> Result<(StatusCode, Json<Pc>), ApiError> {
    let pc = Pc {
        id: uuid::Uuid::new_v4().to_string(),
        host_id: identity.user_id,
        cpu: body.cpu,
        gpu: body.gpu,
        ram_gb: body.ram_gb,
        storage_gb: body.storage_gb,
        uplink_mbps: body.uplink_mbps,
        price_per_hour_cents: body.price_per_hour_cents,
        status: PcStatus::Offline,
        connection_host: body.connection_host,
        connection_port: body.connection_port.unwrap_or(47990),
        categories: body.categories,
        software_tags: body.software_tags,
    };
    state
        .db
        .transaction({
            let pc = pc.clone();
            move |tx| crate::db::insert_pc(tx, &pc).map_err(ApiError::from)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(pc)))
}

async fn require_owned_pc(state: &AppState, identity: &Identity, pc_id: &str) -> Result<Pc, ApiError> {
    let pc_id = pc_id.to_string();
    let pc = state
        .db
        .transaction(move |tx| crate::db::get_pc(tx, &pc_id).map_err(ApiError::from))
        .await?
        .ok_or(ApiError::PcNotFound)?;
    if pc.host_id != identity.user_id {
        return Err(ApiError::Forbidden);
    }
    Ok(pc)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePcRequest {
    pub cpu: Option<String>,
    pub gpu: Option<String>,
    pub ram_gb: Option<i64>,
    pub storage_gb: Option<i64>,
    pub uplink_mbps: Option<i64>,
    pub price_per_hour_cents: Option<i64>,
    pub connection_host: Option<String>,
    pub connection_port: Option<i64>,
    pub categories: Option<Vec<String>>,
    pub software_tags: Option<Vec<String>>,
}

pub async fn update_pc(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(pc_id): Path<String>,
    Json(body): Json<UpdatePcRequest>,
) -> Result<Json<Pc>, ApiError> {
    let mut pc = require_owned_pc(&state, &identity, &pc_id).await?;
    if let Some(v) = body.cpu {
        pc.cpu = v;
    }
    if let Some(v) = body.gpu {
        pc.gpu = v;
    }
    if let Some(v) = body.ram_gb {
        pc.ram_gb = v;
    }
    if let Some(v) = body.storage_gb {
        pc.storage_gb = v;
    }
    if let Some(v) = body.uplink_mbps {
        pc.uplink_mbps = v;
    }
    if let Some(v) = body.price_per_hour_cents {
        pc.price_per_hour_cents = v;
    }
    if let Some(v) = body.connection_host {
        pc.connection_host = v;
    }
    if let Some(v) = body.connection_port {
        pc.connection_port = v;
    }
    if let Some(v) = body.categories {
        pc.categories = v;
    }
    if let Some(v) = body.software_tags {
        pc.software_tags = v;
    }
    state
        .db
        .transaction({
            let pc = pc.clone();
            move |tx| crate::db::update_pc(tx, &pc).map_err(ApiError::from)
        })
        .await?;
    Ok(Json(pc))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPcStatusRequest {
    pub status: String,
}

pub async fn set_pc_status(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(pc_id): Path<String>,
    Json(body): Json<SetPcStatusRequest>,
) -> Result<Json<Pc>, ApiError> {
    let mut pc = require_owned_pc(&state, &identity, &pc_id).await?;
    let status = match body.status.as_str() {
        "ONLINE" => PcStatus::Online,
        "OFFLINE" => PcStatus::Offline,
        _ => return Err(ApiError::BadRequest("status must be ONLINE or OFFLINE".into())),
    };
    pc.status = status;
    state
        .db
        .transaction({
            let pc_id = pc.id.clone();
            move |tx| crate::db::set_pc_status(tx, &pc_id, status).map_err(ApiError::from)
        })
        .await?;
    Ok(Json(pc))
}

pub async fn delete_pc(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(pc_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_owned_pc(&state, &identity, &pc_id).await?;
    state
        .db
        .transaction({
            let pc_id = pc_id.clone();
            move |tx| crate::db::delete_pc(tx, &pc_id).map_err(ApiError::from)
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
