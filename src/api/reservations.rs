//! Reservation endpoints (§6): book / cancel / list for a PC.

use crate::auth::models::Identity;
use crate::errors::ApiError;
use crate::models::Reservation;
use crate::AppState;
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReservationRequest {
    pub start_at: DateTime<Utc>,
    pub duration_min: Option<i64>,
    pub end_at: Option<DateTime<Utc>>,
}

pub async fn create_reservation(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(pc_id): Path<String>,
    Json(body): Json<CreateReservationRequest>,
) -> Result<(StatusCode, Json<Reservation>), ApiError> {
    let end_at = match (body.end_at, body.duration_min) {
        (Some(end_at), _) => end_at,
        (None, Some(minutes)) => body.start_at + Duration::minutes(minutes),
        (None, None) => {
            return Err(ApiError::BadRequest("durationMin or endAt is required".into()))
        }
    };
    let reservation = state
        .reservations
        .create(&pc_id, &identity.user_id, body.start_at, end_at)
        .await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

pub async fn cancel_reservation(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(reservation_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.reservations.cancel(&reservation_id, &identity.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_reservations(
    State(state): State<AppState>,
    Path(pc_id): Path<String>,
) -> Result<Json<Vec<Reservation>>, ApiError> {
    let reservations = state.reservations.list_for_pc(&pc_id).await?;
    Ok(Json(reservations))
}
