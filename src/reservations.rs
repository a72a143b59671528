//! Reservation scheduling (§3, reservations table): non-overlapping booking
//! windows per PC.

use crate::db::{parse_dt, to_str, Db};
use crate::errors::ApiError;
use crate::models::{Reservation, ReservationStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::info;

#[derive(Clone)]
pub struct ReservationService {
    db: Db,
}

impl ReservationService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        pc_id: &str,
        user_id: &str,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<Reservation, ApiError> {
        let pc_id = pc_id.to_string();
        let user_id = user_id.to_string();
        self.db
            .transaction(move |tx| create_tx(tx, &pc_id, &user_id, start_at, end_at))
            .await
    }

    pub async fn cancel(&self, reservation_id: &str, caller_id: &str) -> Result<(), ApiError> {
        let reservation_id = reservation_id.to_string();
        let caller_id = caller_id.to_string();
        self.db
            .transaction(move |tx| cancel_tx(tx, &reservation_id, &caller_id))
            .await
    }

    pub async fn list_for_pc(&self, pc_id: &str) -> Result<Vec<Reservation>, ApiError> {
        let pc_id = pc_id.to_string();
        self.db.transaction(move |tx| list_for_pc_tx(tx, &pc_id)).await
    }
}

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Reservation> {
    let status: String = row.get(5)?;
    Ok(Reservation {
        id: row.get(0)?,
        pc_id: row.get(1)?,
        user_id: row.get(2)?,
        start_at: parse_dt(&row.get::<_, String>(3)?),
        end_at: parse_dt(&row.get::<_, String>(4)?),
        status: ReservationStatus::from_str(&status).unwrap_or(ReservationStatus::Scheduled),
    })
}

const COLUMNS: &str = "id, pc_id, user_id, start_at, end_at, status";

fn overlaps(tx: &Transaction, pc_id: &str, start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> rusqlite::Result<bool> {
    tx.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM reservations
            WHERE pc_id = ?1 AND status != 'CANCELLED'
            AND start_at < ?3 AND end_at > ?2
         )",
        params![pc_id, to_str(start_at), to_str(end_at)],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n != 0)
}

fn create_tx(
    tx: &Transaction,
    pc_id: &str,
    user_id: &str,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
) -> Result<Reservation, ApiError> {
    if end_at <= start_at {
        return Err(ApiError::BadRequest("endAt must be after startAt".into()));
    }
    if start_at <= Utc::now() {
        return Err(ApiError::BadRequest("startAt must be in the future".into()));
    }
    crate::db::get_pc(tx, pc_id).map_err(ApiError::from)?.ok_or(ApiError::PcNotFound)?;
    if overlaps(tx, pc_id, start_at, end_at).map_err(ApiError::from)? {
        return Err(ApiError::ScheduleConflict);
    }

    let id = uuid::Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO reservations (id, pc_id, user_id, start_at, end_at, status)
         VALUES (?1, ?2, ?3, ?4, ?5, 'SCHEDULED')",
        params![id, pc_id, user_id, to_str(start_at), to_str(end_at)],
    )
    .map_err(ApiError::from)?;

    info!(pc_id, user_id, reservation_id = %id, "reservation created");
    tx.query_row(
        &format!("SELECT {COLUMNS} FROM reservations WHERE id = ?1"),
        params![id],
        map_row,
    )
    .map_err(ApiError::from)
}

fn cancel_tx(tx: &Transaction, reservation_id: &str, caller_id: &str) -> Result<(), ApiError> {
    let owner: Option<String> = tx
        .query_row(
            "SELECT user_id FROM reservations WHERE id = ?1",
            params![reservation_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(ApiError::from)?;
    let Some(owner) = owner else {
        return Err(ApiError::NotFound("reservation not found".into()));
    };
    if owner != caller_id {
        return Err(ApiError::Forbidden);
    }
    tx.execute(
        "UPDATE reservations SET status = 'CANCELLED' WHERE id = ?1",
        params![reservation_id],
    )
    .map_err(ApiError::from)?;
    Ok(())
}

fn list_for_pc_tx(tx: &Transaction, pc_id: &str) -> Result<Vec<Reservation>, ApiError> {
    let mut stmt = tx
        .prepare(&format!(
            "SELECT {COLUMNS} FROM reservations WHERE pc_id = ?1 AND status != 'CANCELLED' ORDER BY start_at"
        ))
        .map_err(ApiError::from)?;
    let rows = stmt.query_map(params![pc_id], map_row).map_err(ApiError::from)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(ApiError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Pc, PcStatus, Role};

    async fn seeded_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.transaction(|tx| {
            crate::db::get_or_create_user(tx, "host1", Role::Host).unwrap();
            let pc = Pc {
                id: "pc1".into(),
                host_id: "host1".into(),
                cpu: "".into(),
                gpu: "".into(),
                ram_gb: 16,
                storage_gb: 512,
                uplink_mbps: 500,
                price_per_hour_cents: 1000,
                status: PcStatus::Online,
                connection_host: "10.0.0.1".into(),
                connection_port: 47990,
                categories: vec![],
                software_tags: vec![],
            };
            crate::db::insert_pc(tx, &pc).unwrap();
            Ok::<(), ApiError>(())
        })
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn overlapping_reservation_conflicts() {
        let db = seeded_db().await;
        let svc = ReservationService::new(db);
        let start = Utc::now() + chrono::Duration::hours(1);
        let end = start + chrono::Duration::hours(2);
        svc.create("pc1", "c1", start, end).await.unwrap();

        let overlap_start = start + chrono::Duration::minutes(30);
        let overlap_end = overlap_start + chrono::Duration::hours(1);
        let result = svc.create("pc1", "c2", overlap_start, overlap_end).await;
        assert!(matches!(result, Err(ApiError::ScheduleConflict)));
    }

    #[tokio::test]
    async fn adjacent_non_overlapping_reservations_both_succeed() {
        let db = seeded_db().await;
        let svc = ReservationService::new(db);
        let start = Utc::now() + chrono::Duration::hours(1);
        let end = start + chrono::Duration::hours(1);
        svc.create("pc1", "c1", start, end).await.unwrap();
        let second = svc.create("pc1", "c2", end, end + chrono::Duration::hours(1)).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn cancel_frees_the_window() {
        let db = seeded_db().await;
        let svc = ReservationService::new(db);
        let start = Utc::now() + chrono::Duration::hours(1);
        let end = start + chrono::Duration::hours(1);
        let reservation = svc.create("pc1", "c1", start, end).await.unwrap();
        svc.cancel(&reservation.id, "c1").await.unwrap();
        let second = svc.create("pc1", "c2", start, end).await;
        assert!(second.is_ok());
    }
}
