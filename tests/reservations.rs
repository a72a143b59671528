//! Reservation overlap and cancellation coverage against a real database.

use chrono::{Duration, Utc};
use deskmarket_backend::db::Db;
use deskmarket_backend::models::{Pc, PcStatus, Role};
use deskmarket_backend::reservations::ReservationService;

fn test_db() -> (tempfile::TempDir, Db) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("marketplace.db");
    let db = Db::open(path.to_str().unwrap()).expect("open db");
    (dir, db)
}

async fn seed_pc(db: &Db, pc_id: &str, host_id: &str) {
    let pc_id = pc_id.to_string();
    let host_id = host_id.to_string();
    db.transaction(move |tx| {
        deskmarket_backend::db::get_or_create_user(tx, &host_id, Role::Host)
            .map_err(deskmarket_backend::errors::ApiError::from)?;
        deskmarket_backend::db::insert_pc(
            tx,
            &Pc {
                id: pc_id.clone(),
                host_id: host_id.clone(),
                cpu: "Ryzen 9".into(),
                gpu: "RTX 4090".into(),
                ram_gb: 64,
                storage_gb: 2000,
                uplink_mbps: 1000,
                price_per_hour_cents: 500,
                status: PcStatus::Online,
                connection_host: "10.0.0.5".into(),
                connection_port: 47990,
                categories: vec![],
                software_tags: vec![],
            },
        )
        .map_err(deskmarket_backend::errors::ApiError::from)
    })
    .await
    .expect("seed pc");
}

#[tokio::test]
async fn overlapping_reservation_is_rejected() {
    let (_dir, db) = test_db();
    seed_pc(&db, "pc-1", "host-1").await;
    let reservations = ReservationService::new(db.clone());

    let start = Utc::now() + Duration::hours(1);
    let end = start + Duration::hours(2);
    reservations.create("pc-1", "user-a", start, end).await.expect("first booking");

    let overlap_start = start + Duration::minutes(30);
    let overlap_end = overlap_start + Duration::hours(1);
    let err = reservations
        .create("pc-1", "user-b", overlap_start, overlap_end)
        .await
        .expect_err("overlapping booking must be rejected");
    assert_eq!(err.code(), "SCHEDULE_CONFLICT");
}

#[tokio::test]
async fn cancelling_a_reservation_frees_the_window() {
    let (_dir, db) = test_db();
    seed_pc(&db, "pc-1", "host-1").await;
    let reservations = ReservationService::new(db.clone());

    let start = Utc::now() + Duration::hours(1);
    let end = start + Duration::hours(2);
    let booking = reservations.create("pc-1", "user-a", start, end).await.unwrap();

    reservations.cancel(&booking.id, "user-a").await.expect("cancel");

    let second = reservations.create("pc-1", "user-b", start, end).await;
    assert!(second.is_ok(), "cancelled reservation must not block a new one");

    let all = reservations.list_for_pc("pc-1").await.unwrap();
    assert_eq!(all.len(), 2);
}
