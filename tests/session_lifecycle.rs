//! End-to-end coverage of the session/queue/heartbeat flows through the
//! public service layer, against a real (tempfile-backed) SQLite database.

use deskmarket_backend::db::Db;
use deskmarket_backend::heartbeat::HeartbeatService;
use deskmarket_backend::models::{FailureReason, Pc, PcStatus, QueueStatus, Role};
use deskmarket_backend::queue::QueueManager;
use deskmarket_backend::session::SessionService;

fn test_db() -> (tempfile::TempDir, Db) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("marketplace.db");
    let db = Db::open(path.to_str().unwrap()).expect("open db");
    (dir, db)
}

async fn seed_pc(db: &Db, pc_id: &str, host_id: &str, price_per_hour_cents: i64) {
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
                price_per_hour_cents,
                status: PcStatus::Online,
                connection_host: "10.0.0.5".into(),
                connection_port: 47990,
                categories: vec!["gaming".into()],
                software_tags: vec![],
            },
        )
        .map_err(deskmarket_backend::errors::ApiError::from)
    })
    .await
    .expect("seed pc");
}

async fn seed_wallet(db: &Db, user_id: &str, balance_cents: i64) {
    let user_id = user_id.to_string();
    db.transaction(move |tx| {
        deskmarket_backend::db::get_or_create_user(tx, &user_id, Role::Client)
            .map_err(deskmarket_backend::errors::ApiError::from)?;
        deskmarket_backend::db::credit_wallet(tx, &user_id, balance_cents)
            .map_err(deskmarket_backend::errors::ApiError::from)
    })
    .await
    .expect("seed wallet");
}

#[tokio::test]
async fn happy_path_session_settles_on_end() {
    let (_dir, db) = test_db();
    seed_pc(&db, "pc-1", "host-1", 1000).await;
    seed_wallet(&db, "client-1", 2000).await;

    let sessions = SessionService::new(db.clone(), 0.1, 0.3);

    let session = sessions
        .create_session("pc-1", "client-1", 60, false)
        .await
        .expect("create session");
    assert_eq!(session.status.as_str(), "PENDING");

    let session = sessions
        .start_session(&session.id, "client-1")
        .await
        .expect("start session");
    assert_eq!(session.status.as_str(), "ACTIVE");

    let ended = sessions
        .end_session(&session.id, FailureReason::None, None)
        .await
        .expect("end session");
    assert!(ended.status.is_terminal());
    assert_eq!(ended.failure_reason, FailureReason::None);
}

#[tokio::test]
async fn ending_twice_is_idempotent() {
    let (_dir, db) = test_db();
    seed_pc(&db, "pc-1", "host-1", 600).await;
    seed_wallet(&db, "client-1", 1000).await;
    let sessions = SessionService::new(db.clone(), 0.1, 0.3);

    let session = sessions.create_session("pc-1", "client-1", 30, false).await.unwrap();
    sessions.start_session(&session.id, "client-1").await.unwrap();

    let first = sessions.end_session(&session.id, FailureReason::None, None).await.unwrap();
    let second = sessions.end_session(&session.id, FailureReason::None, None).await.unwrap();
    assert_eq!(first.status.as_str(), second.status.as_str());
    assert_eq!(first.minutes_used, second.minutes_used);
}

#[tokio::test]
async fn second_client_cannot_create_session_on_busy_pc() {
    let (_dir, db) = test_db();
    seed_pc(&db, "pc-1", "host-1", 600).await;
    seed_wallet(&db, "client-1", 1000).await;
    seed_wallet(&db, "client-2", 1000).await;
    let sessions = SessionService::new(db.clone(), 0.1, 0.3);

    sessions.create_session("pc-1", "client-1", 30, false).await.unwrap();
    let err = sessions
        .create_session("pc-1", "client-2", 30, false)
        .await
        .expect_err("second session on same pc must fail");
    assert_eq!(err.code(), "SESSION_EXISTS");
}

#[tokio::test]
async fn queue_promotes_head_entry_when_slot_frees() {
    let (_dir, db) = test_db();
    seed_pc(&db, "pc-1", "host-1", 600).await;
    seed_wallet(&db, "client-1", 1000).await;
    seed_wallet(&db, "client-2", 1000).await;
    seed_wallet(&db, "client-3", 1000).await;

    let sessions = SessionService::new(db.clone(), 0.1, 0.3);
    let queue = QueueManager::new(db.clone(), 90);

    let s1 = sessions.create_session("pc-1", "client-1", 30, false).await.unwrap();
    sessions.start_session(&s1.id, "client-1").await.unwrap();

    let view2 = queue.join("pc-1", "client-2", 30, false).await.unwrap();
    assert_eq!(view2.position, Some(1));
    let view3 = queue.join("pc-1", "client-3", 30, false).await.unwrap();
    assert_eq!(view3.position, Some(2));

    sessions.end_session(&s1.id, FailureReason::None, None).await.unwrap();

    let status2 = queue.status("pc-1", Some("client-2")).await.unwrap();
    assert_eq!(status2.status, Some(QueueStatus::Active));
    assert!(status2.session_id.is_some());

    let status3 = queue.status("pc-1", Some("client-3")).await.unwrap();
    assert_eq!(status3.position, Some(1));
}

#[tokio::test]
async fn leave_clears_position() {
    let (_dir, db) = test_db();
    seed_pc(&db, "pc-1", "host-1", 600).await;
    seed_wallet(&db, "client-1", 1000).await;
    seed_wallet(&db, "client-2", 1000).await;

    let sessions = SessionService::new(db.clone(), 0.1, 0.3);
    let queue = QueueManager::new(db.clone(), 90);

    let s1 = sessions.create_session("pc-1", "client-1", 30, false).await.unwrap();
    sessions.start_session(&s1.id, "client-1").await.unwrap();
    queue.join("pc-1", "client-2", 30, false).await.unwrap();

    queue.leave("pc-1", "client-2").await.unwrap();
    let status = queue.status("pc-1", Some("client-2")).await.unwrap();
    assert_eq!(status.position, None);
}

#[tokio::test]
async fn heartbeat_just_registered_is_not_timed_out() {
    let (_dir, db) = test_db();
    seed_pc(&db, "pc-1", "host-1", 600).await;
    let sessions = SessionService::new(db.clone(), 0.1, 0.3);
    let heartbeat = HeartbeatService::new(db.clone(), sessions, 60_000, 180_000, 45, 120);

    heartbeat.register("host-1", Some(PcStatus::Online)).await.unwrap();
    let timed_out = heartbeat.handle_timeouts().await;
    assert_eq!(timed_out, 0);
}
