//! Host heartbeat & timeout cascade (§4.3).

use crate::db::{self, now_str, parse_dt, to_str, Db};
use crate::errors::ApiError;
use crate::models::{PcStatus, Role};
use crate::session::SessionService;
use chrono::Utc;
use rusqlite::{params, Transaction};
use tracing::{info, warn};

#[derive(Clone)]
pub struct HeartbeatService {
    db: Db,
    sessions: SessionService,
    timeout_idle_ms: u64,
    timeout_active_ms: u64,
    grace_idle_seconds: u64,
    grace_active_seconds: u64,
}

impl HeartbeatService {
    pub fn new(
        db: Db,
        sessions: SessionService,
        timeout_idle_ms: u64,
        timeout_active_ms: u64,
        grace_idle_seconds: u64,
        grace_active_seconds: u64,
    ) -> Self {
        Self {
            db,
            sessions,
            timeout_idle_ms,
            timeout_active_ms,
            grace_idle_seconds,
            grace_active_seconds,
        }
    }

    pub async fn register(&self, host_user_id: &str, status: Option<PcStatus>) -> Result<(), ApiError> {
        let host_user_id = host_user_id.to_string();
        self.db
            .transaction(move |tx| register_heartbeat_tx(tx, &host_user_id, status))
            .await
    }

    /// Periodic sweep (§2.1 step 4). Never propagates errors to callers; logs
    /// and continues on any failure (§7).
    pub async fn handle_timeouts(&self) -> usize {
        let idle_ms = self.timeout_idle_ms;
        let active_ms = self.timeout_active_ms;
        let idle_grace = self.grace_idle_seconds;
        let active_grace = self.grace_active_seconds;

        let timed_out = match self
            .db
            .transaction(move |tx| {
                find_timed_out_hosts(tx, idle_ms, active_ms, idle_grace, active_grace)
            })
            .await
        {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(error = %e, "failed to scan for host timeouts");
                return 0;
            }
        };

        let mut count = 0;
        for host_user_id in timed_out {
            match self.cascade_host_down(&host_user_id).await {
                Ok(_) => count += 1,
                Err(e) => warn!(host_id = %host_user_id, error = %e, "host-down cascade failed"),
            }
        }
        count
    }

    async fn cascade_host_down(&self, host_user_id: &str) -> Result<(), ApiError> {
        let host_user_id_owned = host_user_id.to_string();
        let (pc_ids, active_session_ids) = self
            .db
            .transaction(move |tx| mark_host_offline_tx(tx, &host_user_id_owned))
            .await?;

        if pc_ids.is_empty() {
            return Ok(());
        }
        info!(host_id = %host_user_id, pcs = pc_ids.len(), "host marked offline after heartbeat timeout");

        for session_id in active_session_ids {
            if let Err(e) = self
                .sessions
                .end_session(&session_id, crate::models::FailureReason::Host, Some(PcStatus::Offline))
                .await
            {
                warn!(session_id = %session_id, error = %e, "failed to end session during host-down cascade");
            }
        }
        Ok(())
    }
}

fn register_heartbeat_tx(
    tx: &Transaction,
    host_user_id: &str,
    status: Option<PcStatus>,
) -> Result<(), ApiError> {
    db::get_or_create_user(tx, host_user_id, Role::Host).map_err(ApiError::from)?;
    let mut profile = db::get_or_create_host_profile(tx, host_user_id).map_err(ApiError::from)?;
    profile.last_seen_at = Utc::now();
    db::update_host_profile(tx, &profile).map_err(ApiError::from)?;

    if let Some(status) = status {
        db::set_pcs_status_for_host(tx, host_user_id, status, false).map_err(ApiError::from)?;
    }

    record_online_minute(tx, host_user_id).map_err(ApiError::from)?;
    Ok(())
}

fn record_online_minute(tx: &Transaction, host_user_id: &str) -> rusqlite::Result<()> {
    let minute = Utc::now().format("%Y-%m-%dT%H:%M").to_string();
    tx.execute(
        "INSERT INTO host_online_minutes (host_id, minute) VALUES (?1, ?2)
         ON CONFLICT(host_id, minute) DO NOTHING",
        params![host_user_id, minute],
    )?;
    let cutoff = to_str(Utc::now() - chrono::Duration::days(7));
    tx.execute(
        "DELETE FROM host_online_minutes WHERE host_id = ?1 AND minute < ?2",
        params![host_user_id, &cutoff[..16]],
    )?;
    Ok(())
}

fn host_has_active_session(tx: &Transaction, host_user_id: &str) -> rusqlite::Result<bool> {
    tx.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM sessions s JOIN pcs p ON p.id = s.pc_id
            WHERE p.host_id = ?1 AND s.status = 'ACTIVE'
         )",
        params![host_user_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n != 0)
}

/// Hosts whose `lastSeenAt` exceeds the effective timeout plus grace window
/// (§4.3). Effective timeout and grace both depend on whether the host
/// currently has an ACTIVE session.
fn find_timed_out_hosts(
    tx: &Transaction,
    timeout_idle_ms: u64,
    timeout_active_ms: u64,
    grace_idle_seconds: u64,
    grace_active_seconds: u64,
) -> Result<Vec<String>, ApiError> {
    let mut stmt = tx
        .prepare("SELECT user_id, last_seen_at FROM host_profiles")
        .map_err(ApiError::from)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(ApiError::from)?;

    let now = Utc::now();
    let mut timed_out = Vec::new();
    for row in rows {
        let (user_id, last_seen_str) = row.map_err(ApiError::from)?;
        let has_active = host_has_active_session(tx, &user_id).map_err(ApiError::from)?;
        let has_non_offline_pc = !db::list_non_offline_pc_ids_for_host(tx, &user_id)
            .map_err(ApiError::from)?
            .is_empty();
        if !has_non_offline_pc {
            continue;
        }
        let (timeout_ms, grace_seconds) = if has_active {
            (timeout_active_ms, grace_active_seconds)
        } else {
            (timeout_idle_ms, grace_idle_seconds)
        };
        let last_seen = parse_dt(&last_seen_str);
        let deadline = last_seen
            + chrono::Duration::milliseconds(timeout_ms as i64)
            + chrono::Duration::seconds(grace_seconds as i64);
        if now >= deadline {
            timed_out.push(user_id);
        }
    }
    Ok(timed_out)
}

/// Marks all non-OFFLINE PCs of `host_user_id` OFFLINE, records a
/// `HOST_DOWN` reliability event, and returns the PC ids plus any ACTIVE
/// session ids that the caller must end outside this transaction (ending a
/// session triggers `queue::promote_next`, which this function's caller
/// already handles via `SessionService::end_session`).
fn mark_host_offline_tx(
    tx: &Transaction,
    host_user_id: &str,
) -> Result<(Vec<String>, Vec<String>), ApiError> {
    let pc_ids = db::list_non_offline_pc_ids_for_host(tx, host_user_id).map_err(ApiError::from)?;
    if pc_ids.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let mut active_session_ids = Vec::new();
    for pc_id in &pc_ids {
        let mut stmt = tx
            .prepare("SELECT id FROM sessions WHERE pc_id = ?1 AND status = 'ACTIVE'")
            .map_err(ApiError::from)?;
        let ids = stmt
            .query_map(params![pc_id], |row| row.get::<_, String>(0))
            .map_err(ApiError::from)?;
        for id in ids {
            active_session_ids.push(id.map_err(ApiError::from)?);
        }
    }

    db::set_pcs_status_for_host(tx, host_user_id, PcStatus::Offline, true).map_err(ApiError::from)?;

    let mut profile = db::get_or_create_host_profile(tx, host_user_id).map_err(ApiError::from)?;
    profile.reliability_score =
        crate::reliability::apply_event(profile.reliability_score, crate::models::ReliabilityEventType::HostDown);
    db::update_host_profile(tx, &profile).map_err(ApiError::from)?;
    db::insert_reliability_event(tx, host_user_id, crate::models::ReliabilityEventType::HostDown)
        .map_err(ApiError::from)?;

    Ok((pc_ids, active_session_ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Pc;

    fn seed_pc(tx: &Transaction, pc_id: &str, host_id: &str) {
        db::get_or_create_user(tx, host_id, Role::Host).unwrap();
        db::get_or_create_host_profile(tx, host_id).unwrap();
        let pc = Pc {
            id: pc_id.to_string(),
            host_id: host_id.to_string(),
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
        db::insert_pc(tx, &pc).unwrap();
    }

    #[tokio::test]
    async fn heartbeat_then_immediate_timeout_check_does_not_mark_offline() {
        let db = Db::open_in_memory().unwrap();
        db.transaction(|tx| {
            seed_pc(tx, "pc1", "host1");
            Ok::<(), ApiError>(())
        })
        .await
        .unwrap();

        let sessions = SessionService::new(db.clone(), 0.1, 0.3);
        let hb = HeartbeatService::new(db.clone(), sessions, 60_000, 180_000, 45, 120);
        hb.register("host1", None).await.unwrap();
        let count = hb.handle_timeouts().await;
        assert_eq!(count, 0);

        let status = db
            .transaction(|tx| Ok::<_, ApiError>(db::get_pc(tx, "pc1").unwrap().unwrap().status))
            .await
            .unwrap();
        assert_eq!(status, PcStatus::Online);
    }

    #[tokio::test]
    async fn stale_heartbeat_marks_host_offline() {
        let db = Db::open_in_memory().unwrap();
        db.transaction(|tx| {
            seed_pc(tx, "pc1", "host1");
            let mut profile = db::get_or_create_host_profile(tx, "host1").unwrap();
            profile.last_seen_at = Utc::now() - chrono::Duration::seconds(300);
            db::update_host_profile(tx, &profile).unwrap();
            Ok::<(), ApiError>(())
        })
        .await
        .unwrap();

        let sessions = SessionService::new(db.clone(), 0.1, 0.3);
        let hb = HeartbeatService::new(db.clone(), sessions, 60_000, 180_000, 45, 120);
        let count = hb.handle_timeouts().await;
        assert_eq!(count, 1);

        let status = db
            .transaction(|tx| Ok::<_, ApiError>(db::get_pc(tx, "pc1").unwrap().unwrap().status))
            .await
            .unwrap();
        assert_eq!(status, PcStatus::Offline);
    }
}
