//! Session service (§4.1): session lifecycle, wallet holds, and settlement.
//! Every mutating operation composes one serializable transaction through
//! `Db::transaction`, matching this codebase's existing vault-transfer style
//! in `vault_db.rs`.

use crate::db::{self, now_str, parse_dt, parse_dt_opt, to_str, Db};
use crate::errors::ApiError;
use crate::models::{FailureReason, PcStatus, Session, SessionStatus};
use crate::queue;
use crate::reliability;
use crate::settlement;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::{info, warn};

#[derive(Clone)]
pub struct SessionService {
    db: Db,
    platform_fee_rate: f64,
    host_penalty_rate: f64,
}

impl SessionService {
    pub fn new(db: Db, platform_fee_rate: f64, host_penalty_rate: f64) -> Self {
        Self {
            db,
            platform_fee_rate,
            host_penalty_rate,
        }
    }

    pub async fn create_session(
        &self,
        pc_id: &str,
        client_id: &str,
        minutes_purchased: i64,
        bypass_credits: bool,
    ) -> Result<Session, ApiError> {
        let pc_id = pc_id.to_string();
        let client_id = client_id.to_string();
        self.db
            .transaction(move |tx| create_session_tx(tx, &pc_id, &client_id, minutes_purchased, bypass_credits))
            .await
    }

    pub async fn start_session(&self, session_id: &str, caller_id: &str) -> Result<Session, ApiError> {
        let session_id = session_id.to_string();
        let caller_id = caller_id.to_string();
        self.db
            .transaction(move |tx| start_session_tx(tx, &session_id, &caller_id))
            .await
    }

    pub async fn end_session(
        &self,
        session_id: &str,
        failure_reason: FailureReason,
        release_status: Option<PcStatus>,
    ) -> Result<Session, ApiError> {
        let session_id = session_id.to_string();
        let fee = self.platform_fee_rate;
        let penalty = self.host_penalty_rate;
        let (session, pc_to_promote) = self
            .db
            .transaction(move |tx| {
                end_session_tx(tx, &session_id, failure_reason, release_status, fee, penalty)
            })
            .await?;

        if let Some(pc_id) = pc_to_promote {
            if let Err(e) = queue::promote_next(&self.db, &pc_id).await {
                warn!(pc_id = %pc_id, error = %e, "queue promotion after session end failed");
            }
        }
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, ApiError> {
        let session_id = session_id.to_string();
        self.db
            .transaction(move |tx| {
                get_session(tx, &session_id)?.ok_or_else(|| ApiError::NotFound("session not found".into()))
            })
            .await
    }

    /// Periodic ticker body (§2.1 step 4 / §4.1 `expireSessions`): ends every
    /// ACTIVE session whose `endAt` has passed. Never propagates an error to
    /// the caller; logs and continues (§7).
    pub async fn expire_sessions(&self) -> usize {
        let ids = match self
            .db
            .transaction(|tx| list_expirable_session_ids(tx).map_err(ApiError::from))
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "failed to list expirable sessions");
                return 0;
            }
        };
        let mut count = 0;
        for id in ids {
            match self.end_session(&id, FailureReason::None, None).await {
                Ok(_) => count += 1,
                Err(e) => warn!(session_id = %id, error = %e, "failed to expire session"),
            }
        }
        count
    }
}

fn get_session(tx: &Transaction, session_id: &str) -> rusqlite::Result<Option<Session>> {
    tx.query_row(
        "SELECT id, pc_id, client_user_id, status, minutes_purchased, minutes_used,
                price_per_hour_cents, start_at, end_at, failure_reason, client_ip, created_at
         FROM sessions WHERE id = ?1",
        params![session_id],
        map_session_row,
    )
    .optional()
}

fn map_session_row(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let status: String = row.get(3)?;
    let failure: String = row.get(9)?;
    Ok(Session {
        id: row.get(0)?,
        pc_id: row.get(1)?,
        client_user_id: row.get(2)?,
        status: SessionStatus::from_str(&status).unwrap_or(SessionStatus::Pending),
        minutes_purchased: row.get(4)?,
        minutes_used: row.get(5)?,
        price_per_hour_cents: row.get(6)?,
        start_at: parse_dt_opt(row.get(7)?),
        end_at: parse_dt_opt(row.get(8)?),
        failure_reason: FailureReason::from_str(&failure).unwrap_or(FailureReason::None),
        client_ip: row.get(10)?,
        created_at: parse_dt(&row.get::<_, String>(11)?),
    })
}

/// Any non-terminal session (PENDING or ACTIVE) for this PC, if one exists.
pub fn find_active_session_for_pc(
    tx: &Transaction,
    pc_id: &str,
) -> rusqlite::Result<Option<Session>> {
    tx.query_row(
        "SELECT id, pc_id, client_user_id, status, minutes_purchased, minutes_used,
                price_per_hour_cents, start_at, end_at, failure_reason, client_ip, created_at
         FROM sessions WHERE pc_id = ?1 AND status IN ('PENDING','ACTIVE')",
        params![pc_id],
        map_session_row,
    )
    .optional()
}

fn find_active_session_for_client(
    tx: &Transaction,
    client_id: &str,
) -> rusqlite::Result<Option<Session>> {
    tx.query_row(
        "SELECT id, pc_id, client_user_id, status, minutes_purchased, minutes_used,
                price_per_hour_cents, start_at, end_at, failure_reason, client_ip, created_at
         FROM sessions WHERE client_user_id = ?1 AND status IN ('PENDING','ACTIVE')",
        params![client_id],
        map_session_row,
    )
    .optional()
}

fn list_expirable_session_ids(tx: &Transaction) -> rusqlite::Result<Vec<String>> {
    let now = now_str();
    let mut stmt = tx.prepare(
        "SELECT id FROM sessions WHERE status = 'ACTIVE' AND end_at IS NOT NULL AND end_at <= ?1",
    )?;
    let rows = stmt.query_map(params![now], |row| row.get::<_, String>(0))?;
    rows.collect()
}

/// Core of `createSession` (§4.1). Called directly by the queue manager's
/// `join` fast path too, inside the same transaction.
pub fn create_session_tx(
    tx: &Transaction,
    pc_id: &str,
    client_id: &str,
    minutes_purchased: i64,
    bypass_credits: bool,
) -> Result<Session, ApiError> {
    if !(1..=240).contains(&minutes_purchased) {
        return Err(ApiError::BadRequest("minutesPurchased must be in [1, 240]".into()));
    }

    let pc = db::get_pc(tx, pc_id).map_err(ApiError::from)?.ok_or(ApiError::PcNotFound)?;
    if pc.status == PcStatus::Offline {
        return Err(ApiError::PcOffline);
    }
    if find_active_session_for_pc(tx, pc_id).map_err(ApiError::from)?.is_some() {
        return Err(ApiError::SessionExists);
    }
    if find_active_session_for_client(tx, client_id).map_err(ApiError::from)?.is_some() {
        return Err(ApiError::SessionExists);
    }

    let cost_cents = (pc.price_per_hour_cents * minutes_purchased) / 60;
    db::debit_wallet(tx, client_id, cost_cents, bypass_credits)?;

    let id = uuid::Uuid::new_v4().to_string();
    let now = now_str();
    tx.execute(
        "INSERT INTO sessions (id, pc_id, client_user_id, status, minutes_purchased, minutes_used,
                price_per_hour_cents, start_at, end_at, failure_reason, client_ip, created_at)
         VALUES (?1, ?2, ?3, 'PENDING', ?4, 0, ?5, NULL, NULL, 'NONE', NULL, ?6)",
        params![id, pc_id, client_id, minutes_purchased, pc.price_per_hour_cents, now],
    )
    .map_err(ApiError::from)?;

    info!(session_id = %id, pc_id, client_id, "session created");
    get_session(tx, &id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::Internal("session vanished after insert".into()))
}

pub(crate) fn start_session_tx(tx: &Transaction, session_id: &str, caller_id: &str) -> Result<Session, ApiError> {
    let session = get_session(tx, session_id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound("session not found".into()))?;
    if session.client_user_id != caller_id {
        return Err(ApiError::Forbidden);
    }
    if session.status != SessionStatus::Pending {
        return Err(ApiError::SessionNotActive);
    }
    let pc = db::get_pc(tx, &session.pc_id).map_err(ApiError::from)?.ok_or(ApiError::PcNotFound)?;
    if pc.status == PcStatus::Offline {
        return Err(ApiError::PcOffline);
    }

    let start_at = Utc::now();
    let end_at = start_at + chrono::Duration::seconds(session.minutes_purchased * 60);
    tx.execute(
        "UPDATE sessions SET status = 'ACTIVE', start_at = ?1, end_at = ?2 WHERE id = ?3",
        params![to_str(start_at), to_str(end_at), session_id],
    )
    .map_err(ApiError::from)?;
    db::set_pc_status(tx, &session.pc_id, PcStatus::Busy).map_err(ApiError::from)?;

    let mut profile = db::get_host_profile_by_user(tx, &pc.host_id)
        .map_err(ApiError::from)?
        .unwrap_or_else(|| db::get_or_create_host_profile(tx, &pc.host_id).expect("create host profile"));
    profile.sessions_total += 1;
    db::update_host_profile(tx, &profile).map_err(ApiError::from)?;

    info!(session_id, pc_id = %session.pc_id, "session started");
    get_session(tx, session_id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::Internal("session vanished after start".into()))
}

fn end_session_tx(
    tx: &Transaction,
    session_id: &str,
    failure_reason: FailureReason,
    release_status: Option<PcStatus>,
    platform_fee_rate: f64,
    host_penalty_rate: f64,
) -> Result<(Session, Option<String>), ApiError> {
    let session = get_session(tx, session_id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound("session not found".into()))?;

    if session.status.is_terminal() {
        // Idempotent per §4.1 / §8: re-running settlement would double-pay.
        return Ok((session, None));
    }

    let now = Utc::now();
    let minutes_used = match session.start_at {
        None => 0,
        Some(start) => {
            let elapsed = (now - start).num_seconds();
            let minutes = if elapsed <= 0 { 0 } else { (elapsed + 59) / 60 };
            minutes.clamp(0, session.minutes_purchased)
        }
    };

    let pc = db::get_pc(tx, &session.pc_id).map_err(ApiError::from)?;
    let settlement = settlement::settle(
        session.price_per_hour(),
        session.minutes_purchased,
        minutes_used,
        platform_fee_rate,
        host_penalty_rate,
        failure_reason,
    );

    db::credit_wallet(
        tx,
        &pc.as_ref().map(|p| p.host_id.clone()).unwrap_or_default(),
        cents(settlement.host_payout),
    )
    .map_err(ApiError::from)?;
    if settlement.client_credit > 0.0 {
        db::credit_wallet(tx, &session.client_user_id, cents(settlement.client_credit))
            .map_err(ApiError::from)?;
    }

    let new_status = if failure_reason == FailureReason::None {
        SessionStatus::Ended
    } else {
        SessionStatus::Failed
    };
    tx.execute(
        "UPDATE sessions SET status = ?1, minutes_used = ?2, end_at = ?3, failure_reason = ?4 WHERE id = ?5",
        params![
            new_status.as_str(),
            minutes_used,
            to_str(now),
            failure_reason.as_str(),
            session_id,
        ],
    )
    .map_err(ApiError::from)?;

    let mut pc_to_promote = None;
    if let Some(pc) = &pc {
        let final_status = release_status.unwrap_or(PcStatus::Online);
        db::set_pc_status(tx, &pc.id, final_status).map_err(ApiError::from)?;

        let event = if failure_reason == FailureReason::None {
            crate::models::ReliabilityEventType::SessionOk
        } else {
            crate::models::ReliabilityEventType::SessionFailed
        };
        db::insert_reliability_event(tx, &pc.host_id, event).map_err(ApiError::from)?;

        let mut profile = db::get_or_create_host_profile(tx, &pc.host_id).map_err(ApiError::from)?;
        profile.reliability_score = reliability::apply_event(profile.reliability_score, event);
        if failure_reason == FailureReason::None {
            profile.sessions_completed += 1;
        } else {
            profile.sessions_dropped += 1;
            profile.last_drop_at = Some(now);
        }
        db::update_host_profile(tx, &profile).map_err(ApiError::from)?;

        if final_status == PcStatus::Online {
            pc_to_promote = Some(pc.id.clone());
        }
    }

    info!(session_id, status = new_status.as_str(), minutes_used, "session ended");
    let session = get_session(tx, session_id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::Internal("session vanished after end".into()))?;
    Ok((session, pc_to_promote))
}

fn cents(units: f64) -> i64 {
    (units * 100.0).round() as i64
}
