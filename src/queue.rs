//! Queue manager (§4.2): FIFO waiting list per PC, promotion on slot free.

use crate::db::{self, now_str, parse_dt, parse_dt_opt, to_str, Db};
use crate::errors::ApiError;
use crate::models::{PcStatus, QueueEntry, QueueStatus};
use crate::session::{create_session_tx, find_active_session_for_pc, start_session_tx};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Clone)]
pub struct QueueManager {
    db: Db,
    promotion_ttl_seconds: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusView {
    pub queue_count: i64,
    pub position: Option<i64>,
    pub status: Option<QueueStatus>,
    pub session_id: Option<String>,
}

impl QueueManager {
    pub fn new(db: Db, promotion_ttl_seconds: u64) -> Self {
        Self {
            db,
            promotion_ttl_seconds: promotion_ttl_seconds as i64,
        }
    }

    pub async fn join(
        &self,
        pc_id: &str,
        user_id: &str,
        minutes_purchased: i64,
        bypass_credits: bool,
    ) -> Result<QueueStatusView, ApiError> {
        let pc_id = pc_id.to_string();
        let user_id = user_id.to_string();
        self.db
            .transaction(move |tx| join_tx(tx, &pc_id, &user_id, minutes_purchased, bypass_credits))
            .await
    }

    pub async fn leave(&self, pc_id: &str, user_id: &str) -> Result<(), ApiError> {
        let pc_id = pc_id.to_string();
        let user_id = user_id.to_string();
        self.db.transaction(move |tx| leave_tx(tx, &pc_id, &user_id)).await
    }

    pub async fn status(&self, pc_id: &str, user_id: Option<&str>) -> Result<QueueStatusView, ApiError> {
        let pc_id = pc_id.to_string();
        let user_id = user_id.map(|s| s.to_string());
        self.db
            .transaction(move |tx| status_tx(tx, &pc_id, user_id.as_deref()))
            .await
    }

    pub async fn my_updates(&self, user_id: &str) -> Result<Vec<QueueEntry>, ApiError> {
        let user_id = user_id.to_string();
        self.db.transaction(move |tx| list_active_for_user(tx, &user_id)).await
    }

    /// Promotion TTL sweep (§4.1 `expirePromotedSlots`). Never propagates
    /// errors — logs and continues (§7).
    pub async fn expire_promoted_slots(&self) -> usize {
        let ttl = self.promotion_ttl_seconds;
        let stale_pcs = match self.db.transaction(move |tx| expire_stale_promoted_tx(tx, ttl)).await {
            Ok(pcs) => pcs,
            Err(e) => {
                warn!(error = %e, "failed to expire promoted queue slots");
                return 0;
            }
        };
        let count = stale_pcs.len();
        for pc_id in stale_pcs {
            if let Err(e) = promote_next(&self.db, &pc_id).await {
                warn!(pc_id = %pc_id, error = %e, "failed to re-promote after TTL expiry");
            }
        }
        count
    }
}

fn map_entry_row(row: &rusqlite::Row) -> rusqlite::Result<QueueEntry> {
    let status: String = row.get(3)?;
    Ok(QueueEntry {
        id: row.get(0)?,
        pc_id: row.get(1)?,
        user_id: row.get(2)?,
        status: QueueStatus::from_str(&status).unwrap_or(QueueStatus::Waiting),
        created_at: parse_dt(&row.get::<_, String>(4)?),
        minutes_purchased: row.get(5)?,
        promoted_at: parse_dt_opt(row.get(6)?),
        session_id: row.get(7)?,
    })
}

const ENTRY_COLUMNS: &str =
    "id, pc_id, user_id, status, created_at, minutes_purchased, promoted_at, session_id";

fn find_non_terminal_entry(
    tx: &Transaction,
    pc_id: &str,
    user_id: &str,
) -> rusqlite::Result<Option<QueueEntry>> {
    tx.query_row(
        &format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE pc_id = ?1 AND user_id = ?2
             AND status IN ('WAITING','PROMOTED','ACTIVE')"
        ),
        params![pc_id, user_id],
        map_entry_row,
    )
    .optional()
}

fn list_active_for_user(tx: &Transaction, user_id: &str) -> Result<Vec<QueueEntry>, ApiError> {
    let mut stmt = tx
        .prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE user_id = ?1
             AND status IN ('WAITING','PROMOTED','ACTIVE') ORDER BY created_at"
        ))
        .map_err(ApiError::from)?;
    let rows = stmt
        .query_map(params![user_id], map_entry_row)
        .map_err(ApiError::from)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(ApiError::from)
}

/// 1-based position among WAITING entries for `pc_id`, ordered by
/// `createdAt` then `id` for stability (§4.2).
fn waiting_position(tx: &Transaction, pc_id: &str, entry: &QueueEntry) -> rusqlite::Result<i64> {
    tx.query_row(
        "SELECT COUNT(*) FROM queue_entries WHERE pc_id = ?1 AND status = 'WAITING'
         AND (created_at < ?2 OR (created_at = ?2 AND id <= ?3))",
        params![pc_id, to_str(entry.created_at), entry.id],
        |row| row.get(0),
    )
}

fn waiting_count(tx: &Transaction, pc_id: &str) -> rusqlite::Result<i64> {
    tx.query_row(
        "SELECT COUNT(*) FROM queue_entries WHERE pc_id = ?1 AND status IN ('WAITING','PROMOTED')",
        params![pc_id],
        |row| row.get(0),
    )
}

fn join_tx(
    tx: &Transaction,
    pc_id: &str,
    user_id: &str,
    minutes_purchased: i64,
    bypass_credits: bool,
) -> Result<QueueStatusView, ApiError> {
    if !(1..=240).contains(&minutes_purchased) {
        return Err(ApiError::BadRequest("minutesPurchased must be in [1, 240]".into()));
    }

    if let Some(existing) = find_non_terminal_entry(tx, pc_id, user_id).map_err(ApiError::from)? {
        return match existing.status {
            QueueStatus::Waiting => {
                let position = waiting_position(tx, pc_id, &existing).map_err(ApiError::from)?;
                let count = waiting_count(tx, pc_id).map_err(ApiError::from)?;
                Ok(QueueStatusView {
                    queue_count: count,
                    position: Some(position),
                    status: Some(QueueStatus::Waiting),
                    session_id: None,
                })
            }
            QueueStatus::Active | QueueStatus::Promoted => Ok(QueueStatusView {
                queue_count: waiting_count(tx, pc_id).map_err(ApiError::from)?,
                position: None,
                status: Some(existing.status),
                session_id: existing.session_id,
            }),
            _ => unreachable!("find_non_terminal_entry only returns non-terminal statuses"),
        };
    }

    // §9 decision: permissive, even if the user already waits on another PC.
    let pc = db::get_pc(tx, pc_id).map_err(ApiError::from)?.ok_or(ApiError::PcNotFound)?;
    let has_non_terminal = find_active_session_for_pc(tx, pc_id).map_err(ApiError::from)?.is_some();

    if pc.status == PcStatus::Online && !has_non_terminal {
        let session = create_session_tx(tx, pc_id, user_id, minutes_purchased, bypass_credits)?;
        start_session_tx(tx, &session.id, user_id)?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_str();
        tx.execute(
            "INSERT INTO queue_entries (id, pc_id, user_id, status, created_at, minutes_purchased, promoted_at, session_id)
             VALUES (?1, ?2, ?3, 'ACTIVE', ?4, ?5, NULL, ?6)",
            params![id, pc_id, user_id, now, minutes_purchased, session.id],
        )
        .map_err(ApiError::from)?;
        info!(pc_id, user_id, session_id = %session.id, "queue join: immediate session");
        return Ok(QueueStatusView {
            queue_count: waiting_count(tx, pc_id).map_err(ApiError::from)?,
            position: None,
            status: Some(QueueStatus::Active),
            session_id: Some(session.id),
        });
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = now_str();
    tx.execute(
        "INSERT INTO queue_entries (id, pc_id, user_id, status, created_at, minutes_purchased, promoted_at, session_id)
         VALUES (?1, ?2, ?3, 'WAITING', ?4, ?5, NULL, NULL)",
        params![id, pc_id, user_id, now, minutes_purchased],
    )
    .map_err(ApiError::from)?;
    let entry = find_non_terminal_entry(tx, pc_id, user_id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::Internal("queue entry vanished after insert".into()))?;
    let position = waiting_position(tx, pc_id, &entry).map_err(ApiError::from)?;
    let count = waiting_count(tx, pc_id).map_err(ApiError::from)?;
    info!(pc_id, user_id, position, "queue join: waiting");
    Ok(QueueStatusView {
        queue_count: count,
        position: Some(position),
        status: Some(QueueStatus::Waiting),
        session_id: None,
    })
}

fn leave_tx(tx: &Transaction, pc_id: &str, user_id: &str) -> Result<(), ApiError> {
    let updated = tx
        .execute(
            "UPDATE queue_entries SET status = 'CANCELLED' WHERE pc_id = ?1 AND user_id = ?2 AND status = 'WAITING'",
            params![pc_id, user_id],
        )
        .map_err(ApiError::from)?;
    if updated == 0 {
        return Err(ApiError::NotFound("no waiting queue entry".into()));
    }
    Ok(())
}

fn status_tx(tx: &Transaction, pc_id: &str, user_id: Option<&str>) -> Result<QueueStatusView, ApiError> {
    let count = waiting_count(tx, pc_id).map_err(ApiError::from)?;
    let Some(user_id) = user_id else {
        return Ok(QueueStatusView {
            queue_count: count,
            position: None,
            status: None,
            session_id: None,
        });
    };
    match find_non_terminal_entry(tx, pc_id, user_id).map_err(ApiError::from)? {
        None => Ok(QueueStatusView {
            queue_count: count,
            position: None,
            status: None,
            session_id: None,
        }),
        Some(entry) => {
            let position = if entry.status == QueueStatus::Waiting {
                Some(waiting_position(tx, pc_id, &entry).map_err(ApiError::from)?)
            } else {
                None
            };
            Ok(QueueStatusView {
                queue_count: count,
                position,
                status: Some(entry.status),
                session_id: entry.session_id,
            })
        }
    }
}

/// Picks the oldest WAITING entry for `pc_id` and marks it PROMOTED,
/// `promotedAt = now`. Commits on its own (the caller runs this in its own
/// `Db::transaction`) so the PROMOTED state is durably visible before any
/// session-creation attempt is made — otherwise a PROMOTED entry could never
/// outlive the transaction that created it, and `expire_promoted_slots`
/// would have nothing to ever find.
fn mark_next_promoted_tx(tx: &Transaction, pc_id: &str) -> Result<Option<(String, String, i64)>, ApiError> {
    let next: Option<(String, String, i64)> = tx
        .query_row(
            "SELECT id, user_id, minutes_purchased FROM queue_entries
             WHERE pc_id = ?1 AND status = 'WAITING' ORDER BY created_at, id LIMIT 1",
            params![pc_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(ApiError::from)?;

    let Some((entry_id, user_id, minutes_purchased)) = next else {
        return Ok(None);
    };

    let now = now_str();
    tx.execute(
        "UPDATE queue_entries SET status = 'PROMOTED', promoted_at = ?1 WHERE id = ?2",
        params![now, entry_id],
    )
    .map_err(ApiError::from)?;

    Ok(Some((entry_id, user_id, minutes_purchased)))
}

/// Attempts to turn an already-PROMOTED entry into an ACTIVE session, in its
/// own transaction. Returns `true` on success (entry set ACTIVE), `false` on
/// wallet-debit failure (entry set EXPIRED) — the caller retries with the
/// next WAITING entry rather than recursing inside one transaction.
fn resolve_promoted_tx(
    tx: &Transaction,
    pc_id: &str,
    entry_id: &str,
    user_id: &str,
    minutes_purchased: i64,
) -> Result<bool, ApiError> {
    match create_session_tx(tx, pc_id, user_id, minutes_purchased, false).and_then(|s| {
        start_session_tx(tx, &s.id, user_id)?;
        Ok(s)
    }) {
        Ok(session) => {
            tx.execute(
                "UPDATE queue_entries SET status = 'ACTIVE', session_id = ?1 WHERE id = ?2",
                params![session.id, entry_id],
            )
            .map_err(ApiError::from)?;
            info!(pc_id, user_id, session_id = %session.id, "queue promotion succeeded");
            Ok(true)
        }
        Err(e) => {
            warn!(pc_id, user_id, error = %e, "queue promotion failed, expiring");
            tx.execute(
                "UPDATE queue_entries SET status = 'EXPIRED' WHERE id = ?1",
                params![entry_id],
            )
            .map_err(ApiError::from)?;
            Ok(false)
        }
    }
}

/// Invoked after a session on `pc_id` reaches a terminal state and the PC
/// returns to ONLINE (§4.2 `promoteNext`). Marks the head-of-queue entry
/// PROMOTED in one transaction, then tries to resolve it into a session in a
/// second transaction, retrying the next WAITING entry on wallet-debit
/// failure. Each step commits independently.
pub async fn promote_next(db: &Db, pc_id: &str) -> Result<(), ApiError> {
    loop {
        let pc_id_owned = pc_id.to_string();
        let candidate = db.transaction(move |tx| mark_next_promoted_tx(tx, &pc_id_owned)).await?;
        let Some((entry_id, user_id, minutes_purchased)) = candidate else {
            return Ok(());
        };

        let pc_id_owned = pc_id.to_string();
        let resolved = db
            .transaction(move |tx| resolve_promoted_tx(tx, &pc_id_owned, &entry_id, &user_id, minutes_purchased))
            .await?;
        if resolved {
            return Ok(());
        }
    }
}

/// Marks PROMOTED entries older than `ttl_seconds` as EXPIRED and returns
/// the distinct set of PCs affected, so the caller can re-promote their
/// queues outside this transaction.
fn expire_stale_promoted_tx(tx: &Transaction, ttl_seconds: i64) -> Result<Vec<String>, ApiError> {
    let cutoff = to_str(Utc::now() - chrono::Duration::seconds(ttl_seconds));
    let stale: Vec<(String, String)> = {
        let mut stmt = tx
            .prepare("SELECT id, pc_id FROM queue_entries WHERE status = 'PROMOTED' AND promoted_at < ?1")
            .map_err(ApiError::from)?;
        let rows = stmt
            .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(ApiError::from)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(ApiError::from)?
    };

    let mut pc_ids = Vec::with_capacity(stale.len());
    for (id, pc_id) in stale {
        tx.execute(
            "UPDATE queue_entries SET status = 'EXPIRED' WHERE id = ?1",
            params![id],
        )
        .map_err(ApiError::from)?;
        pc_ids.push(pc_id);
    }
    Ok(pc_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::models::{Pc, PcStatus, Role};

    fn seed_pc(tx: &Transaction, pc_id: &str, host_id: &str, online: bool) {
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
            status: if online { PcStatus::Online } else { PcStatus::Busy },
            connection_host: "10.0.0.1".into(),
            connection_port: 47990,
            categories: vec![],
            software_tags: vec![],
        };
        db::insert_pc(tx, &pc).unwrap();
    }

    #[tokio::test]
    async fn join_on_online_pc_creates_active_session_immediately() {
        let db = Db::open_in_memory().unwrap();
        db.transaction(|tx| {
            seed_pc(tx, "pc1", "host1", true);
            db::get_or_create_user(tx, "c1", Role::Client).unwrap();
            db::credit_wallet(tx, "c1", 10000).unwrap();
            Ok::<(), ApiError>(())
        })
        .await
        .unwrap();

        let qm = QueueManager::new(db, 90);
        let status = qm.join("pc1", "c1", 60, false).await.unwrap();
        assert_eq!(status.status, Some(QueueStatus::Active));
        assert!(status.session_id.is_some());
    }

    #[tokio::test]
    async fn join_on_busy_pc_waits_fifo() {
        let db = Db::open_in_memory().unwrap();
        db.transaction(|tx| {
            seed_pc(tx, "pc1", "host1", false);
            for u in ["c1", "c2"] {
                db::get_or_create_user(tx, u, Role::Client).unwrap();
                db::credit_wallet(tx, u, 10000).unwrap();
            }
            Ok::<(), ApiError>(())
        })
        .await
        .unwrap();

        let qm = QueueManager::new(db, 90);
        let s1 = qm.join("pc1", "c1", 60, false).await.unwrap();
        assert_eq!(s1.position, Some(1));
        let s2 = qm.join("pc1", "c2", 60, false).await.unwrap();
        assert_eq!(s2.position, Some(2));
    }

    #[tokio::test]
    async fn leave_then_status_has_no_position() {
        let db = Db::open_in_memory().unwrap();
        db.transaction(|tx| {
            seed_pc(tx, "pc1", "host1", false);
            db::get_or_create_user(tx, "c1", Role::Client).unwrap();
            db::credit_wallet(tx, "c1", 10000).unwrap();
            Ok::<(), ApiError>(())
        })
        .await
        .unwrap();

        let qm = QueueManager::new(db, 90);
        qm.join("pc1", "c1", 60, false).await.unwrap();
        qm.leave("pc1", "c1").await.unwrap();
        let status = qm.status("pc1", Some("c1")).await.unwrap();
        assert_eq!(status.position, None);
        assert_eq!(status.status, None);
    }
}
