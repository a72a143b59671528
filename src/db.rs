//! Persistence layer: SQLite connection handle, schema setup, and the
//! entity repositories shared across more than one service (users, wallets,
//! host profiles, PCs). Follows this codebase's existing `VaultDb` /
//! `UserAccountsDB` shape: one `Arc<tokio::sync::Mutex<Connection>>`,
//! blocking SQLite calls made inline while the guard is held.

use crate::errors::ApiError;
use crate::models::{HostProfile, Pc, PcStatus, Role, User};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("open database")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        init_schema(&conn).context("init schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside one serializable transaction (§4.1: "all mutating
    /// operations ... pass through the session service, which composes
    /// single serializable transactions"). Retries up to 3x with jittered
    /// backoff on a transient SQLITE_BUSY/locked error (§7).
    pub async fn transaction<T>(
        &self,
        f: impl for<'a> Fn(&'a Transaction<'a>) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut attempts = 0;
        loop {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction().map_err(ApiError::from)?;
            match f(&tx) {
                Ok(value) => {
                    tx.commit().map_err(ApiError::from)?;
                    return Ok(value);
                }
                Err(ApiError::Internal(msg)) if is_transient(&msg) && attempts < 3 => {
                    drop(tx);
                    drop(conn);
                    attempts += 1;
                    let backoff_ms = 5u64 * (1 << attempts) + (rand::random::<u64>() % 10);
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_transient(message: &str) -> bool {
    message.contains("database is locked") || message.contains("SQLITE_BUSY")
}

pub fn now_str() -> String {
    Utc::now().to_rfc3339()
}

pub fn to_str(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub fn parse_dt_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_dt(&v))
}

pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL,
            auth_provider TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS wallets (
            user_id TEXT PRIMARY KEY REFERENCES users(id),
            balance_cents INTEGER NOT NULL CHECK(balance_cents >= 0)
        );

        CREATE TABLE IF NOT EXISTS host_profiles (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            last_seen_at TEXT NOT NULL,
            sessions_total INTEGER NOT NULL DEFAULT 0,
            sessions_completed INTEGER NOT NULL DEFAULT 0,
            sessions_dropped INTEGER NOT NULL DEFAULT 0,
            last_drop_at TEXT,
            reliability_score INTEGER NOT NULL DEFAULT 100
        );

        CREATE TABLE IF NOT EXISTS pcs (
            id TEXT PRIMARY KEY,
            host_id TEXT NOT NULL,
            cpu TEXT NOT NULL DEFAULT '',
            gpu TEXT NOT NULL DEFAULT '',
            ram_gb INTEGER NOT NULL DEFAULT 0,
            storage_gb INTEGER NOT NULL DEFAULT 0,
            uplink_mbps INTEGER NOT NULL DEFAULT 0,
            price_per_hour_cents INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'OFFLINE',
            connection_host TEXT NOT NULL DEFAULT '',
            connection_port INTEGER NOT NULL DEFAULT 47990,
            categories TEXT NOT NULL DEFAULT '',
            software_tags TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_pcs_host ON pcs(host_id);

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            pc_id TEXT NOT NULL,
            client_user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            minutes_purchased INTEGER NOT NULL,
            minutes_used INTEGER NOT NULL DEFAULT 0,
            price_per_hour_cents INTEGER NOT NULL,
            start_at TEXT,
            end_at TEXT,
            failure_reason TEXT NOT NULL DEFAULT 'NONE',
            client_ip TEXT,
            created_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_pc_active
            ON sessions(pc_id) WHERE status IN ('PENDING','ACTIVE');
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_client_active
            ON sessions(client_user_id) WHERE status IN ('PENDING','ACTIVE');

        CREATE TABLE IF NOT EXISTS queue_entries (
            id TEXT PRIMARY KEY,
            pc_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            minutes_purchased INTEGER NOT NULL,
            promoted_at TEXT,
            session_id TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_pc_user_active
            ON queue_entries(pc_id, user_id) WHERE status IN ('WAITING','PROMOTED','ACTIVE');
        CREATE INDEX IF NOT EXISTS idx_queue_pc_waiting ON queue_entries(pc_id, created_at)
            WHERE status = 'WAITING';

        CREATE TABLE IF NOT EXISTS reservations (
            id TEXT PRIMARY KEY,
            pc_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            status TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reservations_pc ON reservations(pc_id)
            WHERE status != 'CANCELLED';

        CREATE TABLE IF NOT EXISTS stream_tokens (
            token TEXT PRIMARY KEY,
            pc_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            consumed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS reliability_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            host_id TEXT NOT NULL,
            type TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reliability_events_host ON reliability_events(host_id);

        CREATE TABLE IF NOT EXISTS host_online_minutes (
            host_id TEXT NOT NULL,
            minute TEXT NOT NULL,
            PRIMARY KEY (host_id, minute)
        );
        ",
    )
}

// --- Users & wallets -------------------------------------------------

pub fn get_user(tx: &Transaction, user_id: &str) -> rusqlite::Result<Option<User>> {
    tx.query_row(
        "SELECT id, role, auth_provider, created_at FROM users WHERE id = ?1",
        params![user_id],
        |row| {
            let role_str: String = row.get(1)?;
            Ok(User {
                id: row.get(0)?,
                role: Role::from_str(&role_str).unwrap_or(Role::Client),
                auth_provider: row.get(2)?,
                created_at: parse_dt(&row.get::<_, String>(3)?),
            })
        },
    )
    .optional()
}

/// Self-healing lookup: a user implicitly "exists" the first time we see
/// their id on an authenticated request, matching the external auth
/// gateway's promise that `sub` is a valid identity we've never had to
/// provision ourselves.
pub fn get_or_create_user(tx: &Transaction, user_id: &str, role: Role) -> rusqlite::Result<User> {
    if let Some(user) = get_user(tx, user_id)? {
        return Ok(user);
    }
    let now = now_str();
    tx.execute(
        "INSERT INTO users (id, role, auth_provider, created_at) VALUES (?1, ?2, 'gateway', ?3)
         ON CONFLICT(id) DO NOTHING",
        params![user_id, role.as_str(), now],
    )?;
    Ok(User {
        id: user_id.to_string(),
        role,
        auth_provider: "gateway".to_string(),
        created_at: parse_dt(&now),
    })
}

/// Wallet balance in cents, self-healing to zero if the row is missing
/// (§3, §4.6, §9: "wallet may not exist").
pub fn get_or_create_wallet_balance_cents(
    tx: &Transaction,
    user_id: &str,
) -> rusqlite::Result<i64> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT balance_cents FROM wallets WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(balance) = existing {
        return Ok(balance);
    }
    tx.execute(
        "INSERT INTO wallets (user_id, balance_cents) VALUES (?1, 0)
         ON CONFLICT(user_id) DO NOTHING",
        params![user_id],
    )?;
    Ok(0)
}

/// Debit `amount_cents` from the user's wallet, failing with
/// `INSUFFICIENT_FUNDS` unless `bypass` is set (§4.1, §4.7).
pub fn debit_wallet(
    tx: &Transaction,
    user_id: &str,
    amount_cents: i64,
    bypass: bool,
) -> Result<(), ApiError> {
    let balance = get_or_create_wallet_balance_cents(tx, user_id).map_err(ApiError::from)?;
    if !bypass && balance < amount_cents {
        return Err(ApiError::InsufficientFunds);
    }
    let new_balance = (balance - amount_cents).max(0);
    tx.execute(
        "UPDATE wallets SET balance_cents = ?1 WHERE user_id = ?2",
        params![new_balance, user_id],
    )
    .map_err(ApiError::from)?;
    Ok(())
}

/// Credit `amount_cents` to the user's wallet, self-healing a missing
/// wallet row first (§4.6, §9).
pub fn credit_wallet(tx: &Transaction, user_id: &str, amount_cents: i64) -> rusqlite::Result<()> {
    if amount_cents <= 0 {
        get_or_create_wallet_balance_cents(tx, user_id)?;
        return Ok(());
    }
    let balance = get_or_create_wallet_balance_cents(tx, user_id)?;
    tx.execute(
        "UPDATE wallets SET balance_cents = ?1 WHERE user_id = ?2",
        params![balance + amount_cents, user_id],
    )?;
    Ok(())
}

// --- Host profiles -----------------------------------------------------

fn map_host_profile_row(row: &rusqlite::Row) -> rusqlite::Result<HostProfile> {
    Ok(HostProfile {
        id: row.get(0)?,
        user_id: row.get(1)?,
        last_seen_at: parse_dt(&row.get::<_, String>(2)?),
        sessions_total: row.get(3)?,
        sessions_completed: row.get(4)?,
        sessions_dropped: row.get(5)?,
        last_drop_at: parse_dt_opt(row.get(6)?),
        reliability_score: row.get(7)?,
    })
}

const HOST_PROFILE_COLUMNS: &str = "id, user_id, last_seen_at, sessions_total, sessions_completed, sessions_dropped, last_drop_at, reliability_score";

pub fn get_host_profile_by_user(
    tx: &Transaction,
    user_id: &str,
) -> rusqlite::Result<Option<HostProfile>> {
    tx.query_row(
        &format!("SELECT {HOST_PROFILE_COLUMNS} FROM host_profiles WHERE user_id = ?1"),
        params![user_id],
        map_host_profile_row,
    )
    .optional()
}

pub fn get_host_profile_by_id(
    tx: &Transaction,
    id: &str,
) -> rusqlite::Result<Option<HostProfile>> {
    tx.query_row(
        &format!("SELECT {HOST_PROFILE_COLUMNS} FROM host_profiles WHERE id = ?1"),
        params![id],
        map_host_profile_row,
    )
    .optional()
}

/// A host profile is created the first time a user claims the host role
/// (§3); never destroyed while a PC references it.
pub fn get_or_create_host_profile(
    tx: &Transaction,
    user_id: &str,
) -> rusqlite::Result<HostProfile> {
    if let Some(profile) = get_host_profile_by_user(tx, user_id)? {
        return Ok(profile);
    }
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_str();
    tx.execute(
        "INSERT INTO host_profiles (id, user_id, last_seen_at, sessions_total, sessions_completed, sessions_dropped, last_drop_at, reliability_score)
         VALUES (?1, ?2, ?3, 0, 0, 0, NULL, 100)",
        params![id, user_id, now],
    )?;
    Ok(HostProfile {
        id,
        user_id: user_id.to_string(),
        last_seen_at: parse_dt(&now),
        sessions_total: 0,
        sessions_completed: 0,
        sessions_dropped: 0,
        last_drop_at: None,
        reliability_score: 100,
    })
}

pub fn update_host_profile(tx: &Transaction, profile: &HostProfile) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE host_profiles SET last_seen_at = ?1, sessions_total = ?2, sessions_completed = ?3,
         sessions_dropped = ?4, last_drop_at = ?5, reliability_score = ?6 WHERE id = ?7",
        params![
            to_str(profile.last_seen_at),
            profile.sessions_total,
            profile.sessions_completed,
            profile.sessions_dropped,
            profile.last_drop_at.map(to_str),
            profile.reliability_score,
            profile.id,
        ],
    )?;
    Ok(())
}

pub fn insert_reliability_event(
    tx: &Transaction,
    host_id: &str,
    event_type: crate::models::ReliabilityEventType,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO reliability_events (host_id, type, created_at) VALUES (?1, ?2, ?3)",
        params![host_id, event_type.as_str(), now_str()],
    )?;
    Ok(())
}

// --- PCs -----------------------------------------------------------------

fn map_pc_row(row: &rusqlite::Row) -> rusqlite::Result<Pc> {
    let status_str: String = row.get(8)?;
    let categories: String = row.get(11)?;
    let software_tags: String = row.get(12)?;
    Ok(Pc {
        id: row.get(0)?,
        host_id: row.get(1)?,
        cpu: row.get(2)?,
        gpu: row.get(3)?,
        ram_gb: row.get(4)?,
        storage_gb: row.get(5)?,
        uplink_mbps: row.get(6)?,
        price_per_hour_cents: row.get(7)?,
        status: PcStatus::from_str(&status_str).unwrap_or(PcStatus::Offline),
        connection_host: row.get(9)?,
        connection_port: row.get(10)?,
        categories: split_csv(&categories),
        software_tags: split_csv(&software_tags),
    })
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

const PC_COLUMNS: &str = "id, host_id, cpu, gpu, ram_gb, storage_gb, uplink_mbps, price_per_hour_cents, status, connection_host, connection_port, categories, software_tags";

pub fn get_pc(tx: &Transaction, pc_id: &str) -> rusqlite::Result<Option<Pc>> {
    tx.query_row(
        &format!("SELECT {PC_COLUMNS} FROM pcs WHERE id = ?1"),
        params![pc_id],
        map_pc_row,
    )
    .optional()
}

pub fn insert_pc(tx: &Transaction, pc: &Pc) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO pcs (id, host_id, cpu, gpu, ram_gb, storage_gb, uplink_mbps, price_per_hour_cents, status, connection_host, connection_port, categories, software_tags)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            pc.id,
            pc.host_id,
            pc.cpu,
            pc.gpu,
            pc.ram_gb,
            pc.storage_gb,
            pc.uplink_mbps,
            pc.price_per_hour_cents,
            pc.status.as_str(),
            pc.connection_host,
            pc.connection_port,
            pc.categories.join(","),
            pc.software_tags.join(","),
        ],
    )?;
    Ok(())
}

pub fn update_pc(tx: &Transaction, pc: &Pc) -> rusqlite::Result<usize> {
    tx.execute(
        "UPDATE pcs SET cpu = ?1, gpu = ?2, ram_gb = ?3, storage_gb = ?4, uplink_mbps = ?5,
         price_per_hour_cents = ?6, status = ?7, connection_host = ?8, connection_port = ?9,
         categories = ?10, software_tags = ?11 WHERE id = ?12",
        params![
            pc.cpu,
            pc.gpu,
            pc.ram_gb,
            pc.storage_gb,
            pc.uplink_mbps,
            pc.price_per_hour_cents,
            pc.status.as_str(),
            pc.connection_host,
            pc.connection_port,
            pc.categories.join(","),
            pc.software_tags.join(","),
            pc.id,
        ],
    )
}

pub fn set_pc_status(tx: &Transaction, pc_id: &str, status: PcStatus) -> rusqlite::Result<usize> {
    tx.execute(
        "UPDATE pcs SET status = ?1 WHERE id = ?2",
        params![status.as_str(), pc_id],
    )
}

/// Bulk status update used by heartbeat self-reports and host-down cascade
/// (§4.3): updates every non-OFFLINE PC of the host in one statement.
pub fn set_pcs_status_for_host(
    tx: &Transaction,
    host_user_id: &str,
    status: PcStatus,
    only_non_offline: bool,
) -> rusqlite::Result<usize> {
    if only_non_offline {
        tx.execute(
            "UPDATE pcs SET status = ?1 WHERE host_id = ?2 AND status != 'OFFLINE'",
            params![status.as_str(), host_user_id],
        )
    } else {
        tx.execute(
            "UPDATE pcs SET status = ?1 WHERE host_id = ?2",
            params![status.as_str(), host_user_id],
        )
    }
}

pub fn list_pcs(
    tx: &Transaction,
    status_filter: Option<PcStatus>,
    category_filter: &[String],
) -> rusqlite::Result<Vec<Pc>> {
    let mut stmt = tx.prepare(&format!("SELECT {PC_COLUMNS} FROM pcs ORDER BY id"))?;
    let rows = stmt.query_map([], map_pc_row)?;
    let mut out = Vec::new();
    for row in rows {
        let pc = row?;
        if let Some(status) = status_filter {
            if pc.status != status {
                continue;
            }
        }
        if !category_filter.is_empty()
            && !category_filter.iter().any(|c| pc.categories.contains(c))
        {
            continue;
        }
        out.push(pc);
    }
    Ok(out)
}

/// Remove a PC entirely (§6 `DELETE /pcs/:id`). Callers must verify
/// ownership and the absence of a non-terminal session before calling this.
pub fn delete_pc(tx: &Transaction, pc_id: &str) -> rusqlite::Result<usize> {
    tx.execute("DELETE FROM pcs WHERE id = ?1", params![pc_id])
}

pub fn list_non_offline_pc_ids_for_host(
    tx: &Transaction,
    host_user_id: &str,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = tx.prepare("SELECT id FROM pcs WHERE host_id = ?1 AND status != 'OFFLINE'")?;
    let rows = stmt.query_map(params![host_user_id], |row| row.get::<_, String>(0))?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_self_heals_and_debits() {
        let db = Db::open_in_memory().unwrap();
        let conn_rt = tokio::runtime::Runtime::new().unwrap();
        conn_rt.block_on(async {
            db.transaction(|tx| {
                let balance = get_or_create_wallet_balance_cents(tx, "u1").unwrap();
                assert_eq!(balance, 0);
                credit_wallet(tx, "u1", 2000).unwrap();
                debit_wallet(tx, "u1", 500, false).unwrap();
                Ok(())
            })
            .await
            .unwrap();

            let balance = db
                .transaction(|tx| {
                    Ok(get_or_create_wallet_balance_cents(tx, "u1").unwrap())
                })
                .await
                .unwrap();
            assert_eq!(balance, 1500);
        });
    }

    #[test]
    fn debit_fails_when_insufficient_and_not_bypassed() {
        let db = Db::open_in_memory().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result: Result<(), ApiError> = rt.block_on(db.transaction(|tx| {
            debit_wallet(tx, "poor-user", 500, false)
        }));
        assert!(matches!(result, Err(ApiError::InsufficientFunds)));
    }

    #[test]
    fn debit_allowed_with_bypass_even_when_insufficient() {
        let db = Db::open_in_memory().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result: Result<(), ApiError> = rt.block_on(db.transaction(|tx| {
            debit_wallet(tx, "poor-user", 500, true)
        }));
        assert!(result.is_ok());
    }
}
