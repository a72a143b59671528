//! Stream connect-token issuance and resolution (§4.4).

use crate::db::{self, now_str, parse_dt, to_str, Db};
use crate::errors::ApiError;
use crate::models::{Pc, SessionStatus};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::RngCore;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

#[derive(Clone)]
pub struct StreamTokenService {
    db: Db,
    ttl_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConnection {
    pub connect_address: String,
    pub connect_hint: String,
    pub pc_name: String,
}

impl StreamTokenService {
    pub fn new(db: Db, ttl_ms: u64) -> Self {
        Self { db, ttl_ms: ttl_ms.max(60_000) }
    }

    pub async fn issue(&self, pc_id: &str, user_id: &str, caller_ip: Option<&str>) -> Result<IssuedToken, ApiError> {
        let pc_id = pc_id.to_string();
        let user_id = user_id.to_string();
        let caller_ip = caller_ip.map(|s| s.to_string());
        let ttl_ms = self.ttl_ms;
        self.db
            .transaction(move |tx| issue_tx(tx, &pc_id, &user_id, caller_ip.as_deref(), ttl_ms))
            .await
    }

    pub async fn resolve(&self, token: &str) -> Result<ResolvedConnection, ApiError> {
        let token = token.to_string();
        self.db.transaction(move |tx| resolve_tx(tx, &token)).await
    }

    pub async fn get_pc_and_session_for_relay(
        &self,
        token: &str,
    ) -> Result<(crate::models::StreamConnectToken, Pc, crate::models::Session), ApiError> {
        let token = token.to_string();
        self.db.transaction(move |tx| lookup_for_relay_tx(tx, &token)).await
    }
}

fn find_token(tx: &Transaction, token: &str) -> rusqlite::Result<Option<crate::models::StreamConnectToken>> {
    tx.query_row(
        "SELECT token, pc_id, user_id, expires_at, consumed_at FROM stream_tokens WHERE token = ?1",
        params![token],
        |row| {
            Ok(crate::models::StreamConnectToken {
                token: row.get(0)?,
                pc_id: row.get(1)?,
                user_id: row.get(2)?,
                expires_at: parse_dt(&row.get::<_, String>(3)?),
                consumed_at: crate::db::parse_dt_opt(row.get(4)?),
            })
        },
    )
    .optional()
}

fn issue_tx(
    tx: &Transaction,
    pc_id: &str,
    user_id: &str,
    caller_ip: Option<&str>,
    ttl_ms: u64,
) -> Result<IssuedToken, ApiError> {
    let session = tx
        .query_row(
            "SELECT id, client_ip FROM sessions WHERE pc_id = ?1 AND client_user_id = ?2 AND status = 'ACTIVE'",
            params![pc_id, user_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()
        .map_err(ApiError::from)?
        .ok_or(ApiError::SessionNotActive)?;
    let (session_id, existing_ip) = session;

    if existing_ip.is_none() {
        if let Some(ip) = caller_ip {
            // Conditional update: only write if still unset, so a concurrent
            // writer cannot clobber an IP recorded first (§4.4).
            tx.execute(
                "UPDATE sessions SET client_ip = ?1 WHERE id = ?2 AND client_ip IS NULL",
                params![ip, session_id],
            )
            .map_err(ApiError::from)?;
        }
    }

    let mut raw = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut raw);
    let token = URL_SAFE_NO_PAD.encode(raw);

    let expires_at = Utc::now() + chrono::Duration::milliseconds(ttl_ms as i64);
    tx.execute(
        "INSERT INTO stream_tokens (token, pc_id, user_id, expires_at, consumed_at) VALUES (?1, ?2, ?3, ?4, NULL)",
        params![token, pc_id, user_id, to_str(expires_at)],
    )
    .map_err(ApiError::from)?;

    info!(pc_id, user_id, "stream connect-token issued");
    Ok(IssuedToken { token, expires_at })
}

fn resolve_tx(tx: &Transaction, token: &str) -> Result<ResolvedConnection, ApiError> {
    let record = find_token(tx, token).map_err(ApiError::from)?.ok_or(ApiError::TokenInvalid)?;

    if record.consumed_at.is_some() {
        return Err(ApiError::TokenConsumed);
    }
    if record.is_expired(Utc::now()) {
        return Err(ApiError::TokenExpired);
    }

    let session = tx
        .query_row(
            "SELECT status FROM sessions WHERE pc_id = ?1 AND client_user_id = ?2 ORDER BY created_at DESC LIMIT 1",
            params![record.pc_id, record.user_id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(ApiError::from)?;
    let status = session.and_then(|s| SessionStatus::from_str(&s));
    if !matches!(status, Some(SessionStatus::Pending) | Some(SessionStatus::Active)) {
        return Err(ApiError::SessionNotActive);
    }

    let pc = db::get_pc(tx, &record.pc_id).map_err(ApiError::from)?.ok_or(ApiError::PcNotFound)?;
    let connect_address = pc.connect_address().ok_or(ApiError::SessionNotActive)?;

    // Single-use consumption, race-safe: only succeeds while still unconsumed.
    let updated = tx
        .execute(
            "UPDATE stream_tokens SET consumed_at = ?1 WHERE token = ?2 AND consumed_at IS NULL",
            params![now_str(), token],
        )
        .map_err(ApiError::from)?;
    if updated == 0 {
        return Err(ApiError::TokenConsumed);
    }

    info!(pc_id = %pc.id, "stream token resolved");
    Ok(ResolvedConnection {
        connect_address: connect_address.clone(),
        connect_hint: format!("Connect with your Moonlight-compatible client to {connect_address}"),
        pc_name: pc.id,
    })
}

fn lookup_for_relay_tx(
    tx: &Transaction,
    token: &str,
) -> Result<(crate::models::StreamConnectToken, Pc, crate::models::Session), ApiError> {
    let record = find_token(tx, token).map_err(ApiError::from)?.ok_or(ApiError::TokenInvalid)?;
    if record.is_expired(Utc::now()) {
        return Err(ApiError::TokenExpired);
    }
    let pc = db::get_pc(tx, &record.pc_id).map_err(ApiError::from)?.ok_or(ApiError::PcNotFound)?;
    let session = crate::session::find_active_session_for_pc(tx, &record.pc_id)
        .map_err(ApiError::from)?
        .ok_or(ApiError::SessionNotActive)?;
    Ok((record, pc, session))
}

/// Deterministic SHA-256-prefix identifier used as the relay room key
/// (§4.4). Formatted as a UUID-like 8-4-4-4-12 hex string; does not leak the
/// token itself.
pub fn derive_stream_id(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    let hex = &hex[..32];
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PcStatus, Role};

    fn seed_active_session(tx: &Transaction, pc_id: &str, host_id: &str, client_id: &str) -> String {
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
            status: PcStatus::Busy,
            connection_host: "10.0.0.1".into(),
            connection_port: 47990,
            categories: vec![],
            software_tags: vec![],
        };
        db::insert_pc(tx, &pc).unwrap();
        db::get_or_create_user(tx, client_id, Role::Client).unwrap();
        let session_id = uuid::Uuid::new_v4().to_string();
        let now = now_str();
        tx.execute(
            "INSERT INTO sessions (id, pc_id, client_user_id, status, minutes_purchased, minutes_used,
                price_per_hour_cents, start_at, end_at, failure_reason, client_ip, created_at)
             VALUES (?1, ?2, ?3, 'ACTIVE', 60, 0, 1000, ?4, ?4, 'NONE', NULL, ?4)",
            params![session_id, pc_id, client_id, now],
        )
        .unwrap();
        session_id
    }

    #[tokio::test]
    async fn issue_then_resolve_returns_connect_address() {
        let db = Db::open_in_memory().unwrap();
        db.transaction(|tx| {
            seed_active_session(tx, "pc1", "host1", "c1");
            Ok::<(), ApiError>(())
        })
        .await
        .unwrap();

        let svc = StreamTokenService::new(db, 3_600_000);
        let issued = svc.issue("pc1", "c1", Some("1.2.3.4")).await.unwrap();
        let resolved = svc.resolve(&issued.token).await.unwrap();
        assert_eq!(resolved.connect_address, "10.0.0.1:47990");
    }

    #[tokio::test]
    async fn second_resolve_of_same_token_conflicts() {
        let db = Db::open_in_memory().unwrap();
        db.transaction(|tx| {
            seed_active_session(tx, "pc1", "host1", "c1");
            Ok::<(), ApiError>(())
        })
        .await
        .unwrap();

        let svc = StreamTokenService::new(db, 3_600_000);
        let issued = svc.issue("pc1", "c1", None).await.unwrap();
        svc.resolve(&issued.token).await.unwrap();
        let second = svc.resolve(&issued.token).await;
        assert!(matches!(second, Err(ApiError::TokenConsumed)));
    }

    #[test]
    fn derive_stream_id_is_deterministic_and_uuid_shaped() {
        let a = derive_stream_id("abc123");
        let b = derive_stream_id("abc123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 36);
        assert_eq!(a.chars().filter(|c| *c == '-').count(), 4);
    }
}
