//! Domain entities (§3). Each maps to one SQLite table (§3.1); the
//! `as_str`/`from_str` pairs below follow this codebase's existing
//! `auth::models::UserRole` convention for storing enums as `TEXT` columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Client,
    Host,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "CLIENT",
            Role::Host => "HOST",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CLIENT" => Some(Role::Client),
            "HOST" => Some(Role::Host),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PcStatus {
    Online,
    Offline,
    Busy,
}

impl PcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PcStatus::Online => "ONLINE",
            PcStatus::Offline => "OFFLINE",
            PcStatus::Busy => "BUSY",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ONLINE" => Some(PcStatus::Online),
            "OFFLINE" => Some(PcStatus::Offline),
            "BUSY" => Some(PcStatus::Busy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Pending,
    Active,
    Ended,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Ended => "ENDED",
            SessionStatus::Failed => "FAILED",
            SessionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(SessionStatus::Pending),
            "ACTIVE" => Some(SessionStatus::Active),
            "ENDED" => Some(SessionStatus::Ended),
            "FAILED" => Some(SessionStatus::Failed),
            "CANCELLED" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Ended | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn is_non_terminal(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FailureReason {
    Host,
    Client,
    Platform,
    None,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Host => "HOST",
            FailureReason::Client => "CLIENT",
            FailureReason::Platform => "PLATFORM",
            FailureReason::None => "NONE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "HOST" => Some(FailureReason::Host),
            "CLIENT" => Some(FailureReason::Client),
            "PLATFORM" => Some(FailureReason::Platform),
            "NONE" => Some(FailureReason::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueStatus {
    Waiting,
    /// Transient: the slot was handed to this entry but the bound session
    /// has not yet been confirmed created (see `queue::promote_next`).
    Promoted,
    Active,
    Cancelled,
    Expired,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Waiting => "WAITING",
            QueueStatus::Promoted => "PROMOTED",
            QueueStatus::Active => "ACTIVE",
            QueueStatus::Cancelled => "CANCELLED",
            QueueStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(QueueStatus::Waiting),
            "PROMOTED" => Some(QueueStatus::Promoted),
            "ACTIVE" => Some(QueueStatus::Active),
            "CANCELLED" => Some(QueueStatus::Cancelled),
            "EXPIRED" => Some(QueueStatus::Expired),
            _ => None,
        }
    }

    pub fn is_non_terminal(&self) -> bool {
        matches!(self, QueueStatus::Waiting | QueueStatus::Promoted | QueueStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReservationStatus {
    Scheduled,
    Active,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Scheduled => "SCHEDULED",
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(ReservationStatus::Scheduled),
            "ACTIVE" => Some(ReservationStatus::Active),
            "CANCELLED" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReliabilityEventType {
    HostDown,
    SessionFailed,
    SessionOk,
}

impl ReliabilityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReliabilityEventType::HostDown => "HOST_DOWN",
            ReliabilityEventType::SessionFailed => "SESSION_FAILED",
            ReliabilityEventType::SessionOk => "SESSION_OK",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "HOST_DOWN" => Some(ReliabilityEventType::HostDown),
            "SESSION_FAILED" => Some(ReliabilityEventType::SessionFailed),
            "SESSION_OK" => Some(ReliabilityEventType::SessionOk),
            _ => None,
        }
    }

    /// Score delta applied by this event type (§4.3).
    pub fn score_delta(&self) -> i64 {
        match self {
            ReliabilityEventType::SessionOk => 1,
            ReliabilityEventType::SessionFailed => -2,
            ReliabilityEventType::HostDown => -10,
        }
    }
}

/// Human-facing reliability label, derived from completion ratio (§4.3).
/// Kept independent from `reliability_score` — the two must never be
/// conflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReliabilityBadge {
    Novo,
    Confiavel,
    Instavel,
}

impl ReliabilityBadge {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReliabilityBadge::Novo => "NOVO",
            ReliabilityBadge::Confiavel => "CONFIAVEL",
            ReliabilityBadge::Instavel => "INSTAVEL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub role: Role,
    pub auth_provider: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub user_id: String,
    pub balance_cents: i64,
}

impl Wallet {
    pub fn balance(&self) -> f64 {
        self.balance_cents as f64 / 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostProfile {
    pub id: String,
    pub user_id: String,
    pub last_seen_at: DateTime<Utc>,
    pub sessions_total: i64,
    pub sessions_completed: i64,
    pub sessions_dropped: i64,
    pub last_drop_at: Option<DateTime<Utc>>,
    pub reliability_score: i64,
}

impl HostProfile {
    pub fn badge(&self) -> ReliabilityBadge {
        crate::reliability::derive_badge(self.sessions_total, self.sessions_completed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pc {
    pub id: String,
    pub host_id: String,
    pub cpu: String,
    pub gpu: String,
    pub ram_gb: i64,
    pub storage_gb: i64,
    pub uplink_mbps: i64,
    pub price_per_hour_cents: i64,
    pub status: PcStatus,
    pub connection_host: String,
    pub connection_port: i64,
    pub categories: Vec<String>,
    pub software_tags: Vec<String>,
}

impl Pc {
    pub fn price_per_hour(&self) -> f64 {
        self.price_per_hour_cents as f64 / 100.0
    }

    /// `connectAddress` resolution (§4.4): `host:port` pair.
    pub fn connect_address(&self) -> Option<String> {
        if self.connection_host.trim().is_empty() {
            None
        } else {
            Some(format!("{}:{}", self.connection_host, self.connection_port))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub pc_id: String,
    pub client_user_id: String,
    pub status: SessionStatus,
    pub minutes_purchased: i64,
    pub minutes_used: i64,
    pub price_per_hour_cents: i64,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub failure_reason: FailureReason,
    pub client_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn price_per_hour(&self) -> f64 {
        self.price_per_hour_cents as f64 / 100.0
    }

    /// Live `minutesUsed` for an ACTIVE session (§6, `GET /sessions/:id`):
    /// computed from wall-clock rather than the stored, settlement-time
    /// value.
    pub fn live_minutes_used(&self, now: DateTime<Utc>) -> i64 {
        match self.start_at {
            None => 0,
            Some(start) => {
                let elapsed_secs = (now - start).num_seconds();
                let minutes = if elapsed_secs <= 0 {
                    0
                } else {
                    (elapsed_secs + 59) / 60 // ceil
                };
                minutes.clamp(0, self.minutes_purchased)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: String,
    pub pc_id: String,
    pub user_id: String,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub minutes_purchased: i64,
    pub promoted_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: String,
    pub pc_id: String,
    pub user_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: ReservationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConnectToken {
    pub token: String,
    pub pc_id: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl StreamConnectToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilityEvent {
    pub id: i64,
    pub host_id: String,
    pub event_type: ReliabilityEventType,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_str_roundtrips() {
        for s in [SessionStatus::Pending, SessionStatus::Active, SessionStatus::Ended] {
            assert_eq!(SessionStatus::from_str(s.as_str()), Some(s));
        }
        for s in [PcStatus::Online, PcStatus::Offline, PcStatus::Busy] {
            assert_eq!(PcStatus::from_str(s.as_str()), Some(s));
        }
        for s in [QueueStatus::Waiting, QueueStatus::Promoted, QueueStatus::Active] {
            assert_eq!(QueueStatus::from_str(s.as_str()), Some(s));
        }
    }

    #[test]
    fn terminal_classification() {
        assert!(SessionStatus::Ended.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
    }

    #[test]
    fn pc_connect_address_prefers_host_port() {
        let pc = Pc {
            id: "pc1".into(),
            host_id: "h1".into(),
            cpu: "".into(),
            gpu: "".into(),
            ram_gb: 0,
            storage_gb: 0,
            uplink_mbps: 0,
            price_per_hour_cents: 1000,
            status: PcStatus::Online,
            connection_host: "10.0.0.5".into(),
            connection_port: 47990,
            categories: vec![],
            software_tags: vec![],
        };
        assert_eq!(pc.connect_address().as_deref(), Some("10.0.0.5:47990"));
    }

    #[test]
    fn live_minutes_used_clamps_future_start() {
        let now = Utc::now();
        let s = Session {
            id: "s1".into(),
            pc_id: "pc1".into(),
            client_user_id: "u1".into(),
            status: SessionStatus::Active,
            minutes_purchased: 60,
            minutes_used: 0,
            price_per_hour_cents: 1000,
            start_at: Some(now + chrono::Duration::seconds(30)),
            end_at: Some(now + chrono::Duration::seconds(3630)),
            failure_reason: FailureReason::None,
            client_ip: None,
            created_at: now,
        };
        assert_eq!(s.live_minutes_used(now), 0);
    }
}
