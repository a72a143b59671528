//! Relay wire types (§4.5/§6): the host→client binary frame header and the
//! client→host control JSON schema.

use serde::{Deserialize, Serialize};

/// `role` query param on the `/stream/relay` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

impl Role {
    pub fn from_query(s: &str) -> Option<Self> {
        match s {
            "host" => Some(Role::Host),
            "client" => Some(Role::Client),
            _ => None,
        }
    }
}

/// Query parameters accepted on the relay handshake.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayHandshake {
    pub role: String,
    pub session_id: String,
    pub stream_id: String,
    pub token: String,
    pub user_id: String,
}

/// Host→client binary frame header: `flags(1) | timestampUs_be(8) | annexB…`.
pub const FRAME_HEADER_LEN: usize = 9;

pub fn encode_frame_header(flags: u8, timestamp_us: u64) -> [u8; FRAME_HEADER_LEN] {
    let mut buf = [0u8; FRAME_HEADER_LEN];
    buf[0] = flags;
    buf[1..9].copy_from_slice(&timestamp_us.to_be_bytes());
    buf
}

pub fn split_frame_header(frame: &[u8]) -> Option<(u8, u64, &[u8])> {
    if frame.len() < FRAME_HEADER_LEN {
        return None;
    }
    let flags = frame[0];
    let ts = u64::from_be_bytes(frame[1..9].try_into().ok()?);
    Some((flags, ts, &frame[FRAME_HEADER_LEN..]))
}

/// Client→host control message (§6). Only `type` is required; the rest are
/// payload fields depending on the message kind.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub token: Option<String>,
    pub session_id: Option<String>,
    pub stream_id: Option<String>,
    pub loss_pct: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub freeze_ms: Option<f64>,
    pub requested_bitrate_kbps: Option<f64>,
    pub reason: Option<String>,
}

pub const KNOWN_CONTROL_TYPES: &[&str] = &["keyframe_request", "network_report", "reconnect"];

pub fn is_known_control_type(kind: &str) -> bool {
    KNOWN_CONTROL_TYPES.contains(&kind)
}

/// WebSocket close codes used across the handshake and forwarding paths
/// (§6). Axum's `CloseFrame` takes a numeric code; application-level codes
/// live in the private-use range 4000-4999.
pub mod close_code {
    pub const TOKEN_INVALID: u16 = 4001;
    pub const SESSION_NOT_ACTIVE: u16 = 4002;
    pub const ROLE_MISMATCH: u16 = 4003;
    pub const SUPERSEDED: u16 = 4004;
    pub const ROOM_CLOSED: u16 = 4005;
    pub const RATE_LIMITED: u16 = 4006;
    pub const BACKPRESSURE: u16 = 4007;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_round_trips() {
        let header = encode_frame_header(1, 123_456_789);
        let mut frame = header.to_vec();
        frame.extend_from_slice(&[0, 0, 0, 1, 0x65]);
        let (flags, ts, payload) = split_frame_header(&frame).unwrap();
        assert_eq!(flags, 1);
        assert_eq!(ts, 123_456_789);
        assert_eq!(payload, &[0, 0, 0, 1, 0x65]);
    }

    #[test]
    fn short_frame_has_no_header() {
        assert!(split_frame_header(&[1, 2, 3]).is_none());
    }

    #[test]
    fn control_type_allowlist() {
        assert!(is_known_control_type("keyframe_request"));
        assert!(!is_known_control_type("shutdown"));
    }
}
