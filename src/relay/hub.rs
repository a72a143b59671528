//! Relay hub (§4.5): in-memory WebSocket rooms pairing one host and one
//! client per `streamId`, with rate limiting and backpressure handling.
//! Room state uses per-room `parking_lot::Mutex` locking, matching this
//! codebase's `middleware::rate_limit` sliding-window style for the
//! connect-attempt limiter.

use super::protocol::{self, close_code, ControlMessage, Role};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{info, warn};

#[derive(Clone)]
pub struct RelayConfig {
    pub max_payload_bytes: usize,
    pub host_bytes_per_sec: u64,
    pub control_msgs_per_sec: u32,
    pub connect_attempts_per_min: u32,
    pub room_linger_seconds: u64,
}

struct Peer {
    sender: mpsc::Sender<Message>,
    user_id: String,
}

struct Room {
    host: Option<Peer>,
    client: Option<Peer>,
    host_bytes_this_second: u64,
    host_bytes_window_start: Instant,
    client_msgs_this_second: u32,
    client_msgs_window_start: Instant,
    empty_since: Option<Instant>,
}

impl Room {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            host: None,
            client: None,
            host_bytes_this_second: 0,
            host_bytes_window_start: now,
            client_msgs_this_second: 0,
            client_msgs_window_start: now,
            empty_since: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.host.is_none() && self.client.is_none()
    }
}

struct ConnectAttempts {
    count: u32,
    window_start: Instant,
}

#[derive(Clone)]
pub struct RelayHub {
    rooms: Arc<Mutex<HashMap<String, Arc<Mutex<Room>>>>>,
    connect_attempts: Arc<Mutex<HashMap<(IpAddr, String, String), ConnectAttempts>>>,
    config: RelayConfig,
}

const SEND_QUEUE_DEPTH: usize = 64;

impl RelayHub {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            connect_attempts: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Per-`(ip, user, session)` connect rate limit (§4.5, default 6/min).
    pub fn check_connect_rate(&self, ip: IpAddr, user_id: &str, session_id: &str) -> bool {
        let mut attempts = self.connect_attempts.lock();
        let now = Instant::now();
        let key = (ip, user_id.to_string(), session_id.to_string());
        let entry = attempts.entry(key).or_insert(ConnectAttempts {
            count: 0,
            window_start: now,
        });
        if now.duration_since(entry.window_start) >= Duration::from_secs(60) {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;
        if entry.count > self.config.connect_attempts_per_min {
            warn!(user_id, session_id, %ip, "relay_connect_denied_rate");
            return false;
        }
        true
    }

    fn room(&self, stream_id: &str) -> Arc<Mutex<Room>> {
        let mut rooms = self.rooms.lock();
        rooms
            .entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Room::new())))
            .clone()
    }

    /// Remove empty rooms past their linger window. Call periodically from a
    /// background sweep; also invoked inline after a peer disconnects.
    pub fn sweep_empty_rooms(&self) {
        let linger = Duration::from_secs(self.config.room_linger_seconds);
        let mut rooms = self.rooms.lock();
        rooms.retain(|_, room| {
            let room = room.lock();
            match room.empty_since {
                Some(since) => Instant::now().duration_since(since) < linger,
                None => true,
            }
        });
    }

    /// Drive one accepted socket for the lifetime of the connection
    /// (§4.5 forwarding rules). `role`/`user_id`/`stream_id` were already
    /// validated by the handshake.
    pub async fn run_peer(&self, socket: WebSocket, role: Role, user_id: String, stream_id: String) {
        let room_handle = self.room(&stream_id);
        let (tx, mut rx) = mpsc::channel::<Message>(SEND_QUEUE_DEPTH);

        let previous = {
            let mut room = room_handle.lock();
            room.empty_since = None;
            let slot = match role {
                Role::Host => &mut room.host,
                Role::Client => &mut room.client,
            };
            let previous = slot.take();
            *slot = Some(Peer {
                sender: tx.clone(),
                user_id: user_id.clone(),
            });
            previous
        };

        if let Some(previous) = previous {
            let _ = previous
                .sender
                .send(close_message(close_code::SUPERSEDED, "superseded"))
                .await;
            info!(stream_id, user_id, role = role_tag(role), "peer superseded prior connection");
        }

        let (mut ws_sink, mut ws_stream) = socket.split();

        let config = self.config.clone();
        let room_for_recv = room_handle.clone();
        let stream_id_for_recv = stream_id.clone();

        let recv_task = async move {
            while let Some(Ok(msg)) = ws_stream.next().await {
                match (&role, &msg) {
                    (Role::Host, Message::Binary(bytes)) => {
                        if bytes.len() > config.max_payload_bytes {
                            continue;
                        }
                        if !check_and_count_host_bytes(&room_for_recv, bytes.len() as u64, config.host_bytes_per_sec) {
                            continue;
                        }
                        forward_to(&room_for_recv, Role::Client, Message::Binary(bytes.clone())).await;
                    }
                    (Role::Client, Message::Text(text)) => {
                        if text.len() > 4096 {
                            continue;
                        }
                        if !check_and_count_client_msgs(&room_for_recv, config.control_msgs_per_sec) {
                            continue;
                        }
                        if !is_recognized_control_message(text) {
                            continue;
                        }
                        forward_to(&room_for_recv, Role::Host, Message::Text(text.clone())).await;
                    }
                    (_, Message::Close(_)) => break,
                    // Wrong-direction payload combos are dropped per §4.5.
                    _ => {}
                }
            }
            let _ = stream_id_for_recv;
        };

        let send_task = async move {
            while let Some(msg) = rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if ws_sink.send(msg).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
        };

        tokio::select! {
            _ = recv_task => {}
            _ = send_task => {}
        }

        self.on_peer_disconnect(&room_handle, role, &user_id, &stream_id);
    }

    fn on_peer_disconnect(&self, room_handle: &Arc<Mutex<Room>>, role: Role, user_id: &str, stream_id: &str) {
        let became_empty = {
            let mut room = room_handle.lock();
            let slot = match role {
                Role::Host => &mut room.host,
                Role::Client => &mut room.client,
            };
            // Only clear if we're still the current occupant (a superseding
            // peer may have already taken the slot).
            if slot.as_ref().map(|p| p.user_id.as_str()) == Some(user_id) {
                *slot = None;
            }
            if room.is_empty() {
                room.empty_since = Some(Instant::now());
                true
            } else {
                false
            }
        };
        info!(stream_id, user_id, role = role_tag(role), "relay peer disconnected");
        if became_empty {
            self.sweep_empty_rooms();
        }
    }
}

fn role_tag(role: Role) -> &'static str {
    match role {
        Role::Host => "host",
        Role::Client => "client",
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

async fn forward_to(room_handle: &Arc<Mutex<Room>>, target: Role, msg: Message) {
    let sender = {
        let room = room_handle.lock();
        let slot = match target {
            Role::Host => &room.host,
            Role::Client => &room.client,
        };
        slot.as_ref().map(|p| p.sender.clone())
    };
    let Some(sender) = sender else {
        // No peer on the other side yet: discard, no buffering (§4.5).
        return;
    };
    if sender.try_send(msg).is_err() {
        // Either the queue is full (slow receiver) or the peer has gone
        // away; either way drop this frame rather than block the relay.
        let _ = sender.try_send(close_message(close_code::BACKPRESSURE, "backpressure"));
    }
}

fn check_and_count_host_bytes(room_handle: &Arc<Mutex<Room>>, bytes: u64, cap_per_sec: u64) -> bool {
    let mut room = room_handle.lock();
    let now = Instant::now();
    if now.duration_since(room.host_bytes_window_start) >= Duration::from_secs(1) {
        room.host_bytes_this_second = 0;
        room.host_bytes_window_start = now;
    }
    if room.host_bytes_this_second + bytes > cap_per_sec {
        return false;
    }
    room.host_bytes_this_second += bytes;
    true
}

fn check_and_count_client_msgs(room_handle: &Arc<Mutex<Room>>, cap_per_sec: u32) -> bool {
    let mut room = room_handle.lock();
    let now = Instant::now();
    if now.duration_since(room.client_msgs_window_start) >= Duration::from_secs(1) {
        room.client_msgs_this_second = 0;
        room.client_msgs_window_start = now;
    }
    if room.client_msgs_this_second >= cap_per_sec {
        return false;
    }
    room.client_msgs_this_second += 1;
    true
}

fn is_recognized_control_message(text: &str) -> bool {
    match serde_json::from_str::<ControlMessage>(text) {
        Ok(msg) => protocol::is_known_control_type(&msg.kind),
        Err(_) => false,
    }
}

/// Spawn the periodic room-linger sweep (§2.1-style ticker). Never aborts.
pub async fn run_sweep_ticker(hub: RelayHub, period: Duration) {
    let mut tick = interval(period);
    loop {
        tick.tick().await;
        hub.sweep_empty_rooms();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RelayConfig {
        RelayConfig {
            max_payload_bytes: 2 * 1024 * 1024,
            host_bytes_per_sec: 1000,
            control_msgs_per_sec: 5,
            connect_attempts_per_min: 3,
            room_linger_seconds: 10,
        }
    }

    #[test]
    fn connect_rate_limit_denies_past_threshold() {
        let hub = RelayHub::new(test_config());
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..3 {
            assert!(hub.check_connect_rate(ip, "u1", "s1"));
        }
        assert!(!hub.check_connect_rate(ip, "u1", "s1"));
    }

    #[test]
    fn host_byte_cap_denies_over_budget_within_window() {
        let room = Arc::new(Mutex::new(Room::new()));
        assert!(check_and_count_host_bytes(&room, 600, 1000));
        assert!(!check_and_count_host_bytes(&room, 600, 1000));
    }

    #[test]
    fn client_control_rate_caps_per_second() {
        let room = Arc::new(Mutex::new(Room::new()));
        for _ in 0..5 {
            assert!(check_and_count_client_msgs(&room, 5));
        }
        assert!(!check_and_count_client_msgs(&room, 5));
    }

    #[test]
    fn unknown_control_type_is_rejected() {
        assert!(!is_recognized_control_message(r#"{"type":"shutdown"}"#));
        assert!(is_recognized_control_message(r#"{"type":"keyframe_request"}"#));
    }
}
