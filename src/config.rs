//! Application configuration, loaded from the environment at boot.
//!
//! Mirrors the shape of this codebase's existing `models::Config::from_env`:
//! every tunable has a documented default and is parsed leniently (a bad
//! value falls back to the default rather than panicking).

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub app_env: String,
    pub jwt_secret: String,

    pub platform_fee_rate: f64,
    pub host_penalty_rate: f64,

    pub session_expiration_interval_ms: u64,
    pub host_heartbeat_timeout_ms: u64,
    pub host_heartbeat_timeout_active_ms: u64,
    pub host_heartbeat_check_interval_ms: u64,
    pub host_offline_grace_seconds: u64,
    pub host_offline_grace_active_seconds: u64,
    pub queue_promotion_ttl_seconds: u64,
    pub stream_connect_token_ttl_ms: u64,

    pub relay_max_payload_bytes: usize,
    pub relay_host_bytes_per_sec: u64,
    pub relay_control_msgs_per_sec: u32,
    pub relay_connect_attempts_per_min: u32,
    pub relay_room_linger_seconds: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let stream_connect_token_ttl_ms =
            env_parse("STREAM_CONNECT_TOKEN_TTL_MS", 3_600_000u64).max(60_000);

        Self {
            port: env_parse("PORT", 3333),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./marketplace.db".to_string()),
            app_env: env::var("APP_ENV")
                .or_else(|_| env::var("RUST_ENV"))
                .unwrap_or_else(|_| "development".to_string()),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_else(|_| "dev-secret".to_string()),

            platform_fee_rate: env_parse("PLATFORM_FEE_RATE", 0.1),
            host_penalty_rate: env_parse("HOST_PENALTY_RATE", 0.3),

            session_expiration_interval_ms: env_parse("SESSION_EXPIRATION_INTERVAL_MS", 30_000),
            host_heartbeat_timeout_ms: env_parse("HOST_HEARTBEAT_TIMEOUT_MS", 60_000),
            host_heartbeat_timeout_active_ms: env_parse(
                "HOST_HEARTBEAT_TIMEOUT_ACTIVE_MS",
                180_000,
            ),
            host_heartbeat_check_interval_ms: env_parse(
                "HOST_HEARTBEAT_CHECK_INTERVAL_MS",
                30_000,
            ),
            host_offline_grace_seconds: env_parse("HOST_OFFLINE_GRACE_SECONDS", 45),
            host_offline_grace_active_seconds: env_parse(
                "HOST_OFFLINE_GRACE_ACTIVE_SECONDS",
                120,
            ),
            queue_promotion_ttl_seconds: env_parse("QUEUE_PROMOTION_TTL_SECONDS", 90),
            stream_connect_token_ttl_ms,

            relay_max_payload_bytes: env_parse("RELAY_MAX_PAYLOAD_BYTES", 2_097_152),
            relay_host_bytes_per_sec: env_parse("RELAY_HOST_BYTES_PER_SEC", 20_000_000),
            relay_control_msgs_per_sec: env_parse("RELAY_CONTROL_MSGS_PER_SEC", 20),
            relay_connect_attempts_per_min: env_parse("RELAY_CONNECT_ATTEMPTS_PER_MIN", 6),
            relay_room_linger_seconds: env_parse("RELAY_ROOM_LINGER_SECONDS", 10),
        }
    }

    /// Dev-bypass headers (`x-dev-bypass-credits`, `x-user-id`) are only
    /// honored outside production, per §4.7 / §9.
    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_token_ttl_has_a_floor() {
        std::env::set_var("STREAM_CONNECT_TOKEN_TTL_MS", "100");
        let cfg = Config::from_env();
        assert_eq!(cfg.stream_connect_token_ttl_ms, 60_000);
        std::env::remove_var("STREAM_CONNECT_TOKEN_TTL_MS");
    }

    #[test]
    fn production_detection_is_case_insensitive() {
        let mut cfg = Config::from_env();
        cfg.app_env = "Production".to_string();
        assert!(cfg.is_production());
        cfg.app_env = "development".to_string();
        assert!(!cfg.is_production());
    }
}
