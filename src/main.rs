//! Binary entry point: load configuration, open the database, construct
//! `AppState`, spawn the background tickers (§2.1), and serve the HTTP/WS
//! router.

mod api;
mod auth;
mod config;
mod db;
mod errors;
mod heartbeat;
mod middleware;
mod models;
mod queue;
mod relay;
mod reliability;
mod reservations;
mod session;
mod settlement;
mod stream_token;

use auth::{IngressState, JwtHandler};
use axum::middleware as axum_mw;
use axum::routing::{get, post};
use axum::Router;
use config::Config;
use db::Db;
use heartbeat::HeartbeatService;
use middleware::rate_limit::{RateLimitConfig, RateLimitLayer};
use queue::QueueManager;
use relay::{RelayConfig, RelayHub};
use reservations::ReservationService;
use session::SessionService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stream_token::StreamTokenService;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub sessions: SessionService,
    pub queue: QueueManager,
    pub heartbeat: HeartbeatService,
    pub stream_tokens: StreamTokenService,
    pub reservations: ReservationService,
    pub relay: RelayHub,
    pub config: Arc<Config>,
    pub server_instance_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env());
    let db = Db::open(&config.database_path)?;

    let sessions = SessionService::new(db.clone(), config.platform_fee_rate, config.host_penalty_rate);
    let queue = QueueManager::new(db.clone(), config.queue_promotion_ttl_seconds);
    let heartbeat = HeartbeatService::new(
        db.clone(),
        sessions.clone(),
        config.host_heartbeat_timeout_ms,
        config.host_heartbeat_timeout_active_ms,
        config.host_offline_grace_seconds,
        config.host_offline_grace_active_seconds,
    );
    let stream_tokens = StreamTokenService::new(db.clone(), config.stream_connect_token_ttl_ms);
    let reservations = ReservationService::new(db.clone());
    let relay_hub = RelayHub::new(RelayConfig {
        max_payload_bytes: config.relay_max_payload_bytes,
        host_bytes_per_sec: config.relay_host_bytes_per_sec,
        control_msgs_per_sec: config.relay_control_msgs_per_sec,
        connect_attempts_per_min: config.relay_connect_attempts_per_min,
        room_linger_seconds: config.relay_room_linger_seconds,
    });

    let state = AppState {
        db,
        sessions: sessions.clone(),
        queue: queue.clone(),
        heartbeat: heartbeat.clone(),
        stream_tokens,
        reservations,
        relay: relay_hub.clone(),
        config: config.clone(),
        server_instance_id: uuid::Uuid::new_v4().to_string(),
    };

    spawn_tickers(&state, &sessions, &queue, &heartbeat, &relay_hub);

    let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let ingress_state = IngressState {
        jwt,
        config: config.clone(),
    };

    let protected_routes = Router::new()
        .route("/sessions", post(api::sessions::create_session))
        .route("/sessions/:id/start", post(api::sessions::start_session))
        .route("/sessions/:id/end", post(api::sessions::end_session))
        .route("/sessions/:id", get(api::sessions::get_session))
        .route("/pcs", get(api::pcs::list_pcs).post(api::pcs::create_pc))
        .route(
            "/pcs/:id",
            get(api::pcs::get_pc)
                .put(api::pcs::update_pc)
                .patch(api::pcs::update_pc)
                .delete(api::pcs::delete_pc),
        )
        .route("/pcs/:id/status", post(api::pcs::set_pc_status))
        .route("/pcs/:pcId/queue/join", post(api::queue::join_queue))
        .route("/pcs/:pcId/queue/leave", post(api::queue::leave_queue))
        .route("/pcs/:pcId/queue", get(api::queue::queue_status))
        .route("/my/queue/updates", get(api::queue::my_queue_updates))
        .route(
            "/pcs/:pcId/reservations",
            post(api::reservations::create_reservation).get(api::reservations::list_reservations),
        )
        .route("/reservations/:id", axum::routing::delete(api::reservations::cancel_reservation))
        .route("/stream/connect-token", post(api::stream::connect_token))
        .route("/stream/pairing", post(api::stream::pairing))
        .route("/hosts/heartbeat", post(api::hosts::heartbeat))
        .route_layer(axum_mw::from_fn_with_state(ingress_state, auth::ingress_middleware))
        .with_state(state.clone());

    let public_routes = Router::new()
        .route("/health", get(api::health::health_check))
        .route("/stream/resolve", post(api::stream::resolve_token))
        .route("/stream/relay", get(api::relay_ws::relay_handler))
        .with_state(state);

    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());
    spawn_rate_limit_cleanup(rate_limiter.clone());

    let app = Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .layer(axum_mw::from_fn_with_state(
            rate_limiter,
            middleware::rate_limit::rate_limit_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(middleware::logging::request_logging));

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "deskmarket backend listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn spawn_tickers(
    state: &AppState,
    sessions: &SessionService,
    queue: &QueueManager,
    heartbeat: &HeartbeatService,
    relay_hub: &RelayHub,
) {
    let session_interval = Duration::from_millis(state.config.session_expiration_interval_ms);
    let sessions = sessions.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(session_interval);
        loop {
            tick.tick().await;
            let expired = sessions.expire_sessions().await;
            if expired > 0 {
                tracing::info!(expired, "session expiration sweep");
            }
        }
    });

    let heartbeat_interval = Duration::from_millis(state.config.host_heartbeat_check_interval_ms);
    let heartbeat = heartbeat.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(heartbeat_interval);
        loop {
            tick.tick().await;
            let timed_out = heartbeat.handle_timeouts().await;
            if timed_out > 0 {
                tracing::info!(timed_out, "host heartbeat timeout sweep");
            }
        }
    });

    let promotion_interval = Duration::from_millis(state.config.host_heartbeat_check_interval_ms);
    let queue = queue.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(promotion_interval);
        loop {
            tick.tick().await;
            let expired = queue.expire_promoted_slots().await;
            if expired > 0 {
                tracing::info!(expired, "queue promotion TTL sweep");
            }
        }
    });

    let relay_hub = relay_hub.clone();
    let linger = Duration::from_secs(state.config.relay_room_linger_seconds);
    tokio::spawn(async move {
        relay::run_sweep_ticker(relay_hub, linger).await;
    });
}

fn spawn_rate_limit_cleanup(limiter: RateLimitLayer) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(120));
        loop {
            tick.tick().await;
            limiter.cleanup();
        }
    });
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "deskmarket_backend=debug,tower_http=debug".into()))
        .with(fmt::layer())
        .init();
}
