//! Request ingress (§4.7): resolves the caller's identity from either a
//! Bearer JWT or a trusted dev header, derives the dev-bypass-credits flag,
//! and extracts the client IP. Mirrors this codebase's existing
//! `auth_middleware` shape (token extraction, `req.extensions_mut().insert`)
//! generalized past the single-Bearer-only flow.

use crate::auth::jwt::JwtHandler;
use crate::auth::models::Identity;
use crate::config::Config;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct IngressState {
    pub jwt: Arc<JwtHandler>,
    pub config: Arc<Config>,
}

/// Resolves an `Identity` per §4.7 and stashes it (plus the caller IP and
/// dev-bypass flag) in request extensions for handlers to read.
pub async fn ingress_middleware(
    State(state): State<IngressState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut req: Request,
    next: Next,
) -> Result<Response, IngressError> {
    let identity = resolve_identity(&state, req.headers())?;
    let client_ip = extract_client_ip(req.headers(), peer);
    let bypass_credits = dev_bypass_allowed(&state, req.headers());

    req.extensions_mut().insert(identity);
    req.extensions_mut().insert(ClientIp(client_ip));
    req.extensions_mut().insert(DevBypassCredits(bypass_credits));

    Ok(next.run(req).await)
}

fn resolve_identity(
    state: &IngressState,
    headers: &axum::http::HeaderMap,
) -> Result<Identity, IngressError> {
    if let Some(token) = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
    {
        let claims = state
            .jwt
            .decode_token(token)
            .map_err(|_| IngressError::InvalidToken)?;
        return Ok(Identity {
            user_id: claims.sub,
            dev_trusted: false,
        });
    }

    if !state.config.is_production() {
        if let Some(user_id) = headers.get("x-user-id").and_then(|h| h.to_str().ok()) {
            return Ok(Identity {
                user_id: user_id.to_string(),
                dev_trusted: true,
            });
        }
    }

    Err(IngressError::MissingIdentity)
}

/// `x-dev-bypass-credits: true` is only honored outside production (§4.7,
/// §9): the flag must be unreachable in production regardless of header
/// presence.
fn dev_bypass_allowed(state: &IngressState, headers: &axum::http::HeaderMap) -> bool {
    if state.config.is_production() {
        return false;
    }
    headers
        .get("x-dev-bypass-credits")
        .and_then(|h| h.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// `x-forwarded-for`'s first non-`unknown` token, else the transport peer
/// (§4.7).
fn extract_client_ip(headers: &axum::http::HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        for token in forwarded.split(',') {
            let token = token.trim();
            if !token.is_empty() && !token.eq_ignore_ascii_case("unknown") {
                return token.to_string();
            }
        }
    }
    peer.ip().to_string()
}

#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

#[derive(Debug, Clone, Copy)]
pub struct DevBypassCredits(pub bool);

pub fn extract_identity(req: &Request) -> Option<&Identity> {
    req.extensions().get::<Identity>()
}

pub fn extract_client_ip_ext(req: &Request) -> Option<&ClientIp> {
    req.extensions().get::<ClientIp>()
}

pub fn extract_bypass_credits(req: &Request) -> bool {
    req.extensions()
        .get::<DevBypassCredits>()
        .map(|b| b.0)
        .unwrap_or(false)
}

#[derive(Debug)]
pub enum IngressError {
    MissingIdentity,
    InvalidToken,
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let message = match self {
            IngressError::MissingIdentity => "missing or unresolvable identity",
            IngressError::InvalidToken => "invalid or expired token",
        };
        (StatusCode::UNAUTHORIZED, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    fn state(app_env: &str) -> IngressState {
        IngressState {
            jwt: Arc::new(JwtHandler::new("test-secret".to_string())),
            config: Arc::new(Config {
                app_env: app_env.to_string(),
                ..Config::from_env()
            }),
        }
    }

    #[test]
    fn dev_header_accepted_outside_production() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "user-123".parse().unwrap());
        let identity = resolve_identity(&state("development"), &headers).unwrap();
        assert_eq!(identity.user_id, "user-123");
        assert!(identity.dev_trusted);
    }

    #[test]
    fn dev_header_rejected_in_production() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "user-123".parse().unwrap());
        let result = resolve_identity(&state("production"), &headers);
        assert!(matches!(result, Err(IngressError::MissingIdentity)));
    }

    #[test]
    fn bearer_token_resolves_identity() {
        let jwt = JwtHandler::new("test-secret".to_string());
        let token = jwt.encode_token("user-abc", 1).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {token}").parse().unwrap());
        let identity = resolve_identity(&state("development"), &headers).unwrap();
        assert_eq!(identity.user_id, "user-abc");
        assert!(!identity.dev_trusted);
    }

    #[test]
    fn dev_bypass_requires_non_production_and_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-dev-bypass-credits", "true".parse().unwrap());
        assert!(dev_bypass_allowed(&state("development"), &headers));
        assert!(!dev_bypass_allowed(&state("production"), &headers));
    }

    #[test]
    fn client_ip_prefers_first_known_forwarded_token() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "unknown, 1.2.3.4, 5.6.7.8".parse().unwrap());
        let peer: SocketAddr = "9.9.9.9:1234".parse().unwrap();
        assert_eq!(extract_client_ip(&headers, peer), "1.2.3.4");
    }
}
