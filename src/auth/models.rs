//! Authentication models
//!
//! The platform does not mint user identities itself — a separate
//! authentication gateway verifies credentials and hands this service a
//! signed JWT. All we decode is `sub` (the user id) and `exp`.

use serde::{Deserialize, Serialize};

/// Claims carried by the gateway-issued JWT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the authenticated user's id.
    pub sub: String,
    /// Expiration timestamp (seconds since epoch).
    pub exp: usize,
}

/// The caller identity resolved by the ingress layer (§4.7), attached to
/// the request via `req.extensions_mut()` the same way `auth::middleware`
/// attaches `Claims` upstream.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    /// True if this identity was resolved from the trusted `x-user-id`
    /// dev header rather than a verified JWT.
    pub dev_trusted: bool,
}
