pub mod hub;
pub mod protocol;

pub use hub::{run_sweep_ticker, RelayConfig, RelayHub};
pub use protocol::{RelayHandshake, Role as RelayRole};

use crate::errors::ApiError;
use crate::models::{Pc, Session};
use crate::stream_token::StreamTokenService;

/// Validate a `/stream/relay` handshake (§4.5 steps 1-4): resolve the token,
/// verify the session is still pending/active, verify the `streamId` the
/// caller presented matches the token-derived one, and verify role binding.
pub async fn validate_handshake(
    tokens: &StreamTokenService,
    handshake: &RelayHandshake,
) -> Result<(RelayRole, Pc, Session), ApiError> {
    let role = RelayRole::from_query(&handshake.role)
        .ok_or_else(|| ApiError::BadRequest("role must be host or client".into()))?;

    let (token, pc, session) = tokens.get_pc_and_session_for_relay(&handshake.token).await?;

    if token.pc_id != pc.id {
        return Err(ApiError::Forbidden);
    }
    if session.id != handshake.session_id {
        return Err(ApiError::Forbidden);
    }
    if crate::stream_token::derive_stream_id(&handshake.token) != handshake.stream_id {
        return Err(ApiError::BadRequest("streamId does not match token".into()));
    }

    let bound_ok = match role {
        RelayRole::Client => handshake.user_id == session.client_user_id,
        RelayRole::Host => handshake.user_id == pc.host_id,
    };
    if !bound_ok {
        return Err(ApiError::Forbidden);
    }

    Ok((role, pc, session))
}
