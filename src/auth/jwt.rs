//! JWT decoding for gateway-issued tokens.
//!
//! This service never mints user-facing tokens (that's the external
//! authentication gateway's job, per §1's collaborator list); it only
//! validates `Authorization: Bearer` tokens and reads `sub`. `encode_token`
//! is kept around for tests, which stand in for the gateway.

use crate::auth::models::Claims;
use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};

pub struct JwtHandler {
    secret: String,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    pub fn decode_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("invalid or expired token")?;
        Ok(decoded.claims)
    }

    /// Mint a token for the given user id. Used by tests and by any
    /// trusted internal caller that needs to simulate the gateway.
    pub fn encode_token(&self, user_id: &str, ttl_hours: i64) -> Result<String> {
        let exp = Utc::now()
            .checked_add_signed(chrono::Duration::hours(ttl_hours))
            .context("invalid timestamp")?
            .timestamp() as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("failed to encode token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_token_it_encoded() {
        let handler = JwtHandler::new("test-secret".to_string());
        let token = handler.encode_token("user-42", 1).unwrap();
        let claims = handler.decode_token(&token).unwrap();
        assert_eq!(claims.sub, "user-42");
    }

    #[test]
    fn rejects_token_from_different_secret() {
        let a = JwtHandler::new("secret-a".to_string());
        let b = JwtHandler::new("secret-b".to_string());
        let token = a.encode_token("user-1", 1).unwrap();
        assert!(b.decode_token(&token).is_err());
    }

    #[test]
    fn rejects_garbage_token() {
        let handler = JwtHandler::new("test-secret".to_string());
        assert!(handler.decode_token("not.a.jwt").is_err());
    }
}
