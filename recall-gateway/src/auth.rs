//! Bearer-token authentication.

use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use recall_core::UserId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// JWT claims.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: usize,
    /// Issued at (Unix timestamp)
    pub iat: usize,
}

/// Authentication state shared across requests.
#[derive(Clone)]
pub struct AuthState {
    pub jwt_secret: Arc<String>,
    pub token_expiry_secs: u64,
}

impl AuthState {
    pub fn new(jwt_secret: impl Into<String>, token_expiry_secs: u64) -> Self {
        Self {
            jwt_secret: Arc::new(jwt_secret.into()),
            token_expiry_secs,
        }
    }

    /// Use the configured secret, or a random one that lives as long as the
    /// process (tokens then do not survive a restart).
    pub fn from_config(jwt_secret: Option<&str>, token_expiry_secs: u64) -> Self {
        match jwt_secret {
            Some(secret) if !secret.is_empty() => Self::new(secret, token_expiry_secs),
            _ => {
                tracing::warn!("No JWT secret configured, generating an ephemeral one");
                let secret = format!("{}{}", uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
                Self::new(secret, token_expiry_secs)
            }
        }
    }

    pub fn generate_token(&self, user_id: &str) -> Result<String> {
        let now = chrono::Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            exp: now + self.token_expiry_secs as usize,
            iat: now,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )?;

        Ok(token)
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )?;

        Ok(token_data.claims)
    }
}

/// Identity of an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
}

/// Require a valid `Authorization: Bearer <jwt>` header and insert [`AuthUser`].
pub async fn auth_middleware(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = auth_state
        .validate_token(token)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let user_id = UserId::new(claims.sub).map_err(|e| {
        tracing::warn!(error = %e, "Token subject is not a valid user id");
        StatusCode::UNAUTHORIZED
    })?;

    request.extensions_mut().insert(AuthUser { user_id });
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        let auth = AuthState::new("test-secret-key-32-bytes-long!!", 3600);
        let token = auth.generate_token("user123").unwrap();
        let claims = auth.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "user123");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn invalid_token_is_rejected() {
        let auth = AuthState::new("test-secret-key-32-bytes-long!!", 3600);
        assert!(auth.validate_token("invalid-token").is_err());
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let issuer = AuthState::new("first-secret-key-32-bytes-long!", 3600);
        let verifier = AuthState::new("second-secret-key-32-bytes-long", 3600);
        let token = issuer.generate_token("user123").unwrap();
        assert!(verifier.validate_token(&token).is_err());
    }

    #[test]
    fn missing_secret_generates_ephemeral_one() {
        let a = AuthState::from_config(None, 60);
        let b = AuthState::from_config(Some(""), 60);
        assert_ne!(a.jwt_secret, b.jwt_secret);
        assert!(a.jwt_secret.len() >= 64);

        let token = a.generate_token("user123").unwrap();
        assert!(a.validate_token(&token).is_ok());
    }
}
