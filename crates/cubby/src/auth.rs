//! WebSocket authentication.
//!
//! Credentials are issued externally; the gateway only verifies them. The
//! token rides in the `Sec-WebSocket-Protocol` header as `jwt.<token>`,
//! since browsers cannot set arbitrary headers on WebSocket upgrades.

use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing websocket token")]
    MissingToken,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("authentication required but no JWT secret configured")]
    NotConfigured,
}

/// Auth settings, loaded with the rest of the server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the credential issuer.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    /// When false, unauthenticated connections are admitted as the dev user.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            required: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: usize,
}

/// Verifies upgrade requests before the socket is accepted.
#[derive(Debug, Clone)]
pub struct AuthVerifier {
    config: AuthConfig,
}

impl AuthVerifier {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Authenticate an upgrade request, returning the user id.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        if !self.config.required {
            return Ok(extract_token(headers)
                .and_then(|t| self.verify(&t).ok())
                .unwrap_or_else(|| "dev".to_string()));
        }

        let secret = self
            .config
            .jwt_secret
            .as_deref()
            .ok_or(AuthError::NotConfigured)?;
        let token = extract_token(headers).ok_or(AuthError::MissingToken)?;
        verify_with_secret(&token, secret)
    }

    fn verify(&self, token: &str) -> Result<String, AuthError> {
        let secret = self
            .config
            .jwt_secret
            .as_deref()
            .ok_or(AuthError::NotConfigured)?;
        verify_with_secret(token, secret)
    }
}

fn verify_with_secret(token: &str, secret: &str) -> Result<String, AuthError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AuthError::InvalidToken)?;
    Ok(data.claims.sub)
}

/// Pull the `jwt.<token>` entry out of the offered websocket subprotocols.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())?;
    for part in raw.split(',').map(|s| s.trim()) {
        if let Some(rest) = part.strip_prefix("jwt.") {
            if !rest.is_empty() {
                return Some(rest.to_string());
            }
        }
    }
    None
}

/// Issue a token for `user_id`, valid for `ttl_secs`. Used by tests and by
/// deployments where the gateway doubles as the credential issuer.
pub fn generate_token(secret: &str, user_id: &str, ttl_secs: u64) -> Result<String, AuthError> {
    let exp = chrono::Utc::now().timestamp() as usize + ttl_secs as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AuthError::InvalidToken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-secret-for-auth-tests-minimum-32-chars";

    fn headers_with_protocols(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "sec-websocket-protocol",
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    fn verifier(required: bool) -> AuthVerifier {
        AuthVerifier::new(AuthConfig {
            jwt_secret: Some(SECRET.to_string()),
            required,
        })
    }

    #[test]
    fn valid_token_authenticates() {
        let token = generate_token(SECRET, "alice", 60).unwrap();
        let headers = headers_with_protocols(&format!("cubby, jwt.{token}"));
        assert_eq!(verifier(true).authenticate(&headers).unwrap(), "alice");
    }

    #[test]
    fn missing_token_is_rejected() {
        let headers = HeaderMap::new();
        assert!(matches!(
            verifier(true).authenticate(&headers),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let headers = headers_with_protocols("jwt.not-a-jwt");
        assert!(matches!(
            verifier(true).authenticate(&headers),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = generate_token("some-other-secret-of-sufficient-len", "alice", 60).unwrap();
        let headers = headers_with_protocols(&format!("jwt.{token}"));
        assert!(matches!(
            verifier(true).authenticate(&headers),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn optional_auth_admits_dev_user() {
        let headers = HeaderMap::new();
        assert_eq!(verifier(false).authenticate(&headers).unwrap(), "dev");
    }

    #[test]
    fn optional_auth_still_honors_tokens() {
        let token = generate_token(SECRET, "bob", 60).unwrap();
        let headers = headers_with_protocols(&format!("jwt.{token}"));
        assert_eq!(verifier(false).authenticate(&headers).unwrap(), "bob");
    }
}
