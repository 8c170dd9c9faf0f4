//! Caller identity for the WebSocket upgrade.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;
use trench_core::ids::UserId;

/// Resolves the authenticated user for an upgrade request.
pub trait IdentityProvider: Send + Sync {
    /// The caller's user, or `None` when the request carries no valid
    /// credentials. `query_token` is the `?token=` query parameter.
    fn authenticate(&self, headers: &HeaderMap, query_token: Option<&str>) -> Option<UserId>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    sub: Option<String>,
}

/// HS256 bearer tokens whose `user_id` (or `sub`) claim is a UUID.
pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityProvider {
    /// Validate tokens signed with `secret`. When `issuer` is set, the `iss`
    /// claim must match it. Tokens must carry `exp`.
    pub fn new(secret: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    fn verify(&self, token: &str) -> Option<UserId> {
        let data = match jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => data,
            Err(e) => {
                debug!(error = %e, "rejecting token");
                return None;
            }
        };
        let Claims { user_id, sub } = data.claims;
        user_id.or(sub).as_deref().and_then(UserId::parse)
    }
}

impl IdentityProvider for JwtIdentityProvider {
    fn authenticate(&self, headers: &HeaderMap, query_token: Option<&str>) -> Option<UserId> {
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty());
        bearer.or(query_token).and_then(|token| self.verify(token))
    }
}
