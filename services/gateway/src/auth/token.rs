//! JWT minting and verification.
//!
//! Admin tokens are HS256 under the process-wide secret with a 12-hour
//! lifetime. Tenant-user tokens are HS256 under the tenant's own
//! `jwt_secret`; their claims are application-defined, so verification
//! returns them as raw JSON.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const ADMIN_TOKEN_TTL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminClaims {
    pub role: String,
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs() as i64
}

pub fn mint_admin_token(secret: &str, subject: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let now = now_epoch_seconds();
    let claims = AdminClaims {
        role: "admin".to_string(),
        sub: subject.to_string(),
        exp: now + ADMIN_TOKEN_TTL.as_secs() as i64,
        iat: now,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Verifies an admin bearer. Returns `None` on any failure, including a
/// token that verifies but lacks the admin role.
pub fn verify_admin_token(secret: &str, token: &str) -> Option<AdminClaims> {
    let validation = Validation::new(Algorithm::HS256);
    let decoded = jsonwebtoken::decode::<AdminClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .ok()?;
    (decoded.claims.role == "admin").then_some(decoded.claims)
}

/// Verifies a tenant-user token under the tenant's secret and returns its
/// claims verbatim.
pub fn verify_tenant_token(jwt_secret: &str, token: &str) -> Option<Value> {
    let mut validation = Validation::new(Algorithm::HS256);
    // Tenant tokens carry application-defined audiences.
    validation.validate_aud = false;
    let decoded = jsonwebtoken::decode::<Value>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &validation,
    )
    .ok()?;
    Some(decoded.claims)
}

/// Test-only minting of a tenant token with a `sub` claim.
#[cfg(test)]
pub fn mint_tenant_test_token(jwt_secret: &str, subject: &str) -> String {
    let claims = serde_json::json!({
        "sub": subject,
        "exp": now_epoch_seconds() + 3600,
    });
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
    .expect("mint test token")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_token_round_trips() {
        let token = mint_admin_token("secret", "root").unwrap();
        let claims = verify_admin_token("secret", &token).unwrap();
        assert_eq!(claims.role, "admin");
        assert_eq!(claims.sub, "root");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn wrong_secret_fails() {
        let token = mint_admin_token("secret", "root").unwrap();
        assert!(verify_admin_token("other", &token).is_none());
    }

    #[test]
    fn non_admin_role_fails() {
        // A tenant-user token signed with the same secret must not pass the
        // admin check even though the signature verifies.
        let claims = serde_json::json!({
            "role": "authenticated",
            "sub": "u1",
            "exp": now_epoch_seconds() + 3600,
            "iat": now_epoch_seconds(),
        });
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(verify_admin_token("secret", &token).is_none());
    }

    #[test]
    fn tenant_claims_surface_verbatim() {
        let token = mint_tenant_test_token("tenant-secret", "user-9");
        let claims = verify_tenant_token("tenant-secret", &token).unwrap();
        assert_eq!(claims["sub"], "user-9");
        assert!(verify_tenant_token("wrong", &token).is_none());
    }

    #[test]
    fn expired_tokens_fail() {
        let claims = serde_json::json!({
            "sub": "u1",
            "exp": now_epoch_seconds() - 120,
        });
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"s"),
        )
        .unwrap();
        assert!(verify_tenant_token("s", &token).is_none());
    }
}
