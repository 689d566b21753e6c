//! Authorisation.
//!
//! # Purpose
//! Credential extraction and the role state machine: admin tokens, tenant
//! API keys, and tenant-user JWTs collapse into one of three roles that
//! drive both the RLS GUC and access to privileged endpoints.

mod token;

pub use token::{
    ADMIN_TOKEN_TTL, AdminClaims, mint_admin_token, verify_admin_token, verify_tenant_token,
};

use crate::error::ApiError;
use crate::model::Project;
use serde_json::Value;
use subtle::ConstantTimeEq;

/// Paths that may proceed unauthenticated because they *are* the
/// authentication flow: OAuth callbacks, passwordless starts, token
/// refresh, and MFA challenges.
const AUTH_FLOW_ALLOWLIST: [&str; 6] = [
    "/auth/callback",
    "/auth/passwordless",
    "/auth/refresh",
    "/auth/challenge",
    "/auth/magiclink",
    "/auth/verify-otp",
];

/// The three data-plane roles, in descending privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestRole {
    ServiceRole,
    Authenticated,
    Anon,
}

impl RequestRole {
    /// Value for `SET LOCAL role`; a fixed vocabulary, never user input.
    pub fn as_guc(&self) -> &'static str {
        match self {
            RequestRole::ServiceRole => "service_role",
            RequestRole::Authenticated => "authenticated",
            RequestRole::Anon => "anon",
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, RequestRole::ServiceRole)
    }
}

/// Authorisation result attached to the request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub role: RequestRole,
    /// Tenant-user claims when the bearer verified under the project's JWT
    /// secret.
    pub claims: Option<Value>,
    /// True when the process-wide admin secret verified the bearer.
    pub is_admin: bool,
}

impl AuthContext {
    pub fn admin() -> Self {
        Self {
            role: RequestRole::ServiceRole,
            claims: None,
            is_admin: true,
        }
    }
}

/// Credentials pulled off the request by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub bearer: Option<String>,
    pub apikey: Option<String>,
}

fn ct_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn is_auth_flow_path(path: &str) -> bool {
    AUTH_FLOW_ALLOWLIST
        .iter()
        .any(|allowed| path.ends_with(allowed) || path.contains(&format!("{allowed}/")))
}

/// The state machine of §authorisation: first match wins.
pub fn authorize(
    project: &Project,
    credentials: &Credentials,
    path: &str,
    verified_admin: bool,
) -> Result<AuthContext, ApiError> {
    if verified_admin {
        return Ok(AuthContext::admin());
    }

    let secrets = &project.secrets;
    if let Some(bearer) = credentials.bearer.as_deref() {
        if ct_eq(bearer, &secrets.service_key) {
            return Ok(AuthContext {
                role: RequestRole::ServiceRole,
                claims: None,
                is_admin: false,
            });
        }
        if ct_eq(bearer, &secrets.anon_key) {
            return Ok(AuthContext {
                role: RequestRole::Anon,
                claims: None,
                is_admin: false,
            });
        }
    }
    if let Some(apikey) = credentials.apikey.as_deref() {
        if ct_eq(apikey, &secrets.service_key) {
            return Ok(AuthContext {
                role: RequestRole::ServiceRole,
                claims: None,
                is_admin: false,
            });
        }
    }
    if let Some(bearer) = credentials.bearer.as_deref() {
        if let Some(claims) = verify_tenant_token(&secrets.jwt_secret, bearer) {
            return Ok(AuthContext {
                role: RequestRole::Authenticated,
                claims: Some(claims),
                is_admin: false,
            });
        }
    }
    if let Some(apikey) = credentials.apikey.as_deref() {
        if ct_eq(apikey, &secrets.anon_key) {
            return Ok(AuthContext {
                role: RequestRole::Anon,
                claims: None,
                is_admin: false,
            });
        }
    }
    if is_auth_flow_path(path) {
        return Ok(AuthContext {
            role: RequestRole::Anon,
            claims: None,
            is_admin: false,
        });
    }
    Err(ApiError::Unauthorized(
        "missing or invalid credentials".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProjectMetadata, ProjectSecrets, ProjectStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn project() -> Project {
        Project {
            id: Uuid::new_v4(),
            slug: "acme".to_string(),
            display_name: "Acme".to_string(),
            db_name: "tenant_acme".to_string(),
            custom_domain: None,
            status: ProjectStatus::Active,
            blocked_ips: Vec::new(),
            metadata: ProjectMetadata::default(),
            secrets: ProjectSecrets {
                anon_key: "anon-key".to_string(),
                service_key: "service-key".to_string(),
                jwt_secret: "jwt-secret".to_string(),
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn creds(bearer: Option<&str>, apikey: Option<&str>) -> Credentials {
        Credentials {
            bearer: bearer.map(str::to_string),
            apikey: apikey.map(str::to_string),
        }
    }

    #[test]
    fn verified_admin_wins_over_everything() {
        let ctx = authorize(&project(), &creds(Some("junk"), None), "/x", true).unwrap();
        assert!(ctx.is_admin);
        assert_eq!(ctx.role, RequestRole::ServiceRole);
    }

    #[test]
    fn service_key_bearer_is_service_role() {
        let ctx = authorize(&project(), &creds(Some("service-key"), None), "/x", false).unwrap();
        assert_eq!(ctx.role, RequestRole::ServiceRole);
        assert!(!ctx.is_admin);
    }

    #[test]
    fn anon_key_bearer_is_anon() {
        let ctx = authorize(&project(), &creds(Some("anon-key"), None), "/x", false).unwrap();
        assert_eq!(ctx.role, RequestRole::Anon);
    }

    #[test]
    fn service_apikey_beats_user_jwt() {
        let token = token::mint_tenant_test_token("jwt-secret", "u1");
        let ctx = authorize(
            &project(),
            &creds(Some(&token), Some("service-key")),
            "/x",
            false,
        )
        .unwrap();
        // apikey=service_key is checked before the bearer JWT per the
        // first-match-wins ordering.
        assert_eq!(ctx.role, RequestRole::ServiceRole);
    }

    #[test]
    fn tenant_jwt_is_authenticated_with_claims() {
        let token = token::mint_tenant_test_token("jwt-secret", "u1");
        let ctx = authorize(&project(), &creds(Some(&token), None), "/x", false).unwrap();
        assert_eq!(ctx.role, RequestRole::Authenticated);
        assert_eq!(
            ctx.claims.unwrap().get("sub").and_then(|v| v.as_str()),
            Some("u1")
        );
    }

    #[test]
    fn foreign_jwt_is_rejected() {
        let token = token::mint_tenant_test_token("other-secret", "u1");
        let err = authorize(&project(), &creds(Some(&token), None), "/x", false).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[test]
    fn anon_apikey_is_anon() {
        let ctx = authorize(&project(), &creds(None, Some("anon-key")), "/x", false).unwrap();
        assert_eq!(ctx.role, RequestRole::Anon);
    }

    #[test]
    fn auth_flow_paths_pass_without_credentials() {
        let ctx = authorize(
            &project(),
            &creds(None, None),
            "/api/data/acme/auth/refresh",
            false,
        )
        .unwrap();
        assert_eq!(ctx.role, RequestRole::Anon);
    }

    #[test]
    fn everything_else_is_401() {
        let err = authorize(&project(), &creds(None, None), "/api/data/acme/t", false)
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }
}
