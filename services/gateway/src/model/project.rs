//! Project (tenant) records.
//!
//! # Purpose
//! The control-plane record for one isolated customer environment: slug,
//! physical database, decrypted secrets, firewall blocklist, status, and
//! the metadata bag.

use super::ProjectMetadata;
use cascata_pool::PoolConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Suspended,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::Suspended => "suspended",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "suspended" => ProjectStatus::Suspended,
            _ => ProjectStatus::Active,
        }
    }
}

/// Decrypted per-project secrets. Held in memory only; never serialised
/// into API responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSecrets {
    pub anon_key: String,
    pub service_key: String,
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Project {
    pub id: Uuid,
    /// Globally unique, URL-safe identifier; doubles as the data-plane path
    /// segment.
    pub slug: String,
    pub display_name: String,
    /// Physical database name inside the managed cluster. Ignored when an
    /// external primary URL is configured.
    pub db_name: String,
    pub custom_domain: Option<String>,
    pub status: ProjectStatus,
    pub blocked_ips: Vec<String>,
    pub metadata: ProjectMetadata,
    #[serde(skip)]
    #[schema(ignore)]
    pub secrets: ProjectSecrets,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which database a request should run against, resolved from the project
/// and the access pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolTarget {
    /// Identifier handed to the pool registry.
    pub db: String,
    pub config: PoolConfig,
}

impl Project {
    /// True when the tenant's primary database lives outside the platform.
    pub fn is_ejected(&self) -> bool {
        self.metadata.external_db_url.is_some()
    }

    /// Selector rule: external primary wins outright; reads go to the
    /// replica when one exists; everything else uses the internal pool for
    /// the tenant database.
    pub fn pool_target(&self, is_read: bool) -> PoolTarget {
        if self.is_ejected() {
            return PoolTarget {
                db: self.db_name.clone(),
                config: self.metadata.pool_config(),
            };
        }
        if is_read {
            if let Some(config) = self.metadata.replica_pool_config() {
                return PoolTarget {
                    db: self.db_name.clone(),
                    config,
                };
            }
        }
        PoolTarget {
            db: self.db_name.clone(),
            config: self.metadata.pool_config(),
        }
    }

    /// Validates a slug: lowercase alphanumerics and dashes, must not be
    /// empty or start/end with a dash.
    pub fn valid_slug(slug: &str) -> bool {
        !slug.is_empty()
            && slug.len() <= 63
            && slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !slug.starts_with('-')
            && !slug.ends_with('-')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_validation() {
        assert!(Project::valid_slug("acme"));
        assert!(Project::valid_slug("acme-2"));
        assert!(!Project::valid_slug(""));
        assert!(!Project::valid_slug("-acme"));
        assert!(!Project::valid_slug("acme-"));
        assert!(!Project::valid_slug("Acme"));
        assert!(!Project::valid_slug("a/b"));
        assert!(!Project::valid_slug(&"a".repeat(64)));
    }

    #[test]
    fn pool_target_prefers_external_primary() {
        let mut project = sample();
        project.metadata.external_db_url =
            Some("postgres://u:p@tenant.example.com/db".to_string());
        project.metadata.replica_db_url =
            Some("postgres://u:p@replica.example.com/db".to_string());
        // Even reads go to the external primary; the replica selector only
        // applies to managed tenants.
        let target = project.pool_target(true);
        assert_eq!(
            target.config.connection_string.as_deref(),
            Some("postgres://u:p@tenant.example.com/db")
        );
    }

    #[test]
    fn pool_target_routes_reads_to_replica() {
        let mut project = sample();
        project.metadata.replica_db_url =
            Some("postgres://u:p@replica.example.com/db".to_string());
        let read = project.pool_target(true);
        assert_eq!(
            read.config.connection_string.as_deref(),
            Some("postgres://u:p@replica.example.com/db")
        );
        let write = project.pool_target(false);
        assert!(write.config.connection_string.is_none());
        assert_eq!(write.db, "tenant_acme");
    }

    #[test]
    fn pool_target_defaults_internal() {
        let target = sample().pool_target(true);
        assert!(target.config.connection_string.is_none());
        assert_eq!(target.db, "tenant_acme");
    }

    fn sample() -> Project {
        Project {
            id: Uuid::new_v4(),
            slug: "acme".to_string(),
            display_name: "Acme".to_string(),
            db_name: "tenant_acme".to_string(),
            custom_domain: None,
            status: ProjectStatus::Active,
            blocked_ips: Vec::new(),
            metadata: ProjectMetadata::default(),
            secrets: super::ProjectSecrets {
                anon_key: "a".to_string(),
                service_key: "s".to_string(),
                jwt_secret: "j".to_string(),
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn status_round_trips() {
        assert_eq!(ProjectStatus::parse("active"), ProjectStatus::Active);
        assert_eq!(ProjectStatus::parse("suspended"), ProjectStatus::Suspended);
        assert_eq!(ProjectStatus::parse("junk"), ProjectStatus::Active);
    }
}
