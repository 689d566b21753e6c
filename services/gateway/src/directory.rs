//! Tenant directory.
//!
//! # Purpose
//! Maps an incoming `(host, path)` onto a project record: custom hostname
//! first for public hosts, then the `/api/data/{slug}/…` path segment.
//! Lookups go through a short-TTL cache so the hot path rarely touches the
//! control store; any project mutation invalidates its entries. Secrets
//! arrive already decrypted from the store — resolution is where they are
//! first needed, for key comparison and JWT verification.

use crate::error::ApiError;
use crate::model::Project;
use crate::store::ControlStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const CACHE_TTL: Duration = Duration::from_secs(30);

/// How the project was found; domain-locking needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    CustomDomain,
    Slug,
}

pub struct TenantDirectory {
    store: Arc<dyn ControlStore>,
    cache: DashMap<String, (Project, Instant)>,
}

/// True for hosts that belong to local development: loopback and
/// link-local addresses never participate in custom-hostname routing.
pub fn is_local_host(host: &str) -> bool {
    let bare = host_without_port(host);
    if matches!(bare, "localhost" | "127.0.0.1" | "::1" | "0.0.0.0") {
        return true;
    }
    bare.starts_with("127.") || bare.starts_with("169.254.") || bare.starts_with("fe80:")
}

/// Strips `:port` (and IPv6 brackets) off a Host header value.
pub fn host_without_port(host: &str) -> &str {
    if let Some(stripped) = host.strip_prefix('[') {
        return stripped.split(']').next().unwrap_or(stripped);
    }
    host.rsplit_once(':')
        .map(|(name, port)| {
            if port.chars().all(|c| c.is_ascii_digit()) {
                name
            } else {
                host
            }
        })
        .unwrap_or(host)
}

/// Extracts the slug segment of a data-plane path (`/api/data/{slug}/…`).
pub fn slug_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/api/data/")?;
    let slug = rest.split('/').next()?;
    (!slug.is_empty()).then_some(slug)
}

impl TenantDirectory {
    pub fn new(store: Arc<dyn ControlStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache: DashMap::new(),
        })
    }

    fn cached(&self, key: &str) -> Option<Project> {
        let entry = self.cache.get(key)?;
        let (project, stored_at) = entry.value();
        if stored_at.elapsed() > CACHE_TTL {
            drop(entry);
            self.cache.remove(key);
            return None;
        }
        Some(project.clone())
    }

    fn remember(&self, key: String, project: &Project) {
        self.cache.insert(key, (project.clone(), Instant::now()));
    }

    pub async fn by_slug(&self, slug: &str) -> Result<Option<Project>, ApiError> {
        let key = format!("slug:{slug}");
        if let Some(project) = self.cached(&key) {
            return Ok(Some(project));
        }
        match self.store.get_project(slug).await {
            Ok(project) => {
                self.remember(key, &project);
                Ok(Some(project))
            }
            Err(crate::store::StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn by_domain(&self, host: &str) -> Result<Option<Project>, ApiError> {
        let key = format!("host:{host}");
        if let Some(project) = self.cached(&key) {
            return Ok(Some(project));
        }
        match self.store.find_by_domain(host).await {
            Ok(Some(project)) => {
                self.remember(key, &project);
                Ok(Some(project))
            }
            Ok(None) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Resolution algorithm: public hosts try the custom hostname first;
    /// local hosts (and public hosts with no domain match) fall back to the
    /// path slug.
    pub async fn resolve(
        &self,
        host: &str,
        path: &str,
    ) -> Result<Option<(Project, ResolvedVia)>, ApiError> {
        if !is_local_host(host) {
            if let Some(project) = self.by_domain(host_without_port(host)).await? {
                return Ok(Some((project, ResolvedVia::CustomDomain)));
            }
        }
        if let Some(slug) = slug_from_path(path) {
            if let Some(project) = self.by_slug(slug).await? {
                return Ok(Some((project, ResolvedVia::Slug)));
            }
        }
        Ok(None)
    }

    /// Domain-locking: a project with a custom hostname only accepts slug
    /// routing from admins or local development hosts.
    pub fn enforce_domain_lock(
        project: &Project,
        via: ResolvedVia,
        host: &str,
        is_admin: bool,
    ) -> Result<(), ApiError> {
        if project.custom_domain.is_some()
            && via == ResolvedVia::Slug
            && !is_admin
            && !is_local_host(host)
        {
            return Err(ApiError::Forbidden(
                "project is locked to its custom domain".to_string(),
            ));
        }
        Ok(())
    }

    /// Drops cache entries after a project mutation.
    pub fn invalidate(&self, slug: &str, custom_domain: Option<&str>) {
        self.cache.remove(&format!("slug:{slug}"));
        if let Some(domain) = custom_domain {
            self.cache.remove(&format!("host:{domain}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::store::{NewProject, ProjectPatch};

    async fn directory_with(slug: &str, domain: Option<&str>) -> (Arc<TenantDirectory>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store
            .create_project(NewProject {
                slug: slug.to_string(),
                display_name: slug.to_string(),
                custom_domain: domain.map(str::to_string),
                metadata: Default::default(),
            })
            .await
            .unwrap();
        (TenantDirectory::new(store.clone()), store)
    }

    #[test]
    fn local_host_detection() {
        assert!(is_local_host("localhost"));
        assert!(is_local_host("localhost:8080"));
        assert!(is_local_host("127.0.0.1:3000"));
        assert!(is_local_host("[::1]:443"));
        assert!(is_local_host("169.254.10.2"));
        assert!(!is_local_host("api.acme.com"));
    }

    #[test]
    fn slug_extraction() {
        assert_eq!(slug_from_path("/api/data/acme/customers"), Some("acme"));
        assert_eq!(slug_from_path("/api/data/acme"), Some("acme"));
        assert_eq!(slug_from_path("/api/control/projects"), None);
        assert_eq!(slug_from_path("/api/data/"), None);
    }

    #[tokio::test]
    async fn resolves_by_slug_on_local_host() {
        let (directory, _) = directory_with("acme", None).await;
        let (project, via) = directory
            .resolve("localhost:8080", "/api/data/acme/customers")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(project.slug, "acme");
        assert_eq!(via, ResolvedVia::Slug);
    }

    #[tokio::test]
    async fn resolves_by_custom_domain_on_public_host() {
        let (directory, _) = directory_with("acme", Some("api.acme.com")).await;
        let (project, via) = directory
            .resolve("api.acme.com", "/api/data/whatever/x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(project.slug, "acme");
        assert_eq!(via, ResolvedVia::CustomDomain);
    }

    #[tokio::test]
    async fn unknown_tenant_resolves_to_none() {
        let (directory, _) = directory_with("acme", None).await;
        let resolved = directory
            .resolve("localhost", "/api/data/ghost/t")
            .await
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn domain_lock_rejects_slug_routing() {
        let (directory, _) = directory_with("acme", Some("api.acme.com")).await;
        let (project, via) = directory
            .resolve("gateway.public.example", "/api/data/acme/t")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(via, ResolvedVia::Slug);
        let err =
            TenantDirectory::enforce_domain_lock(&project, via, "gateway.public.example", false)
                .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        // Admins and local hosts pass.
        TenantDirectory::enforce_domain_lock(&project, via, "gateway.public.example", true)
            .unwrap();
        TenantDirectory::enforce_domain_lock(&project, via, "localhost", false).unwrap();
    }

    #[tokio::test]
    async fn cache_serves_until_invalidated() {
        let (directory, store) = directory_with("acme", None).await;
        let first = directory.by_slug("acme").await.unwrap().unwrap();
        // Mutate behind the cache's back; the stale name is still served.
        store
            .update_project("acme", ProjectPatch {
                display_name: Some("renamed".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let cached = directory.by_slug("acme").await.unwrap().unwrap();
        assert_eq!(cached.display_name, first.display_name);
        directory.invalidate("acme", None);
        let fresh = directory.by_slug("acme").await.unwrap().unwrap();
        assert_eq!(fresh.display_name, "renamed");
    }
}
