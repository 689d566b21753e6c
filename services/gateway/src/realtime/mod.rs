//! Realtime bridge.
//!
//! # Purpose
//! One dedicated LISTEN session per tenant with live interest, held outside
//! any pool — the transaction-mode pooler silently breaks `LISTEN`, so the
//! bridge always dials the direct server (or the tenant's own URL for
//! ejected projects). Notifications fan out to SSE subscribers over a
//! broadcast channel and are forwarded to the event dispatcher that feeds
//! the rule engine and webhook fan-out.
//!
//! Interest is refcounted two ways: live SSE subscribers, and a "pin" for
//! tenants whose rules or webhooks need events even with zero subscribers.
//! When both reach zero the LISTEN session is torn down.

use crate::config::GatewayConfig;
use crate::error::ApiError;
use crate::model::{ChangeEvent, Project};
use dashmap::DashMap;
use sqlx::postgres::PgListener;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Hard cap of concurrent SSE subscribers per project.
pub const MAX_SUBSCRIBERS_PER_PROJECT: usize = 5_000;

/// Channel the bridge listens on; matches the row trigger installed by
/// table creation.
pub const NOTIFY_CHANNEL: &str = "cascata_events";

const BROADCAST_CAPACITY: usize = 1_024;

struct TenantChannel {
    sender: broadcast::Sender<ChangeEvent>,
    subscribers: usize,
    /// Rules/webhooks keep the listener alive without any subscriber.
    pinned: bool,
    listener: tokio::task::JoinHandle<()>,
}

pub struct RealtimeBridge {
    config: Arc<GatewayConfig>,
    tenants: DashMap<String, TenantChannel>,
    /// Every received event is also handed to the dispatcher (rule engine,
    /// webhook fan-out) tagged with its project slug.
    events: mpsc::UnboundedSender<(String, ChangeEvent)>,
    /// Unset only in tests, where no database is reachable.
    spawn_listeners: bool,
    /// Self-reference handed to listener tasks and subscriber guards.
    weak: Weak<RealtimeBridge>,
}

/// A live SSE subscription. Dropping it (or the guard extracted from it)
/// releases the slot and tears the listener down once the tenant has no
/// remaining interest.
pub struct Subscription {
    pub client_id: String,
    pub receiver: broadcast::Receiver<ChangeEvent>,
    guard: SubscriberGuard,
}

impl Subscription {
    /// Splits the subscription so the guard can ride inside a response
    /// stream while the receiver is consumed.
    pub fn into_parts(self) -> (String, broadcast::Receiver<ChangeEvent>, SubscriberGuard) {
        (self.client_id, self.receiver, self.guard)
    }
}

pub struct SubscriberGuard {
    bridge: Arc<RealtimeBridge>,
    slug: String,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.bridge.release(&self.slug);
    }
}

impl RealtimeBridge {
    pub fn new(
        config: Arc<GatewayConfig>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, ChangeEvent)>) {
        Self::build(config, true)
    }

    /// Bridge with listener spawning disabled, for tests that exercise the
    /// subscriber bookkeeping without a database.
    #[cfg(test)]
    pub(crate) fn new_detached(
        config: Arc<GatewayConfig>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, ChangeEvent)>) {
        Self::build(config, false)
    }

    fn build(
        config: Arc<GatewayConfig>,
        spawn_listeners: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, ChangeEvent)>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let bridge = Arc::new_cyclic(|weak| Self {
            config,
            tenants: DashMap::new(),
            events,
            spawn_listeners,
            weak: weak.clone(),
        });
        (bridge, receiver)
    }

    /// LISTEN connection string: the tenant's own URL for ejected projects,
    /// otherwise the direct (pool-bypassing) server.
    fn listen_url(&self, project: &Project) -> String {
        if let Some(external) = &project.metadata.external_db_url {
            return external.clone();
        }
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.config.db_user,
            self.config.db_pass,
            self.config.db_direct_host,
            self.config.db_direct_port,
            project.db_name
        )
    }

    /// Ensures a LISTEN task exists for the tenant; the critical section
    /// only touches the map, never I/O.
    fn ensure_channel(&self, project: &Project) -> broadcast::Sender<ChangeEvent> {
        if let Some(entry) = self.tenants.get(&project.slug) {
            return entry.sender.clone();
        }
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        let listener = if self.spawn_listeners {
            self.spawn_listener(project, sender.clone())
        } else {
            tokio::spawn(std::future::pending())
        };
        let entry = TenantChannel {
            sender: sender.clone(),
            subscribers: 0,
            pinned: false,
            listener,
        };
        match self.tenants.entry(project.slug.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                // Another caller won the race; discard our task.
                entry.listener.abort();
                existing.get().sender.clone()
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
                sender
            }
        }
    }

    fn spawn_listener(
        &self,
        project: &Project,
        sender: broadcast::Sender<ChangeEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let url = self.listen_url(project);
        let slug = project.slug.clone();
        let weak = self.weak.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let teardown = |slug: &str| {
                if let Some(bridge) = weak.upgrade() {
                    bridge.teardown(slug);
                }
            };
            let mut listener = match PgListener::connect(&url).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::warn!(slug = %slug, error = %err, "realtime listener connect failed");
                    teardown(&slug);
                    return;
                }
            };
            if let Err(err) = listener.listen(NOTIFY_CHANNEL).await {
                tracing::warn!(slug = %slug, error = %err, "LISTEN failed");
                teardown(&slug);
                return;
            }
            tracing::info!(slug = %slug, "realtime listener up");
            metrics::gauge!("cascata_realtime_listeners").increment(1.0);
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let Ok(event) =
                            serde_json::from_str::<ChangeEvent>(notification.payload())
                        else {
                            tracing::debug!(slug = %slug, "unparseable notify payload");
                            continue;
                        };
                        let _ = events.send((slug.clone(), event.clone()));
                        // No receivers is fine; the pin may be the only
                        // interest.
                        let _ = sender.send(event);
                    }
                    Err(err) => {
                        tracing::warn!(slug = %slug, error = %err, "realtime listener error");
                        break;
                    }
                }
            }
            metrics::gauge!("cascata_realtime_listeners").decrement(1.0);
            // Tear down so the next subscribe rebuilds a fresh session.
            teardown(&slug);
        })
    }

    fn teardown(&self, slug: &str) {
        if let Some((_, channel)) = self.tenants.remove(slug) {
            channel.listener.abort();
        }
    }

    /// Registers an SSE subscriber.
    pub fn subscribe(&self, project: &Project) -> Result<Subscription, ApiError> {
        let bridge = self
            .weak
            .upgrade()
            .ok_or_else(|| ApiError::Internal("bridge shutting down".to_string()))?;
        let sender = self.ensure_channel(project);
        {
            let mut entry = self
                .tenants
                .get_mut(&project.slug)
                .ok_or_else(|| ApiError::Internal("listener vanished".to_string()))?;
            if entry.subscribers >= MAX_SUBSCRIBERS_PER_PROJECT {
                return Err(ApiError::RateLimited { retry_after_secs: 30 });
            }
            entry.subscribers += 1;
        }
        metrics::gauge!("cascata_realtime_subscribers").increment(1.0);
        Ok(Subscription {
            client_id: Uuid::new_v4().to_string(),
            receiver: sender.subscribe(),
            guard: SubscriberGuard {
                bridge,
                slug: project.slug.clone(),
            },
        })
    }

    fn release(&self, slug: &str) {
        metrics::gauge!("cascata_realtime_subscribers").decrement(1.0);
        let drop_channel = {
            let Some(mut entry) = self.tenants.get_mut(slug) else {
                return;
            };
            entry.subscribers = entry.subscribers.saturating_sub(1);
            entry.subscribers == 0 && !entry.pinned
        };
        if drop_channel {
            self.teardown(slug);
        }
    }

    /// Keeps (or releases) a listener for a tenant whose rules or webhooks
    /// need events regardless of subscribers.
    pub fn set_pin(&self, project: &Project, pinned: bool) {
        if pinned {
            self.ensure_channel(project);
            if let Some(mut entry) = self.tenants.get_mut(&project.slug) {
                entry.pinned = true;
            }
            return;
        }
        let drop_channel = {
            let Some(mut entry) = self.tenants.get_mut(&project.slug) else {
                return;
            };
            entry.pinned = false;
            entry.subscribers == 0
        };
        if drop_channel {
            self.teardown(&project.slug);
        }
    }

    pub fn active_tenants(&self) -> usize {
        self.tenants.len()
    }

    pub fn subscriber_count(&self, slug: &str) -> usize {
        self.tenants
            .get(slug)
            .map(|entry| entry.subscribers)
            .unwrap_or(0)
    }

    /// Drops every listener; subscribers observe their streams closing.
    pub fn shutdown(&self) {
        let slugs: Vec<String> = self.tenants.iter().map(|entry| entry.key().clone()).collect();
        for slug in slugs {
            self.teardown(&slug);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProjectMetadata, ProjectSecrets, ProjectStatus};
    use chrono::Utc;

    fn test_config() -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            metrics_bind: "127.0.0.1:0".parse().unwrap(),
            service_mode: crate::config::ServiceMode::All,
            db_direct_host: "127.0.0.1".to_string(),
            db_direct_port: 5432,
            db_pool_host: "127.0.0.1".to_string(),
            db_pool_port: 6432,
            db_user: "cascata".to_string(),
            db_pass: "pw".to_string(),
            control_db: "cascata_control".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            system_hostname: None,
            system_jwt_secret: "s".to_string(),
            sys_secret: "k".to_string(),
            admin_seed_user: None,
            admin_seed_password: None,
            storage_root: None,
            qdrant_host: None,
            store_backend: crate::config::StoreBackend::Memory,
        })
    }

    fn project(slug: &str, external: Option<&str>) -> Project {
        let mut metadata = ProjectMetadata::default();
        metadata.external_db_url = external.map(str::to_string);
        Project {
            id: uuid::Uuid::new_v4(),
            slug: slug.to_string(),
            display_name: slug.to_string(),
            db_name: format!("tenant_{slug}"),
            custom_domain: None,
            status: ProjectStatus::Active,
            blocked_ips: Vec::new(),
            metadata,
            secrets: ProjectSecrets {
                anon_key: "a".to_string(),
                service_key: "s".to_string(),
                jwt_secret: "j".to_string(),
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn listen_url_prefers_external() {
        let (bridge, _events) = RealtimeBridge::new_detached(test_config());
        let ejected = project("acme", Some("postgres://u:p@tenant.example.com/db"));
        assert_eq!(
            bridge.listen_url(&ejected),
            "postgres://u:p@tenant.example.com/db"
        );
    }

    #[test]
    fn listen_url_dials_direct_server() {
        let (bridge, _events) = RealtimeBridge::new_detached(test_config());
        let managed = project("acme", None);
        assert_eq!(
            bridge.listen_url(&managed),
            "postgres://cascata:pw@127.0.0.1:5432/tenant_acme"
        );
    }

    #[tokio::test]
    async fn subscriber_counts_and_release() {
        let (bridge, _events) = RealtimeBridge::new_detached(test_config());
        let tenant = project("acme", None);
        let first = bridge.subscribe(&tenant).unwrap();
        let second = bridge.subscribe(&tenant).unwrap();
        assert_ne!(first.client_id, second.client_id);
        assert_eq!(bridge.subscriber_count("acme"), 2);
        drop(first);
        assert_eq!(bridge.subscriber_count("acme"), 1);
        drop(second);
        // Last subscriber gone: channel torn down entirely.
        assert_eq!(bridge.active_tenants(), 0);
    }

    #[tokio::test]
    async fn pin_survives_subscriber_churn() {
        let (bridge, _events) = RealtimeBridge::new_detached(test_config());
        let tenant = project("acme", None);
        bridge.set_pin(&tenant, true);
        let sub = bridge.subscribe(&tenant).unwrap();
        drop(sub);
        assert_eq!(bridge.active_tenants(), 1);
        bridge.set_pin(&tenant, false);
        assert_eq!(bridge.active_tenants(), 0);
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let (bridge, _events) = RealtimeBridge::new_detached(test_config());
        bridge.set_pin(&project("a", None), true);
        bridge.set_pin(&project("b", None), true);
        assert_eq!(bridge.active_tenants(), 2);
        bridge.shutdown();
        assert_eq!(bridge.active_tenants(), 0);
    }
}
