//! Per-tenant connection pool registry.
//!
//! # Purpose
//! Owns every Postgres pool the gateway holds open: internal tenant
//! databases (direct or through the external pooler), read replicas, and
//! ejected tenants reached via their own connection strings. Entries are
//! created on first acquire, touched on every acquire, and closed by the
//! idle reaper, the hard cap, explicit invalidation, or shutdown.
//!
//! Acquire is the hot path. The map admits concurrent readers and the
//! reaper never blocks acquires: callers hold the `PgPool` handle by value
//! after lookup, so removal of an entry does not invalidate handles already
//! obtained from it.

use base64::Engine;
use dashmap::DashMap;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{Executor, PgPool};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const DEFAULT_MAX_ACTIVE_POOLS: usize = 500;
pub const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 15_000;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const REAP_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_MAX: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("database connect failed: {0}")]
    Connect(#[source] sqlx::Error),
}

/// Per-acquire options. `connection_string` marks the pool as external
/// (ejected tenant); `use_direct` bypasses the transaction pooler for
/// sessions that need `LISTEN` or session-level state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub idle_ms: u64,
    pub statement_timeout_ms: u64,
    pub use_direct: bool,
    pub connection_string: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_ms: 30_000,
            statement_timeout_ms: DEFAULT_STATEMENT_TIMEOUT_MS,
            use_direct: false,
            connection_string: None,
        }
    }
}

/// Where the registry finds the managed database servers.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub direct_host: String,
    pub direct_port: u16,
    pub pooled_host: String,
    pub pooled_port: u16,
    pub user: String,
    pub password: String,
    pub max_active_pools: usize,
}

impl RegistrySettings {
    fn connect_options(&self, db: &str, use_direct: bool) -> PgConnectOptions {
        let (host, port) = if use_direct {
            (self.direct_host.as_str(), self.direct_port)
        } else {
            (self.pooled_host.as_str(), self.pooled_port)
        };
        PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(db)
            .username(&self.user)
            .password(&self.password)
    }
}

struct PoolEntry {
    pool: PgPool,
    /// Milliseconds since registry start, updated on every acquire.
    last_used: AtomicU64,
    external: bool,
}

pub struct PoolRegistry {
    settings: RegistrySettings,
    pools: DashMap<String, Arc<PoolEntry>>,
    /// Serialises construction per key so only one acquirer builds an entry.
    building: DashMap<String, Arc<Mutex<()>>>,
    started: Instant,
}

/// Computes the registry key for a database + options pair. External pools
/// embed a prefix of the connection-string hash so distinct logical uses
/// (primary vs replica) coexist.
pub fn pool_key(db: &str, config: &PoolConfig) -> String {
    match &config.connection_string {
        Some(connection_string) => {
            let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(connection_string);
            let prefix: String = encoded.chars().take(10).collect();
            format!("ext_{db}_{prefix}")
        }
        None if config.use_direct => format!("{db}_direct"),
        None => format!("{db}_pooled"),
    }
}

impl PoolRegistry {
    pub fn new(settings: RegistrySettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            pools: DashMap::new(),
            building: DashMap::new(),
            started: Instant::now(),
        })
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pools.contains_key(key)
    }

    /// Acquires (building if needed) the pool for `db` under `config`.
    pub async fn get(&self, db: &str, config: &PoolConfig) -> Result<PgPool, PoolError> {
        let key = pool_key(db, config);
        if let Some(entry) = self.pools.get(&key) {
            entry.last_used.store(self.now_ms(), Ordering::Relaxed);
            return Ok(entry.pool.clone());
        }

        let build_lock = self
            .building
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = build_lock.lock().await;

        // Another acquirer may have finished while we waited for the lock.
        if let Some(entry) = self.pools.get(&key) {
            entry.last_used.store(self.now_ms(), Ordering::Relaxed);
            return Ok(entry.pool.clone());
        }

        let pool = match self.build_pool(db, config).await {
            Ok(pool) => pool,
            Err(err) => {
                // No half-initialised entry may survive a failed build.
                self.building.remove(&key);
                return Err(err);
            }
        };
        let entry = Arc::new(PoolEntry {
            pool: pool.clone(),
            last_used: AtomicU64::new(self.now_ms()),
            external: config.connection_string.is_some(),
        });
        self.pools.insert(key.clone(), entry);
        self.building.remove(&key);
        tracing::debug!(key = %key, live = self.pools.len(), "pool created");

        self.enforce_cap().await;
        Ok(pool)
    }

    async fn build_pool(&self, db: &str, config: &PoolConfig) -> Result<PgPool, PoolError> {
        let options = match &config.connection_string {
            Some(connection_string) => {
                let options = PgConnectOptions::from_str(connection_string).map_err(|err| {
                    PoolError::InvalidConnectionString(err.to_string())
                })?;
                // Tenant-operated databases: TLS on, trust permissive.
                options.ssl_mode(PgSslMode::Require)
            }
            None => self.settings.connect_options(db, config.use_direct),
        };

        let statement_timeout = format!(
            "SET statement_timeout = {}",
            if config.statement_timeout_ms == 0 {
                DEFAULT_STATEMENT_TIMEOUT_MS
            } else {
                config.statement_timeout_ms
            }
        );
        PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .idle_timeout(Duration::from_millis(config.idle_ms.max(1_000)))
            .after_connect(move |conn, _meta| {
                let statement_timeout = statement_timeout.clone();
                Box::pin(async move {
                    conn.execute(statement_timeout.as_str()).await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .map_err(PoolError::Connect)
    }

    /// Removes and closes every entry whose key contains `db`. Used when a
    /// project is updated or deleted.
    pub async fn close(&self, db: &str) {
        let keys: Vec<String> = self
            .pools
            .iter()
            .filter(|entry| entry.key().contains(db))
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.remove_and_close(&key).await;
        }
    }

    /// Drops one entry after a pool-level error so the next acquire rebuilds
    /// cleanly. Holders of already-acquired connections are unaffected.
    pub fn invalidate(&self, key: &str) {
        if let Some((_, entry)) = self.pools.remove(key) {
            tracing::warn!(key = %key, "pool invalidated after error");
            let pool = entry.pool.clone();
            tokio::spawn(async move { pool.close().await });
        }
    }

    pub async fn close_all(&self) {
        let keys: Vec<String> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.remove_and_close(&key).await;
        }
    }

    async fn remove_and_close(&self, key: &str) {
        if let Some((_, entry)) = self.pools.remove(key) {
            entry.pool.close().await;
            tracing::debug!(key = %key, "pool closed");
        }
    }

    /// Keys of entries untouched for longer than the idle threshold,
    /// measured against `now` (milliseconds since registry start).
    fn idle_keys(&self, now: u64) -> Vec<String> {
        let idle_cutoff = IDLE_MAX.as_millis() as u64;
        self.pools
            .iter()
            .filter(|entry| {
                now.saturating_sub(entry.value().last_used.load(Ordering::Relaxed)) > idle_cutoff
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// One reaper tick: close entries idle beyond the threshold, then
    /// enforce the hard cap oldest-first.
    pub async fn reap(&self) {
        for key in self.idle_keys(self.now_ms()) {
            tracing::info!(key = %key, "reaping idle pool");
            self.remove_and_close(&key).await;
        }
        self.enforce_cap().await;
    }

    async fn enforce_cap(&self) {
        while self.pools.len() > self.settings.max_active_pools {
            let oldest = self
                .pools
                .iter()
                .min_by_key(|entry| entry.value().last_used.load(Ordering::Relaxed))
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    tracing::info!(key = %key, "evicting pool over hard cap");
                    self.remove_and_close(&key).await;
                }
                None => break,
            }
        }
    }

    /// Spawns the background reaper. The handle is aborted on shutdown.
    pub fn spawn_reaper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.reap().await;
            }
        })
    }

    #[cfg(test)]
    fn insert_lazy(&self, key: &str, external: bool, last_used: u64) {
        let options = self.settings.connect_options("test", true);
        let pool = PgPoolOptions::new().connect_lazy_with(options);
        self.pools.insert(
            key.to_string(),
            Arc::new(PoolEntry {
                pool,
                last_used: AtomicU64::new(last_used),
                external,
            }),
        );
    }

    /// Number of external (ejected) pools currently live.
    pub fn external_count(&self) -> usize {
        self.pools
            .iter()
            .filter(|entry| entry.value().external)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_active_pools: usize) -> RegistrySettings {
        RegistrySettings {
            direct_host: "127.0.0.1".to_string(),
            direct_port: 5432,
            pooled_host: "127.0.0.1".to_string(),
            pooled_port: 6432,
            user: "cascata".to_string(),
            password: "secret".to_string(),
            max_active_pools,
        }
    }

    #[test]
    fn keying_internal_variants() {
        let direct = PoolConfig {
            use_direct: true,
            ..Default::default()
        };
        assert_eq!(pool_key("acme", &direct), "acme_direct");
        assert_eq!(pool_key("acme", &PoolConfig::default()), "acme_pooled");
    }

    #[test]
    fn keying_external_embeds_hash_prefix() {
        let config = PoolConfig {
            connection_string: Some("postgres://u:p@db.example.com/acme".to_string()),
            ..Default::default()
        };
        let key = pool_key("acme", &config);
        assert!(key.starts_with("ext_acme_"));
        // prefix is exactly ten characters of the encoded string
        assert_eq!(key.len(), "ext_acme_".len() + 10);

        let replica = PoolConfig {
            connection_string: Some("postgres://u:p@replica.example.com/acme".to_string()),
            ..Default::default()
        };
        assert_ne!(key, pool_key("acme", &replica));
    }

    #[tokio::test]
    async fn hard_cap_evicts_oldest_first() {
        let registry = PoolRegistry::new(settings(4));
        for (index, slug) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            registry.insert_lazy(&format!("{slug}_pooled"), false, index as u64);
        }
        registry.reap().await;
        assert_eq!(registry.len(), 4);
        assert!(!registry.contains("a_pooled"));
        assert!(registry.contains("e_pooled"));
    }

    #[tokio::test]
    async fn idle_selection_spares_recently_used_entries() {
        let registry = PoolRegistry::new(settings(10));
        let idle_ms = IDLE_MAX.as_millis() as u64;
        registry.insert_lazy("stale_pooled", false, 0);
        registry.insert_lazy("fresh_pooled", false, idle_ms);
        let stale = registry.idle_keys(idle_ms + 1);
        assert_eq!(stale, vec!["stale_pooled".to_string()]);
    }

    #[tokio::test]
    async fn close_removes_every_variant() {
        let registry = PoolRegistry::new(settings(10));
        registry.insert_lazy("acme_direct", false, 1);
        registry.insert_lazy("acme_pooled", false, 2);
        registry.insert_lazy("ext_acme_AbCdEfGhIj", true, 3);
        registry.insert_lazy("other_pooled", false, 4);
        registry.close("acme").await;
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("other_pooled"));
    }

    #[tokio::test]
    async fn close_all_drains_registry() {
        let registry = PoolRegistry::new(settings(10));
        registry.insert_lazy("a_pooled", false, 1);
        registry.insert_lazy("b_direct", false, 2);
        registry.close_all().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn invalidate_is_nonblocking() {
        let registry = PoolRegistry::new(settings(10));
        registry.insert_lazy("acme_pooled", false, 1);
        registry.invalidate("acme_pooled");
        assert!(!registry.contains("acme_pooled"));
    }

    #[tokio::test]
    async fn external_count_tracks_flag() {
        let registry = PoolRegistry::new(settings(10));
        registry.insert_lazy("a_pooled", false, 1);
        registry.insert_lazy("ext_b_0123456789", true, 2);
        assert_eq!(registry.external_count(), 1);
    }
}
