use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

// Gateway configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // HTTP bind address for the public API.
    pub bind_addr: SocketAddr,
    // Metrics HTTP bind address.
    pub metrics_bind: SocketAddr,
    // Which subsystems this process runs.
    pub service_mode: ServiceMode,
    // Managed database servers: direct connections and the external pooler.
    pub db_direct_host: String,
    pub db_direct_port: u16,
    pub db_pool_host: String,
    pub db_pool_port: u16,
    pub db_user: String,
    pub db_pass: String,
    // Name of the central control database.
    pub control_db: String,
    pub redis_url: String,
    // Hostname of the control plane itself; requests for other public hosts
    // with no tenant context get a stealth 404.
    pub system_hostname: Option<String>,
    // Process-wide admin JWT signing secret.
    pub system_jwt_secret: String,
    // Symmetric key for tenant secrets at rest.
    pub sys_secret: String,
    // Seed admin credentials, applied only when the admin table is empty.
    pub admin_seed_user: Option<String>,
    pub admin_seed_password: Option<String>,
    // Recognised for the storage/vector collaborators; the core only logs them.
    pub storage_root: Option<String>,
    pub qdrant_host: Option<String>,
    // Control-store backend; memory is for development and tests.
    pub store_backend: StoreBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    // Data plane + realtime.
    Api,
    // Admin surface only.
    ControlPlane,
    // Queue workers only.
    Worker,
    // Everything in one process (development default).
    All,
}

impl ServiceMode {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "API" => Ok(Self::Api),
            "CONTROL_PLANE" => Ok(Self::ControlPlane),
            "WORKER" => Ok(Self::Worker),
            "ALL" => Ok(Self::All),
            other => bail!("unrecognised SERVICE_MODE: {other}"),
        }
    }

    pub fn serves_http(&self) -> bool {
        !matches!(self, Self::Worker)
    }

    pub fn runs_workers(&self) -> bool {
        matches!(self, Self::Worker | Self::All)
    }

    pub fn serves_data_plane(&self) -> bool {
        matches!(self, Self::Api | Self::All)
    }
}

#[derive(Debug, Deserialize)]
struct GatewayConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    system_hostname: Option<String>,
    control_db: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let port: u16 = env_or("PORT", "8080")
            .parse()
            .with_context(|| "parse PORT")?;
        let bind_addr: SocketAddr = format!("0.0.0.0:{port}")
            .parse()
            .with_context(|| "parse bind address")?;
        let metrics_bind = env_or("CASCATA_METRICS_BIND", "0.0.0.0:9100")
            .parse()
            .with_context(|| "parse CASCATA_METRICS_BIND")?;
        let service_mode = match env_opt("SERVICE_MODE") {
            Some(raw) => ServiceMode::parse(&raw)?,
            None => ServiceMode::All,
        };

        let db_direct_port: u16 = env_or("DB_DIRECT_PORT", "5432")
            .parse()
            .with_context(|| "parse DB_DIRECT_PORT")?;
        let db_pool_port: u16 = env_or("DB_POOL_PORT", "6432")
            .parse()
            .with_context(|| "parse DB_POOL_PORT")?;
        let redis_host = env_or("REDIS_HOST", "127.0.0.1");
        let redis_port: u16 = env_or("REDIS_PORT", "6379")
            .parse()
            .with_context(|| "parse REDIS_PORT")?;

        let system_jwt_secret = env_or("SYSTEM_JWT_SECRET", "");
        if system_jwt_secret.is_empty() {
            bail!("SYSTEM_JWT_SECRET must be set");
        }
        let sys_secret = env_or("SYS_SECRET", "");
        if sys_secret.is_empty() {
            bail!("SYS_SECRET must be set");
        }

        Ok(Self {
            bind_addr,
            metrics_bind,
            service_mode,
            db_direct_host: env_or("DB_DIRECT_HOST", "127.0.0.1"),
            db_direct_port,
            db_pool_host: env_or("DB_POOL_HOST", "127.0.0.1"),
            db_pool_port,
            db_user: env_or("DB_USER", "postgres"),
            db_pass: env_or("DB_PASS", "postgres"),
            control_db: env_or("CASCATA_CONTROL_DB", "cascata_control"),
            redis_url: format!("redis://{redis_host}:{redis_port}"),
            system_hostname: env_opt("CASCATA_SYSTEM_HOSTNAME"),
            system_jwt_secret,
            sys_secret,
            admin_seed_user: env_opt("CASCATA_ADMIN_USER"),
            admin_seed_password: env_opt("CASCATA_ADMIN_PASSWORD"),
            storage_root: env_opt("STORAGE_ROOT"),
            qdrant_host: env_opt("QDRANT_HOST")
                .map(|host| format!("{host}:{}", env_or("QDRANT_PORT", "6333"))),
            store_backend: match env_or("CASCATA_STORE", "postgres").as_str() {
                "memory" => StoreBackend::Memory,
                _ => StoreBackend::Postgres,
            },
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("CASCATA_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read CASCATA_CONFIG: {path}"))?;
            let override_cfg: GatewayConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse gateway config yaml")?;
            if let Some(value) = override_cfg.bind_addr {
                config.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.system_hostname {
                config.system_hostname = Some(value);
            }
            if let Some(value) = override_cfg.control_db {
                config.control_db = value;
            }
        }
        Ok(config)
    }

    /// Connection URL for the central control database, always via the
    /// direct server so migrations and LISTEN-free admin work are unaffected
    /// by the pooler.
    pub fn control_db_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db_user, self.db_pass, self.db_direct_host, self.db_direct_port, self.control_db
        )
    }

    pub fn registry_settings(&self) -> cascata_pool::RegistrySettings {
        cascata_pool::RegistrySettings {
            direct_host: self.db_direct_host.clone(),
            direct_port: self.db_direct_port,
            pooled_host: self.db_pool_host.clone(),
            pooled_port: self.db_pool_port,
            user: self.db_user.clone(),
            password: self.db_pass.clone(),
            max_active_pools: cascata_pool::DEFAULT_MAX_ACTIVE_POOLS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    // Helper to clear all gateway env vars between tests.
    fn clear_env() {
        for key in [
            "PORT",
            "SERVICE_MODE",
            "DB_DIRECT_HOST",
            "DB_DIRECT_PORT",
            "DB_POOL_HOST",
            "DB_POOL_PORT",
            "DB_USER",
            "DB_PASS",
            "REDIS_HOST",
            "REDIS_PORT",
            "CASCATA_CONTROL_DB",
            "CASCATA_METRICS_BIND",
            "CASCATA_SYSTEM_HOSTNAME",
            "CASCATA_CONFIG",
            "CASCATA_ADMIN_USER",
            "CASCATA_ADMIN_PASSWORD",
            "STORAGE_ROOT",
            "QDRANT_HOST",
            "QDRANT_PORT",
            "CASCATA_STORE",
            "SYSTEM_JWT_SECRET",
            "SYS_SECRET",
        ] {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    fn set_required() {
        unsafe {
            env::set_var("SYSTEM_JWT_SECRET", "test-admin-secret");
            env::set_var("SYS_SECRET", "test-sys-secret");
        }
    }

    #[serial]
    #[test]
    fn from_env_uses_defaults() {
        clear_env();
        set_required();
        let config = GatewayConfig::from_env().expect("from_env");
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.metrics_bind.to_string(), "0.0.0.0:9100");
        assert_eq!(config.service_mode, ServiceMode::All);
        assert_eq!(config.control_db, "cascata_control");
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        clear_env();
    }

    #[serial]
    #[test]
    fn missing_secrets_fail_boot() {
        clear_env();
        assert!(GatewayConfig::from_env().is_err());
        clear_env();
    }

    #[serial]
    #[test]
    fn service_mode_parses_strictly() {
        clear_env();
        set_required();
        unsafe {
            env::set_var("SERVICE_MODE", "WORKER");
        }
        let config = GatewayConfig::from_env().expect("from_env");
        assert_eq!(config.service_mode, ServiceMode::Worker);
        assert!(!config.service_mode.serves_http());
        assert!(config.service_mode.runs_workers());

        unsafe {
            env::set_var("SERVICE_MODE", "bogus");
        }
        assert!(GatewayConfig::from_env().is_err());
        clear_env();
    }

    #[serial]
    #[test]
    fn control_db_url_targets_direct_server() {
        clear_env();
        set_required();
        unsafe {
            env::set_var("DB_DIRECT_HOST", "db.internal");
            env::set_var("DB_USER", "svc");
            env::set_var("DB_PASS", "pw");
        }
        let config = GatewayConfig::from_env().expect("from_env");
        assert_eq!(
            config.control_db_url(),
            "postgres://svc:pw@db.internal:5432/cascata_control"
        );
        clear_env();
    }

    #[serial]
    #[test]
    fn from_env_or_yaml_overrides_with_valid_yaml() {
        clear_env();
        set_required();
        let tmpdir = TempDir::new().unwrap();
        let config_path = tmpdir.path().join("config.yml");
        fs::write(
            &config_path,
            r#"
bind_addr: "127.0.0.1:7443"
metrics_bind: "127.0.0.1:7070"
system_hostname: "api.cascata.dev"
"#,
        )
        .unwrap();
        unsafe {
            env::set_var("CASCATA_CONFIG", config_path.to_str().unwrap());
        }
        let config = GatewayConfig::from_env_or_yaml().expect("from_env_or_yaml");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:7443");
        assert_eq!(config.metrics_bind.to_string(), "127.0.0.1:7070");
        assert_eq!(config.system_hostname.as_deref(), Some("api.cascata.dev"));
        clear_env();
    }

    #[serial]
    #[test]
    fn from_env_or_yaml_invalid_yaml_fails() {
        clear_env();
        set_required();
        let tmpdir = TempDir::new().unwrap();
        let config_path = tmpdir.path().join("bad.yml");
        fs::write(&config_path, "this is not: valid: yaml:").unwrap();
        unsafe {
            env::set_var("CASCATA_CONFIG", config_path.to_str().unwrap());
        }
        assert!(GatewayConfig::from_env_or_yaml().is_err());
        clear_env();
    }
}
