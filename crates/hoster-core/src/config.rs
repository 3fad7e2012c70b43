//! Layered configuration: TOML file + `HOSTER_*` environment overrides.
//!
//! Environment variables are mapped onto nested keys by taking the first
//! `_`-separated segment after the prefix as the section and the remainder
//! as the field: `HOSTER_SERVER_PORT=3000` overrides `server.port`,
//! `HOSTER_WORKERS_HEALTH_INTERVAL_SECS=30` overrides
//! `workers.health_interval_secs`.
//!
//! The node encryption key is deliberately NOT a config-file field. It is
//! read from `HOSTER_NODES_ENCRYPTION_KEY` only and never written back out.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{CoreError, CoreResult};

/// Environment variable holding the 32-byte secret used to encrypt SSH keys
/// and cloud credentials at rest.
pub const ENCRYPTION_KEY_ENV: &str = "HOSTER_NODES_ENCRYPTION_KEY";

const ENV_PREFIX: &str = "HOSTER_";

/// Config sections recognized for environment override mapping.
const SECTIONS: &[&str] = &["server", "database", "nodes", "workers", "proxy", "gateway"];

/// Top-level configuration for the control plane.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub nodes: NodesConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// HTTP listener settings for the API and the hostname proxy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub host: String,
    /// API listener port.
    pub port: u16,
    /// Hostname-router listener port.
    pub proxy_port: u16,
    /// Base domain for auto-assigned deployment hostnames.
    pub base_domain: String,
    /// Graceful-shutdown budget before in-flight I/O is abandoned.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            proxy_port: 9091,
            base_domain: "apps.localhost".to_string(),
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn proxy_address(&self) -> String {
        format!("{}:{}", self.host, self.proxy_port)
    }
}

/// Persistent storage settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    /// Directory holding `hoster.db` and `configs/`.
    pub data_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/hoster"),
        }
    }
}

impl DatabaseConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("hoster.db")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.data_dir.join("configs")
    }
}

/// Remote-node settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NodesConfig {
    /// Path to the minion binary uploaded to nodes on first contact.
    pub minion_binary_path: Option<PathBuf>,
    /// Per-SSH-exec timeout.
    pub ssh_timeout_secs: u64,
    /// The 32-byte at-rest encryption key. Populated from the environment
    /// only; absent means remote-node features are disabled.
    #[serde(skip)]
    pub encryption_key: Option<String>,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            minion_binary_path: None,
            ssh_timeout_secs: 60,
            encryption_key: None,
        }
    }
}

/// Background worker intervals and bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkersConfig {
    pub health_interval_secs: u64,
    pub health_max_concurrent: usize,
    pub health_check_timeout_secs: u64,
    pub provision_interval_secs: u64,
    pub provision_max_concurrent: usize,
    pub dns_interval_secs: u64,
    pub dns_startup_delay_secs: u64,
    pub dns_max_concurrent: usize,
    pub billing_interval_secs: u64,
    pub billing_batch_size: usize,
    /// Upstream billing endpoint. Absent means the no-op reporter is used.
    pub billing_endpoint: Option<String>,
    pub billing_token: Option<String>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 60,
            health_max_concurrent: 5,
            health_check_timeout_secs: 10,
            provision_interval_secs: 5,
            provision_max_concurrent: 3,
            dns_interval_secs: 60,
            dns_startup_delay_secs: 10,
            dns_max_concurrent: 5,
            billing_interval_secs: 60,
            billing_batch_size: 100,
            billing_endpoint: None,
            billing_token: None,
        }
    }
}

/// Hostname-router settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProxyConfig {
    /// Inclusive range deployments' proxy ports are allocated from.
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port_range_start: 20000,
            port_range_end: 29999,
        }
    }
}

/// Upstream API-gateway trust settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct GatewayConfig {
    /// When set, requests must carry a matching `X-APIGate-Secret` header.
    pub shared_secret: Option<String>,
}

impl Config {
    /// Load configuration from an optional TOML file, then apply
    /// `HOSTER_*` environment overrides on top.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Toml),
            );
        }

        for (key, value) in std::env::vars() {
            if let Some(target) = env_override_key(&key) {
                builder = builder
                    .set_override(target, value)
                    .map_err(|e| CoreError::Config(e.to_string()))?;
            }
        }

        let mut cfg: Config = builder
            .build()
            .map_err(|e| CoreError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        cfg.nodes.encryption_key = std::env::var(ENCRYPTION_KEY_ENV).ok();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field constraints. Called by `load`; exposed for
    /// programmatically-built configs in tests.
    pub fn validate(&self) -> CoreResult<()> {
        if let Some(key) = &self.nodes.encryption_key {
            if key.len() != 32 {
                return Err(CoreError::BadKeyLength(key.len()));
            }
        }
        if self.server.base_domain.is_empty() {
            return Err(CoreError::Config("server.base_domain must not be empty".into()));
        }
        if self.proxy.port_range_start == 0 || self.proxy.port_range_start > self.proxy.port_range_end {
            return Err(CoreError::Config(format!(
                "invalid proxy port range {}-{}",
                self.proxy.port_range_start, self.proxy.port_range_end
            )));
        }
        if self.workers.billing_batch_size == 0 {
            return Err(CoreError::Config("workers.billing_batch_size must be positive".into()));
        }
        Ok(())
    }

    /// Whether remote-node features (SSH, provisioning) are enabled.
    pub fn remote_nodes_enabled(&self) -> bool {
        self.nodes.encryption_key.is_some()
    }
}

/// Map a `HOSTER_SECTION_FIELD` environment variable onto a `section.field`
/// config key. Returns `None` for unrelated variables and for the
/// encryption key, which bypasses the layered config.
fn env_override_key(var: &str) -> Option<String> {
    if var == ENCRYPTION_KEY_ENV {
        return None;
    }
    let rest = var.strip_prefix(ENV_PREFIX)?;
    let (section, field) = rest.split_once('_')?;
    let section = section.to_ascii_lowercase();
    if !SECTIONS.contains(&section.as_str()) || field.is_empty() {
        return None;
    }
    Some(format!("{section}.{}", field.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.server.api_address(), "0.0.0.0:8080");
        assert_eq!(cfg.server.proxy_address(), "0.0.0.0:9091");
        assert_eq!(cfg.server.shutdown_timeout_secs, 30);
        assert_eq!(cfg.workers.health_interval_secs, 60);
        assert_eq!(cfg.workers.health_max_concurrent, 5);
        assert_eq!(cfg.workers.provision_interval_secs, 5);
        assert_eq!(cfg.workers.provision_max_concurrent, 3);
        assert_eq!(cfg.workers.billing_batch_size, 100);
        assert!(!cfg.remote_nodes_enabled());
    }

    #[test]
    fn env_override_key_maps_sections() {
        assert_eq!(env_override_key("HOSTER_SERVER_PORT").as_deref(), Some("server.port"));
        assert_eq!(
            env_override_key("HOSTER_WORKERS_HEALTH_INTERVAL_SECS").as_deref(),
            Some("workers.health_interval_secs")
        );
        assert_eq!(
            env_override_key("HOSTER_SERVER_BASE_DOMAIN").as_deref(),
            Some("server.base_domain")
        );
    }

    #[test]
    fn env_override_key_rejects_unrelated() {
        assert_eq!(env_override_key("PATH"), None);
        assert_eq!(env_override_key("HOSTER_UNKNOWN_THING"), None);
        // The encryption key never flows through the layered config.
        assert_eq!(env_override_key(ENCRYPTION_KEY_ENV), None);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "[server]\nport = 3000\nbase_domain = \"apps.example.com\"\n\n[proxy]\nport_range_start = 30000\nport_range_end = 30999\n"
        )
        .unwrap();

        let cfg = Config::load(Some(file.path())).unwrap();
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.server.base_domain, "apps.example.com");
        assert_eq!(cfg.proxy.port_range_start, 30000);
        // Untouched sections keep defaults.
        assert_eq!(cfg.server.proxy_port, 9091);
    }

    #[test]
    fn validate_rejects_short_key() {
        let mut cfg = Config::default();
        cfg.nodes.encryption_key = Some("too-short".to_string());
        assert!(matches!(cfg.validate(), Err(CoreError::BadKeyLength(9))));
    }

    #[test]
    fn validate_accepts_32_byte_key() {
        let mut cfg = Config::default();
        cfg.nodes.encryption_key = Some("0123456789abcdef0123456789abcdef".to_string());
        assert!(cfg.validate().is_ok());
        assert!(cfg.remote_nodes_enabled());
    }

    #[test]
    fn validate_rejects_inverted_port_range() {
        let mut cfg = Config::default();
        cfg.proxy.port_range_start = 30000;
        cfg.proxy.port_range_end = 20000;
        assert!(cfg.validate().is_err());
    }
}
