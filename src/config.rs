//! Gateway configuration with TOML parsing
//!
//! The file config covers node-local concerns only: listen addresses, node
//! role, the backing config store, and filesystem roots. All security policy
//! (domains, applications, WAF groups, CC policies, IP lists) lives in the
//! config registry and is refreshed from the store at runtime.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Node role. A primary node owns the authoritative configuration; replicas
/// mirror it through the store's LastModified counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Primary,
    Replica,
}

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration
    pub listen: ListenConfig,
    /// Node role and synchronization
    pub node: NodeConfig,
    /// Config store backing file (JSON document with apps/domains/policies)
    pub store: StoreConfig,
    /// Filesystem roots for static content
    pub paths: PathsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Session cookie signing
    pub session: SessionConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            node: NodeConfig::default(),
            store: StoreConfig::default(),
            paths: PathsConfig::default(),
            logging: LoggingConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Plaintext HTTP listen address
    pub http: String,
    /// TLS listen address
    pub https: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            http: "0.0.0.0:80".to_string(),
            https: "0.0.0.0:443".to_string(),
        }
    }
}

impl ListenConfig {
    pub fn http_addr(&self) -> Result<SocketAddr> {
        self.http
            .parse()
            .map_err(|e| GatewayError::Config(format!("invalid listen.http: {}", e)))
    }

    pub fn https_addr(&self) -> Result<SocketAddr> {
        self.https
            .parse()
            .map_err(|e| GatewayError::Config(format!("invalid listen.https: {}", e)))
    }

    /// Port suffix appended to https redirect locations. `:443` is omitted.
    pub fn https_port_suffix(&self) -> String {
        match self.https.rsplit(':').next() {
            Some("443") | None => String::new(),
            Some(port) => format!(":{}", port),
        }
    }
}

/// Node role and replica synchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node role: primary or replica
    pub role: NodeRole,
    /// Seconds between LastModified polls against the store
    pub sync_seconds: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Primary,
            sync_seconds: 120,
        }
    }
}

/// Config store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the JSON config document
    pub file: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("./gateway-store.json"),
        }
    }
}

/// Filesystem roots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Fallback site served for unknown hosts
    pub welcome_root: PathBuf,
    /// CDN cache root; per-app subdirectories are created below it
    pub cdn_cache_root: PathBuf,
    /// Directory for access log files
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            welcome_root: PathBuf::from("./static/welcome"),
            cdn_cache_root: PathBuf::from("./static/cdncache"),
            log_dir: PathBuf::from("./log"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Enable the access log
    pub access_log: bool,
    /// Access log file path (empty = log_dir/access.log)
    pub access_log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            access_log: true,
            access_log_file: None,
        }
    }
}

/// Session cookie signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signing key for the session cookie. Generated at boot when empty,
    /// which invalidates sessions across restarts.
    pub signing_key: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signing_key: String::new(),
        }
    }
}

/// Global settings refreshed from the store alongside policy data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// WAF hit log retention in days
    pub waf_log_days: i64,
    /// CC hit log retention in days
    pub cc_log_days: i64,
    /// Access log retention in days
    pub access_log_days: i64,
    /// Let verified search engines bypass the 5-second shield
    pub skip_se_enabled: bool,
    /// Authentication gate and provider configuration
    pub auth: crate::oauth::AuthConfig,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            waf_log_days: 7,
            cc_log_days: 7,
            access_log_days: 180,
            skip_se_enabled: true,
            auth: crate::oauth::AuthConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("failed to read config file {:?}: {}", path, e))
        })?;
        let config: GatewayConfig = toml::from_str(&content).map_err(|e| {
            GatewayError::Config(format!("failed to parse config file {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.listen.http_addr()?;
        self.listen.https_addr()?;
        if self.node.sync_seconds == 0 {
            return Err(GatewayError::Config(
                "node.sync_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.node.sync_seconds, 120);
    }

    #[test]
    fn test_https_port_suffix() {
        let mut listen = ListenConfig::default();
        assert_eq!(listen.https_port_suffix(), "");

        listen.https = "0.0.0.0:8443".to_string();
        assert_eq!(listen.https_port_suffix(), ":8443");
    }

    #[test]
    fn test_config_parsing() {
        let toml_content = r#"
[listen]
http = "0.0.0.0:8080"
https = "0.0.0.0:8443"

[node]
role = "replica"
sync_seconds = 30

[store]
file = "/etc/warden/store.json"
"#;
        let config: GatewayConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.node.role, NodeRole::Replica);
        assert_eq!(config.node.sync_seconds, 30);
        assert_eq!(config.listen.http, "0.0.0.0:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_listen_rejected() {
        let mut config = GatewayConfig::default();
        config.listen.http = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }
}
