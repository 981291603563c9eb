//! JSON configuration for both binaries.
//!
//! Files are parsed strictly at startup and validated fail-fast; a broken
//! config never gets as far as binding a socket or starting a ticker.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Reads and parses any JSON config file.
pub fn read_config_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Empty list disables authentication entirely.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub cors_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub key: String,
    /// Human-readable owner, used in request logs.
    pub name: String,
    /// e.g. "metrics:write", "heartbeat:write"
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub dedup_enabled: bool,
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
    /// Percent thresholds. Explicit 0 disables the corresponding check;
    /// omitted fields get the defaults below.
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    #[serde(default = "default_disk_threshold")]
    pub disk_threshold: f64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_check_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            dedup_enabled: true,
            dedup_window_secs: default_dedup_window(),
            cpu_threshold: default_cpu_threshold(),
            memory_threshold: default_memory_threshold(),
            disk_threshold: default_disk_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    /// Linked from notification cards when set.
    #[serde(default)]
    pub dashboard_url: String,
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_config_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("server port must be non-zero");
        }
        for key in &self.api_keys {
            if key.key.is_empty() || key.name.is_empty() {
                bail!("api_keys entries require both key and name");
            }
        }
        if self.alerting.check_interval_secs == 0 {
            bail!("alerting.check_interval_secs must be positive");
        }
        if self.alerting.heartbeat_timeout_secs == 0 {
            bail!("alerting.heartbeat_timeout_secs must be positive");
        }
        if self.alerting.dedup_enabled && self.alerting.dedup_window_secs == 0 {
            bail!("alerting.dedup_window_secs must be positive when dedup is enabled");
        }
        for (name, value) in [
            ("cpu_threshold", self.alerting.cpu_threshold),
            ("memory_threshold", self.alerting.memory_threshold),
            ("disk_threshold", self.alerting.disk_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                bail!("alerting.{name} must be within 0..=100, got {value}");
            }
        }
        if self.webhook.enabled && self.webhook.url.is_empty() {
            bail!("webhook.url is required when webhook notifications are enabled");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable identity of this host in the fleet. Required.
    pub name: String,
    /// Empty means standalone mode: collect and log locally, never push.
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_collect_interval")]
    pub collect_interval_secs: u64,
    #[serde(default = "default_push_interval")]
    pub push_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Only report these mount points when non-empty.
    #[serde(default)]
    pub disk_mounts: Vec<String>,
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_config_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("agent name is required");
        }
        for (name, value) in [
            ("collect_interval_secs", self.collect_interval_secs),
            ("push_interval_secs", self.push_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
        ] {
            if value == 0 {
                bail!("{name} must be positive");
            }
        }
        if !self.server_url.is_empty() && self.api_key.is_empty() {
            bail!("api_key is required when server_url is set");
        }
        Ok(())
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    120
}

fn default_dedup_window() -> u64 {
    300
}

fn default_cpu_threshold() -> f64 {
    80.0
}

fn default_memory_threshold() -> f64 {
    85.0
}

fn default_disk_threshold() -> f64 {
    90.0
}

fn default_collect_interval() -> u64 {
    30
}

fn default_push_interval() -> u64 {
    60
}

fn default_heartbeat_interval() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn server_defaults_fill_missing_fields() {
        let file = write_config(r#"{ "api_keys": [] }"#);
        let config = ServerConfig::load(file.path()).unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8443);
        assert!(config.alerting.enabled);
        assert_eq!(config.alerting.cpu_threshold, 80.0);
        assert_eq!(config.alerting.memory_threshold, 85.0);
        assert_eq!(config.alerting.disk_threshold, 90.0);
        assert_eq!(config.alerting.check_interval_secs, 30);
        assert_eq!(config.alerting.heartbeat_timeout_secs, 120);
        assert_eq!(config.alerting.dedup_window_secs, 300);
    }

    #[test]
    fn explicit_zero_threshold_is_kept() {
        let file = write_config(r#"{ "alerting": { "cpu_threshold": 0 } }"#);
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.alerting.cpu_threshold, 0.0);
        assert_eq!(config.alerting.memory_threshold, 85.0);
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let file = write_config(r#"{ "alerting": { "disk_threshold": 150 } }"#);
        let err = ServerConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("disk_threshold"));
    }

    #[test]
    fn webhook_enabled_requires_url() {
        let file = write_config(r#"{ "webhook": { "enabled": true } }"#);
        assert!(ServerConfig::load(file.path()).is_err());
    }

    #[test]
    fn api_key_without_name_rejected() {
        let file = write_config(r#"{ "api_keys": [{ "key": "s3cret", "name": "" }] }"#);
        assert!(ServerConfig::load(file.path()).is_err());
    }

    #[test]
    fn agent_requires_name() {
        let file = write_config(r#"{ "server_url": "https://hub.example" }"#);
        assert!(AgentConfig::load(file.path()).is_err());
    }

    #[test]
    fn agent_standalone_without_key_is_fine() {
        let file = write_config(r#"{ "name": "web-1" }"#);
        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.name, "web-1");
        assert!(config.server_url.is_empty());
        assert_eq!(config.collect_interval_secs, 30);
        assert_eq!(config.push_interval_secs, 60);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn agent_with_server_requires_key() {
        let file = write_config(r#"{ "name": "web-1", "server_url": "https://hub.example" }"#);
        assert!(AgentConfig::load(file.path()).is_err());
    }
}
