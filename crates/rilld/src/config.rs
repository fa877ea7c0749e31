//! Gateway configuration
//!
//! Loaded from an optional YAML file, with every field overridable by CLI
//! flag or `RILL_*` environment variable (see [`crate::cli`]).

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for the rill gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Metadata store endpoint (Supabase project URL)
    #[serde(default)]
    pub supabase_url: String,

    /// Metadata store service key
    #[serde(default)]
    pub supabase_key: String,

    /// Server bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Workers per connection
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Pending-query queue capacity per connection
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum inbound frame size in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_workers() -> usize {
    3
}

fn default_queue_capacity() -> usize {
    100
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_key: String::new(),
            bind_address: default_bind_address(),
            port: default_port(),
            max_workers: default_max_workers(),
            queue_capacity: default_queue_capacity(),
            max_frame_bytes: default_max_frame_bytes(),
            log_level: default_log_level(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))?;
        let config = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Validate the effective configuration before startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.supabase_url.is_empty() {
            anyhow::bail!("supabase_url is required");
        }
        if self.supabase_key.is_empty() {
            anyhow::bail!("supabase_key is required");
        }
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        Ok(())
    }

    /// Get the server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.max_frame_bytes, 64 * 1024);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: GatewayConfig = serde_yaml::from_str(
            "supabase_url: https://meta.example.com\nsupabase_key: service-key\nport: 9000\n",
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_workers, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_requires_store() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let config = GatewayConfig {
            supabase_url: "https://meta.example.com".into(),
            supabase_key: "k".into(),
            max_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_address() {
        let config = GatewayConfig {
            bind_address: "127.0.0.1".into(),
            port: 9999,
            ..Default::default()
        };
        assert_eq!(config.server_address(), "127.0.0.1:9999");
    }
}
