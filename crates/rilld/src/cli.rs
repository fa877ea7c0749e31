//! CLI argument parsing for the rill gateway
//!
//! Flags layer over the optional YAML config file: file values first, then
//! environment variables, then explicit flags.

use crate::config::GatewayConfig;
use clap::Parser;
use std::path::PathBuf;

/// rilld - streaming query-execution gateway
///
/// Accepts analytic query requests over a persistent WebSocket transport,
/// resolves them against stored definitions, and streams result rows back
/// row by row.
#[derive(Parser, Debug)]
#[command(name = "rilld")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "RILL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Metadata store endpoint (Supabase project URL)
    #[arg(long, env = "RILL_SUPABASE_URL")]
    pub supabase_url: Option<String>,

    /// Metadata store service key
    #[arg(long, env = "RILL_SUPABASE_KEY")]
    pub supabase_key: Option<String>,

    /// Server bind address
    #[arg(long, env = "RILL_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Server port
    #[arg(short, long, env = "RILL_PORT")]
    pub port: Option<u16>,

    /// Workers per connection
    #[arg(long, env = "RILL_MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// Pending-query queue capacity per connection
    #[arg(long, env = "RILL_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    /// Maximum inbound frame size in bytes
    #[arg(long, env = "RILL_MAX_FRAME_BYTES")]
    pub max_frame_bytes: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "RILL_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl Cli {
    /// Resolve the effective configuration: file values overlaid with flags.
    pub fn into_config(self) -> anyhow::Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::load(path)?,
            None => GatewayConfig::default(),
        };

        if let Some(url) = self.supabase_url {
            config.supabase_url = url;
        }
        if let Some(key) = self.supabase_key {
            config.supabase_key = key;
        }
        if let Some(bind) = self.bind_address {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(workers) = self.max_workers {
            config.max_workers = workers;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(bytes) = self.max_frame_bytes {
            config.max_frame_bytes = bytes;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "rilld",
            "--supabase-url",
            "https://meta.example.com",
            "--supabase-key",
            "service-key",
            "--port",
            "9000",
            "--max-workers",
            "5",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.queue_capacity, 100);
    }

    #[test]
    fn test_missing_store_fails_validation() {
        let cli = Cli::parse_from(["rilld"]);
        assert!(cli.into_config().is_err());
    }
}
