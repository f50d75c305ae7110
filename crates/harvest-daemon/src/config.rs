//! Configuration loading and management

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use harvest_core::{ClientConfig, Endpoint, ReplicationConfig};
use serde::{Deserialize, Serialize};

/// Daemon configuration, read from `config.json` in the data directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Our own base URL; never added as a peer
    #[serde(default)]
    pub local_endpoint: Option<String>,

    /// Metadata format requested from every node
    #[serde(default = "default_metadata_prefix")]
    pub metadata_prefix: String,

    /// Container harvested objects are created in
    #[serde(default = "default_destination")]
    pub destination: String,

    /// Seconds between harvest cycles in `run` mode (default: 1 hour)
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Whole-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Stage record payloads as temp files instead of in memory
    #[serde(default)]
    pub stage_to_disk: bool,

    /// Upper bound on discovery rounds per sweep
    #[serde(default = "default_discovery_max_rounds")]
    pub discovery_max_rounds: usize,
}

fn default_metadata_prefix() -> String {
    "oai_dc".to_string()
}

fn default_destination() -> String {
    "harvested".to_string()
}

fn default_interval() -> u64 {
    3600 // 1 hour
}

fn default_request_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_discovery_max_rounds() -> usize {
    harvest_core::discovery::DEFAULT_MAX_ROUNDS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_endpoint: None,
            metadata_prefix: default_metadata_prefix(),
            destination: default_destination(),
            interval_secs: default_interval(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            stage_to_disk: false,
            discovery_max_rounds: default_discovery_max_rounds(),
        }
    }
}

impl Config {
    /// Load configuration from the data directory, writing defaults if absent
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_file = data_dir.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content).with_context(|| "Failed to parse config.json")?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = Config::default();

            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

            // Write default config for reference
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    /// Parsed `local_endpoint`, if set
    pub fn local_endpoint(&self) -> Result<Option<Endpoint>> {
        self.local_endpoint
            .as_deref()
            .map(|raw| Endpoint::parse(raw).with_context(|| format!("Invalid local_endpoint: {}", raw)))
            .transpose()
    }

    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ..ClientConfig::default()
        }
    }

    pub fn replication(&self) -> ReplicationConfig {
        ReplicationConfig {
            metadata_prefix: self.metadata_prefix.clone(),
            destination: self.destination.clone(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}
