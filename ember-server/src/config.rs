use crate::persistence::DurabilityConfig;
use crate::replication::ReplicationConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Listener and keyspace settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub host: String,
    pub port: u16,
    /// Number of SELECT-addressable databases
    pub databases: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6400,
            databases: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing filter directive, e.g. "info" or "ember_server=debug"
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Complete server configuration; every section falls back to its
/// defaults when absent from the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: NetConfig,
    pub durability: DurabilityConfig,
    pub replication: ReplicationConfig,
    pub logging: LoggingConfig,
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: ServerConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.databases == 0 || self.server.databases > 256 {
            anyhow::bail!("databases must be between 1 and 256");
        }
        if self.durability.queue_depth == 0 {
            anyhow::bail!("durability queue_depth must be positive");
        }
        self.replication.validate().map_err(anyhow::Error::msg)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: ServerConfig = serde_yaml::from_str(
            "server:\n  port: 7000\ndurability:\n  fsync: always\n",
        )
        .unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.databases, 16);
        assert!(config.durability.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_bad_database_count_rejected() {
        let mut config = ServerConfig::default();
        config.server.databases = 0;
        assert!(config.validate().is_err());
    }
}
