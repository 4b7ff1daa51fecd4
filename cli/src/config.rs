// Configuration management for the parley CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/parley/config.json
// - Linux: ~/.config/parley/config.json
// - Windows: %APPDATA%\parley\config.json

use anyhow::{Context, Result};
use parley_core::{RelayLinkConfig, TcpConnectorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay settings (`parley relay`)
    pub relay: RelaySettings,

    /// Client settings (`parley chat`)
    pub client: ClientSettings,

    /// Commitment ledger file; defaults to the data directory
    pub ledger_path: Option<String>,

    #[serde(skip)]
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Port the relay listens on
    pub port: u16,

    /// Interface the relay binds
    pub bind: String,

    /// Frames queued per connection before the target is evicted
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Relay WebSocket URL
    pub relay_url: String,

    /// First reconnect delay in seconds
    pub reconnect_delay_secs: u64,

    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Interface direct links listen on
    pub direct_bind: String,

    /// Host advertised in offers
    pub advertise_host: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: RelaySettings::default(),
            client: ClientSettings::default(),
            ledger_path: None,
            path: None,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: "0.0.0.0".to_string(),
            outbound_buffer: 64,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080".to_string(),
            reconnect_delay_secs: 3,
            max_reconnect_attempts: 10,
            direct_bind: "0.0.0.0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("parley");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("parley");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_dir()?.join("config.json"))
    }

    /// Load config from `path`, creating it with defaults if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str::<Config>(&contents).context("Failed to parse config file")?
        } else {
            Config::default()
        };

        config.path = Some(path.to_path_buf());
        if !path.exists() {
            config.save()?;
        }
        Ok(config)
    }

    /// Save config to the file it was loaded from
    pub fn save(&self) -> Result<()> {
        let path = self.path.as_ref().context("Config has no backing file")?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "relay_port" => {
                self.relay.port = value.parse().context("Invalid port number")?;
            }
            "relay_bind" => self.relay.bind = value.to_string(),
            "outbound_buffer" => {
                let buffer: usize = value.parse().context("Invalid number")?;
                anyhow::ensure!(buffer > 0, "outbound_buffer must be at least 1");
                self.relay.outbound_buffer = buffer;
            }
            "relay_url" => {
                anyhow::ensure!(
                    value.starts_with("ws://") || value.starts_with("wss://"),
                    "relay_url must be a ws:// or wss:// URL"
                );
                self.client.relay_url = value.to_string();
            }
            "reconnect_delay_secs" => {
                self.client.reconnect_delay_secs = value.parse().context("Invalid number")?;
            }
            "max_reconnect_attempts" => {
                self.client.max_reconnect_attempts = value.parse().context("Invalid number")?;
            }
            "direct_bind" => self.client.direct_bind = value.to_string(),
            "advertise_host" => self.client.advertise_host = value.to_string(),
            "ledger_path" => {
                self.ledger_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.save()?;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "relay_port" => Some(self.relay.port.to_string()),
            "relay_bind" => Some(self.relay.bind.clone()),
            "outbound_buffer" => Some(self.relay.outbound_buffer.to_string()),
            "relay_url" => Some(self.client.relay_url.clone()),
            "reconnect_delay_secs" => Some(self.client.reconnect_delay_secs.to_string()),
            "max_reconnect_attempts" => Some(self.client.max_reconnect_attempts.to_string()),
            "direct_bind" => Some(self.client.direct_bind.clone()),
            "advertise_host" => Some(self.client.advertise_host.clone()),
            "ledger_path" => self.ledger_path.clone(),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("relay_port".to_string(), self.relay.port.to_string()),
            ("relay_bind".to_string(), self.relay.bind.clone()),
            ("outbound_buffer".to_string(), self.relay.outbound_buffer.to_string()),
            ("relay_url".to_string(), self.client.relay_url.clone()),
            (
                "reconnect_delay_secs".to_string(),
                format!("{}s", self.client.reconnect_delay_secs),
            ),
            (
                "max_reconnect_attempts".to_string(),
                self.client.max_reconnect_attempts.to_string(),
            ),
            ("direct_bind".to_string(), self.client.direct_bind.clone()),
            ("advertise_host".to_string(), self.client.advertise_host.clone()),
            (
                "ledger_path".to_string(),
                self.ledger_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
        ]
    }

    /// Resolved ledger file
    pub fn ledger_file(&self) -> Result<PathBuf> {
        match &self.ledger_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("ledger.json")),
        }
    }

    /// Relay link settings, with an optional URL override
    pub fn relay_link(&self, url: Option<String>) -> RelayLinkConfig {
        RelayLinkConfig {
            url: url.unwrap_or_else(|| self.client.relay_url.clone()),
            reconnect_delay: Duration::from_secs(self.client.reconnect_delay_secs),
            max_reconnect_attempts: self.client.max_reconnect_attempts,
            ..Default::default()
        }
    }

    /// Direct link settings
    pub fn tcp_connector(&self) -> TcpConnectorConfig {
        TcpConnectorConfig {
            bind_host: self.client.direct_bind.clone(),
            advertise_host: self.client.advertise_host.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.port, 8080);
        assert_eq!(config.relay.outbound_buffer, 64);
        assert_eq!(config.client.relay_url, "ws://127.0.0.1:8080");
        assert_eq!(config.client.reconnect_delay_secs, 3);
    }

    #[test]
    fn test_load_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.get("relay_port").as_deref(), Some("8080"));
    }

    #[test]
    fn test_set_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set("relay_port", "9090").unwrap();
        config.set("advertise_host", "192.168.1.20").unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.relay.port, 9090);
        assert_eq!(reloaded.tcp_connector().advertise_host, "192.168.1.20");
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load_from(&dir.path().join("config.json")).unwrap();

        assert!(config.set("relay_port", "not-a-port").is_err());
        assert!(config.set("outbound_buffer", "0").is_err());
        assert!(config.set("relay_url", "http://example.com").is_err());
        assert!(config.set("no_such_key", "1").is_err());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"relay":{"port":7000}}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.relay.port, 7000);
        assert_eq!(config.relay.outbound_buffer, 64);
        assert_eq!(config.client.max_reconnect_attempts, 10);
    }

    #[test]
    fn test_relay_link_override() {
        let config = Config::default();
        let link = config.relay_link(Some("ws://relay.example:9000".to_string()));
        assert_eq!(link.url, "ws://relay.example:9000");
        assert_eq!(link.reconnect_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_list_covers_every_key() {
        let config = Config::default();
        for (key, _) in config.list() {
            assert!(config.get(&key).is_some() || key == "ledger_path", "{}", key);
        }
    }
}
