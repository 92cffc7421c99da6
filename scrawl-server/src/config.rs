use scrawl_collab::ServerConfig;
use serde::Deserialize;
use std::time::Duration;

/// Server process configuration, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Liveness probe period in seconds
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Document compaction period in seconds
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,

    /// Per-room fan-out buffer
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Config {
    /// Read `app.env` (or `.env`) into the environment if present.
    pub fn load_env_files() {
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            dotenvy::dotenv().ok();
        }
    }

    pub fn load() -> Result<Self, ConfigError> {
        envy::from_env::<Config>().map_err(ConfigError::EnvError)
    }

    /// Like [`Config::load`], but falls back to defaults on a malformed value.
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => {
                log::info!("Configuration loaded");
                config
            }
            Err(e) => {
                log::warn!("{e}; using defaults");
                Self::default()
            }
        }
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.server_address(),
            broadcast_capacity: self.broadcast_capacity.max(1),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            compaction_interval: Duration::from_secs(self.compaction_interval_secs.max(1)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            compaction_interval_secs: default_compaction_interval_secs(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    EnvError(#[source] envy::Error),
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5678
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_compaction_interval_secs() -> u64 {
    1800
}

fn default_broadcast_capacity() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, envy::Error> {
        envy::from_iter(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server_address(), "0.0.0.0:5678");
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "9000"),
            ("HEARTBEAT_INTERVAL_SECS", "5"),
            ("COMPACTION_INTERVAL_SECS", "60"),
            ("BROADCAST_CAPACITY", "32"),
        ])
        .unwrap();
        let server = config.server_config();
        assert_eq!(server.bind_addr, "127.0.0.1:9000");
        assert_eq!(server.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(server.compaction_interval, Duration::from_secs(60));
        assert_eq!(server.broadcast_capacity, 32);
    }

    #[test]
    fn test_malformed_port_is_an_error() {
        assert!(from_pairs(&[("PORT", "not-a-port")]).is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::EnvError(from_pairs(&[("PORT", "x")]).unwrap_err());
        assert!(err.to_string().starts_with("Environment variable error: "));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = Config { heartbeat_interval_secs: 0, broadcast_capacity: 0, ..Config::default() };
        let server = config.server_config();
        assert_eq!(server.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(server.broadcast_capacity, 1);
    }
}
