//! Configuration management for rtc-session-core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Session engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// DataChannel configuration
    #[serde(default)]
    pub data_channel: DataChannelConfig,

    /// ICE servers handed to the transport
    #[serde(default)]
    pub ice: IceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrent sessions per manager
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Tick of the coalescing media queue in ms
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Warn once this many events are waiting for the consumer (0 disables)
    #[serde(default = "default_event_queue_warn_depth")]
    pub event_queue_warn_depth: usize,

    /// Hard cap on undelivered events; later events are discarded
    #[serde(default = "default_event_queue_limit")]
    pub event_queue_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            flush_interval_ms: default_flush_interval_ms(),
            event_queue_warn_depth: default_event_queue_warn_depth(),
            event_queue_limit: default_event_queue_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChannelConfig {
    /// Largest payload send() accepts, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Ordering of channels created with the session defaults
    #[serde(default = "default_ordered")]
    pub default_ordered: bool,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            default_ordered: default_ordered(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default)]
    pub servers: Vec<IceServer>,
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Per-session slice of the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_message_size: usize,
    pub default_ordered: bool,
    pub event_queue_warn_depth: usize,
    pub event_queue_limit: usize,
    pub ice_servers: Vec<IceServer>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Config::default().session()
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.engine.max_sessions == 0 {
            return Err("Engine max_sessions must be non-zero".into());
        }

        if self.engine.flush_interval_ms == 0 {
            return Err("Engine flush_interval_ms must be non-zero".into());
        }

        if self.engine.event_queue_limit == 0 {
            return Err("Engine event_queue_limit must be non-zero".into());
        }

        if self.data_channel.max_message_size == 0 {
            return Err("DataChannel max_message_size must be non-zero".into());
        }

        for server in &self.ice.servers {
            if server.urls.is_empty() {
                return Err("ICE server entries need at least one url".into());
            }
            for url in &server.urls {
                let scheme = url.split(':').next().unwrap_or_default();
                if !matches!(scheme, "stun" | "stuns" | "turn" | "turns") {
                    return Err(format!("ICE server url '{}' must use stun/stuns/turn/turns", url).into());
                }
                if scheme.starts_with("turn") && (server.username.is_none() || server.credential.is_none()) {
                    return Err(format!("TURN server '{}' needs username and credential", url).into());
                }
            }
        }

        if self.logging.level.parse::<log::LevelFilter>().is_err() {
            return Err(format!("Unknown log level '{}'", self.logging.level).into());
        }

        Ok(())
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            max_message_size: self.data_channel.max_message_size,
            default_ordered: self.data_channel.default_ordered,
            event_queue_warn_depth: self.engine.event_queue_warn_depth,
            event_queue_limit: self.engine.event_queue_limit,
            ice_servers: self.ice.servers.clone(),
        }
    }
}

fn default_max_sessions() -> usize { 16 }
fn default_flush_interval_ms() -> u64 { 20 }
fn default_event_queue_warn_depth() -> usize { 1024 }
fn default_event_queue_limit() -> usize { 65536 }
fn default_max_message_size() -> usize { 256 * 1024 }
fn default_ordered() -> bool { true }

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.session().max_message_size, 262_144);
        assert_eq!(SessionConfig::default().event_queue_warn_depth, 1024);
        assert_eq!(SessionConfig::default().event_queue_limit, 65536);
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut cfg = Config::default();
        cfg.engine.max_sessions = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.data_channel.max_message_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.engine.event_queue_limit = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_turn_needs_credentials() {
        let mut cfg = Config::default();
        cfg.ice.servers.push(IceServer {
            urls: vec!["turn:turn.example.org:3478".to_string()],
            username: None,
            credential: None,
        });
        assert!(cfg.validate().is_err());

        cfg.ice.servers[0].username = Some("user".to_string());
        cfg.ice.servers[0].credential = Some("secret".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_scheme_and_level() {
        let mut cfg = Config::default();
        cfg.ice.servers.push(IceServer {
            urls: vec!["http://example.org".to_string()],
            username: None,
            credential: None,
        });
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.logging.level = "loud".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [engine]
            max_sessions = 4

            [[ice.servers]]
            urls = ["stun:stun.example.org:3478"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.engine.max_sessions, 4);
        assert_eq!(cfg.engine.flush_interval_ms, 20);
        assert!(cfg.data_channel.default_ordered);
        assert_eq!(cfg.session().ice_servers.len(), 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = Config::load(&PathBuf::from("/nonexistent/rtc-session.toml")).unwrap();
        assert_eq!(cfg.logging.level, "info");
    }
}
