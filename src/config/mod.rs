//! Configuration management
//!
//! Defaults are layered under an optional TOML file and `CALLCORE__*`
//! environment variables, e.g. `CALLCORE__CALL__RING_TIMEOUT_SECS=30`.

use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub call: CallConfig,
    pub ice: IceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Outgoing/Incoming sessions that are not Active by then fail
    pub ring_timeout_secs: u64,
    /// Fraction of remote participants that must be connected, in (0, 1]
    pub quorum: f64,
    /// ICE restarts per link before it is given up
    pub max_ice_restarts: u32,
    /// How long an ICE restart may take before the link is given up
    pub ice_restart_grace_secs: u64,
    pub history_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    /// Local addresses offered as host candidates
    pub host_addresses: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 60,
            quorum: 1.0,
            max_ice_restarts: 1,
            ice_restart_grace_secs: 15,
            history_limit: 50,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            host_addresses: vec![SocketAddr::from(([127, 0, 0, 1], 50000))],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CallConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn ice_restart_grace(&self) -> Duration {
        Duration::from_secs(self.ice_restart_grace_secs)
    }

    /// Connected links needed before a session with `participants` remotes is Active
    pub fn required_links(&self, participants: usize) -> usize {
        if participants == 0 {
            return 0;
        }
        let needed = (participants as f64 * self.quorum).ceil() as usize;
        needed.clamp(1, participants)
    }
}

impl Config {
    /// Load defaults, then `path` (TOML) if given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("CALLCORE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: Config = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        let call = &self.call;
        if !(call.quorum > 0.0 && call.quorum <= 1.0) {
            return Err(CallError::Config(format!(
                "call.quorum must be in (0, 1], got {}",
                call.quorum
            )));
        }
        if call.ring_timeout_secs == 0 {
            return Err(CallError::Config("call.ring_timeout_secs must be positive".to_string()));
        }
        if call.ice_restart_grace_secs == 0 {
            return Err(CallError::Config("call.ice_restart_grace_secs must be positive".to_string()));
        }
        if call.history_limit == 0 {
            return Err(CallError::Config("call.history_limit must be positive".to_string()));
        }

        if let Some(bad) = self
            .ice
            .stun_servers
            .iter()
            .find(|url| !(url.starts_with("stun:") || url.starts_with("stuns:")))
        {
            return Err(CallError::Config(format!("invalid STUN server URL '{}'", bad)));
        }
        if let Some(bad) = self
            .ice
            .turn_servers
            .iter()
            .find(|t| !(t.url.starts_with("turn:") || t.url.starts_with("turns:")))
        {
            return Err(CallError::Config(format!("invalid TURN server URL '{}'", bad.url)));
        }
        if self.ice.host_addresses.is_empty() {
            return Err(CallError::Config("ice.host_addresses must not be empty".to_string()));
        }
        Ok(())
    }

    /// Render the effective configuration
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CallError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.call.ring_timeout(), Duration::from_secs(60));
        assert_eq!(config.ice.stun_servers.len(), 2);
    }

    #[test]
    fn test_required_links() {
        let mut call = CallConfig::default();
        assert_eq!(call.required_links(1), 1);
        assert_eq!(call.required_links(3), 3);

        call.quorum = 0.5;
        assert_eq!(call.required_links(3), 2);
        assert_eq!(call.required_links(1), 1);

        call.quorum = 0.01;
        assert_eq!(call.required_links(4), 1);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = Config::default();
        config.call.quorum = 0.0;
        assert!(matches!(config.validate(), Err(CallError::Config(_))));

        let mut config = Config::default();
        config.call.quorum = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.call.ring_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ice.stun_servers.push("http://example.com".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!("callcore-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[call]\nring_timeout_secs = 30\nquorum = 0.5\n").unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"").unwrap();
        drop(file);

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.call.ring_timeout_secs, 30);
        assert_eq!(config.call.quorum, 0.5);
        assert_eq!(config.call.max_ice_restarts, 1);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("CALLCORE__CALL__HISTORY_LIMIT", "7");
        let config = Config::load(None);
        std::env::remove_var("CALLCORE__CALL__HISTORY_LIMIT");

        assert_eq!(config.unwrap().call.history_limit, 7);
    }

    #[test]
    fn test_to_toml_renders_effective_values() {
        let rendered = Config::default().to_toml().unwrap();
        assert!(rendered.contains("ring_timeout_secs = 60"));
        assert!(rendered.contains("stun:stun.l.google.com:19302"));
    }
}
