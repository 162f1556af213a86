//! Server Configuration
//!
//! Rendezvous settings, accepted credentials and the obfuscation knobs every
//! hosted session runs with.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use shroud_crypto::PskCredentials;
use shroud_protocol::DEFAULT_RENDEZVOUS_PORT;
use shroud_session::{ConfigError, SessionConfig};

/// One accepted PSK
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PskEntry {
    /// Identity the client presents
    pub identity: String,
    /// Key as hex, `0x` prefix optional
    pub key: String,
}

impl PskEntry {
    /// Create an entry
    pub fn new(identity: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            key: key.into(),
        }
    }

    /// Entry for existing credentials
    pub fn from_credentials(creds: &PskCredentials) -> Self {
        Self::new(creds.identity(), creds.key_hex())
    }

    /// Parse into credentials
    pub fn credentials(&self) -> Result<PskCredentials, ConfigError> {
        PskCredentials::from_hex(self.identity.as_str(), &self.key)
            .map_err(|e| ConfigError::InvalidValue(format!("psk '{}': {}", self.identity, e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the rendezvous port and every hop port
    pub bind_address: String,

    /// Rendezvous port
    pub bind_port: u16,

    /// Maximum concurrent sessions
    pub max_sessions: usize,

    /// How long an answered hello is kept for retransmissions (seconds)
    pub handshake_timeout_secs: u64,

    /// Maximum clock drift accepted in a hello timestamp (seconds)
    pub max_time_drift_secs: u64,

    /// Log level
    pub log_level: String,

    /// Accepted credentials
    pub psk: Vec<PskEntry>,

    /// Obfuscation settings; hop parameters are dictated to clients
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: DEFAULT_RENDEZVOUS_PORT,
            max_sessions: 256,
            handshake_timeout_secs: 10,
            max_time_drift_secs: 60,
            log_level: "info".to_string(),
            psk: Vec::new(),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Get the bind IP
    pub fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("bind_address '{}'", self.bind_address)))
    }

    /// Get the rendezvous socket address
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.bind_port))
    }

    /// Parse every configured credential
    pub fn credentials(&self) -> Result<Vec<PskCredentials>, ConfigError> {
        self.psk.iter().map(PskEntry::credentials).collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_ip()?;

        if self.bind_port == 0 {
            return Err(ConfigError::InvalidValue("bind_port cannot be 0".into()));
        }

        if self.max_sessions == 0 {
            return Err(ConfigError::InvalidValue("max_sessions cannot be 0".into()));
        }

        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "handshake_timeout_secs cannot be 0".into(),
            ));
        }

        if self.psk.is_empty() {
            return Err(ConfigError::InvalidValue(
                "at least one psk entry is required".into(),
            ));
        }
        self.credentials()?;

        let [min, max] = self.session.port_range;
        if (min..=max).contains(&self.bind_port) {
            return Err(ConfigError::InvalidValue(format!(
                "bind_port {} lies inside the hop port range",
                self.bind_port
            )));
        }

        self.session.validate()
    }
}

/// Configuration builder
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set bind address
    pub fn bind_address(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_address = addr.into();
        self
    }

    /// Set bind port
    pub fn bind_port(mut self, port: u16) -> Self {
        self.config.bind_port = port;
        self
    }

    /// Set maximum sessions
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    /// Set maximum hello timestamp drift
    pub fn max_time_drift(mut self, secs: u64) -> Self {
        self.config.max_time_drift_secs = secs;
        self
    }

    /// Accept a PSK
    pub fn psk(mut self, identity: impl Into<String>, key_hex: impl Into<String>) -> Self {
        self.config.psk.push(PskEntry::new(identity, key_hex));
        self
    }

    /// Set log level
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Set the session settings
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
