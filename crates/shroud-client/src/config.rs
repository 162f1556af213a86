//! Client Configuration
//!
//! Where the server lives, which PSK to present and how this end shapes its
//! own traffic. Hop parameters are dictated by the server at handshake, so
//! the hop fields of the embedded [`SessionConfig`] only affect overlap,
//! grace and retry timing here.

use std::net::{SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};
use shroud_crypto::PskCredentials;
use shroud_protocol::DEFAULT_RENDEZVOUS_PORT;
use shroud_session::{ConfigError, SessionConfig, DEFAULT_SOCKS_PROXY};

use crate::errors::ClientError;

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server rendezvous address (host:port)
    pub server_address: String,

    /// PSK identity
    pub psk_identity: String,

    /// PSK key as hex, `0x` prefix optional
    pub psk_key: String,

    /// Wait for the first ServerHello (seconds); doubles per retry
    pub handshake_timeout_secs: u64,

    /// Hello transmissions before giving up
    pub handshake_attempts: u32,

    /// Route datagrams through a SOCKS5 proxy
    pub socks_enabled: bool,

    /// SOCKS5 proxy address
    pub socks_proxy: String,

    /// Local address sockets bind on
    pub bind_address: String,

    /// Obfuscation settings for this end
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: format!("127.0.0.1:{}", DEFAULT_RENDEZVOUS_PORT),
            psk_identity: String::new(),
            psk_key: String::new(),
            handshake_timeout_secs: 3,
            handshake_attempts: 5,
            socks_enabled: false,
            socks_proxy: DEFAULT_SOCKS_PROXY.to_string(),
            bind_address: "0.0.0.0".to_string(),
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new configuration builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
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

    /// Resolve the server address to a SocketAddr
    pub fn resolve_server_address(&self) -> Result<SocketAddr, ClientError> {
        resolve(&self.server_address)
    }

    /// Resolve the SOCKS5 proxy address
    pub fn resolve_socks_proxy(&self) -> Result<SocketAddr, ClientError> {
        resolve(&self.socks_proxy)
    }

    /// Parse the configured credentials
    pub fn credentials(&self) -> Result<PskCredentials, ConfigError> {
        PskCredentials::from_hex(self.psk_identity.as_str(), &self.psk_key)
            .map_err(|e| ConfigError::InvalidValue(format!("psk '{}': {}", self.psk_identity, e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_address.is_empty() {
            return Err(ConfigError::InvalidValue("server_address is required".into()));
        }

        if self.psk_identity.is_empty() {
            return Err(ConfigError::InvalidValue("psk_identity is required".into()));
        }
        self.credentials()?;

        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "handshake_timeout_secs cannot be 0".into(),
            ));
        }

        if self.handshake_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "handshake_attempts must be at least 1".into(),
            ));
        }

        if self.socks_enabled && self.socks_proxy.is_empty() {
            return Err(ConfigError::InvalidValue(
                "socks_proxy is required when socks_enabled".into(),
            ));
        }

        self.bind_address
            .parse::<std::net::IpAddr>()
            .map_err(|_| {
                ConfigError::InvalidValue(format!("bind_address '{}'", self.bind_address))
            })?;

        self.session.validate()
    }
}

fn resolve(address: &str) -> Result<SocketAddr, ClientError> {
    address
        .to_socket_addrs()
        .map_err(|e| ClientError::DnsResolutionFailed {
            host: address.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| ClientError::InvalidAddress(address.to_string()))
}

/// Configuration builder
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set server address
    pub fn server_address(mut self, addr: impl Into<String>) -> Self {
        self.config.server_address = addr.into();
        self
    }

    /// Set the PSK to present
    pub fn psk(mut self, identity: impl Into<String>, key_hex: impl Into<String>) -> Self {
        self.config.psk_identity = identity.into();
        self.config.psk_key = key_hex.into();
        self
    }

    /// Use existing credentials
    pub fn credentials(self, creds: &PskCredentials) -> Self {
        self.psk(creds.identity(), creds.key_hex())
    }

    /// Set the first handshake timeout
    pub fn handshake_timeout(mut self, secs: u64) -> Self {
        self.config.handshake_timeout_secs = secs;
        self
    }

    /// Set hello transmissions before giving up
    pub fn handshake_attempts(mut self, attempts: u32) -> Self {
        self.config.handshake_attempts = attempts;
        self
    }

    /// Route through a SOCKS5 proxy
    pub fn socks_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.socks_enabled = true;
        self.config.socks_proxy = proxy.into();
        self
    }

    /// Set local bind address
    pub fn bind_address(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_address = addr.into();
        self
    }

    /// Set the session settings
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "00112233445566778899aabbccddeeff";

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.server_address, "127.0.0.1:5684");
        assert_eq!(config.handshake_attempts, 5);
        assert!(!config.socks_enabled);
        assert_eq!(config.socks_proxy, "127.0.0.1:9050");
        // No credentials yet
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::builder()
            .server_address("10.0.0.1:7000")
            .psk("client-01ab", KEY)
            .handshake_attempts(2)
            .socks_proxy("127.0.0.1:1080")
            .build()
            .unwrap();

        assert_eq!(config.server_address, "10.0.0.1:7000");
        assert_eq!(config.handshake_attempts, 2);
        assert!(config.socks_enabled);
        assert_eq!(config.credentials().unwrap().identity(), "client-01ab");
        assert_eq!(config.resolve_socks_proxy().unwrap().port(), 1080);
    }

    #[test]
    fn test_config_validation() {
        assert!(ClientConfig::builder().server_address("").psk("a", KEY).build().is_err());
        assert!(ClientConfig::builder().psk("a", "not-hex").build().is_err());
        assert!(ClientConfig::builder().psk("a", KEY).handshake_attempts(0).build().is_err());
        assert!(ClientConfig::builder().psk("a", KEY).handshake_timeout(0).build().is_err());
        assert!(ClientConfig::builder().psk("a", KEY).bind_address("nowhere").build().is_err());
    }

    #[test]
    fn test_resolve_address() {
        let config = ClientConfig::builder()
            .server_address("127.0.0.1:5684")
            .psk("a", KEY)
            .build()
            .unwrap();
        assert_eq!(config.resolve_server_address().unwrap().port(), 5684);

        let missing_port = ClientConfig {
            server_address: "127.0.0.1".into(),
            ..config
        };
        assert!(missing_port.resolve_server_address().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ClientConfig::builder().psk("client-01ab", KEY).build().unwrap();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
