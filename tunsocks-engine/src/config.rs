//! Configuration types for the session engine

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Port used when none is configured or the configured one is malformed
pub const DEFAULT_PROXY_PORT: u16 = 1080;

/// Main configuration structure
///
/// # Example Configuration
///
/// ```toml
/// [proxy]
/// address = "proxy.example.com"
/// port = 1080
/// username = "alice"
/// password = "secret"
///
/// [session]
/// session_name = "tunsocks"
/// reader_join_timeout_ms = 2000
/// stack_log_level = "warn"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upstream SOCKS proxy
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Session tuning
    #[serde(default)]
    pub session: SessionSettings,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.proxy.validate()?;
        self.session.validate()
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# tunsocks configuration

# Upstream SOCKS5 proxy every connection is sent through
[proxy]
# Host name or IP address of the proxy
address = "proxy.example.com"

# Proxy port (default: 1080; malformed values fall back to 1080)
port = 1080

# Credentials for username/password authentication (optional)
# username = "user"
# password = "secret"

# Session settings
[session]
# Label shown by the host for the session
session_name = "tunsocks"

# Read buffer for the interface, must cover the 1500 byte MTU (default: 2048)
reader_buffer_size = 2048

# How long teardown waits for the interface reader to exit (default: 2000)
reader_join_timeout_ms = 2000

# Log level passed to the packet stack: "off", "error", "warn", "info", "debug", "trace"
stack_log_level = "warn"

# Loopback address the local relay binds to (default: 127.0.0.1)
relay_listen = "127.0.0.1"
"#
        .to_string()
    }
}

/// Upstream proxy settings entered by the user
///
/// `address` may be empty: the session still starts and connections fail
/// individually when the relay cannot resolve the upstream.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy host name or IP address
    #[serde(default)]
    pub address: String,

    /// Proxy port
    #[serde(default = "default_proxy_port", deserialize_with = "deserialize_port")]
    pub port: u16,

    /// Username for RFC 1929 authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for RFC 1929 authentication
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: DEFAULT_PROXY_PORT,
            username: None,
            password: None,
        }
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Resolved username/password pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Vec<u8>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ProxyConfig {
    /// Create a configuration without credentials
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    /// Set username/password credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Build a configuration from raw form fields
    ///
    /// Empty username/password mean "no credentials"; a port that does not
    /// parse falls back to [`DEFAULT_PROXY_PORT`].
    pub fn from_fields(address: &str, port: &str, username: &str, password: &str) -> Self {
        Self {
            address: address.trim().to_string(),
            port: parse_port(port),
            username: Some(username.to_string()).filter(|u| !u.is_empty()),
            password: Some(password.to_string()).filter(|p| !p.is_empty()),
        }
    }

    /// Credentials to present to the upstream, if any
    ///
    /// A password without a username is ignored.
    pub fn credentials(&self) -> Option<Credentials> {
        let username = self.username.as_deref().filter(|u| !u.is_empty())?;
        Some(Credentials {
            username: username.to_string(),
            password: self
                .password
                .as_deref()
                .map(|p| p.as_bytes().to_vec())
                .unwrap_or_default(),
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ref username) = self.username {
            if username.len() > 255 {
                return Err(Error::Config(format!(
                    "username is {} bytes long (maximum 255)",
                    username.len()
                )));
            }
        }

        if let Some(ref password) = self.password {
            if password.len() > 255 {
                return Err(Error::Config(format!(
                    "password is {} bytes long (maximum 255)",
                    password.len()
                )));
            }
        }

        Ok(())
    }
}

/// Parse a port number, falling back to [`DEFAULT_PROXY_PORT`]
pub fn parse_port(text: &str) -> u16 {
    match text.trim().parse::<u16>() {
        Ok(port) => port,
        Err(e) => {
            log::warn!(
                "Failed to parse port {:?} ({}), using {}",
                text,
                e,
                DEFAULT_PROXY_PORT
            );
            DEFAULT_PROXY_PORT
        }
    }
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(i64),
        Text(String),
    }

    Ok(match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => u16::try_from(n).unwrap_or_else(|_| {
            log::warn!("Port {} is out of range, using {}", n, DEFAULT_PROXY_PORT);
            DEFAULT_PROXY_PORT
        }),
        PortValue::Text(text) => parse_port(&text),
    })
}

/// Session tuning knobs
///
/// The routing parameters of the interface are fixed and not part of the
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Label shown by the host for the session
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// Interface read buffer size in bytes
    #[serde(default = "default_reader_buffer_size")]
    pub reader_buffer_size: usize,

    /// Bound on the wait for the reader task during teardown
    #[serde(default = "default_reader_join_timeout_ms")]
    pub reader_join_timeout_ms: u64,

    /// Log level handed to the packet stack
    #[serde(default = "default_stack_log_level")]
    pub stack_log_level: String,

    /// Loopback address the local relay binds to
    #[serde(default = "default_relay_listen")]
    pub relay_listen: IpAddr,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            session_name: default_session_name(),
            reader_buffer_size: default_reader_buffer_size(),
            reader_join_timeout_ms: default_reader_join_timeout_ms(),
            stack_log_level: default_stack_log_level(),
            relay_listen: default_relay_listen(),
        }
    }
}

impl SessionSettings {
    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.reader_buffer_size < tunsocks_tun::DEFAULT_MTU as usize {
            return Err(Error::Config(format!(
                "reader_buffer_size {} is smaller than the {} byte MTU",
                self.reader_buffer_size,
                tunsocks_tun::DEFAULT_MTU
            )));
        }

        if self.reader_join_timeout_ms == 0 {
            return Err(Error::Config("reader_join_timeout_ms must be positive".into()));
        }

        if !self.relay_listen.is_loopback() {
            return Err(Error::Config(format!(
                "relay_listen {} is not a loopback address",
                self.relay_listen
            )));
        }

        Ok(())
    }

    /// Bound on the wait for the reader task during teardown
    pub fn reader_join_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_join_timeout_ms)
    }

    /// Parsed stack log level; unknown names fall back to `warn`
    pub fn stack_log_level(&self) -> log::LevelFilter {
        self.stack_log_level.parse().unwrap_or_else(|_| {
            log::warn!(
                "Unknown stack log level {:?}, using warn",
                self.stack_log_level
            );
            log::LevelFilter::Warn
        })
    }
}

fn default_proxy_port() -> u16 {
    DEFAULT_PROXY_PORT
}

fn default_session_name() -> String {
    tunsocks_tun::DEFAULT_SESSION_NAME.to_string()
}

fn default_reader_buffer_size() -> usize {
    tunsocks_tun::DEFAULT_READ_BUFFER
}

fn default_reader_join_timeout_ms() -> u64 {
    2000
}

fn default_stack_log_level() -> String {
    "warn".to_string()
}

fn default_relay_listen() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[proxy]
address = "proxy.example.com"
port = 9050
username = "alice"
password = "secret"

[session]
session_name = "office"
reader_join_timeout_ms = 500
stack_log_level = "debug"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.proxy.address, "proxy.example.com");
        assert_eq!(config.proxy.port, 9050);
        let creds = config.proxy.credentials().unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, b"secret".to_vec());

        assert_eq!(config.session.session_name, "office");
        assert_eq!(config.session.reader_buffer_size, 2048);
        assert_eq!(config.session.reader_join_timeout(), Duration::from_millis(500));
        assert_eq!(config.session.stack_log_level(), log::LevelFilter::Debug);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();

        assert_eq!(config.proxy.address, "");
        assert_eq!(config.proxy.port, 1080);
        assert!(config.proxy.credentials().is_none());
        assert_eq!(config.session.session_name, "tunsocks");
        assert_eq!(config.session.relay_listen, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_malformed_port_falls_back() {
        let config = Config::from_toml("[proxy]\nport = \"abc\"\n").unwrap();
        assert_eq!(config.proxy.port, DEFAULT_PROXY_PORT);

        let config = Config::from_toml("[proxy]\nport = 70000\n").unwrap();
        assert_eq!(config.proxy.port, DEFAULT_PROXY_PORT);

        let config = Config::from_toml("[proxy]\nport = \"8080\"\n").unwrap();
        assert_eq!(config.proxy.port, 8080);
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("1081"), 1081);
        assert_eq!(parse_port(" 1081 "), 1081);
        assert_eq!(parse_port("abc"), 1080);
        assert_eq!(parse_port(""), 1080);
        assert_eq!(parse_port("-1"), 1080);
    }

    #[test]
    fn test_from_fields() {
        let config = ProxyConfig::from_fields("", "abc", "", "");
        assert_eq!(config, ProxyConfig::default());
        assert!(config.credentials().is_none());

        let config = ProxyConfig::from_fields("10.0.0.1", "1090", "bob", "pw");
        assert_eq!(config.port, 1090);
        assert_eq!(config.credentials().unwrap().username, "bob");
    }

    #[test]
    fn test_password_without_username_is_ignored() {
        let config = ProxyConfig::from_fields("10.0.0.1", "1080", "", "pw");
        assert!(config.credentials().is_none());
    }

    #[test]
    fn test_long_username_rejected() {
        let config = ProxyConfig::new("h", 1080).with_credentials("u".repeat(256), "p");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_small_read_buffer_rejected() {
        let toml = "[session]\nreader_buffer_size = 512\n";
        assert!(matches!(Config::from_toml(toml), Err(Error::Config(_))));
    }

    #[test]
    fn test_non_loopback_relay_rejected() {
        let toml = "[session]\nrelay_listen = \"0.0.0.0\"\n";
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_stack_log_level_falls_back() {
        let settings = SessionSettings {
            stack_log_level: "loud".into(),
            ..Default::default()
        };
        assert_eq!(settings.stack_log_level(), log::LevelFilter::Warn);
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = ProxyConfig::new("h", 1080).with_credentials("u", "hunter2");
        assert!(!format!("{:?}", config).contains("hunter2"));
        assert!(!format!("{:?}", config.credentials().unwrap()).contains("hunter2"));
    }

    #[test]
    fn test_sample_config_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        assert_eq!(config.proxy.port, 1080);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::from_toml("[proxy\naddress = "),
            Err(Error::ConfigParse(_))
        ));
    }
}
