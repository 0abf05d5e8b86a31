//! Configuration management

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Remote server hostname
    pub server: String,
    /// Local SOCKS5 listen port
    pub port: u16,
    /// Account username, sent as an upgrade header
    pub username: String,
    /// Account password; Argon2 key material for the auth token
    pub password: String,
    /// DoH provider name (closed set, see [`DohProvider`])
    pub doh: String,
    /// Fetch and validate the server's published ESNI keys before dialing
    #[serde(default = "default_esni")]
    pub esni: bool,
}

fn default_esni() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 1080,
            username: String::new(),
            password: String::new(),
            doh: "cloudflare".to_string(),
            esni: true,
        }
    }
}

/// DoH providers known to the implementation.
///
/// The set is closed: an unknown name in `client.doh` is a
/// construction-time configuration error, before any socket is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DohProvider {
    Cloudflare,
    Google,
    Quad9,
}

impl DohProvider {
    /// Query endpoint serving the JSON DoH wire format
    pub fn endpoint(&self) -> &'static str {
        match self {
            DohProvider::Cloudflare => "https://cloudflare-dns.com/dns-query",
            DohProvider::Google => "https://dns.google/resolve",
            DohProvider::Quad9 => "https://dns.quad9.net:5053/dns-query",
        }
    }
}

impl FromStr for DohProvider {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cloudflare" => Ok(DohProvider::Cloudflare),
            "google" => Ok(DohProvider::Google),
            "quad9" => Ok(DohProvider::Quad9),
            _ => Err(crate::Error::Config(format!("unknown doh provider: {}", s))),
        }
    }
}

impl fmt::Display for DohProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DohProvider::Cloudflare => write!(f, "cloudflare"),
            DohProvider::Google => write!(f, "google"),
            DohProvider::Quad9 => write!(f, "quad9"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_config() {
        let toml = r#"
            [client]
            server = "relay.example.com"
            port = 1080
            username = "alice"
            password = "hunter2"
            doh = "cloudflare"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        let client = config.client.unwrap();
        assert_eq!(client.server, "relay.example.com");
        assert_eq!(client.port, 1080);
        assert!(client.esni); // default
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!(
            "Cloudflare".parse::<DohProvider>().unwrap(),
            DohProvider::Cloudflare
        );
        assert_eq!("quad9".parse::<DohProvider>().unwrap(), DohProvider::Quad9);
        assert!("dnspod".parse::<DohProvider>().is_err());
    }

    #[test]
    fn test_provider_roundtrip_display() {
        for p in [DohProvider::Cloudflare, DohProvider::Google, DohProvider::Quad9] {
            assert_eq!(p.to_string().parse::<DohProvider>().unwrap(), p);
        }
    }
}
