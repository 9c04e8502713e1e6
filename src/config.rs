//! Configuration management
//!
//! Handles loading and validating client configuration from TOML files.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Listen address for inbound application connections
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Inbound protocol: SOCKS5 negotiation or a fixed tunnel target
    #[serde(default)]
    pub protocol: Protocol,
    /// Transport relayed to the server
    #[serde(default)]
    pub mode: Mode,
    /// Fixed forward address (host:port), required when protocol = "tunnel"
    pub forward: Option<String>,
    /// Read up to one early-data chunk from the inbound connection and
    /// carry it inside the client handshake
    #[serde(default)]
    pub fast_open: bool,
}

/// Remote Shadowsocks server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server address (host:port)
    pub address: String,
    /// Cipher method
    pub method: CipherMethod,
    /// Pre-shared key, base64-encoded
    pub password: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Inbound protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Socks,
    Tunnel,
}

/// Relayed transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Tcp,
    Udp,
}

/// Shadowsocks 2022 cipher method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CipherMethod {
    #[serde(rename = "2022-blake3-aes-128-gcm")]
    Aes128Gcm,
    #[serde(rename = "2022-blake3-aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "2022-blake3-chacha20-poly1305")]
    Chacha20Poly1305,
}

impl CipherMethod {
    /// Pre-shared key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            CipherMethod::Aes128Gcm => 16,
            CipherMethod::Aes256Gcm | CipherMethod::Chacha20Poly1305 => 32,
        }
    }
}

impl std::fmt::Display for CipherMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CipherMethod::Aes128Gcm => "2022-blake3-aes-128-gcm",
            CipherMethod::Aes256Gcm => "2022-blake3-aes-256-gcm",
            CipherMethod::Chacha20Poly1305 => "2022-blake3-chacha20-poly1305",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CipherMethod {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "2022-blake3-aes-128-gcm" => Ok(CipherMethod::Aes128Gcm),
            "2022-blake3-aes-256-gcm" => Ok(CipherMethod::Aes256Gcm),
            "2022-blake3-chacha20-poly1305" => Ok(CipherMethod::Chacha20Poly1305),
            _ => Err(crate::error::Error::UnsupportedCipher),
        }
    }
}

// Default value functions
fn default_listen() -> SocketAddr {
    "127.0.0.1:1080".parse().unwrap()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config =
            toml::from_str(&contents).with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.address.is_empty() {
            anyhow::bail!("server.address must not be empty");
        }
        if self.client.protocol == Protocol::Tunnel && self.client.forward.is_none() {
            anyhow::bail!("client.forward is required when client.protocol = \"tunnel\"");
        }
        let key = self.decoded_key()?;
        let expected = self.server.method.key_len();
        if key.len() != expected {
            anyhow::bail!(
                "server.password must decode to {} bytes for {}, got {}",
                expected,
                self.server.method,
                key.len()
            );
        }
        Ok(())
    }

    /// Decode the base64 pre-shared key.
    pub fn decoded_key(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.server.password)
            .context("server.password is not valid base64")
    }
}
