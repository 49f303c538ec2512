use std::{path::{Path, PathBuf}, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::tunnel::{Gateway, GatewayUrlError};

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:3128";
const DEFAULT_RELAY_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid listen address `{0}`, expected host:port")]
    InvalidListenAddress(String),
    #[error(transparent)]
    InvalidGatewayUrl(#[from] GatewayUrlError),
    #[error("Relay buffer size must be at least 1 byte")]
    InvalidBufferSize,
    #[error("Maximum connection count must be at least 1")]
    InvalidMaxConnections,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TlsSettings {
    /// Accept any certificate presented by the gateway.
    pub disable_verification: bool,
    /// PEM bundle replacing the built-in trust anchors.
    pub alternate_ca_path: Option<PathBuf>,
}

#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    /// Local address the proxy listens on.
    pub listen: String,

    /// URL of the access gateway. Empty or absent means direct tunneling.
    pub gateway_url: Option<String>,
    /// Bearer token presented to the gateway on every CONNECT.
    pub gateway_token: Option<String>,

    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub connect_timeout: Duration,
    /// Time a client gets to send its request head.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub request_timeout: Duration,
    /// How long in-flight connections get to wind down on shutdown.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub shutdown_grace: Duration,

    pub tcp_nodelay: bool,
    pub max_connections: Option<usize>,
    pub relay_buffer_size: usize,

    pub tls: TlsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDRESS.to_owned(),
            gateway_url: None,
            gateway_token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            tcp_nodelay: true,
            max_connections: None,
            relay_buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
            tls: TlsSettings::default(),
        }
    }
}

impl Settings {
    /// Parses the configured gateway, `None` in direct mode.
    pub fn gateway(&self) -> Result<Option<Gateway>, ConfigError> {
        match self.gateway_url.as_deref() {
            Some(url) => Ok(Gateway::parse(url)?),
            None => Ok(None),
        }
    }

    /// Checks everything that can be checked before binding anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_listen_address(&self.listen)?;
        self.gateway()?;
        if self.relay_buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::InvalidMaxConnections);
        }
        Ok(())
    }
}

fn validate_listen_address(listen: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidListenAddress(listen.to_owned());
    let (host, port) = listen.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    port.parse::<u16>().map_err(|_| invalid())?;
    Ok(())
}

/// Loads settings from a TOML file, or the defaults when no file is given.
pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };

    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}
