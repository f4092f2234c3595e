//! Server configuration.
//!
//! # Example
//!
//! ```ignore
//! use xport::ServerConfig;
//!
//! let config = ServerConfig::new()
//!     .with_port(9000)
//!     .with_device_path("/link");
//!
//! let config = ServerConfig::from_json_str(r#"{ "port": 9000 }"#)?;
//! ```
//!
//! # JSON Keys
//!
//! | Key | Default |
//! |-----|---------|
//! | `bind` | `0.0.0.0` |
//! | `port` | `8000` |
//! | `xport_lwspath` | `/xportlws` |
//! | `xport_wspath` | `/xportws` |
//! | `version_path` | `/version` |
//! | `handshake_timeout_ms` | `5000` |
//! | `max_header_bytes` | `8192` |

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default listen address (all interfaces).
const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Default listen port.
const DEFAULT_PORT: u16 = 8000;

/// Default device endpoint.
const DEFAULT_DEVICE_PATH: &str = "/xportlws";

/// Default client endpoint.
const DEFAULT_CLIENT_PATH: &str = "/xportws";

/// Default version endpoint.
const DEFAULT_VERSION_PATH: &str = "/version";

/// Default time allowed for a request head to arrive.
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Default request head size limit.
const DEFAULT_MAX_HEADER_BYTES: usize = 8192;

/// Smallest accepted head limit; a bare upgrade request fits.
const MIN_HEADER_BYTES: usize = 256;

// ============================================================================
// ServerConfig
// ============================================================================

/// Listener and routing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind: IpAddr,

    /// Port to listen on (0 for random).
    pub port: u16,

    /// Path devices upgrade on.
    #[serde(rename = "xport_lwspath")]
    pub device_path: String,

    /// Path clients upgrade on.
    #[serde(rename = "xport_wspath")]
    pub client_path: String,

    /// Path answering with the crate version.
    pub version_path: String,

    /// Time allowed for a request head to arrive, in milliseconds.
    pub handshake_timeout_ms: u64,

    /// Largest request head accepted, in bytes.
    pub max_header_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ServerConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bind: DEFAULT_BIND_IP,
            port: DEFAULT_PORT,
            device_path: DEFAULT_DEVICE_PATH.to_string(),
            client_path: DEFAULT_CLIENT_PATH.to_string(),
            version_path: DEFAULT_VERSION_PATH.to_string(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }

    /// Parses a JSON configuration; missing keys keep their defaults and
    /// unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] if a value is out of range
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be read
    /// - see [`from_json_str`](Self::from_json_str)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ServerConfig {
    /// Sets the listen address.
    #[inline]
    #[must_use]
    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Sets the listen port.
    #[inline]
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the device endpoint path.
    #[inline]
    #[must_use]
    pub fn with_device_path(mut self, path: impl Into<String>) -> Self {
        self.device_path = path.into();
        self
    }

    /// Sets the client endpoint path.
    #[inline]
    #[must_use]
    pub fn with_client_path(mut self, path: impl Into<String>) -> Self {
        self.client_path = path.into();
        self
    }

    /// Sets the version endpoint path.
    #[inline]
    #[must_use]
    pub fn with_version_path(mut self, path: impl Into<String>) -> Self {
        self.version_path = path.into();
        self
    }

    /// Sets the request head timeout.
    #[inline]
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the request head size limit.
    #[inline]
    #[must_use]
    pub fn with_max_header_bytes(mut self, bytes: usize) -> Self {
        self.max_header_bytes = bytes;
        self
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl ServerConfig {
    /// Returns the socket address to listen on.
    #[inline]
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Returns the request head timeout.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("xport_lwspath", &self.device_path),
            ("xport_wspath", &self.client_path),
            ("version_path", &self.version_path),
        ] {
            if !path.starts_with('/') {
                return Err(Error::config(format!("{name} must start with '/': {path:?}")));
            }
        }

        if self.device_path == self.client_path {
            return Err(Error::config("device and client paths must differ"));
        }

        if self.handshake_timeout_ms == 0 {
            return Err(Error::config("handshake_timeout_ms must be positive"));
        }

        if self.max_header_bytes < MIN_HEADER_BYTES {
            return Err(Error::config(format!(
                "max_header_bytes must be at least {MIN_HEADER_BYTES}"
            )));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
