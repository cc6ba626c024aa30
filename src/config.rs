//! Server configuration.
//!
//! A [`ServerConfig`] is built once at startup (defaults, then an optional
//! TOML file, then command line flags) and shared read-only by every session.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::auth::UserPass;
use crate::error::ConfigError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Credentials; `None` means no authentication is required
    pub credentials: Option<UserPass>,
    /// Idle timeout for sockets, also used for connect and handshake stages
    pub timeout: Duration,
    /// Maximum concurrent sessions
    pub max_connections: usize,
    /// Relay buffer size in bytes
    pub buffer_size: usize,
    /// Bind attempts before giving up
    pub bind_retries: u32,
    /// Base delay between bind attempts, doubled after each failure
    pub bind_retry_delay: Duration,
    /// Listen backlog handed to the OS
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9999,
            credentials: None,
            timeout: Duration::from_secs(30),
            max_connections: 100,
            buffer_size: 4096,
            bind_retries: 5,
            bind_retry_delay: Duration::from_secs(3),
            backlog: 100,
        }
    }
}

impl ServerConfig {
    /// listen_addr returns the `host:port` string to bind
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Overlay every key present in `file` onto this configuration.
    pub fn apply_file(&mut self, file: ServerConfigFile) -> Result<(), ConfigError> {
        if let Some(host) = file.host {
            self.host = host;
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        match (file.username, file.password) {
            (Some(username), Some(password)) => {
                self.credentials = Some(UserPass { username, password })
            }
            (None, None) => {}
            _ => {
                return Err(ConfigError::invalid(
                    "username and password must be set together",
                ));
            }
        }
        if let Some(secs) = file.timeout_secs {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(max) = file.max_connections {
            self.max_connections = max;
        }
        if let Some(size) = file.buffer_size {
            self.buffer_size = size;
        }
        if let Some(retries) = file.bind_retries {
            self.bind_retries = retries;
        }
        if let Some(secs) = file.bind_retry_delay_secs {
            self.bind_retry_delay = Duration::from_secs(secs);
        }
        if let Some(backlog) = file.backlog {
            self.backlog = backlog;
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::invalid("host cannot be empty"));
        }
        if let Some(creds) = &self.credentials {
            if creds.username.len() > 255 || creds.password.len() > 255 {
                return Err(ConfigError::invalid(
                    "username and password are limited to 255 bytes",
                ));
            }
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout must be greater than zero"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::invalid("max_connections must be at least 1"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::invalid("buffer_size must be at least 1"));
        }
        if self.bind_retries == 0 {
            return Err(ConfigError::invalid("bind_retries must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration file format. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfigFile {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_connections: Option<usize>,
    pub buffer_size: Option<usize>,
    pub bind_retries: Option<u32>,
    pub bind_retry_delay_secs: Option<u64>,
    pub backlog: Option<u32>,
}

impl ServerConfigFile {
    /// Parse a TOML document.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }
}
