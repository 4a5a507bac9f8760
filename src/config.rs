//! Server configuration.
//!
//! Embedding applications usually build a [`Config`] in code; it also
//! deserializes from YAML for deployments that keep server settings in a
//! config file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Deadline applied to every socket read, in milliseconds. Unset or 0
    /// means no deadline. Expiry closes the connection.
    pub read_timeout_ms: Option<u64>,
    /// Deadline applied to every response write, in milliseconds. Unset or
    /// 0 means no deadline.
    pub write_timeout_ms: Option<u64>,
    /// When true, a panic in a handler unwinds through the connection task
    /// instead of being caught and logged.
    #[serde(default)]
    pub disable_panic_recovery: bool,
    /// Optional certificate material for LDAPS or STARTTLS.
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM file with the server certificate chain.
    pub cert_file: String,
    /// PEM file with the PKCS#8 or RSA private key.
    pub key_file: String,
}

impl Config {
    /// Load a config from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let content = std::fs::read_to_string(path)?;
        Config::from_yaml(&content)
    }

    /// Parse a config from YAML.
    pub fn from_yaml(content: &str) -> Result<Config> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::InvalidParameter(format!("invalid config: {}", e)))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
