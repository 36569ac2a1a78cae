//! # Endpoint Descriptor
//!
//! Where and how to reach one server: address, optional password and the
//! socket timeout. Built once per target and shared as `Arc<Endpoint>` by
//! every connection opened against it.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rkv_common::{RkvError, RkvResult};

/// Default server port.
pub const DEFAULT_PORT: u16 = 6379;

/// Connection target shared by all connections to the same server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Sent with `AUTH` right after connecting when present. Never written
    /// back out when the endpoint is serialized.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Socket read/connect timeout in milliseconds; `0` disables it.
    pub timeout_ms: u32,
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            password: None,
            timeout_ms: 0,
        }
    }
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
            ..Endpoint::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Parses an endpoint from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> RkvResult<Self> {
        let endpoint: Endpoint =
            serde_json::from_str(json).map_err(|err| RkvError::Config(err.to_string()))?;
        endpoint.validate()?;
        Ok(endpoint)
    }

    /// Reads an endpoint from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> RkvResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|err| RkvError::Config(format!("{}: {}", path.display(), err)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> RkvResult<()> {
        if self.host.trim().is_empty() {
            return Err(RkvError::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(RkvError::Config("port must not be zero".into()));
        }
        Ok(())
    }

    /// Timeout as a `Duration`, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms as u64)),
        }
    }
}

// Keeps the password out of logs.
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
