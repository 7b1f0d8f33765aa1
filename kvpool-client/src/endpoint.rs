//! Target endpoint and credentials for physical connections.

use std::fmt;
use std::time::Duration;

use crate::error::{ClientError, ClientResult};

/// Default time allowed to establish a TCP session.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Password, optionally paired with an ACL username.
///
/// `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    username: Option<String>,
    password: String,
}

impl Credential {
    pub fn password(password: impl Into<String>) -> Self {
        Credential {
            username: None,
            password: password.into(),
        }
    }

    pub fn with_username(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential {
            username: Some(username.into()),
            password: password.into(),
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub(crate) fn secret(&self) -> &[u8] {
        self.password.as_bytes()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where and how to open physical connections.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub credential: Option<Credential>,
    /// Logical database selected after authentication; 0 skips `SELECT`.
    pub database: u32,
    pub connect_timeout: Duration,
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        EndpointConfig {
            host: host.into(),
            port,
            credential: None,
            database: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.host.trim().is_empty() {
            return Err(ClientError::invalid("endpoint host must not be empty"));
        }
        if self.port == 0 {
            return Err(ClientError::invalid("endpoint port must be in 1..=65535"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::invalid("connect timeout must be positive"));
        }
        Ok(())
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig::new("127.0.0.1", 6379)
    }
}
