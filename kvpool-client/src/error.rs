//! # Client Errors
//!
//! Purpose: One typed error surface for configuration, pool, transport and
//! command failures so callers decide retry and backoff themselves.

use std::time::Duration;

use thiserror::Error;

/// Result type for the pooled client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the connection factory and its connections.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Endpoint, pool or resource parameters are malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No connection became available within the pool's maximum wait.
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted {
        /// How long the caller was blocked before giving up.
        waited: Duration,
    },

    /// Establishing a new physical connection took too long.
    #[error("timed out connecting to {address} after {timeout:?}")]
    ConnectTimeout {
        /// Target address.
        address: String,
        /// Configured connect timeout.
        timeout: Duration,
    },

    /// The transport refused or failed while connecting.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        /// Target address.
        address: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The server rejected the configured credential.
    #[error("authentication failed: {message}")]
    Auth {
        /// Error reply returned by the server.
        message: String,
    },

    /// A single command exceeded the command timeout.
    #[error("command {command} timed out after {timeout:?}")]
    CommandTimeout {
        /// Upper-cased command name.
        command: String,
        /// Configured command timeout.
        timeout: Duration,
    },

    /// The factory was closed before or during this call.
    #[error("connection factory is closed")]
    FactoryClosed,

    /// The shared client resources were shut down.
    #[error("client resources are shut down")]
    ResourcesShutdown,

    /// The logical connection lost its physical connection after an earlier failure.
    #[error("connection is broken and can no longer issue commands")]
    ConnectionBroken,

    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,

    /// Server returned an error reply.
    #[error("server error: {message}")]
    Server {
        /// Error reply text.
        message: String,
    },

    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
}

impl ClientError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ClientError::InvalidConfiguration(message.into())
    }

    pub(crate) fn server(message: &[u8]) -> Self {
        ClientError::Server {
            message: String::from_utf8_lossy(message).into_owned(),
        }
    }
}
