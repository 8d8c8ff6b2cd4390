//! Error types for the federation link layer.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FederationError>;

/// Federation link layer errors.
#[derive(Debug, Error)]
pub enum FederationError {
    /// IO error (network)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The S2S listener could not bind its socket.
    ///
    /// This is a configuration error and is never retried.
    #[error("Failed to bind S2S listener on {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Outbound dial to a remote domain failed
    #[error("Dial to {domain_pair} failed: {reason}")]
    Dial {
        /// Canonical domain pair key
        domain_pair: String,
        /// Human readable reason
        reason: String,
    },

    /// Outbound connect timed out
    #[error("Connection to {domain} timed out after {timeout:?}")]
    Timeout {
        /// Remote domain
        domain: String,
        /// Configured connect timeout
        timeout: Duration,
    },

    /// A domain pair was built from an empty domain
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    /// The link manager is draining or stopped
    #[error("Federation link manager is shutting down")]
    Shutdown,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stream error reported by a stream implementation
    #[error("Stream error: {0}")]
    Stream(String),
}

impl FederationError {
    /// Create a new dial error.
    pub fn dial(domain_pair: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Dial {
            domain_pair: domain_pair.into(),
            reason: reason.into(),
        }
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new invalid domain error.
    pub fn invalid_domain(msg: impl Into<String>) -> Self {
        Self::InvalidDomain(msg.into())
    }
}
