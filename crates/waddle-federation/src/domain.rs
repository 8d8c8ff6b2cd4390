//! Identifiers for federation links.

use std::fmt;
use std::sync::Arc;

use crate::error::{FederationError, Result};

/// Identifier of a single S2S stream.
///
/// Outbound streams use their domain pair key; inbound streams use a
/// connection-derived identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(Arc<str>);

impl StreamId {
    /// Create a stream ID from any string.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Generate a fresh identifier for an inbound connection.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Ordered (local, remote) pair of XMPP domains identifying one outbound link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainPair {
    local: String,
    remote: String,
}

impl DomainPair {
    /// Create a domain pair. Both domains must be non-empty.
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Result<Self> {
        let local = local.into();
        let remote = remote.into();
        if local.is_empty() {
            return Err(FederationError::invalid_domain("local domain is empty"));
        }
        if remote.is_empty() {
            return Err(FederationError::invalid_domain("remote domain is empty"));
        }
        Ok(Self { local, remote })
    }

    /// The local (originating) domain.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The remote (receiving) domain.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Canonical registry key, `local:remote`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.local, self.remote)
    }

    /// Stream ID of the outbound stream serving this pair.
    pub fn stream_id(&self) -> StreamId {
        StreamId::new(self.key())
    }
}

impl fmt::Display for DomainPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}
