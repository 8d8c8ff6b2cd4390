//! S2S stream capability.
//!
//! The XMPP protocol engine for a single federation link (STARTTLS, dialback,
//! stanza routing) lives behind [`S2sStream`]. The link layer only needs to
//! identify a stream and ask it to disconnect; streams report their own
//! termination through the [`OnDisconnect`] callback they were built with.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::dialback::DialbackKey;
use crate::dialer::{Dialer, OutboundConnection};
use crate::domain::{DomainPair, StreamId};
use crate::error::Result;
use crate::transport::Transport;

/// S2S connection direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum S2sDirection {
    /// Inbound connection (remote server connected to us)
    Inbound,
    /// Outbound connection (we connected to remote server)
    Outbound,
}

impl S2sDirection {
    /// Short label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "in",
            Self::Outbound => "out",
        }
    }
}

impl fmt::Display for S2sDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason passed to [`S2sStream::disconnect`], named after the RFC 6120
/// stream error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The server is being shut down
    SystemShutdown,
    /// The peer did not complete negotiation in time
    ConnectionTimeout,
    /// The peer violated a local policy (e.g. stanza too large)
    PolicyViolation,
    /// The peer failed dialback verification
    NotAuthorized,
    /// A remote connection required for the stream failed
    RemoteConnectionFailed,
    /// A newer stream replaced this one
    Conflict,
    /// Anything else
    UndefinedCondition,
}

impl StreamError {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemShutdown => "system-shutdown",
            Self::ConnectionTimeout => "connection-timeout",
            Self::PolicyViolation => "policy-violation",
            Self::NotAuthorized => "not-authorized",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::Conflict => "conflict",
            Self::UndefinedCondition => "undefined-condition",
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running S2S stream.
#[async_trait]
pub trait S2sStream: Send + Sync + 'static {
    /// Stream identifier. Stable for the lifetime of the stream.
    fn id(&self) -> &StreamId;

    /// Direction of the stream.
    fn direction(&self) -> S2sDirection;

    /// Terminate the stream with `reason`.
    ///
    /// Once the stream has torn down it must invoke its [`OnDisconnect`]
    /// callback. Disconnecting an already closed stream is a no-op.
    async fn disconnect(&self, reason: StreamError) -> Result<()>;
}

impl fmt::Debug for dyn S2sStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S2sStream")
            .field("id", self.id())
            .field("direction", &self.direction())
            .finish()
    }
}

/// One-shot callback a stream fires when it terminates.
///
/// Cloning shares the same slot: whichever clone fires first runs the
/// callback, later calls do nothing.
#[derive(Clone)]
pub struct OnDisconnect {
    slot: Arc<Mutex<Option<Box<dyn FnOnce(&StreamId) + Send>>>>,
}

impl OnDisconnect {
    /// Wrap a callback.
    pub fn new(f: impl FnOnce(&StreamId) + Send + 'static) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(Box::new(f)))),
        }
    }

    /// A callback that does nothing.
    pub fn noop() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Run the callback. Returns `false` if it already ran.
    pub fn fire(&self, id: &StreamId) -> bool {
        let callback = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match callback {
            Some(f) => {
                f(id);
                true
            }
            None => false,
        }
    }

    /// Whether the callback has already run.
    pub fn is_fired(&self) -> bool {
        match self.slot.lock() {
            Ok(slot) => slot.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl fmt::Debug for OnDisconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnDisconnect")
            .field("fired", &self.is_fired())
            .finish()
    }
}

/// Everything an inbound stream needs to run.
pub struct InboundStreamConfig {
    /// Identifier assigned to the new stream
    pub id: StreamId,
    /// Dialback key generator bound to the shared secret
    pub key_gen: DialbackKey,
    /// Accepted, configured transport
    pub transport: Transport,
    /// Negotiation timeout
    pub connect_timeout: Duration,
    /// Maximum stanza size in bytes
    pub max_stanza_size: usize,
    /// Dialer for answering dialback verification requests
    pub dialer: Arc<dyn Dialer>,
    /// Unregisters the stream from the inbound registry
    pub on_disconnect: OnDisconnect,
}

/// Everything an outbound stream needs to run.
pub struct OutboundStreamConfig {
    /// Identifier of the stream (the domain pair key)
    pub id: StreamId,
    /// Connection produced by the dialer
    pub connection: OutboundConnection,
    /// Dialback key generator bound to the shared secret
    pub key_gen: DialbackKey,
    /// Negotiation timeout
    pub connect_timeout: Duration,
    /// Maximum stanza size in bytes
    pub max_stanza_size: usize,
    /// Unregisters the stream from the outbound registry
    pub on_disconnect: OnDisconnect,
}

/// Creates and starts S2S streams.
///
/// Implementations run each stream on its own task and return immediately.
pub trait StreamFactory: Send + Sync + 'static {
    /// Start an inbound stream over an accepted connection.
    fn spawn_inbound(&self, config: InboundStreamConfig) -> Arc<dyn S2sStream>;

    /// Start an outbound stream over a dialled connection.
    fn spawn_outbound(&self, pair: &DomainPair, config: OutboundStreamConfig)
        -> Arc<dyn S2sStream>;
}
