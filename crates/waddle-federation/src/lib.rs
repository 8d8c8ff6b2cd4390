//! # waddle-federation
//!
//! XMPP server-to-server (S2S) federation link layer for Waddle Social.
//!
//! This crate manages the set of federation links between the local server
//! and remote XMPP domains. It does not speak the XMPP protocol itself: stream
//! negotiation, dialback and stanza routing are provided by an
//! [`S2sStream`] implementation created through a [`StreamFactory`].
//!
//! ## Architecture
//!
//! - **Listener**: TCP listener on port 5269, one inbound stream per accepted
//!   connection
//! - **Inbound Registry**: active inbound streams keyed by stream ID
//! - **Outbound Registry**: at most one outbound link per `local:remote`
//!   domain pair, dialled on demand
//! - **Dialback keys**: HMAC-SHA256 keys (XEP-0220) shared by all streams
//! - **Manager**: owns the above, handles start and graceful shutdown
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! # use waddle_federation::{S2sConfig, FederationManager, TcpDialer, StreamFactory};
//! # async fn run(factory: Arc<dyn StreamFactory>) -> waddle_federation::Result<()> {
//! let config = S2sConfig::from_env();
//! let dialer = Arc::new(TcpDialer::new(config.connect_timeout, config.keep_alive));
//! let manager = FederationManager::new(config, dialer, factory);
//!
//! manager.start().await?;
//! let link = manager.get_or_dial("waddle.social", "example.org").await?;
//! let stream = link.wait_established().await?;
//! # let _ = stream;
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dialback;
pub mod dialer;
pub mod domain;
pub mod listener;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod stream;
pub mod transport;

mod error;

pub use config::{BackoffConfig, S2sConfig};
pub use dialback::DialbackKey;
pub use dialer::{Dialer, OutboundConnection, TcpDialer};
pub use domain::{DomainPair, StreamId};
pub use error::{FederationError, Result};
pub use listener::{Accept, ListenerState, ListeningFlag, S2sListener};
pub use manager::{FederationManager, ShutdownReport};
pub use metrics::S2sMetrics;
pub use registry::{InboundRegistry, LinkState, OutboundLink, OutboundRegistry};
pub use stream::{
    InboundStreamConfig, OnDisconnect, OutboundStreamConfig, S2sDirection, S2sStream,
    StreamError, StreamFactory,
};
pub use transport::{SocketTransportFactory, Transport, TransportFactory};
