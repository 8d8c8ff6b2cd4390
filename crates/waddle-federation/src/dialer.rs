//! Outbound dialling.
//!
//! The [`Dialer`] opens the network connection for a new outbound link. The
//! outbound registry invokes it at most once per domain pair at a time and
//! returns its errors to the caller unmodified.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::config::DEFAULT_S2S_PORT;
use crate::domain::DomainPair;
use crate::error::{FederationError, Result};
use crate::transport::{SocketTransportFactory, Transport, TransportFactory};

/// A freshly dialled outbound connection, ready for stream negotiation.
#[derive(Debug)]
pub struct OutboundConnection {
    /// Domain pair the connection was dialled for
    pub pair: DomainPair,
    /// Connected transport
    pub transport: Transport,
}

impl OutboundConnection {
    /// Create a new outbound connection.
    pub fn new(pair: DomainPair, transport: Transport) -> Self {
        Self { pair, transport }
    }

    /// Remote address, if known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }
}

/// Opens outbound federation connections.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connect `local` to `remote`.
    async fn dial(&self, pair: &DomainPair) -> Result<OutboundConnection>;
}

/// Plain TCP dialer.
///
/// Connects to `remote:port` under the connect timeout. Target discovery
/// beyond the A/AAAA lookup done by the OS resolver is left to custom
/// dialers.
pub struct TcpDialer {
    port: u16,
    connect_timeout: Duration,
    transport: Arc<dyn TransportFactory>,
}

impl TcpDialer {
    /// Create a dialer targeting the default S2S port.
    pub fn new(connect_timeout: Duration, keep_alive: bool) -> Self {
        Self {
            port: DEFAULT_S2S_PORT,
            connect_timeout,
            transport: Arc::new(SocketTransportFactory::new(keep_alive)),
        }
    }

    /// Override the remote port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the transport factory.
    pub fn with_transport(mut self, transport: Arc<dyn TransportFactory>) -> Self {
        self.transport = transport;
        self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    #[instrument(skip(self), name = "s2s.dialer.dial", fields(domain_pair = %pair))]
    async fn dial(&self, pair: &DomainPair) -> Result<OutboundConnection> {
        let target = (pair.remote(), self.port);

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(FederationError::dial(pair.key(), e.to_string())),
            Err(_) => {
                return Err(FederationError::Timeout {
                    domain: pair.remote().to_string(),
                    timeout: self.connect_timeout,
                })
            }
        };

        let peer_addr = stream.peer_addr()?;
        let transport = self.transport.wrap(stream, peer_addr)?;
        debug!(peer = %peer_addr, "Outbound TCP connection established");

        Ok(OutboundConnection::new(pair.clone(), transport))
    }
}
