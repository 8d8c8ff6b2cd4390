//! Federation link manager.
//!
//! Owns the S2S listener and both link registries, and coordinates startup
//! and graceful shutdown:
//!
//! 1. `stop()` wins the listener compare-and-set (losers return immediately)
//! 2. The listening socket is closed, if the manager was started
//! 3. The manager starts draining: new `get_or_dial` calls fail and dials
//!    still in flight disconnect their stream as soon as it starts
//! 4. Every outbound link, then every inbound stream, is disconnected with
//!    `system-shutdown`

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, instrument, warn};

use crate::config::S2sConfig;
use crate::dialer::Dialer;
use crate::error::Result;
use crate::listener::{ListenerState, S2sListener};
use crate::metrics::S2sMetrics;
use crate::registry::{InboundRegistry, OutboundLink, OutboundRegistry};
use crate::stream::{StreamError, StreamFactory};
use crate::transport::{SocketTransportFactory, TransportFactory};

/// Outcome of [`FederationManager::stop`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Outbound links disconnected cleanly
    pub outbound_closed: usize,
    /// Inbound streams disconnected cleanly
    pub inbound_closed: usize,
    /// Disconnects that returned an error
    pub errors: usize,
    /// `stop` had already run; nothing was touched
    pub already_stopped: bool,
}

/// Federation link manager.
pub struct FederationManager {
    config: S2sConfig,
    listener: S2sListener,
    inbound: Arc<InboundRegistry>,
    outbound: Arc<OutboundRegistry>,
    draining: Arc<AtomicBool>,
    metrics: Arc<S2sMetrics>,
}

impl FederationManager {
    /// Create a manager using the default socket transport.
    pub fn new(
        config: S2sConfig,
        dialer: Arc<dyn Dialer>,
        factory: Arc<dyn StreamFactory>,
    ) -> Self {
        let transport = Arc::new(SocketTransportFactory::new(config.keep_alive));
        Self::with_transport(config, dialer, factory, transport)
    }

    /// Create a manager with a custom transport factory for accepted sockets.
    pub fn with_transport(
        config: S2sConfig,
        dialer: Arc<dyn Dialer>,
        factory: Arc<dyn StreamFactory>,
        transport: Arc<dyn TransportFactory>,
    ) -> Self {
        let metrics = Arc::new(S2sMetrics::new());
        let draining = Arc::new(AtomicBool::new(false));
        let inbound = Arc::new(InboundRegistry::new(Arc::clone(&metrics)));
        let outbound = Arc::new(OutboundRegistry::new(
            Arc::clone(&dialer),
            Arc::clone(&factory),
            config.key_gen(),
            config.connect_timeout,
            config.max_stanza_size,
            Arc::clone(&draining),
            Arc::clone(&metrics),
        ));
        let listener = S2sListener::new(
            &config,
            dialer,
            factory,
            transport,
            Arc::clone(&inbound),
            Arc::clone(&metrics),
        );

        Self {
            config,
            listener,
            inbound,
            outbound,
            draining,
            metrics,
        }
    }

    /// Validate the configuration and start accepting inbound connections.
    ///
    /// Returns the bound address. Bind errors are configuration errors; the
    /// caller is expected to terminate rather than retry.
    #[instrument(skip(self), name = "s2s.manager.start", fields(s2s = %self.config.id))]
    pub async fn start(&self) -> Result<SocketAddr> {
        self.config.validate()?;
        self.listener.start(self.config.listen_addr()).await
    }

    /// Return the outbound link for `local:remote`, dialling it if needed.
    ///
    /// See [`OutboundRegistry::get_or_dial`].
    pub async fn get_or_dial(
        &self,
        local_domain: &str,
        remote_domain: &str,
    ) -> Result<Arc<OutboundLink>> {
        self.outbound.get_or_dial(local_domain, remote_domain).await
    }

    /// Shut down: close the listener, then disconnect every link.
    ///
    /// Idempotent. Only the first call does any work; later calls return a
    /// report with `already_stopped` set. A manager that was never started
    /// still drains links created by `get_or_dial`, and can no longer be
    /// started afterwards.
    #[instrument(skip(self), name = "s2s.manager.stop", fields(s2s = %self.config.id))]
    pub async fn stop(&self) -> ShutdownReport {
        if !self.listener.stop().await {
            return ShutdownReport {
                already_stopped: self.listener.state() == ListenerState::Stopped,
                ..ShutdownReport::default()
            };
        }
        self.draining.store(true, Ordering::SeqCst);

        let mut report = ShutdownReport::default();
        let id = &self.config.id;

        let links = self.outbound.drain();
        let results = join_all(
            links
                .iter()
                .map(|link| link.disconnect(StreamError::SystemShutdown)),
        )
        .await;
        for (link, result) in links.iter().zip(results) {
            match result {
                Ok(()) => report.outbound_closed += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(domain_pair = %link.pair(), error = %e, "Failed to disconnect s2s out stream");
                }
            }
        }
        info!(
            count = report.outbound_closed,
            "{}: shutting down... closed {} out connection(s)",
            id,
            report.outbound_closed
        );

        let streams = self.inbound.drain();
        let results = join_all(
            streams
                .iter()
                .map(|stream| stream.disconnect(StreamError::SystemShutdown)),
        )
        .await;
        for (stream, result) in streams.iter().zip(results) {
            match result {
                Ok(()) => report.inbound_closed += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(id = %stream.id(), error = %e, "Failed to disconnect s2s in stream");
                }
            }
        }
        info!(
            count = report.inbound_closed,
            "{}: shutting down... closed {} in connection(s)",
            id,
            report.inbound_closed
        );

        report
    }

    /// Listener lifecycle state.
    pub fn state(&self) -> ListenerState {
        self.listener.state()
    }

    /// Whether shutdown has begun.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Bound listener address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Inbound stream registry.
    pub fn inbound(&self) -> &Arc<InboundRegistry> {
        &self.inbound
    }

    /// Outbound link registry.
    pub fn outbound(&self) -> &Arc<OutboundRegistry> {
        &self.outbound
    }

    /// Link metrics.
    pub fn metrics(&self) -> &Arc<S2sMetrics> {
        &self.metrics
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &S2sConfig {
        &self.config
    }
}

impl std::fmt::Debug for FederationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationManager")
            .field("id", &self.config.id)
            .field("state", &self.state())
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .finish()
    }
}
