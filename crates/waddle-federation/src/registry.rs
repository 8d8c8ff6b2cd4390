//! Inbound and outbound S2S link registries.
//!
//! Both registries are `DashMap`s owned by one [`FederationManager`]
//! instance. Mutation is limited to single atomic insert/remove operations;
//! no map lock is ever held across an `.await`.
//!
//! ## Outbound get-or-dial
//!
//! ```text
//! caller A ──► entry(a:b) vacant ──► insert Pending ──► dial ──► attach stream ──► Established
//! caller B ──► entry(a:b) occupied ─► return same handle (possibly still Pending)
//! ```
//!
//! Only the caller that inserted the slot dials. A failed dial rolls the
//! slot back so a later call can retry.
//!
//! [`FederationManager`]: crate::manager::FederationManager

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::dialback::DialbackKey;
use crate::dialer::Dialer;
use crate::domain::{DomainPair, StreamId};
use crate::error::{FederationError, Result};
use crate::metrics::S2sMetrics;
use crate::stream::{
    OnDisconnect, OutboundStreamConfig, S2sDirection, S2sStream, StreamError, StreamFactory,
};

/// Lifecycle of an outbound link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Registry slot reserved, dial in progress
    Pending,
    /// Dial succeeded, stream running
    Established,
    /// Dial failed, slot removed
    Failed,
    /// Stream terminated, slot removed
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Established => write!(f, "established"),
            Self::Failed => write!(f, "failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Handle to an outbound link, shared by every caller that asked for the
/// same domain pair.
pub struct OutboundLink {
    pair: DomainPair,
    id: StreamId,
    state: watch::Sender<LinkState>,
    stream: OnceLock<Arc<dyn S2sStream>>,
    disconnect_requested: AtomicBool,
}

impl OutboundLink {
    fn new(pair: DomainPair) -> Arc<Self> {
        let (state, _) = watch::channel(LinkState::Pending);
        Arc::new(Self {
            id: pair.stream_id(),
            pair,
            state,
            stream: OnceLock::new(),
            disconnect_requested: AtomicBool::new(false),
        })
    }

    /// Domain pair served by this link.
    pub fn pair(&self) -> &DomainPair {
        &self.pair
    }

    /// Stream ID (the domain pair key).
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// The outbound stream, once the dial has completed.
    pub fn stream(&self) -> Option<Arc<dyn S2sStream>> {
        self.stream.get().cloned()
    }

    /// Wait until the dial finishes and return the running stream.
    pub async fn wait_established(&self) -> Result<Arc<dyn S2sStream>> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|state| *state != LinkState::Pending)
            .await
            .map_err(|_| FederationError::Shutdown)?;

        match state {
            LinkState::Established => self
                .stream()
                .ok_or_else(|| FederationError::stream("established link without a stream")),
            LinkState::Failed => Err(FederationError::dial(self.pair.key(), "dial failed")),
            LinkState::Closed | LinkState::Pending => Err(FederationError::stream(format!(
                "link {} is closed",
                self.pair
            ))),
        }
    }

    /// Disconnect the link.
    ///
    /// If the dial is still in flight the request is remembered and the
    /// stream is disconnected as soon as it starts.
    pub async fn disconnect(&self, reason: StreamError) -> Result<()> {
        self.disconnect_requested.store(true, Ordering::SeqCst);
        match self.stream.get() {
            Some(stream) => stream.disconnect(reason).await,
            None => Ok(()),
        }
    }

    fn disconnect_requested(&self) -> bool {
        self.disconnect_requested.load(Ordering::SeqCst)
    }

    fn attach(&self, stream: Arc<dyn S2sStream>) {
        if self.stream.set(stream).is_err() {
            warn!(domain_pair = %self.pair, "Outbound link already has a stream");
            return;
        }
        self.state.send_if_modified(|state| {
            if *state == LinkState::Pending {
                *state = LinkState::Established;
                true
            } else {
                false
            }
        });
    }

    fn mark_failed(&self) {
        self.state.send_replace(LinkState::Failed);
    }

    fn mark_closed(&self) {
        self.state.send_replace(LinkState::Closed);
    }
}

impl fmt::Debug for OutboundLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundLink")
            .field("pair", &self.pair)
            .field("state", &self.state())
            .finish()
    }
}

/// Registry of outbound links keyed by domain pair.
pub struct OutboundRegistry {
    links: DashMap<String, Arc<OutboundLink>>,
    dialer: Arc<dyn Dialer>,
    factory: Arc<dyn StreamFactory>,
    key_gen: DialbackKey,
    connect_timeout: Duration,
    max_stanza_size: usize,
    draining: Arc<AtomicBool>,
    metrics: Arc<S2sMetrics>,
}

impl OutboundRegistry {
    /// Create an empty outbound registry.
    pub fn new(
        dialer: Arc<dyn Dialer>,
        factory: Arc<dyn StreamFactory>,
        key_gen: DialbackKey,
        connect_timeout: Duration,
        max_stanza_size: usize,
        draining: Arc<AtomicBool>,
        metrics: Arc<S2sMetrics>,
    ) -> Self {
        Self {
            links: DashMap::new(),
            dialer,
            factory,
            key_gen,
            connect_timeout,
            max_stanza_size,
            draining,
            metrics,
        }
    }

    /// Return the link for `local:remote`, dialling it if none exists.
    ///
    /// Concurrent callers for the same pair all receive the same handle and
    /// the dialer runs once. Callers that did not dial may get a handle that
    /// is still [`LinkState::Pending`]; use [`OutboundLink::wait_established`]
    /// to wait for it.
    #[instrument(skip(self), name = "s2s.outbound.get_or_dial")]
    pub async fn get_or_dial(
        self: &Arc<Self>,
        local_domain: &str,
        remote_domain: &str,
    ) -> Result<Arc<OutboundLink>> {
        let pair = DomainPair::new(local_domain, remote_domain)?;
        if self.is_draining() {
            return Err(FederationError::Shutdown);
        }

        let link = match self.links.entry(pair.key()) {
            Entry::Occupied(existing) => {
                self.metrics.record_dedup_hit();
                debug!(domain_pair = %pair, state = %existing.get().state(), "Reusing s2s out stream");
                return Ok(Arc::clone(existing.get()));
            }
            Entry::Vacant(slot) => {
                let link = OutboundLink::new(pair.clone());
                slot.insert(Arc::clone(&link));
                link
            }
        };
        self.metrics.record_link_registered(S2sDirection::Outbound);

        // Releases the slot if the dial fails or this future is dropped
        // before the stream is attached.
        let mut rollback = DialRollback::new(self, &link);

        let connection = match self.dialer.dial(&pair).await {
            Ok(connection) => {
                self.metrics.record_dial(true);
                connection
            }
            Err(e) => {
                self.metrics.record_dial(false);
                warn!(domain_pair = %pair, error = %e, "Failed to dial s2s out stream");
                return Err(e);
            }
        };

        let on_disconnect = self.unregister_callback(&link);
        let config = OutboundStreamConfig {
            id: link.id().clone(),
            connection,
            key_gen: self.key_gen.clone(),
            connect_timeout: self.connect_timeout,
            max_stanza_size: self.max_stanza_size,
            on_disconnect: on_disconnect.clone(),
        };
        let stream = self.factory.spawn_outbound(&pair, config);
        link.attach(Arc::clone(&stream));
        rollback.disarm();
        info!(domain_pair = %pair, "registered s2s out stream");

        if self.is_draining() || link.disconnect_requested() {
            info!(domain_pair = %pair, "Dial completed during shutdown, disconnecting");
            if let Err(e) = stream.disconnect(StreamError::SystemShutdown).await {
                warn!(domain_pair = %pair, error = %e, "Failed to disconnect s2s out stream");
            }
            self.remove(&link);
            link.mark_closed();
            return Err(FederationError::Shutdown);
        }

        if on_disconnect.is_fired() {
            // The stream terminated before it was attached.
            self.remove(&link);
            link.mark_closed();
        }

        Ok(link)
    }

    /// Remove `link` from the registry.
    ///
    /// Only removes the entry if it still maps to this exact handle, so a
    /// stale callback cannot evict a newer link for the same pair.
    pub fn unregister(&self, link: &Arc<OutboundLink>) -> bool {
        link.mark_closed();
        let removed = self.remove(link);
        if removed {
            info!(domain_pair = %link.pair(), "unregistered s2s out stream");
        }
        removed
    }

    fn remove(&self, link: &Arc<OutboundLink>) -> bool {
        let removed = self
            .links
            .remove_if(&link.pair().key(), |_, current| Arc::ptr_eq(current, link))
            .is_some();
        if removed {
            self.metrics.record_link_unregistered(S2sDirection::Outbound);
        }
        removed
    }

    fn unregister_callback(self: &Arc<Self>, link: &Arc<OutboundLink>) -> OnDisconnect {
        let registry: Weak<Self> = Arc::downgrade(self);
        let link: Weak<OutboundLink> = Arc::downgrade(link);
        OnDisconnect::new(move |_id| {
            let Some(link) = link.upgrade() else {
                return;
            };
            match registry.upgrade() {
                Some(registry) => {
                    registry.unregister(&link);
                }
                None => link.mark_closed(),
            }
        })
    }

    /// Remove every link and return them, for shutdown.
    ///
    /// Drained links are marked closed; their streams still need to be
    /// disconnected by the caller.
    pub fn drain(&self) -> Vec<Arc<OutboundLink>> {
        let keys: Vec<String> = self.links.iter().map(|entry| entry.key().clone()).collect();
        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, link)) = self.links.remove(&key) {
                self.metrics.record_link_unregistered(S2sDirection::Outbound);
                link.mark_closed();
                drained.push(link);
            }
        }
        drained
    }

    /// Look up the link for a domain pair.
    pub fn get(&self, pair: &DomainPair) -> Option<Arc<OutboundLink>> {
        self.links.get(&pair.key()).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a link exists for a domain pair.
    pub fn contains(&self, pair: &DomainPair) -> bool {
        self.links.contains_key(&pair.key())
    }

    /// Number of registered links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Keys of all registered links.
    pub fn domain_pairs(&self) -> Vec<DomainPair> {
        self.links
            .iter()
            .map(|entry| entry.value().pair().clone())
            .collect()
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Removes a pending link from the registry and marks it failed when
/// dropped, unless disarmed once the dialled stream is attached.
struct DialRollback<'a> {
    registry: &'a OutboundRegistry,
    link: Arc<OutboundLink>,
    armed: bool,
}

impl<'a> DialRollback<'a> {
    fn new(registry: &'a OutboundRegistry, link: &Arc<OutboundLink>) -> Self {
        Self {
            registry,
            link: Arc::clone(link),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DialRollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.registry.remove(&self.link) {
            debug!(domain_pair = %self.link.pair(), "Released pending s2s out slot");
        }
        self.link.mark_failed();
    }
}

impl fmt::Debug for OutboundRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundRegistry")
            .field("link_count", &self.links.len())
            .finish()
    }
}

/// Registry of active inbound streams keyed by stream ID.
pub struct InboundRegistry {
    streams: DashMap<StreamId, Arc<dyn S2sStream>>,
    metrics: Arc<S2sMetrics>,
}

impl InboundRegistry {
    /// Create an empty inbound registry.
    pub fn new(metrics: Arc<S2sMetrics>) -> Self {
        Self {
            streams: DashMap::new(),
            metrics,
        }
    }

    /// Register an inbound stream under its ID.
    ///
    /// Returns `false` if a stream with the same ID was replaced.
    pub fn register(&self, stream: Arc<dyn S2sStream>) -> bool {
        let id = stream.id().clone();
        let replaced = self.streams.insert(id.clone(), stream).is_some();
        if replaced {
            warn!(id = %id, "Replaced s2s in stream with duplicate id");
        } else {
            self.metrics.record_link_registered(S2sDirection::Inbound);
            info!(id = %id, "registered s2s in stream");
        }
        !replaced
    }

    /// Remove an inbound stream. Missing IDs are ignored.
    pub fn unregister(&self, id: &StreamId) -> Option<Arc<dyn S2sStream>> {
        let removed = self.streams.remove(id).map(|(_, stream)| stream);
        if removed.is_some() {
            self.metrics.record_link_unregistered(S2sDirection::Inbound);
            info!(id = %id, "unregistered s2s in stream");
        } else {
            debug!(id = %id, "s2s in stream was not registered");
        }
        removed
    }

    /// Callback that unregisters `id` when its stream terminates.
    pub fn unregister_callback(self: &Arc<Self>, id: StreamId) -> OnDisconnect {
        let registry = Arc::downgrade(self);
        OnDisconnect::new(move |_| {
            if let Some(registry) = registry.upgrade() {
                registry.unregister(&id);
            }
        })
    }

    /// Remove every stream and return them, for shutdown.
    pub fn drain(&self) -> Vec<Arc<dyn S2sStream>> {
        let ids = self.ids();
        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, stream)) = self.streams.remove(&id) {
                self.metrics.record_link_unregistered(S2sDirection::Inbound);
                drained.push(stream);
            }
        }
        drained
    }

    /// Look up a stream by ID.
    pub fn get(&self, id: &StreamId) -> Option<Arc<dyn S2sStream>> {
        self.streams.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a stream is registered.
    pub fn contains(&self, id: &StreamId) -> bool {
        self.streams.contains_key(id)
    }

    /// Number of registered streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// IDs of all registered streams.
    pub fn ids(&self) -> Vec<StreamId> {
        self.streams.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl fmt::Debug for InboundRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundRegistry")
            .field("stream_count", &self.streams.len())
            .finish()
    }
}
