//! S2S listener for inbound federation connections.
//!
//! Accepts connections from remote XMPP servers (port 5269 by default),
//! starts an inbound stream for each one and registers it in the inbound
//! registry.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{BackoffConfig, S2sConfig};
use crate::dialback::DialbackKey;
use crate::dialer::Dialer;
use crate::domain::StreamId;
use crate::error::{FederationError, Result};
use crate::metrics::S2sMetrics;
use crate::registry::InboundRegistry;
use crate::stream::{InboundStreamConfig, StreamFactory};
use crate::transport::TransportFactory;

/// Listener lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// `start` has not been called
    NotStarted,
    /// Accept loop running
    Listening,
    /// `stop` has run
    Stopped,
}

const NOT_STARTED: u8 = 0;
const LISTENING: u8 = 1;
const STOPPED: u8 = 2;

/// Atomic listener state. Changes only by compare-and-set, so exactly one
/// caller wins each transition.
///
/// `stop` also moves a listener that never started straight to
/// [`ListenerState::Stopped`], so it can no longer be started.
#[derive(Debug)]
pub struct ListeningFlag(AtomicU8);

impl Default for ListeningFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ListeningFlag {
    /// New flag in [`ListenerState::NotStarted`].
    pub fn new() -> Self {
        Self(AtomicU8::new(NOT_STARTED))
    }

    /// Current state.
    pub fn state(&self) -> ListenerState {
        match self.0.load(Ordering::SeqCst) {
            NOT_STARTED => ListenerState::NotStarted,
            LISTENING => ListenerState::Listening,
            _ => ListenerState::Stopped,
        }
    }

    /// NotStarted -> Listening. Returns `true` for the winner.
    pub fn start(&self) -> bool {
        self.transition(NOT_STARTED, LISTENING)
    }

    /// Listening or NotStarted -> Stopped. Returns `true` for the winner.
    pub fn stop(&self) -> bool {
        self.transition(LISTENING, STOPPED) || self.transition(NOT_STARTED, STOPPED)
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.0
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Source of inbound connections for the accept loop.
///
/// Implemented for [`TcpListener`]; hosts with their own socket setup (e.g.
/// inherited listeners) can hand any source to [`S2sListener::serve`].
#[async_trait]
pub trait Accept: Send + 'static {
    /// Wait for the next connection.
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;

    /// Address the source is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Everything the accept loop needs per connection.
#[derive(Clone)]
struct Acceptor {
    id: String,
    key_gen: DialbackKey,
    connect_timeout: Duration,
    max_stanza_size: usize,
    backoff: BackoffConfig,
    dialer: Arc<dyn Dialer>,
    factory: Arc<dyn StreamFactory>,
    transport: Arc<dyn TransportFactory>,
    registry: Arc<InboundRegistry>,
    metrics: Arc<S2sMetrics>,
}

impl Acceptor {
    async fn run<A: Accept>(self, mut listener: A, shutdown: CancellationToken) {
        let mut failures: u32 = 0;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    failures = 0;
                    self.handle(socket, peer_addr);
                }
                Err(e) => {
                    self.metrics.record_accept_error();
                    failures = failures.saturating_add(1);
                    let delay = self.backoff.delay(failures);
                    warn!(
                        error = %e,
                        consecutive_failures = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to accept S2S connection"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("S2S listener closed");
    }

    fn handle(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let transport = match self.transport.wrap(socket, peer_addr) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(error = %e, peer = %peer_addr, "Failed to configure S2S transport");
                return;
            }
        };
        self.metrics.record_inbound_accepted();

        let id = StreamId::generate();
        let on_disconnect = self.registry.unregister_callback(id.clone());
        let config = InboundStreamConfig {
            id: id.clone(),
            key_gen: self.key_gen.clone(),
            transport,
            connect_timeout: self.connect_timeout,
            max_stanza_size: self.max_stanza_size,
            dialer: Arc::clone(&self.dialer),
            on_disconnect: on_disconnect.clone(),
        };

        let stream = self.factory.spawn_inbound(config);
        debug!(s2s = %self.id, id = %id, peer = %peer_addr, "Inbound S2S connection accepted");
        self.registry.register(stream);

        if on_disconnect.is_fired() {
            // Terminated before it was registered.
            self.registry.unregister(&id);
        }
    }
}

/// S2S listener accepting connections from remote XMPP servers.
pub struct S2sListener {
    acceptor: Acceptor,
    flag: ListeningFlag,
    shutdown: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl S2sListener {
    /// Create a listener that registers accepted streams in `registry`.
    pub fn new(
        config: &S2sConfig,
        dialer: Arc<dyn Dialer>,
        factory: Arc<dyn StreamFactory>,
        transport: Arc<dyn TransportFactory>,
        registry: Arc<InboundRegistry>,
        metrics: Arc<S2sMetrics>,
    ) -> Self {
        Self {
            acceptor: Acceptor {
                id: config.id.clone(),
                key_gen: config.key_gen(),
                connect_timeout: config.connect_timeout,
                max_stanza_size: config.max_stanza_size,
                backoff: config.accept_backoff,
                dialer,
                factory,
                transport,
                registry,
                metrics,
            },
            flag: ListeningFlag::new(),
            shutdown: CancellationToken::new(),
            local_addr: OnceLock::new(),
            task: Mutex::new(None),
        }
    }

    /// Bind `addr` and start accepting connections in the background.
    ///
    /// Returns the bound address (useful with port 0). A bind failure is
    /// returned as [`FederationError::Bind`] and is not retried.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.flag.state() != ListenerState::NotStarted {
            return Err(FederationError::config("S2S listener already started or stopped"));
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| FederationError::Bind { addr, source })?;
        self.serve(listener)
    }

    /// Start the accept loop over an already bound connection source.
    pub fn serve<A: Accept>(&self, listener: A) -> Result<SocketAddr> {
        let local_addr = listener.local_addr()?;

        if !self.flag.start() {
            return Err(FederationError::config("S2S listener already started or stopped"));
        }
        let _ = self.local_addr.set(local_addr);

        let span = info_span!("s2s.listener", s2s = %self.acceptor.id, addr = %local_addr);
        let handle = tokio::spawn(
            self.acceptor
                .clone()
                .run(listener, self.shutdown.clone())
                .instrument(span),
        );
        *self.lock_task() = Some(handle);

        info!(s2s = %self.acceptor.id, addr = %local_addr, "XMPP S2S server listening");
        Ok(local_addr)
    }

    /// Stop accepting connections and close the listening socket.
    ///
    /// Only the first call does anything; it returns `true`. The socket is
    /// closed by the time the winning call returns. Stopping a listener that
    /// never started only prevents it from starting later.
    pub async fn stop(&self) -> bool {
        if !self.flag.stop() {
            return false;
        }
        self.shutdown.cancel();

        let task = self.lock_task().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "S2S accept loop terminated abnormally");
            }
        }
        true
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ListenerState {
        self.flag.state()
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }
}

impl std::fmt::Debug for S2sListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S2sListener")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::OutboundConnection;
    use crate::domain::DomainPair;
    use crate::stream::{OnDisconnect, OutboundStreamConfig, S2sDirection, S2sStream, StreamError};
    use crate::transport::SocketTransportFactory;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    struct IdleStream {
        id: StreamId,
        on_disconnect: OnDisconnect,
    }

    #[async_trait]
    impl S2sStream for IdleStream {
        fn id(&self) -> &StreamId {
            &self.id
        }

        fn direction(&self) -> S2sDirection {
            S2sDirection::Inbound
        }

        async fn disconnect(&self, _reason: StreamError) -> Result<()> {
            self.on_disconnect.fire(&self.id);
            Ok(())
        }
    }

    struct IdleFactory;

    impl StreamFactory for IdleFactory {
        fn spawn_inbound(&self, config: InboundStreamConfig) -> Arc<dyn S2sStream> {
            Arc::new(IdleStream {
                id: config.id,
                on_disconnect: config.on_disconnect,
            })
        }

        fn spawn_outbound(
            &self,
            _pair: &DomainPair,
            config: OutboundStreamConfig,
        ) -> Arc<dyn S2sStream> {
            Arc::new(IdleStream {
                id: config.id,
                on_disconnect: config.on_disconnect,
            })
        }
    }

    struct NoDialer;

    #[async_trait]
    impl Dialer for NoDialer {
        async fn dial(&self, pair: &DomainPair) -> Result<OutboundConnection> {
            Err(FederationError::dial(pair.key(), "dialling disabled"))
        }
    }

    /// Yields each scripted result in turn, then waits forever.
    struct ScriptedAccept {
        script: VecDeque<io::Result<(TcpStream, SocketAddr)>>,
        calls: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedAccept {
        fn new(script: Vec<io::Result<(TcpStream, SocketAddr)>>) -> (Self, Arc<Mutex<Vec<Instant>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let source = Self {
                script: script.into(),
                calls: Arc::clone(&calls),
            };
            (source, calls)
        }
    }

    #[async_trait]
    impl Accept for ScriptedAccept {
        async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
            self.calls.lock().unwrap().push(Instant::now());
            match self.script.pop_front() {
                Some(next) => next,
                None => std::future::pending().await,
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:5269".parse().unwrap())
        }
    }

    fn accept_error() -> io::Result<(TcpStream, SocketAddr)> {
        Err(io::Error::other("too many open files"))
    }

    /// Server side of a loopback connection, plus the client keeping it open.
    fn accepted_socket() -> (std::net::TcpStream, io::Result<(TcpStream, SocketAddr)>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, Ok((TcpStream::from_std(server).unwrap(), peer)))
    }

    fn gaps(calls: &[Instant]) -> Vec<Duration> {
        calls.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }

    fn listener() -> (S2sListener, Arc<InboundRegistry>) {
        listener_with(&S2sConfig::default())
    }

    fn listener_with(config: &S2sConfig) -> (S2sListener, Arc<InboundRegistry>) {
        let metrics = Arc::new(S2sMetrics::new());
        let registry = Arc::new(InboundRegistry::new(Arc::clone(&metrics)));
        let listener = S2sListener::new(
            config,
            Arc::new(NoDialer),
            Arc::new(IdleFactory),
            Arc::new(SocketTransportFactory::new(true)),
            Arc::clone(&registry),
            metrics,
        );
        (listener, registry)
    }

    #[test]
    fn test_listening_flag_transitions() {
        let flag = ListeningFlag::new();
        assert_eq!(flag.state(), ListenerState::NotStarted);

        assert!(flag.start());
        assert!(!flag.start());
        assert_eq!(flag.state(), ListenerState::Listening);

        assert!(flag.stop());
        assert!(!flag.stop());
        assert!(!flag.start());
        assert_eq!(flag.state(), ListenerState::Stopped);
    }

    #[test]
    fn test_listening_flag_stop_before_start() {
        let flag = ListeningFlag::new();
        assert!(flag.stop());
        assert!(!flag.stop());
        assert!(!flag.start());
        assert_eq!(flag.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start_prevents_start() {
        let (listener, _registry) = listener();
        assert!(listener.stop().await);

        let err = listener
            .start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Config(_)));
        assert_eq!(listener.state(), ListenerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_back_off_and_reset() {
        let (listener, registry) = listener();
        let (_client, accepted) = accepted_socket();

        let mut script: Vec<_> = (0..10).map(|_| accept_error()).collect();
        script.push(accepted);
        script.push(accept_error());
        script.push(accept_error());
        let (source, calls) = ScriptedAccept::new(script);

        listener.serve(source).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        // 13 scripted results, then one call left waiting.
        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 14);

        let expected_ms = [5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000, 0, 5, 10];
        for (gap, expected) in gaps(&calls).into_iter().zip(expected_ms) {
            let expected = Duration::from_millis(expected);
            assert!(
                gap >= expected && gap <= expected + Duration::from_millis(2),
                "gap {gap:?}, expected {expected:?}"
            );
        }

        let metrics = &listener.acceptor.metrics;
        assert_eq!(metrics.total_accept_errors(), 12);
        assert_eq!(metrics.total_inbound_accepted(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(listener.state(), ListenerState::Listening);

        assert!(listener.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_backoff_sleep() {
        let config = S2sConfig {
            accept_backoff: BackoffConfig {
                initial_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
            ..S2sConfig::default()
        };
        let (listener, _registry) = listener_with(&config);
        let (source, calls) = ScriptedAccept::new(vec![accept_error(), accept_error()]);

        listener.serve(source).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(listener.acceptor.metrics.total_accept_errors(), 1);

        let started = Instant::now();
        let stopped = tokio::time::timeout(Duration::from_secs(1), listener.stop())
            .await
            .expect("stop should not wait for the backoff sleep");
        assert!(stopped);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_accepts_and_registers() {
        let (listener, registry) = listener();
        let addr = listener.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.local_addr(), Some(addr));

        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(listener.stop().await);
    }

    #[tokio::test]
    async fn test_stop_closes_socket() {
        let (listener, _registry) = listener();
        let addr = listener.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        assert!(listener.stop().await);
        assert!(!listener.stop().await);
        assert_eq!(listener.state(), ListenerState::Stopped);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (listener, _registry) = listener();
        listener.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let err = listener
            .start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Config(_)));
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let (listener, _registry) = listener();
        let err = listener.start(addr).await.unwrap_err();
        assert!(matches!(err, FederationError::Bind { .. }));
        assert_eq!(listener.state(), ListenerState::NotStarted);
    }
}
