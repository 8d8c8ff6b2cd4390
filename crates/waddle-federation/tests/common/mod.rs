//! Test utilities for the federation link layer.
//!
//! Provides a scriptable dialer and a stream factory whose streams run on
//! their own task and record how they were disconnected.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use waddle_federation::{
    Dialer, DomainPair, FederationError, FederationManager, InboundStreamConfig, OnDisconnect,
    OutboundConnection, OutboundStreamConfig, Result, S2sConfig, S2sDirection, S2sStream,
    StreamError, StreamFactory, StreamId, Transport,
};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing once per test binary.
pub fn init_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// Configuration bound to an ephemeral loopback port.
pub fn test_config() -> S2sConfig {
    S2sConfig {
        id: "s2s-test".to_string(),
        bind_address: "127.0.0.1".parse().unwrap(),
        port: 0,
        dialback_secret: "test-dialback-secret".to_string(),
        ..S2sConfig::default()
    }
}

/// Build a manager around the given mocks.
pub fn test_manager(dialer: Arc<MockDialer>, factory: Arc<MockStreamFactory>) -> FederationManager {
    FederationManager::new(test_config(), dialer, factory)
}

/// Poll `condition` until it holds, panicking after [`DEFAULT_TIMEOUT`].
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(DEFAULT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Run `fut` under [`DEFAULT_TIMEOUT`].
pub async fn with_timeout<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(DEFAULT_TIMEOUT, fut)
        .await
        .expect("operation timed out")
}

/// Dialer returning in-memory connections.
#[derive(Default)]
pub struct MockDialer {
    calls: AtomicUsize,
    delay: Duration,
    fail: bool,
    gate: Option<Arc<Notify>>,
    started: Arc<Notify>,
    peers: Mutex<Vec<DuplexStream>>,
}

impl MockDialer {
    /// Dialer that succeeds immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dialer that succeeds after `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Dialer that always fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Dialer that fails after `delay`.
    pub fn failing_after(delay: Duration) -> Self {
        Self {
            delay,
            fail: true,
            ..Self::default()
        }
    }

    /// Dialer that blocks each dial until `gate` is notified.
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    /// Number of dials performed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Close the remote end of every dialled connection.
    pub fn hang_up_all(&self) {
        self.peers.lock().unwrap().clear();
    }

    /// Wait until a dial has started.
    pub async fn dial_started(&self) {
        self.started.notified().await;
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, pair: &DomainPair) -> Result<OutboundConnection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(FederationError::dial(pair.key(), "connection refused"));
        }

        let (local, remote) = tokio::io::duplex(1024);
        self.peers.lock().unwrap().push(remote);
        let addr: SocketAddr = "127.0.0.1:5269".parse().unwrap();
        Ok(OutboundConnection::new(pair.clone(), Transport::new(local, Some(addr))))
    }
}

/// Stream that runs until its transport hits EOF or it is disconnected.
pub struct MockStream {
    id: StreamId,
    direction: S2sDirection,
    shutdown: CancellationToken,
    on_disconnect: OnDisconnect,
    reasons: Mutex<Vec<StreamError>>,
}

impl MockStream {
    fn spawn(
        id: StreamId,
        direction: S2sDirection,
        transport: Transport,
        on_disconnect: OnDisconnect,
    ) -> Arc<Self> {
        let stream = Arc::new(Self {
            id,
            direction,
            shutdown: CancellationToken::new(),
            on_disconnect,
            reasons: Mutex::new(Vec::new()),
        });

        let task = Arc::clone(&stream);
        tokio::spawn(async move {
            let mut transport = transport;
            let mut buf = [0u8; 256];
            loop {
                tokio::select! {
                    _ = task.shutdown.cancelled() => break,
                    read = transport.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    },
                }
            }
            task.on_disconnect.fire(&task.id);
        });

        stream
    }

    /// Reasons passed to `disconnect`, in call order.
    pub fn reasons(&self) -> Vec<StreamError> {
        self.reasons.lock().unwrap().clone()
    }

    /// Whether the stream has terminated.
    pub fn is_closed(&self) -> bool {
        self.on_disconnect.is_fired()
    }
}

#[async_trait]
impl S2sStream for MockStream {
    fn id(&self) -> &StreamId {
        &self.id
    }

    fn direction(&self) -> S2sDirection {
        self.direction
    }

    async fn disconnect(&self, reason: StreamError) -> Result<()> {
        self.reasons.lock().unwrap().push(reason);
        self.shutdown.cancel();
        self.on_disconnect.fire(&self.id);
        Ok(())
    }
}

/// Stream factory keeping a handle to every stream it started.
#[derive(Default)]
pub struct MockStreamFactory {
    inbound: Mutex<Vec<Arc<MockStream>>>,
    outbound: Mutex<Vec<Arc<MockStream>>>,
}

impl MockStreamFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inbound streams started so far.
    pub fn inbound(&self) -> Vec<Arc<MockStream>> {
        self.inbound.lock().unwrap().clone()
    }

    /// Outbound streams started so far.
    pub fn outbound(&self) -> Vec<Arc<MockStream>> {
        self.outbound.lock().unwrap().clone()
    }
}

impl StreamFactory for MockStreamFactory {
    fn spawn_inbound(&self, config: InboundStreamConfig) -> Arc<dyn S2sStream> {
        let stream = MockStream::spawn(
            config.id,
            S2sDirection::Inbound,
            config.transport,
            config.on_disconnect,
        );
        self.inbound.lock().unwrap().push(Arc::clone(&stream));
        stream
    }

    fn spawn_outbound(
        &self,
        _pair: &DomainPair,
        config: OutboundStreamConfig,
    ) -> Arc<dyn S2sStream> {
        let stream = MockStream::spawn(
            config.id,
            S2sDirection::Outbound,
            config.connection.transport,
            config.on_disconnect,
        );
        self.outbound.lock().unwrap().push(Arc::clone(&stream));
        stream
    }
}
