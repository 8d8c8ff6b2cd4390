//! S2S link metrics.
//!
//! Counters are kept locally in [`S2sMetrics`] for inspection and mirrored
//! to the global OpenTelemetry meter provider, which must be initialized by
//! the host application.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

use crate::stream::S2sDirection;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-federation"))
}

/// Counter for accepted inbound S2S connections.
fn inbound_accepted_counter() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.s2s.inbound.accepted")
        .with_description("Total inbound S2S connections accepted")
        .with_unit("connection")
        .build()
}

/// Counter for outbound dial attempts.
fn outbound_dials_counter() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.s2s.outbound.dials")
        .with_description("Total outbound S2S dial attempts")
        .with_unit("dial")
        .build()
}

/// Gauge for registered S2S links.
fn links_gauge() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.s2s.links.active")
        .with_description("Current number of registered S2S links")
        .with_unit("link")
        .build()
}

/// Thread-safe counters for the S2S link layer.
#[derive(Debug, Default)]
pub struct S2sMetrics {
    inbound_accepted: AtomicU64,
    accept_errors: AtomicU64,
    outbound_dials: AtomicU64,
    dial_failures: AtomicU64,
    dedup_hits: AtomicU64,
    active_inbound: AtomicI64,
    active_outbound: AtomicI64,
}

impl S2sMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted inbound connection.
    pub fn record_inbound_accepted(&self) {
        self.inbound_accepted.fetch_add(1, Ordering::Relaxed);
        inbound_accepted_counter().add(1, &[]);
    }

    /// Record a failed `accept()` call.
    pub fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of an outbound dial.
    pub fn record_dial(&self, success: bool) {
        self.outbound_dials.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.dial_failures.fetch_add(1, Ordering::Relaxed);
        }
        outbound_dials_counter().add(1, &[KeyValue::new("success", success)]);
    }

    /// Record a `get_or_dial` call served by an existing link.
    pub fn record_dedup_hit(&self) {
        self.dedup_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a link being registered.
    pub fn record_link_registered(&self, direction: S2sDirection) {
        let active = self.active(direction).fetch_add(1, Ordering::Relaxed) + 1;
        links_gauge().record(active, &[KeyValue::new("direction", direction.as_str())]);
    }

    /// Record a link being unregistered.
    pub fn record_link_unregistered(&self, direction: S2sDirection) {
        let active = self.active(direction).fetch_sub(1, Ordering::Relaxed) - 1;
        links_gauge().record(active, &[KeyValue::new("direction", direction.as_str())]);
    }

    fn active(&self, direction: S2sDirection) -> &AtomicI64 {
        match direction {
            S2sDirection::Inbound => &self.active_inbound,
            S2sDirection::Outbound => &self.active_outbound,
        }
    }

    /// Total inbound connections accepted.
    pub fn total_inbound_accepted(&self) -> u64 {
        self.inbound_accepted.load(Ordering::Relaxed)
    }

    /// Total accept errors.
    pub fn total_accept_errors(&self) -> u64 {
        self.accept_errors.load(Ordering::Relaxed)
    }

    /// Total outbound dials attempted.
    pub fn total_outbound_dials(&self) -> u64 {
        self.outbound_dials.load(Ordering::Relaxed)
    }

    /// Total outbound dials that failed.
    pub fn total_dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    /// Total `get_or_dial` calls that reused an existing link.
    pub fn total_dedup_hits(&self) -> u64 {
        self.dedup_hits.load(Ordering::Relaxed)
    }

    /// Current number of registered links in `direction`.
    pub fn active_links(&self, direction: S2sDirection) -> i64 {
        self.active(direction).load(Ordering::Relaxed)
    }
}
