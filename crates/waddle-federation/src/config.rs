//! S2S federation configuration.
//!
//! # Environment Variables
//!
//! - `WADDLE_S2S_ID`: Label used in log lines. Default: `s2s`
//! - `WADDLE_S2S_BIND_ADDR`: Bind address. Default: `0.0.0.0`
//! - `WADDLE_S2S_PORT`: Listen port. Default: `5269`
//! - `WADDLE_S2S_KEEP_ALIVE`: Enable TCP keep-alive on accepted sockets. Default: `true`
//! - `WADDLE_S2S_DIALBACK_SECRET`: Dialback shared secret. Default: random per process
//! - `WADDLE_S2S_CONNECT_TIMEOUT_SECS`: Connect timeout. Default: `5`
//! - `WADDLE_S2S_MAX_STANZA_SIZE`: Maximum stanza size in bytes. Default: `32768`

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::dialback::{random_secret, DialbackKey};
use crate::error::{FederationError, Result};

/// Default S2S port (RFC 6120).
pub const DEFAULT_S2S_PORT: u16 = 5269;

/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default maximum stanza size in bytes.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 32 * 1024;

/// Backoff applied by the accept loop after an accept error.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first consecutive error.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Growth factor per consecutive error.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay to apply after `consecutive_failures` errors in a row.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exp = consecutive_failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// S2S federation configuration.
///
/// Immutable once handed to the link manager.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct S2sConfig {
    /// Label used in shutdown log lines
    pub id: String,
    /// Address to bind the S2S listener to
    pub bind_address: IpAddr,
    /// Port to bind the S2S listener to (0 picks an ephemeral port)
    pub port: u16,
    /// Whether TCP keep-alive is enabled on federation sockets
    pub keep_alive: bool,
    /// Secret for dialback key generation (XEP-0220)
    pub dialback_secret: String,
    /// Timeout for stream negotiation and outbound connects
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// Maximum accepted stanza size in bytes
    pub max_stanza_size: usize,
    /// Accept loop error backoff
    pub accept_backoff: BackoffConfig,
}

impl Default for S2sConfig {
    fn default() -> Self {
        Self {
            id: "s2s".to_string(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_S2S_PORT,
            keep_alive: true,
            dialback_secret: random_secret(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
            accept_backoff: BackoffConfig::default(),
        }
    }
}

impl std::fmt::Debug for S2sConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S2sConfig")
            .field("id", &self.id)
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field("keep_alive", &self.keep_alive)
            .field("dialback_secret", &"[REDACTED]")
            .field("connect_timeout", &self.connect_timeout)
            .field("max_stanza_size", &self.max_stanza_size)
            .field("accept_backoff", &self.accept_backoff)
            .finish()
    }
}

impl S2sConfig {
    /// Load configuration from `WADDLE_S2S_*` environment variables.
    ///
    /// Unparseable values fall back to their defaults with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let dialback_secret = match std::env::var("WADDLE_S2S_DIALBACK_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                info!("WADDLE_S2S_DIALBACK_SECRET not set, using a random dialback secret");
                defaults.dialback_secret.clone()
            }
        };

        let config = Self {
            id: std::env::var("WADDLE_S2S_ID").unwrap_or(defaults.id),
            bind_address: env_parse("WADDLE_S2S_BIND_ADDR", defaults.bind_address),
            port: env_parse("WADDLE_S2S_PORT", defaults.port),
            keep_alive: env_parse("WADDLE_S2S_KEEP_ALIVE", defaults.keep_alive),
            dialback_secret,
            connect_timeout: Duration::from_secs(env_parse(
                "WADDLE_S2S_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )),
            max_stanza_size: env_parse("WADDLE_S2S_MAX_STANZA_SIZE", defaults.max_stanza_size),
            accept_backoff: defaults.accept_backoff,
        };

        info!(
            addr = %config.listen_addr(),
            keep_alive = config.keep_alive,
            connect_timeout_secs = config.connect_timeout.as_secs(),
            max_stanza_size = config.max_stanza_size,
            "S2S configuration loaded"
        );

        config
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Dialback key generator bound to this configuration's secret.
    pub fn key_gen(&self) -> DialbackKey {
        DialbackKey::new(self.dialback_secret.as_bytes())
    }

    /// Check the configuration for values the link layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dialback_secret.is_empty() {
            return Err(FederationError::config("dialback secret must not be empty"));
        }
        if self.max_stanza_size == 0 {
            return Err(FederationError::config("max stanza size must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(FederationError::config("connect timeout must be greater than zero"));
        }
        if self.accept_backoff.multiplier < 1.0 {
            return Err(FederationError::config("accept backoff multiplier must be >= 1.0"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key = key, value = %raw, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
