//! Configuration for the relay core subsystems.
//!
//! Every struct has sensible defaults and a `from_env` constructor reading
//! `RELAY_*` environment variables, validated on load.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Configuration for the SSE fan-out engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Interval between SSE heartbeat comments on every hub.
    pub heartbeat_interval: Duration,
    /// Hard cap on a single SSE connection's duration. The server closes the
    /// connection once exceeded so clients reconnect and rebalance across
    /// relay replicas. `None` disables the cap.
    pub max_conn_time: Option<Duration>,
    /// Bound on each subscriber's outgoing event queue. A subscriber whose
    /// queue overflows is dropped rather than blocking the rest.
    pub subscriber_queue_depth: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(180),
            max_conn_time: None,
            subscriber_queue_depth: 64,
        }
    }
}

impl StreamConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            heartbeat_interval: duration_var(
                "RELAY_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            )?,
            max_conn_time: optional_duration_var("RELAY_MAX_CONN_TIME_SECS")?,
            subscriber_queue_depth: usize_var(
                "RELAY_SUBSCRIBER_QUEUE_DEPTH",
                defaults.subscriber_queue_depth,
            )?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(RelayError::precondition("heartbeat interval must be non-zero"));
        }
        if self.subscriber_queue_depth == 0 {
            return Err(RelayError::precondition("subscriber queue depth must be non-zero"));
        }
        Ok(())
    }
}

/// Configuration for the analytics event bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Base URI of the upstream events service.
    pub events_uri: String,
    /// Path appended to the base URI for summarized event batches.
    pub events_path: String,
    /// How often per-metadata processors flush their buffers upstream.
    pub flush_interval: Duration,
    /// Floor for the idle-queue cleanup sweep interval. The effective
    /// interval is `max(cleanup_interval, 2 * flush_interval)`.
    pub cleanup_interval: Duration,
    /// Maximum buffered output events per processor between flushes.
    pub capacity: usize,
    /// Additional delivery attempts after a retryable upstream failure.
    pub retry_attempts: u32,
    /// Delay before an upstream retry.
    pub retry_delay: Duration,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            events_uri: "https://events.launchdarkly.com".to_string(),
            events_path: "/bulk".to_string(),
            flush_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
            capacity: 1000,
            retry_attempts: 1,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl EventsConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            events_uri: env::var("RELAY_EVENTS_URI").unwrap_or(defaults.events_uri),
            events_path: env::var("RELAY_EVENTS_PATH").unwrap_or(defaults.events_path),
            flush_interval: duration_var("RELAY_EVENTS_FLUSH_INTERVAL_SECS", defaults.flush_interval)?,
            cleanup_interval: duration_var(
                "RELAY_EVENTS_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval,
            )?,
            capacity: usize_var("RELAY_EVENTS_CAPACITY", defaults.capacity)?,
            retry_attempts: u32_var("RELAY_EVENTS_RETRY_ATTEMPTS", defaults.retry_attempts)?,
            retry_delay: defaults.retry_delay,
        })
    }

    /// The effective idle-queue sweep interval.
    pub fn effective_cleanup_interval(&self) -> Duration {
        self.cleanup_interval.max(self.flush_interval * 2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.events_uri.is_empty() {
            return Err(RelayError::precondition("events URI must not be empty"));
        }
        if self.flush_interval.is_zero() {
            return Err(RelayError::precondition("flush interval must be non-zero"));
        }
        if self.capacity == 0 {
            return Err(RelayError::precondition("event capacity must be non-zero"));
        }
        Ok(())
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub stream: StreamConfig,
    pub events: EventsConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8030,
            stream: StreamConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            host: env::var("RELAY_HOST").unwrap_or(defaults.host),
            port: env::var("RELAY_PORT")
                .ok()
                .map(|v| {
                    v.parse()
                        .map_err(|e| RelayError::precondition(format!("RELAY_PORT: {}", e)))
                })
                .transpose()?
                .unwrap_or(defaults.port),
            stream: StreamConfig::from_env()?,
            events: EventsConfig::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.stream.validate()?;
        self.events.validate()?;
        Ok(())
    }
}

fn duration_var(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| RelayError::precondition(format!("{}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

fn optional_duration_var(name: &str) -> Result<Option<Duration>> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| RelayError::precondition(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

fn usize_var(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| RelayError::precondition(format!("{}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

fn u32_var(name: &str, default: u32) -> Result<u32> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| RelayError::precondition(format!("{}: {}", name, e))),
        Err(_) => Ok(default),
    }
}
