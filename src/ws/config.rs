#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;

const DEFAULT_CHECK_INTERVAL_DURATION: Duration = Duration::from_secs(120);
const DEFAULT_PONG_TIMEOUT_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_WRITE_TIMEOUT_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_DELIVERY_CAPACITY: usize = 1024;
const DEFAULT_FAULT_CAPACITY: usize = 64;
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Configuration for the persistent connection.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// How often the liveness monitor wakes up. A connection with no inbound traffic for at
    /// least this long is probed with a PING.
    #[builder(default = DEFAULT_CHECK_INTERVAL_DURATION)]
    pub check_interval: Duration,
    /// Grace period after a PING before a still-silent connection is replaced
    #[builder(default = DEFAULT_PONG_TIMEOUT_DURATION)]
    pub pong_timeout: Duration,
    /// Deadline applied to every frame write, PINGs included
    #[builder(default = DEFAULT_WRITE_TIMEOUT_DURATION)]
    pub write_timeout: Duration,
    /// Capacity of the outbound queue. Producers wait when it is full.
    #[builder(default = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,
    /// Capacity of each per-event delivery channel. Frames arriving while it is full are dropped
    /// and reported.
    #[builder(default = DEFAULT_DELIVERY_CAPACITY)]
    pub delivery_capacity: usize,
    /// Capacity of the fault broadcast channel
    #[builder(default = DEFAULT_FAULT_CAPACITY)]
    pub fault_capacity: usize,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Initial backoff duration for first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl ReconnectConfig {
    #[must_use]
    pub fn new(
        max_attempts: Option<u32>,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None, // Infinite reconnection by default
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}
