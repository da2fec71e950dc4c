//! Configuration for the protocol state machine.

use std::time::Duration;

/// Configuration of one state machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Highest protocol version spoken locally.
    pub protocol_version: u32,
    /// Liveness timeout of the watchdog.
    pub watchdog_timeout: Duration,
    /// Tick interval of the keepalive and feed-dog timers.
    pub tick_interval: Duration,
    /// Maximum number of keepalive packets per save-data notify.
    pub keepalive_budget: u32,
    /// Feed-dog duration used during bulk transfer.
    pub transfer_feed_duration: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl MachineConfig {
    /// Creates a configuration for `protocol_version`.
    pub fn new(protocol_version: u32) -> Self {
        Self {
            protocol_version,
            watchdog_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_secs(2),
            keepalive_budget: 15,
            transfer_feed_duration: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the watchdog timeout.
    pub fn with_watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = timeout;
        self
    }

    /// Sets the keepalive/feed-dog tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the keepalive tick budget.
    pub fn with_keepalive_budget(mut self, budget: u32) -> Self {
        self.keepalive_budget = budget;
        self
    }

    /// Sets the feed-dog duration used during bulk transfer.
    pub fn with_transfer_feed_duration(mut self, duration: Duration) -> Self {
        self.transfer_feed_duration = duration;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the number of ticks covering `duration`, clamped to a byte.
    pub fn feed_dog_ticks(&self, duration: Duration) -> u8 {
        if self.tick_interval.is_zero() {
            return 0;
        }
        let ticks = duration.as_millis() / self.tick_interval.as_millis().max(1);
        u8::try_from(ticks).unwrap_or(u8::MAX)
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries before the task times out.
    pub max_retries: u32,
    /// Timeout used for the first retry.
    pub initial_timeout: Duration,
    /// Upper bound of the timeout.
    pub max_timeout: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration allowing `max_retries` retries.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::new(0)
        }
    }

    /// Sets the initial timeout.
    pub fn with_initial_timeout(mut self, timeout: Duration) -> Self {
        self.initial_timeout = timeout;
        self
    }

    /// Sets the maximum timeout.
    pub fn with_max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = timeout;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Returns true once `retry` retries have been spent.
    pub fn is_exhausted(&self, retry: u32) -> bool {
        retry >= self.max_retries
    }

    /// Calculates the timeout armed for the given retry (1-indexed).
    ///
    /// Retry 0 uses the initial timeout. The result never decreases with
    /// `retry` and never exceeds `max_timeout`.
    pub fn timeout_for_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = (self.initial_timeout.as_secs_f64() * factor).min(self.max_timeout.as_secs_f64());
        if secs.is_finite() {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_timeout
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
