//! Configuration for the cloud sync manager.

use datasync_runtime::SyncError;
use std::time::Duration;

/// Retry budget and intervals of cloud sync tasks.
#[derive(Debug, Clone)]
pub struct CloudSyncConfig {
    /// Attempts of a scheduled task, the first run included.
    pub max_attempts: u32,
    /// Attempts of a task started by a local change.
    pub client_attempts: u32,
    /// Delay before retrying after most failures.
    pub retry_interval: Duration,
    /// Delay before retrying a store that was locked.
    pub locked_interval: Duration,
}

impl CloudSyncConfig {
    /// Sets the attempt budget of scheduled tasks.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the attempt budget of local-change tasks.
    pub fn with_client_attempts(mut self, attempts: u32) -> Self {
        self.client_attempts = attempts;
        self
    }

    /// Sets the standard retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Sets the retry interval for locked stores.
    pub fn with_locked_interval(mut self, interval: Duration) -> Self {
        self.locked_interval = interval;
        self
    }

    /// Returns the retry delay after `error`.
    pub fn interval_for(&self, error: &SyncError) -> Duration {
        match error {
            SyncError::ResourceLocked => self.locked_interval,
            _ => self.retry_interval,
        }
    }

    /// Returns the attempt a local-change task starts at.
    ///
    /// With auto-retry the task gets `client_attempts` runs; without it the
    /// first failure is final.
    pub fn client_start_attempt(&self, auto_retry: bool) -> u32 {
        if auto_retry {
            self.max_attempts
                .saturating_sub(self.client_attempts.max(1))
                .saturating_add(1)
        } else {
            self.max_attempts
        }
    }
}

impl Default for CloudSyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            client_attempts: 3,
            retry_interval: Duration::from_secs(10),
            locked_interval: Duration::from_secs(2),
        }
    }
}
