//! Bounded retry of cloud sync tasks.

use crate::info::SyncInfo;
use datasync_runtime::SyncResult;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// What a task needs to run again.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Attempt that just failed, starting at 1.
    pub attempt: u32,
    /// The request being retried.
    pub info: SyncInfo,
}

/// Schedules the next attempt of a task.
pub(crate) trait RetryScheduler: Send + Sync {
    /// Schedules the attempt after `state` to run after `interval`.
    ///
    /// Returns false if a retry of the same sync id is already pending.
    fn schedule_retry(&self, state: &RetryState, interval: Duration) -> SyncResult<bool>;
}

/// Result of handing a task outcome to a [`Retryer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The outcome was a success; nothing to do.
    Succeeded,
    /// The next attempt was scheduled.
    Scheduled,
    /// A retry of the same request is already pending.
    AlreadyPending,
    /// The failure went to the caller's callback.
    Surfaced,
}

/// Decides, per task attempt, whether a failure is retried or final.
///
/// Retryers of attempts below the budget reschedule; the retryer of the last
/// attempt is terminal and reports every failure to the caller.
#[derive(Clone)]
pub struct Retryer {
    state: Arc<RetryState>,
    max_attempts: u32,
    scheduler: Weak<dyn RetryScheduler>,
}

impl Retryer {
    pub(crate) fn new(state: RetryState, max_attempts: u32, scheduler: Weak<dyn RetryScheduler>) -> Self {
        Self {
            state: Arc::new(state),
            max_attempts,
            scheduler,
        }
    }

    /// Returns the attempt this retryer belongs to.
    pub fn attempt(&self) -> u32 {
        self.state.attempt
    }

    /// Returns true if failures are final.
    pub fn is_terminal(&self) -> bool {
        self.state.attempt >= self.max_attempts
    }

    /// Returns the request being retried.
    pub fn info(&self) -> &SyncInfo {
        &self.state.info
    }

    /// Handles the outcome of an attempt.
    ///
    /// Non-retryable failures are surfaced right away, whatever the budget.
    pub fn retry(&self, interval: Duration, result: SyncResult<()>) -> RetryOutcome {
        let error = match result {
            Ok(()) => return RetryOutcome::Succeeded,
            Err(error) => error,
        };
        let info = &self.state.info;
        if self.is_terminal() || !error.is_retryable() {
            debug!(sync_id = info.sync_id(), attempt = self.state.attempt, %error, "sync failed for good");
            info.set_error(error);
            return RetryOutcome::Surfaced;
        }
        let Some(scheduler) = self.scheduler.upgrade() else {
            warn!(sync_id = info.sync_id(), "manager gone, surfacing failure");
            info.set_error(error);
            return RetryOutcome::Surfaced;
        };
        match scheduler.schedule_retry(&self.state, interval) {
            Ok(true) => {
                debug!(
                    sync_id = info.sync_id(),
                    attempt = self.state.attempt,
                    ?interval,
                    %error,
                    "sync retry scheduled"
                );
                RetryOutcome::Scheduled
            }
            Ok(false) => RetryOutcome::AlreadyPending,
            Err(schedule_error) => {
                warn!(sync_id = info.sync_id(), error = %schedule_error, "sync retry not scheduled");
                info.set_error(error);
                RetryOutcome::Surfaced
            }
        }
    }
}

impl fmt::Debug for Retryer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retryer")
            .field("attempt", &self.state.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("sync_id", &self.state.info.sync_id())
            .finish()
    }
}
