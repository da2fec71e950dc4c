//! Timer and executor abstraction.
//!
//! Every piece of deferred work (retries, watchdogs, feed-dogs, cloud tasks)
//! goes through a [`TimerService`]. Two implementations are provided:
//! [`TokioTimerService`] for production and [`ManualTimer`](crate::ManualTimer)
//! for deterministic tests.
//!
//! Finalizers handed to [`TimerService::set_timer`] run exactly once, whether
//! the timer is removed from outside, removes itself from its own tick, is
//! dropped by the service, or fails to arm. Callers that keep a context alive across ticks
//! release their reference there.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Identifier of a scheduled one-shot task or repeating timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Creates a timer id from its raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// A one-shot unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The body of a repeating timer, called with the timer's own id.
pub type Tick = Box<dyn FnMut(TimerId) + Send + 'static>;

/// Runs once when a repeating timer goes away.
pub type Finalizer = Box<dyn FnOnce() + Send + 'static>;

/// Shared timer/executor used by all components.
pub trait TimerService: Send + Sync {
    /// Runs `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: Task) -> SyncResult<TimerId>;

    /// Arms a repeating timer firing every `interval`.
    fn set_timer(
        &self,
        interval: Duration,
        tick: Tick,
        finalizer: Option<Finalizer>,
    ) -> SyncResult<TimerId>;

    /// Cancels a scheduled task or repeating timer.
    ///
    /// Returns true if a live timer was removed. Already-running work is not
    /// interrupted.
    fn remove_timer(&self, id: TimerId) -> bool;

    /// Runs `task` in the background as soon as possible.
    fn schedule_task(&self, task: Task) -> SyncResult<()>;
}

/// Runs the wrapped finalizer when dropped.
pub(crate) struct FinalizeGuard(Option<Finalizer>);

impl FinalizeGuard {
    pub(crate) fn new(finalizer: Option<Finalizer>) -> Self {
        Self(finalizer)
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if let Some(finalizer) = self.0.take() {
            finalizer();
        }
    }
}

/// Timer service backed by a tokio runtime.
///
/// Each timer is a tokio task; removing a timer aborts its task, which drops
/// the task's finalizer guard. One-shot tasks run on the blocking pool since
/// they may touch storage.
pub struct TokioTimerService {
    handle: Handle,
    timers: Arc<Mutex<HashMap<TimerId, AbortHandle>>>,
    next_id: AtomicU64,
}

impl TokioTimerService {
    /// Creates a timer service spawning onto `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Creates a timer service on the current tokio runtime.
    pub fn current() -> SyncResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| SyncError::Timer(e.to_string()))
    }

    /// Returns the number of timers that are still armed.
    pub fn active_timers(&self) -> usize {
        self.timers.lock().len()
    }

    fn next_id(&self) -> TimerId {
        TimerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl TimerService for TokioTimerService {
    fn schedule(&self, delay: Duration, task: Task) -> SyncResult<TimerId> {
        let id = self.next_id();
        let timers = Arc::clone(&self.timers);
        // Held across spawn so the task cannot observe the map before insert.
        let mut guard = self.timers.lock();
        let handle = self.handle.clone();
        let join = self.handle.spawn(async move {
            time::sleep(delay).await;
            if timers.lock().remove(&id).is_some() {
                if let Err(e) = handle.spawn_blocking(task).await {
                    tracing::error!(timer = %id, error = %e, "scheduled task panicked");
                }
            }
        });
        guard.insert(id, join.abort_handle());
        Ok(id)
    }

    fn set_timer(
        &self,
        interval: Duration,
        mut tick: Tick,
        finalizer: Option<Finalizer>,
    ) -> SyncResult<TimerId> {
        if interval.is_zero() {
            drop(FinalizeGuard::new(finalizer));
            return Err(SyncError::Timer(
                "repeating timer needs a non-zero interval".into(),
            ));
        }
        let id = self.next_id();
        let timers = Arc::clone(&self.timers);
        let mut guard = self.timers.lock();
        let join = self.handle.spawn(async move {
            let _finalizer = FinalizeGuard::new(finalizer);
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !timers.lock().contains_key(&id) {
                    break;
                }
                tick(id);
            }
        });
        guard.insert(id, join.abort_handle());
        Ok(id)
    }

    fn remove_timer(&self, id: TimerId) -> bool {
        match self.timers.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn schedule_task(&self, task: Task) -> SyncResult<()> {
        drop(self.handle.spawn_blocking(task));
        Ok(())
    }
}

impl Drop for TokioTimerService {
    fn drop(&mut self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }
}
