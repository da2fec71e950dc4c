//! Deterministic timer service for tests.

use crate::error::{SyncError, SyncResult};
use crate::timer::{FinalizeGuard, Finalizer, Task, Tick, TimerId, TimerService};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

enum Entry {
    Once(Task),
    Repeating {
        interval: Duration,
        tick: Tick,
        finalizer: Option<Finalizer>,
    },
}

struct Armed {
    due: Duration,
    entry: Entry,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    armed: BTreeMap<TimerId, Armed>,
    ready: VecDeque<Task>,
    firing: Option<TimerId>,
    removed_while_firing: bool,
    fail_next_arm: bool,
    arms: usize,
}

/// A timer service driven by a virtual clock.
///
/// Nothing runs until the test calls [`ManualTimer::advance`] or
/// [`ManualTimer::run_pending`]. Callbacks always run without the internal
/// lock held, so they may freely arm or remove timers, including their own.
///
/// # Example
///
/// ```
/// use datasync_runtime::{ManualTimer, TimerService};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let timer = ManualTimer::new();
/// let hits = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&hits);
/// timer
///     .schedule(Duration::from_secs(1), Box::new(move || {
///         counter.fetch_add(1, Ordering::SeqCst);
///     }))
///     .unwrap();
///
/// timer.advance(Duration::from_millis(999));
/// assert_eq!(hits.load(Ordering::SeqCst), 0);
/// timer.advance(Duration::from_millis(1));
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// ```
#[derive(Default)]
pub struct ManualTimer {
    state: Mutex<ManualState>,
}

impl ManualTimer {
    /// Creates a timer with the clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the virtual time elapsed since creation.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Makes the next `schedule`/`set_timer` call fail.
    pub fn fail_next_arm(&self) {
        self.state.lock().fail_next_arm = true;
    }

    /// Returns true if `id` is still armed.
    pub fn is_armed(&self, id: TimerId) -> bool {
        let state = self.state.lock();
        state.armed.contains_key(&id) || (state.firing == Some(id) && !state.removed_while_firing)
    }

    /// Returns the number of armed timers.
    pub fn armed_count(&self) -> usize {
        self.state.lock().armed.len()
    }

    /// Returns the number of successful arm calls so far.
    pub fn arm_count(&self) -> usize {
        self.state.lock().arms
    }

    /// Returns the delay until `id` fires, if it is armed.
    pub fn remaining(&self, id: TimerId) -> Option<Duration> {
        let state = self.state.lock();
        state
            .armed
            .get(&id)
            .map(|armed| armed.due.saturating_sub(state.now))
    }

    /// Runs queued background tasks until none are left.
    pub fn run_pending(&self) {
        loop {
            let task = self.state.lock().ready.pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Moves the clock forward, firing every timer that comes due.
    pub fn advance(&self, by: Duration) {
        let target = self.state.lock().now + by;
        loop {
            self.run_pending();
            let next = {
                let mut state = self.state.lock();
                let due = state
                    .armed
                    .iter()
                    .filter(|(_, armed)| armed.due <= target)
                    .min_by_key(|(id, armed)| (armed.due, **id))
                    .map(|(id, _)| *id);
                match due {
                    Some(id) => state.armed.remove(&id).map(|armed| {
                        state.now = armed.due;
                        (id, armed)
                    }),
                    None => None,
                }
            };
            let Some((id, armed)) = next else { break };
            self.fire(id, armed);
        }
        self.state.lock().now = target;
        self.run_pending();
    }

    fn fire(&self, id: TimerId, armed: Armed) {
        match armed.entry {
            Entry::Once(task) => task(),
            Entry::Repeating {
                interval,
                mut tick,
                finalizer,
            } => {
                {
                    let mut state = self.state.lock();
                    state.firing = Some(id);
                    state.removed_while_firing = false;
                }
                tick(id);
                let mut state = self.state.lock();
                state.firing = None;
                if state.removed_while_firing {
                    state.removed_while_firing = false;
                    drop(state);
                    drop(tick);
                    drop(FinalizeGuard::new(finalizer));
                } else {
                    let due = armed.due + interval;
                    state.armed.insert(
                        id,
                        Armed {
                            due,
                            entry: Entry::Repeating {
                                interval,
                                tick,
                                finalizer,
                            },
                        },
                    );
                }
            }
        }
    }

    fn arm(&self, delay: Duration, entry: Entry) -> SyncResult<TimerId> {
        let mut state = self.state.lock();
        if state.fail_next_arm {
            state.fail_next_arm = false;
            drop(state);
            if let Entry::Repeating { finalizer, .. } = entry {
                drop(FinalizeGuard::new(finalizer));
            }
            return Err(SyncError::Timer("injected arm failure".into()));
        }
        state.next_id += 1;
        state.arms += 1;
        let id = TimerId::new(state.next_id);
        let due = state.now + delay;
        state.armed.insert(id, Armed { due, entry });
        Ok(id)
    }
}

impl TimerService for ManualTimer {
    fn schedule(&self, delay: Duration, task: Task) -> SyncResult<TimerId> {
        self.arm(delay, Entry::Once(task))
    }

    fn set_timer(
        &self,
        interval: Duration,
        tick: Tick,
        finalizer: Option<Finalizer>,
    ) -> SyncResult<TimerId> {
        if interval.is_zero() {
            drop(FinalizeGuard::new(finalizer));
            return Err(SyncError::Timer(
                "repeating timer needs a non-zero interval".into(),
            ));
        }
        self.arm(
            interval,
            Entry::Repeating {
                interval,
                tick,
                finalizer,
            },
        )
    }

    fn remove_timer(&self, id: TimerId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            if state.firing == Some(id) {
                let first = !state.removed_while_firing;
                state.removed_while_firing = true;
                return first;
            }
            state.armed.remove(&id)
        };
        match removed {
            Some(Armed {
                entry: Entry::Repeating { tick, finalizer, .. },
                ..
            }) => {
                drop(tick);
                drop(FinalizeGuard::new(finalizer));
                true
            }
            Some(Armed {
                entry: Entry::Once(task),
                ..
            }) => {
                drop(task);
                true
            }
            None => false,
        }
    }

    fn schedule_task(&self, task: Task) -> SyncResult<()> {
        self.state.lock().ready.push_back(task);
        Ok(())
    }
}

impl Drop for ManualTimer {
    fn drop(&mut self) {
        let armed = std::mem::take(&mut self.state.get_mut().armed);
        for (_, armed) in armed {
            if let Entry::Repeating { finalizer, .. } = armed.entry {
                drop(FinalizeGuard::new(finalizer));
            }
        }
    }
}
