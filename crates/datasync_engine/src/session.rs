//! Per-peer sync session.

use datasync_runtime::{SyncError, SyncMode, SyncResult, TimerId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// One unit of work queued on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    /// Target id, unique within the session.
    pub id: u32,
    /// Sync mode.
    pub mode: SyncMode,
    /// Already satisfied; finished without protocol I/O.
    pub skippable: bool,
    /// Whether a timeout may be retried.
    pub retry: bool,
}

impl SyncTarget {
    /// Creates a retryable target.
    pub fn new(id: u32, mode: SyncMode) -> Self {
        Self {
            id,
            mode,
            skippable: false,
            retry: true,
        }
    }

    /// Marks the target as already satisfied.
    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }

    /// Disables retry on timeout.
    pub fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }
}

/// Final status of a target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetOutcome {
    /// Target id.
    pub id: u32,
    /// Whether the target was skipped without I/O.
    pub skipped: bool,
    /// Result of the target.
    pub result: SyncResult<()>,
}

#[derive(Debug, Default)]
struct Targets {
    pending: VecDeque<SyncTarget>,
    current: Option<SyncTarget>,
    outcomes: Vec<TargetOutcome>,
    finished: bool,
}

#[derive(Debug, Default)]
struct Status {
    watchdog: Option<TimerId>,
    watchdog_active: bool,
    retry_time: u32,
    need_retry: bool,
}

/// State shared by everything that works on one peer.
///
/// Targets are processed in push order. The usage count tracks callers
/// currently inside the session; once the session is killed no new caller
/// may enter.
#[derive(Debug)]
pub struct SyncSession {
    device_id: String,
    session_id: u32,
    version: AtomicU32,
    killed: AtomicBool,
    usage: AtomicUsize,
    targets: Mutex<Targets>,
    status: Mutex<Status>,
}

/// Keeps a session's usage count raised while alive.
#[derive(Debug)]
pub struct UsageGuard<'a> {
    session: &'a SyncSession,
}

impl Drop for UsageGuard<'_> {
    fn drop(&mut self) {
        self.session.usage.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SyncSession {
    /// Creates a session with `device_id`.
    pub fn new(device_id: impl Into<String>, session_id: u32, version: u32) -> Self {
        Self {
            device_id: device_id.into(),
            session_id,
            version: AtomicU32::new(version),
            killed: AtomicBool::new(false),
            usage: AtomicUsize::new(0),
            targets: Mutex::new(Targets::default()),
            status: Mutex::new(Status::default()),
        }
    }

    /// Returns the peer device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the session id sent in keepalive packets.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Returns the negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Records the negotiated protocol version.
    pub fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::Release);
    }

    /// Marks the session killed; new callers are refused.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    /// Returns true once the session is killed.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Raises the usage count for the guard's lifetime.
    pub fn enter(&self) -> SyncResult<UsageGuard<'_>> {
        self.usage.fetch_add(1, Ordering::AcqRel);
        let guard = UsageGuard { session: self };
        if self.is_killed() {
            return Err(SyncError::Busy(format!("session {} is killed", self.session_id)));
        }
        Ok(guard)
    }

    /// Returns the number of callers inside the session.
    pub fn usage_count(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    /// Queues a target.
    pub fn push_target(&self, target: SyncTarget) {
        let mut targets = self.targets.lock();
        targets.finished = false;
        targets.pending.push_back(target);
    }

    /// Pops the next target and makes it current.
    pub fn pop_target(&self) -> Option<SyncTarget> {
        let mut targets = self.targets.lock();
        let next = targets.pending.pop_front();
        targets.current = next.clone();
        next
    }

    /// Returns the target being synced.
    pub fn current_target(&self) -> Option<SyncTarget> {
        self.targets.lock().current.clone()
    }

    /// Returns the number of queued targets, current excluded.
    pub fn pending_targets(&self) -> usize {
        self.targets.lock().pending.len()
    }

    /// Records the outcome of `target`.
    pub fn finish_target(&self, target: &SyncTarget, skipped: bool, result: SyncResult<()>) {
        let mut targets = self.targets.lock();
        if targets.current.as_ref().map(|t| t.id) == Some(target.id) {
            targets.current = None;
        }
        targets.outcomes.push(TargetOutcome {
            id: target.id,
            skipped,
            result,
        });
    }

    /// Records the outcome of the current target, if any.
    pub fn finish_current(&self, result: SyncResult<()>) -> bool {
        let current = self.current_target();
        match current {
            Some(target) => {
                self.finish_target(&target, false, result);
                true
            }
            None => false,
        }
    }

    /// Marks the session finished and drops queued targets.
    pub fn mark_finished(&self) {
        let mut targets = self.targets.lock();
        targets.pending.clear();
        targets.current = None;
        targets.finished = true;
    }

    /// Returns true once the target queue drained.
    pub fn is_finished(&self) -> bool {
        self.targets.lock().finished
    }

    /// Returns the outcomes recorded so far.
    pub fn outcomes(&self) -> Vec<TargetOutcome> {
        self.targets.lock().outcomes.clone()
    }

    /// Returns true if the current target may be retried.
    pub fn current_allows_retry(&self) -> bool {
        self.targets.lock().current.as_ref().is_some_and(|t| t.retry)
    }

    /// Returns the armed watchdog timer.
    pub fn watchdog_timer(&self) -> Option<TimerId> {
        self.status.lock().watchdog
    }

    pub(crate) fn set_watchdog_timer(&self, timer: Option<TimerId>) {
        let mut status = self.status.lock();
        status.watchdog_active = timer.is_some();
        status.watchdog = timer;
    }

    pub(crate) fn take_watchdog_timer(&self) -> Option<TimerId> {
        let mut status = self.status.lock();
        status.watchdog_active = false;
        status.watchdog.take()
    }

    /// Returns true while the watchdog is armed.
    pub fn is_watchdog_active(&self) -> bool {
        self.status.lock().watchdog_active
    }

    /// Returns the retry counter.
    pub fn retry_time(&self) -> u32 {
        self.status.lock().retry_time
    }

    pub(crate) fn set_retry_time(&self, retry_time: u32) {
        self.status.lock().retry_time = retry_time;
    }

    /// Returns true if the last timeout scheduled a retry.
    pub fn need_retry(&self) -> bool {
        self.status.lock().need_retry
    }

    /// Sets or clears the retry flag.
    pub fn set_need_retry(&self, need_retry: bool) {
        self.status.lock().need_retry = need_retry;
    }
}
