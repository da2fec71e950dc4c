//! Per-peer protocol state machine.
//!
//! The machine serializes everything that touches one session behind the
//! session lock (`core`), selects the switch table by negotiated version and
//! owns three kinds of liveness timers:
//!
//! - the **watchdog**, whose expiry drives retry with escalating backoff
//!   and finally the protocol's timeout event;
//! - the **save-data keepalive**, which feeds the watchdog and tells the
//!   peer that a received batch is still being saved;
//! - one **feed-dog** per transfer direction, which feeds the watchdog
//!   during bulk transfer for a bounded number of ticks.
//!
//! Every timer closure holds a weak reference in its tick and a strong
//! reference in its finalizer, so the machine outlives its armed timers.

use crate::config::MachineConfig;
use crate::protocol::{Direction, MachineOps, Protocol, StepContext};
use crate::session::{SyncSession, SyncTarget};
use crate::table::{select_table, Transition};
use crate::transport::{Communicator, SyncMessage, SyncStorage};
use datasync_runtime::{MetadataStore, SyncError, SyncResult, TimerId, TimerService};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

struct Core<P: Protocol> {
    state: P::State,
    state_error: bool,
    protocol: P,
}

#[derive(Debug, Default)]
struct Keepalive {
    timer: Option<TimerId>,
    count: u32,
}

/// Snapshot of one direction's feed-dog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedDogController {
    /// Armed tick timer.
    pub timer: Option<TimerId>,
    /// Ticks counted since the last (re)start.
    pub elapsed: u8,
    /// Tick count after which the timer stops itself.
    pub upper_limit: u8,
    /// Number of transfers holding the feed-dog.
    pub ref_count: u32,
}

/// Builder validating the collaborators of a [`SyncStateMachine`].
pub struct MachineBuilder<P: Protocol> {
    protocol: P,
    session: Option<Arc<SyncSession>>,
    storage: Option<Arc<dyn SyncStorage>>,
    metadata: Option<Arc<dyn MetadataStore>>,
    communicator: Option<Arc<dyn Communicator>>,
    timer: Option<Arc<dyn TimerService>>,
    config: MachineConfig,
}

impl<P: Protocol> MachineBuilder<P> {
    /// Sets the session.
    pub fn session(mut self, session: Arc<SyncSession>) -> Self {
        self.session = Some(session);
        self
    }

    /// Sets the local dataset.
    pub fn storage(mut self, storage: Arc<dyn SyncStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the metadata store.
    pub fn metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Sets the communicator.
    pub fn communicator(mut self, communicator: Arc<dyn Communicator>) -> Self {
        self.communicator = Some(communicator);
        self
    }

    /// Sets the timer service.
    pub fn timer(mut self, timer: Arc<dyn TimerService>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Sets the configuration.
    pub fn config(mut self, config: MachineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the machine.
    ///
    /// Fails with [`SyncError::InvalidArgument`] if the session, storage,
    /// metadata or communicator is missing, and with
    /// [`SyncError::NotInitialized`] if no timer service is bound.
    pub fn initialize(self) -> SyncResult<Arc<SyncStateMachine<P>>> {
        let missing = |what: &str| SyncError::InvalidArgument(format!("missing {what}"));
        let session = self.session.ok_or_else(|| missing("session"))?;
        let storage = self.storage.ok_or_else(|| missing("storage"))?;
        let metadata = self.metadata.ok_or_else(|| missing("metadata"))?;
        let communicator = self.communicator.ok_or_else(|| missing("communicator"))?;
        let timer = self
            .timer
            .ok_or_else(|| SyncError::NotInitialized("timer service".into()))?;
        let protocol = self.protocol;
        let config = self.config;

        Ok(Arc::new_cyclic(|self_ref| SyncStateMachine {
            self_ref: self_ref.clone(),
            core: Mutex::new(Core {
                state: protocol.initial_state(),
                state_error: false,
                protocol,
            }),
            session,
            storage,
            metadata,
            communicator,
            timer,
            config,
            keepalive: Mutex::new(Keepalive::default()),
            feed_dogs: [
                Mutex::new(FeedDogController::default()),
                Mutex::new(FeedDogController::default()),
            ],
        }))
    }
}

/// Drives one [`SyncSession`] through a [`Protocol`].
pub struct SyncStateMachine<P: Protocol> {
    self_ref: Weak<Self>,
    session: Arc<SyncSession>,
    storage: Arc<dyn SyncStorage>,
    metadata: Arc<dyn MetadataStore>,
    communicator: Arc<dyn Communicator>,
    timer: Arc<dyn TimerService>,
    config: MachineConfig,
    core: Mutex<Core<P>>,
    keepalive: Mutex<Keepalive>,
    feed_dogs: [Mutex<FeedDogController>; 2],
}

impl<P: Protocol> SyncStateMachine<P> {
    /// Starts building a machine driving `protocol`.
    pub fn builder(protocol: P) -> MachineBuilder<P> {
        MachineBuilder {
            protocol,
            session: None,
            storage: None,
            metadata: None,
            communicator: None,
            timer: None,
            config: MachineConfig::default(),
        }
    }

    /// Returns the session.
    pub fn session(&self) -> &Arc<SyncSession> {
        &self.session
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Returns the current state.
    pub fn current_state(&self) -> P::State {
        self.core.lock().state
    }

    /// Returns true if a switch hit a state the selected table does not know.
    pub fn has_state_error(&self) -> bool {
        self.core.lock().state_error
    }

    /// Runs `f` with the protocol, under the session lock.
    pub fn with_protocol<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&self.core.lock().protocol)
    }

    fn cx(&self) -> StepContext<'_> {
        StepContext { ops: self }
    }

    /// Starts a sync.
    ///
    /// Fails with [`SyncError::Busy`] if the session is killed. Concurrent
    /// calls for one session are serialized.
    pub fn start_sync(&self) -> SyncResult<()> {
        let _usage = self.session.enter()?;
        let mut core = self.core.lock();
        core.state_error = false;
        let state = core.state;
        let event = core.protocol.start(state, &self.cx())?;
        debug!(device = %self.session.device_id(), ?event, "starting sync");
        self.run(&mut core, event);
        Ok(())
    }

    /// Switches the current state by `event` without stepping.
    pub fn switch_state(&self, event: P::Event) -> SyncResult<()> {
        let mut core = self.core.lock();
        self.switch_machine_state(&mut core, event)
    }

    /// Switches by `event` and steps while the protocol produces events.
    pub fn switch_state_and_step(&self, event: P::Event) {
        let mut core = self.core.lock();
        self.run(&mut core, event);
    }

    /// Feeds an inbound message to the protocol.
    pub fn receive_message(&self, message: &SyncMessage) -> SyncResult<()> {
        let _usage = self.session.enter()?;
        let mut core = self.core.lock();
        let state = core.state;
        let event = core.protocol.on_message(state, message, &self.cx())?;
        if let Some(event) = event {
            self.run(&mut core, event);
        }
        Ok(())
    }

    fn switch_machine_state(&self, core: &mut Core<P>, event: P::Event) -> SyncResult<()> {
        let version = self.session.version();
        let Some(table) = select_table(core.protocol.switch_tables(), version) else {
            error!(device = %self.session.device_id(), version, "no compatible switch table");
            return Err(SyncError::NotFound(format!(
                "switch table for version {version}"
            )));
        };
        match table.lookup(core.state, event) {
            Transition::Next(next) => {
                debug!(
                    device = %self.session.device_id(),
                    table = table.min_version(),
                    from = ?core.state,
                    to = ?next,
                    ?event,
                    "state switched"
                );
                core.state = next;
                Ok(())
            }
            Transition::UnknownState => {
                error!(
                    device = %self.session.device_id(),
                    table = table.min_version(),
                    state = ?core.state,
                    "state missing from switch table"
                );
                core.state_error = true;
                Ok(())
            }
            Transition::UnknownEvent => {
                debug!(state = ?core.state, ?event, "event ignored");
                Err(SyncError::NotFound(format!(
                    "event {event:?} in state {:?}",
                    core.state
                )))
            }
        }
    }

    fn run(&self, core: &mut Core<P>, event: P::Event) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            if self.switch_machine_state(core, event).is_err() || core.state_error {
                break;
            }
            next = self.step(core);
        }
    }

    fn step(&self, core: &mut Core<P>) -> Option<P::Event> {
        let state = core.state;
        match core.protocol.step(state, &self.cx()) {
            Ok(event) => event,
            Err(e) => {
                warn!(device = %self.session.device_id(), ?state, error = %e, "step failed");
                None
            }
        }
    }

    /// Handles expiry of the watchdog timer `timer`.
    ///
    /// Stale timers and killed sessions yield [`SyncError::UnexpectedTimer`]
    /// without touching the session.
    pub fn timeout_callback(&self, timer: TimerId) -> SyncResult<()> {
        let mut core = self.core.lock();
        if self.session.is_killed() || self.session.watchdog_timer() != Some(timer) {
            debug!(device = %self.session.device_id(), %timer, "stale watchdog tick");
            return Err(SyncError::UnexpectedTimer(timer.get()));
        }

        let retry = self.session.retry_time();
        if self.config.retry.is_exhausted(retry) || !self.session.current_allows_retry() {
            info!(device = %self.session.device_id(), retry, "sync timed out");
            let event = core.protocol.timeout_event();
            self.run(&mut core, event);
            return Ok(());
        }

        let retry = retry + 1;
        self.session.set_retry_time(retry);
        self.session.set_need_retry(true);
        let timeout = self.config.retry.timeout_for_retry(retry);
        self.rearm_watchdog(timeout)?;
        info!(
            device = %self.session.device_id(),
            retry,
            timeout_ms = timeout.as_millis() as u64,
            "retrying sync step"
        );
        if let Some(event) = self.step(&mut core) {
            self.run(&mut core, event);
        }
        Ok(())
    }

    /// Aborts the session in the background.
    ///
    /// The scheduled task keeps the machine alive until it has run.
    pub fn abort(&self) -> SyncResult<()> {
        let this = self
            .self_ref
            .upgrade()
            .ok_or_else(|| SyncError::NotInitialized("state machine is dropping".into()))?;
        let scheduled = self.timer.schedule_task(Box::new(move || {
            let mut core = this.core.lock();
            core.protocol.abort(&this.cx());
            this.stop_watchdog();
            core.state = core.protocol.initial_state();
            core.state_error = false;
            info!(device = %this.session.device_id(), "sync aborted");
        }));
        if let Err(e) = &scheduled {
            error!(device = %self.session.device_id(), error = %e, "abort could not be scheduled");
        }
        scheduled
    }

    /// Prepares the next queued target.
    ///
    /// Returns [`SyncError::NoSyncTask`] once the queue is drained.
    pub fn exec_next_task(&self) -> SyncResult<()> {
        let mut core = self.core.lock();
        let target = self.next_target()?;
        if let Err(e) = core.protocol.prepare_next_task(&target, &self.cx()) {
            error!(device = %self.session.device_id(), target = target.id, error = %e, "prepare failed");
            self.session.finish_target(&target, false, Err(e.clone()));
            return Err(e);
        }
        Ok(())
    }

    fn next_target(&self) -> SyncResult<SyncTarget> {
        loop {
            match self.session.pop_target() {
                Some(target) if target.skippable => {
                    debug!(target = target.id, "target already satisfied");
                    self.session.finish_target(&target, true, Ok(()));
                }
                Some(target) => return Ok(target),
                None => {
                    self.session.mark_finished();
                    debug!(device = %self.session.device_id(), "all sync targets finished");
                    return Err(SyncError::NoSyncTask);
                }
            }
        }
    }

    fn arm_watchdog(&self, interval: Duration) -> SyncResult<TimerId> {
        let weak = self.self_ref.clone();
        let keep = self.self_ref.upgrade();
        let result = self.timer.set_timer(
            interval,
            Box::new(move |id: TimerId| {
                if let Some(machine) = weak.upgrade() {
                    if let Err(e) = machine.timeout_callback(id) {
                        debug!(timer = %id, error = %e, "watchdog tick ignored");
                    }
                }
            }),
            Some(Box::new(move || drop(keep))),
        );
        match result {
            Ok(id) => {
                self.session.set_watchdog_timer(Some(id));
                Ok(id)
            }
            Err(e) => {
                self.session.set_watchdog_timer(None);
                warn!(device = %self.session.device_id(), error = %e, "watchdog could not be armed");
                Err(e)
            }
        }
    }

    fn disarm_watchdog(&self) {
        if let Some(id) = self.session.take_watchdog_timer() {
            self.timer.remove_timer(id);
        }
    }

    fn rearm_watchdog(&self, interval: Duration) -> SyncResult<()> {
        self.disarm_watchdog();
        self.arm_watchdog(interval).map(|_| ())
    }

    /// Arms the watchdog with the configured timeout.
    pub fn start_watchdog(&self) -> SyncResult<()> {
        self.rearm_watchdog(self.config.watchdog_timeout)
    }

    /// Re-arms an active watchdog and zeroes the retry counter.
    pub fn reset_watchdog(&self) -> SyncResult<()> {
        if !self.session.is_watchdog_active() {
            return Ok(());
        }
        debug!(device = %self.session.device_id(), "reset watchdog");
        self.disarm_watchdog();
        self.session.set_retry_time(0);
        self.arm_watchdog(self.config.watchdog_timeout).map(|_| ())
    }

    /// Disarms the watchdog.
    pub fn stop_watchdog(&self) {
        debug!(device = %self.session.device_id(), "stop watchdog");
        self.disarm_watchdog();
    }

    fn feed_watchdog(&self) {
        let _core = self.core.lock();
        if let Err(e) = self.reset_watchdog() {
            warn!(device = %self.session.device_id(), error = %e, "watchdog feed failed");
        }
    }

    /// Starts the save-data keepalive.
    ///
    /// Returns false if a keepalive is already running (its tick count is
    /// reset) or the timer could not be armed.
    pub fn start_save_data_notify(&self, session_id: u32, sequence_id: u32, msg_id: u32) -> bool {
        let mut keepalive = self.keepalive.lock();
        if keepalive.timer.is_some() {
            keepalive.count = 0;
            warn!(device = %self.session.device_id(), "save-data notify already running");
            return false;
        }
        let Some(keep) = self.self_ref.upgrade() else {
            return false;
        };
        let weak = self.self_ref.clone();
        let result = self.timer.set_timer(
            self.config.tick_interval,
            Box::new(move |id: TimerId| {
                if let Some(machine) = weak.upgrade() {
                    machine.on_keepalive_tick(id, session_id, sequence_id, msg_id);
                }
            }),
            Some(Box::new(move || drop(keep))),
        );
        match result {
            Ok(id) => {
                keepalive.timer = Some(id);
                keepalive.count = 0;
                true
            }
            Err(e) => {
                warn!(device = %self.session.device_id(), error = %e, "save-data notify not armed");
                false
            }
        }
    }

    fn on_keepalive_tick(&self, id: TimerId, session_id: u32, sequence_id: u32, msg_id: u32) {
        self.feed_watchdog();
        let mut keepalive = self.keepalive.lock();
        if keepalive.timer != Some(id) {
            return;
        }
        if keepalive.count >= self.config.keepalive_budget {
            info!(device = %self.session.device_id(), "save-data notify budget spent");
            self.stop_keepalive(&mut keepalive);
            return;
        }
        let packet = SyncMessage::SaveDataNotify {
            session_id,
            sequence_id,
            msg_id,
        };
        if let Err(e) = self
            .communicator
            .send_message(self.session.device_id(), packet)
        {
            warn!(device = %self.session.device_id(), error = %e, "save-data notify not sent");
        }
        keepalive.count += 1;
    }

    fn stop_keepalive(&self, keepalive: &mut Keepalive) {
        if let Some(id) = keepalive.timer.take() {
            self.timer.remove_timer(id);
        }
        keepalive.count = 0;
    }

    /// Stops the save-data keepalive.
    pub fn stop_save_data_notify(&self) {
        let mut keepalive = self.keepalive.lock();
        self.stop_keepalive(&mut keepalive);
    }

    /// Returns true while the save-data keepalive is armed.
    pub fn is_save_data_notify_active(&self) -> bool {
        self.keepalive.lock().timer.is_some()
    }

    /// Returns the number of keepalive packets sent by the running keepalive.
    pub fn save_data_notify_count(&self) -> u32 {
        self.keepalive.lock().count
    }

    /// Takes a reference on the feed-dog of `direction`.
    ///
    /// The first reference arms a tick timer that stops itself after
    /// `duration / tick_interval` ticks. Further references only raise that
    /// limit and restart the count; they return false.
    pub fn start_feed_dog_for_sync(&self, duration: Duration, direction: Direction) -> bool {
        let limit = self.config.feed_dog_ticks(duration);
        let mut dog = self.feed_dogs[direction.index()].lock();
        dog.ref_count += 1;
        if dog.timer.is_some() {
            dog.upper_limit = dog.upper_limit.max(limit);
            dog.elapsed = 0;
            debug!(?direction, ref_count = dog.ref_count, "feed-dog already running");
            return false;
        }

        let Some(keep) = self.self_ref.upgrade() else {
            dog.ref_count -= 1;
            return false;
        };
        let weak = self.self_ref.clone();
        let result = self.timer.set_timer(
            self.config.tick_interval,
            Box::new(move |id: TimerId| {
                if let Some(machine) = weak.upgrade() {
                    machine.on_feed_dog_tick(id, direction);
                }
            }),
            Some(Box::new(move || drop(keep))),
        );
        match result {
            Ok(id) => {
                info!(?direction, limit, "feed-dog started");
                dog.timer = Some(id);
                dog.upper_limit = limit;
                dog.elapsed = 0;
                true
            }
            Err(e) => {
                dog.ref_count -= 1;
                warn!(?direction, error = %e, "feed-dog not armed");
                false
            }
        }
    }

    fn on_feed_dog_tick(&self, id: TimerId, direction: Direction) {
        self.feed_watchdog();
        let mut dog = self.feed_dogs[direction.index()].lock();
        if dog.timer != Some(id) {
            return;
        }
        if dog.elapsed >= dog.upper_limit {
            info!(?direction, "feed-dog limit reached");
            self.teardown_feed_dog(&mut dog);
            return;
        }
        dog.elapsed += 1;
    }

    fn teardown_feed_dog(&self, dog: &mut FeedDogController) {
        if let Some(id) = dog.timer.take() {
            self.timer.remove_timer(id);
        }
        *dog = FeedDogController::default();
    }

    /// Releases one reference on the feed-dog of `direction`.
    ///
    /// The timer is torn down when the last reference goes.
    pub fn stop_feed_dog_for_sync(&self, direction: Direction) {
        let mut dog = self.feed_dogs[direction.index()].lock();
        if dog.timer.is_none() {
            return;
        }
        dog.ref_count = dog.ref_count.saturating_sub(1);
        if dog.ref_count == 0 {
            debug!(?direction, "feed-dog released");
            self.teardown_feed_dog(&mut dog);
        }
    }

    /// Tears down the feed-dog of `direction` regardless of references.
    pub fn force_stop_feed_dog(&self, direction: Direction) {
        let mut dog = self.feed_dogs[direction.index()].lock();
        self.teardown_feed_dog(&mut dog);
    }

    /// Returns a snapshot of the feed-dog of `direction`.
    pub fn feed_dog(&self, direction: Direction) -> FeedDogController {
        *self.feed_dogs[direction.index()].lock()
    }
}

impl<P: Protocol> MachineOps for SyncStateMachine<P> {
    fn session(&self) -> &Arc<SyncSession> {
        &self.session
    }

    fn storage(&self) -> &dyn SyncStorage {
        self.storage.as_ref()
    }

    fn metadata(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }

    fn communicator(&self) -> &dyn Communicator {
        self.communicator.as_ref()
    }

    fn config(&self) -> &MachineConfig {
        &self.config
    }

    fn start_watchdog(&self) -> SyncResult<()> {
        SyncStateMachine::start_watchdog(self)
    }

    fn reset_watchdog(&self) -> SyncResult<()> {
        SyncStateMachine::reset_watchdog(self)
    }

    fn stop_watchdog(&self) {
        SyncStateMachine::stop_watchdog(self)
    }

    fn start_feed_dog(&self, duration: Duration, direction: Direction) -> bool {
        self.start_feed_dog_for_sync(duration, direction)
    }

    fn stop_feed_dog(&self, direction: Direction) {
        self.stop_feed_dog_for_sync(direction)
    }

    fn start_save_data_notify(&self, session_id: u32, sequence_id: u32, msg_id: u32) -> bool {
        SyncStateMachine::start_save_data_notify(self, session_id, sequence_id, msg_id)
    }

    fn stop_save_data_notify(&self) {
        SyncStateMachine::stop_save_data_notify(self)
    }

    fn next_target(&self) -> SyncResult<SyncTarget> {
        SyncStateMachine::next_target(self)
    }
}
