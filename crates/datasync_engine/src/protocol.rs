//! The protocol seam of the state machine.
//!
//! A [`Protocol`] supplies the version-specific data (states, events and
//! switch tables) and the actions run on entering a state. The machine owns
//! the dispatch loop, the timers and the locking.

use crate::config::MachineConfig;
use crate::session::{SyncSession, SyncTarget};
use crate::table::StateSwitchTable;
use crate::transport::{Communicator, SyncMessage, SyncStorage};
use datasync_runtime::{MetadataStore, SyncResult};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Transfer direction of a feed-dog timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sending data to the peer.
    Send,
    /// Receiving data from the peer.
    Receive,
}

impl Direction {
    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Send => 0,
            Direction::Receive => 1,
        }
    }
}

/// Version-specific behavior driven by a
/// [`SyncStateMachine`](crate::SyncStateMachine).
///
/// Every method runs with the session lock held.
pub trait Protocol: Send + 'static {
    /// Protocol states.
    type State: Copy + Eq + Hash + Debug + Send + Sync + 'static;
    /// Protocol events.
    type Event: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// State of a fresh or aborted machine.
    fn initial_state(&self) -> Self::State;

    /// Switch tables, tried in declared order.
    fn switch_tables(&self) -> &[StateSwitchTable<Self::State, Self::Event>];

    /// Prepares a sync from `state` and returns the event that starts it.
    fn start(&mut self, state: Self::State, cx: &StepContext<'_>) -> SyncResult<Self::Event>;

    /// Runs the action of `state`, optionally producing the next event.
    fn step(&mut self, state: Self::State, cx: &StepContext<'_>)
        -> SyncResult<Option<Self::Event>>;

    /// Maps an inbound message to an event.
    fn on_message(
        &mut self,
        state: Self::State,
        message: &SyncMessage,
        cx: &StepContext<'_>,
    ) -> SyncResult<Option<Self::Event>>;

    /// Event switched in when the retry budget is spent.
    fn timeout_event(&self) -> Self::Event;

    /// Releases per-task resources on abort.
    fn abort(&mut self, cx: &StepContext<'_>);

    /// Prepares `target` for syncing.
    fn prepare_next_task(&mut self, target: &SyncTarget, cx: &StepContext<'_>) -> SyncResult<()>;
}

/// Machine operations available to a protocol while it holds the session
/// lock.
pub(crate) trait MachineOps: Send + Sync {
    fn session(&self) -> &Arc<SyncSession>;
    fn storage(&self) -> &dyn SyncStorage;
    fn metadata(&self) -> &dyn MetadataStore;
    fn communicator(&self) -> &dyn Communicator;
    fn config(&self) -> &MachineConfig;
    fn start_watchdog(&self) -> SyncResult<()>;
    fn reset_watchdog(&self) -> SyncResult<()>;
    fn stop_watchdog(&self);
    fn start_feed_dog(&self, duration: Duration, direction: Direction) -> bool;
    fn stop_feed_dog(&self, direction: Direction);
    fn start_save_data_notify(&self, session_id: u32, sequence_id: u32, msg_id: u32) -> bool;
    fn stop_save_data_notify(&self);
    fn next_target(&self) -> SyncResult<SyncTarget>;
}

/// Handle passed to [`Protocol`] methods.
pub struct StepContext<'a> {
    pub(crate) ops: &'a dyn MachineOps,
}

impl StepContext<'_> {
    /// The session being driven.
    pub fn session(&self) -> &Arc<SyncSession> {
        self.ops.session()
    }

    /// The local dataset.
    pub fn storage(&self) -> &dyn SyncStorage {
        self.ops.storage()
    }

    /// Persisted sync metadata.
    pub fn metadata(&self) -> &dyn MetadataStore {
        self.ops.metadata()
    }

    /// Machine configuration.
    pub fn config(&self) -> &MachineConfig {
        self.ops.config()
    }

    /// Sends `message` to the session's peer.
    pub fn send(&self, message: SyncMessage) -> SyncResult<()> {
        let device = self.ops.session().device_id();
        self.ops.communicator().send_message(device, message)
    }

    /// Arms the watchdog.
    pub fn start_watchdog(&self) -> SyncResult<()> {
        self.ops.start_watchdog()
    }

    /// Re-arms the watchdog and zeroes the retry counter.
    pub fn reset_watchdog(&self) -> SyncResult<()> {
        self.ops.reset_watchdog()
    }

    /// Disarms the watchdog.
    pub fn stop_watchdog(&self) {
        self.ops.stop_watchdog()
    }

    /// Starts or extends the feed-dog of `direction`.
    pub fn start_feed_dog(&self, duration: Duration, direction: Direction) -> bool {
        self.ops.start_feed_dog(duration, direction)
    }

    /// Releases one reference on the feed-dog of `direction`.
    pub fn stop_feed_dog(&self, direction: Direction) {
        self.ops.stop_feed_dog(direction)
    }

    /// Starts the save-data keepalive.
    pub fn start_save_data_notify(&self, session_id: u32, sequence_id: u32, msg_id: u32) -> bool {
        self.ops.start_save_data_notify(session_id, sequence_id, msg_id)
    }

    /// Stops the save-data keepalive.
    pub fn stop_save_data_notify(&self) {
        self.ops.stop_save_data_notify()
    }

    /// Pops the next target that needs protocol I/O.
    ///
    /// Returns [`SyncError::NoSyncTask`](datasync_runtime::SyncError::NoSyncTask)
    /// once the queue is drained.
    pub fn next_target(&self) -> SyncResult<SyncTarget> {
        self.ops.next_target()
    }
}
