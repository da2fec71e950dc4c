//! Reference single-version peer protocol.
//!
//! Push side of a key/value exchange: time sync, ability negotiation (from
//! version 3), then acknowledged data batches. Inbound batches are saved
//! with the save-data keepalive running and acknowledged.

use crate::protocol::{Direction, Protocol, StepContext};
use crate::session::SyncTarget;
use crate::table::StateSwitchTable;
use crate::transport::SyncMessage;
use datasync_runtime::{MetadataStoreExt, SyncError, SyncMode, SyncResult};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Lowest version that negotiates abilities.
pub const ABILITY_SYNC_VERSION: u32 = 3;

/// States of [`SingleVerProtocol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SingleVerState {
    /// No task running.
    Idle,
    /// Waiting for the time sync answer.
    TimeSync,
    /// Waiting for the ability answer.
    AbilitySync,
    /// Sending the next batch.
    DataSync,
    /// Waiting for a batch acknowledgement.
    WaitForAck,
    /// The current target finished.
    TaskFinished,
    /// The current target failed.
    TaskFailed,
    /// The current target ran out of retries.
    TimedOut,
}

/// Events of [`SingleVerProtocol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SingleVerEvent {
    /// A target was prepared.
    Start,
    /// Time offset known.
    TimeSynced,
    /// Version agreed.
    AbilityAgreed,
    /// A batch is in flight.
    BatchSent,
    /// Nothing left to send.
    AllSent,
    /// The batch in flight was acknowledged.
    Acked,
    /// Another target was prepared.
    NextTask,
    /// The target queue is drained.
    AllDone,
    /// The current target failed.
    Failed,
    /// Retries exhausted.
    Timeout,
}

use SingleVerEvent as Ev;
use SingleVerState as St;

fn common_rules(table: StateSwitchTable<St, Ev>) -> StateSwitchTable<St, Ev> {
    let mut table = table
        .on(St::Idle, Ev::Start, St::TimeSync)
        .on(St::AbilitySync, Ev::AbilityAgreed, St::DataSync)
        .on(St::DataSync, Ev::BatchSent, St::WaitForAck)
        .on(St::DataSync, Ev::AllSent, St::TaskFinished)
        .on(St::WaitForAck, Ev::Acked, St::DataSync);
    for active in [St::TimeSync, St::AbilitySync, St::DataSync, St::WaitForAck] {
        table = table
            .on(active, Ev::Failed, St::TaskFailed)
            .on(active, Ev::Timeout, St::TimedOut);
    }
    for done in [St::TaskFinished, St::TaskFailed, St::TimedOut] {
        table = table
            .on(done, Ev::NextTask, St::DataSync)
            .on(done, Ev::AllDone, St::Idle);
    }
    table
}

/// Switch table for versions with ability negotiation.
pub fn ability_table() -> StateSwitchTable<St, Ev> {
    common_rules(StateSwitchTable::new(ABILITY_SYNC_VERSION))
        .on(St::TimeSync, Ev::TimeSynced, St::AbilitySync)
}

/// Switch table for versions without ability negotiation.
pub fn legacy_table() -> StateSwitchTable<St, Ev> {
    common_rules(StateSwitchTable::new(2)).on(St::TimeSync, Ev::TimeSynced, St::DataSync)
}

/// Key of the persisted time offset for `device`.
pub fn time_offset_key(device: &str) -> String {
    format!("time_offset/{device}")
}

/// Key of the persisted send watermark for `device` and `storage`.
pub fn watermark_key(device: &str, storage: &str) -> String {
    format!("watermark/{device}/{storage}")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Reference peer protocol with one data version.
pub struct SingleVerProtocol {
    tables: Vec<StateSwitchTable<St, Ev>>,
    batch_size: usize,
    mode: SyncMode,
    watermark: u64,
    sequence_id: u32,
    in_flight: Option<(u32, SyncMessage)>,
    last_error: Option<SyncError>,
    sending: bool,
}

impl SingleVerProtocol {
    /// Creates the protocol with both switch tables, newest first.
    pub fn new() -> Self {
        Self::with_tables(vec![ability_table(), legacy_table()])
    }

    /// Creates the protocol with custom switch tables.
    pub fn with_tables(tables: Vec<StateSwitchTable<St, Ev>>) -> Self {
        Self {
            tables,
            batch_size: 128,
            mode: SyncMode::PushPull,
            watermark: 0,
            sequence_id: 0,
            in_flight: None,
            last_error: None,
            sending: false,
        }
    }

    /// Sets the number of records per batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Returns the acknowledged send watermark of the current target.
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Returns the sequence id of the last batch sent.
    pub fn sequence_id(&self) -> u32 {
        self.sequence_id
    }

    fn fail(&mut self, error: SyncError) -> Option<Ev> {
        warn!(error = %error, "sync step failed");
        self.last_error = Some(error);
        Some(Ev::Failed)
    }

    fn send_or_fail(&mut self, cx: &StepContext<'_>, message: SyncMessage) -> Option<Ev> {
        match cx.send(message) {
            Ok(()) => None,
            Err(e) => self.fail(e),
        }
    }

    fn release_sender(&mut self, cx: &StepContext<'_>) {
        if self.sending {
            cx.stop_feed_dog(Direction::Send);
            self.sending = false;
        }
        self.in_flight = None;
    }

    fn advance_target(&mut self, cx: &StepContext<'_>) -> SyncResult<Option<Ev>> {
        match cx.next_target() {
            Ok(target) => {
                self.prepare_next_task(&target, cx)?;
                Ok(Some(Ev::NextTask))
            }
            Err(SyncError::NoSyncTask) => {
                cx.stop_watchdog();
                info!(device = %cx.session().device_id(), "all targets synced");
                Ok(Some(Ev::AllDone))
            }
            Err(e) => Err(e),
        }
    }

    fn finish(&mut self, result: SyncResult<()>, cx: &StepContext<'_>) -> SyncResult<Option<Ev>> {
        self.release_sender(cx);
        cx.session().finish_current(result);
        self.advance_target(cx)
    }

    fn send_batch(&mut self, cx: &StepContext<'_>) -> SyncResult<Option<Ev>> {
        if !matches!(self.mode, SyncMode::Push | SyncMode::PushPull) {
            return Ok(Some(Ev::AllSent));
        }
        let batch = match cx.storage().collect_outgoing(self.watermark, self.batch_size) {
            Ok(batch) => batch,
            Err(e) => return Ok(self.fail(e)),
        };
        if batch.entries.is_empty() {
            return Ok(Some(Ev::AllSent));
        }
        if !self.sending {
            cx.start_feed_dog(cx.config().transfer_feed_duration, Direction::Send);
            self.sending = true;
        }
        self.sequence_id = self.sequence_id.wrapping_add(1);
        let message = SyncMessage::Data {
            sequence_id: self.sequence_id,
            entries: batch.entries,
            watermark: batch.watermark,
        };
        self.in_flight = Some((self.sequence_id, message.clone()));
        match cx.send(message) {
            Ok(()) => Ok(Some(Ev::BatchSent)),
            Err(e) => Ok(self.fail(e)),
        }
    }

    fn resend(&mut self, state: St, cx: &StepContext<'_>) -> Option<Ev> {
        cx.session().set_need_retry(false);
        let message = match state {
            St::TimeSync => SyncMessage::TimeSync {
                local_time: now_millis(),
            },
            St::AbilitySync => SyncMessage::AbilitySync {
                version: cx.config().protocol_version,
            },
            St::WaitForAck => match &self.in_flight {
                Some((_, message)) => message.clone(),
                None => return None,
            },
            _ => return None,
        };
        debug!(?state, "resending after timeout");
        self.send_or_fail(cx, message)
    }

    fn save_incoming(
        &mut self,
        cx: &StepContext<'_>,
        sequence_id: u32,
        entries: &[crate::transport::DataEntry],
        watermark: u64,
    ) -> SyncResult<()> {
        let session_id = cx.session().session_id();
        let notifying = cx.start_save_data_notify(session_id, sequence_id, sequence_id);
        let saved = cx.storage().apply_incoming(cx.session().device_id(), entries);
        if notifying {
            cx.stop_save_data_notify();
        }
        saved?;
        cx.send(SyncMessage::DataAck {
            sequence_id,
            watermark,
        })
    }
}

impl Default for SingleVerProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for SingleVerProtocol {
    type State = St;
    type Event = Ev;

    fn initial_state(&self) -> St {
        St::Idle
    }

    fn switch_tables(&self) -> &[StateSwitchTable<St, Ev>] {
        &self.tables
    }

    fn start(&mut self, state: St, cx: &StepContext<'_>) -> SyncResult<Ev> {
        if state != St::Idle {
            return Err(SyncError::Busy(format!("sync running in state {state:?}")));
        }
        let target = cx.next_target()?;
        self.prepare_next_task(&target, cx)?;
        Ok(Ev::Start)
    }

    fn step(&mut self, state: St, cx: &StepContext<'_>) -> SyncResult<Option<Ev>> {
        if cx.session().need_retry() {
            return Ok(self.resend(state, cx));
        }
        match state {
            St::Idle | St::WaitForAck => Ok(None),
            St::TimeSync => Ok(self.send_or_fail(
                cx,
                SyncMessage::TimeSync {
                    local_time: now_millis(),
                },
            )),
            St::AbilitySync => Ok(self.send_or_fail(
                cx,
                SyncMessage::AbilitySync {
                    version: cx.config().protocol_version,
                },
            )),
            St::DataSync => self.send_batch(cx),
            St::TaskFinished => self.finish(Ok(()), cx),
            St::TaskFailed => {
                let error = self
                    .last_error
                    .take()
                    .unwrap_or_else(|| SyncError::store_fatal("sync failed"));
                self.finish(Err(error), cx)
            }
            St::TimedOut => self.finish(Err(SyncError::Timeout), cx),
        }
    }

    fn on_message(
        &mut self,
        state: St,
        message: &SyncMessage,
        cx: &StepContext<'_>,
    ) -> SyncResult<Option<Ev>> {
        let device = cx.session().device_id().to_string();
        match (state, message) {
            (St::TimeSync, SyncMessage::TimeSyncAck { offset }) => {
                cx.metadata().save_meta(&time_offset_key(&device), offset, true)?;
                cx.reset_watchdog()?;
                Ok(Some(Ev::TimeSynced))
            }
            (St::AbilitySync, SyncMessage::AbilityAck { version }) => {
                let agreed = (*version).min(cx.config().protocol_version);
                cx.session().set_version(agreed);
                cx.reset_watchdog()?;
                debug!(%device, agreed, "ability negotiated");
                Ok(Some(Ev::AbilityAgreed))
            }
            (
                St::WaitForAck,
                SyncMessage::DataAck {
                    sequence_id,
                    watermark,
                },
            ) => {
                match &self.in_flight {
                    Some((expected, _)) if expected == sequence_id => {}
                    _ => {
                        debug!(%device, sequence_id, "stale ack ignored");
                        return Ok(None);
                    }
                }
                self.in_flight = None;
                self.watermark = *watermark;
                let key = watermark_key(&device, &cx.storage().identifier());
                cx.metadata().save_meta(&key, watermark, true)?;
                cx.reset_watchdog()?;
                Ok(Some(Ev::Acked))
            }
            (St::WaitForAck, SyncMessage::SaveDataNotify { .. }) => {
                cx.reset_watchdog()?;
                Ok(None)
            }
            (
                _,
                SyncMessage::Data {
                    sequence_id,
                    entries,
                    watermark,
                },
            ) => {
                self.save_incoming(cx, *sequence_id, entries, *watermark)?;
                Ok(None)
            }
            (_, SyncMessage::TimeSync { local_time }) => {
                let offset = now_millis() as i64 - *local_time as i64;
                cx.send(SyncMessage::TimeSyncAck { offset })?;
                Ok(None)
            }
            (_, SyncMessage::AbilitySync { version }) => {
                let agreed = (*version).min(cx.config().protocol_version);
                cx.send(SyncMessage::AbilityAck { version: agreed })?;
                Ok(None)
            }
            _ => {
                debug!(%device, ?state, "message ignored");
                Ok(None)
            }
        }
    }

    fn timeout_event(&self) -> Ev {
        Ev::Timeout
    }

    fn abort(&mut self, cx: &StepContext<'_>) {
        self.release_sender(cx);
        cx.stop_save_data_notify();
        cx.session().finish_current(Err(SyncError::Busy("aborted".into())));
        self.last_error = None;
    }

    fn prepare_next_task(&mut self, target: &SyncTarget, cx: &StepContext<'_>) -> SyncResult<()> {
        let device = cx.session().device_id().to_string();
        let key = watermark_key(&device, &cx.storage().identifier());
        self.watermark = cx.metadata().load_meta(&key, true)?.unwrap_or(0);
        self.mode = target.mode;
        self.in_flight = None;
        self.last_error = None;
        cx.session().set_need_retry(false);
        debug!(%device, target = target.id, watermark = self.watermark, "target prepared");
        cx.start_watchdog()
    }
}
