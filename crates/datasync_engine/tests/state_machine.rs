//! End-to-end tests of the state machine driving the single-version protocol.

use datasync_engine::{
    ability_table, legacy_table, time_offset_key, watermark_key, DataEntry, Direction,
    FeedDogController, MachineConfig, MemorySyncStorage, MockCommunicator, RetryConfig,
    SingleVerEvent, SingleVerProtocol, SingleVerState, StateSwitchTable, SyncMessage, SyncSession,
    SyncStateMachine, SyncTarget, Transition,
};
use datasync_runtime::{
    ManualTimer, MemoryMetadataStore, MetadataStoreExt, SyncError, SyncMode, TimerId,
    TokioTimerService,
};
use datasync_testkit::init_tracing;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const PEER: &str = "peer-1";

struct Harness {
    timer: Arc<ManualTimer>,
    comm: Arc<MockCommunicator>,
    storage: Arc<MemorySyncStorage>,
    metadata: Arc<MemoryMetadataStore>,
    session: Arc<SyncSession>,
    machine: Arc<SyncStateMachine<SingleVerProtocol>>,
}

fn config() -> MachineConfig {
    MachineConfig::new(3)
        .with_watchdog_timeout(Duration::from_secs(5))
        .with_tick_interval(Duration::from_secs(2))
}

fn harness_with(version: u32, config: MachineConfig, protocol: SingleVerProtocol) -> Harness {
    init_tracing();
    let timer = Arc::new(ManualTimer::new());
    let comm = Arc::new(MockCommunicator::new());
    let storage = Arc::new(MemorySyncStorage::new("kv"));
    let metadata = Arc::new(MemoryMetadataStore::new());
    let session = Arc::new(SyncSession::new(PEER, 11, version));
    let machine = SyncStateMachine::builder(protocol)
        .session(Arc::clone(&session))
        .storage(storage.clone())
        .metadata(metadata.clone())
        .communicator(comm.clone())
        .timer(timer.clone())
        .config(config)
        .initialize()
        .unwrap();
    Harness {
        timer,
        comm,
        storage,
        metadata,
        session,
        machine,
    }
}

fn harness() -> Harness {
    harness_with(3, config(), SingleVerProtocol::new())
}

fn is_time_sync(message: &SyncMessage) -> bool {
    matches!(message, SyncMessage::TimeSync { .. })
}

fn last_data(comm: &MockCommunicator) -> (u32, u64) {
    comm.sent()
        .into_iter()
        .rev()
        .find_map(|(_, message)| match message {
            SyncMessage::Data {
                sequence_id,
                watermark,
                ..
            } => Some((sequence_id, watermark)),
            _ => None,
        })
        .expect("no data batch sent")
}

#[test]
fn full_push_flow_with_ability_negotiation() {
    let h = harness();
    h.storage.put("a", "1");
    h.storage.put("b", "2");
    h.session.push_target(SyncTarget::new(1, SyncMode::PushPull));

    h.machine.start_sync().unwrap();
    assert_eq!(h.machine.current_state(), SingleVerState::TimeSync);
    assert!(h.session.is_watchdog_active());
    assert_eq!(h.comm.count(is_time_sync), 1);

    h.machine
        .receive_message(&SyncMessage::TimeSyncAck { offset: 7 })
        .unwrap();
    assert_eq!(h.machine.current_state(), SingleVerState::AbilitySync);

    h.machine
        .receive_message(&SyncMessage::AbilityAck { version: 5 })
        .unwrap();
    assert_eq!(h.session.version(), 3);
    assert_eq!(h.machine.current_state(), SingleVerState::WaitForAck);
    assert!(h.machine.feed_dog(Direction::Send).timer.is_some());

    let (sequence_id, watermark) = last_data(&h.comm);
    assert_eq!(watermark, 2);
    h.machine
        .receive_message(&SyncMessage::DataAck {
            sequence_id,
            watermark,
        })
        .unwrap();

    assert_eq!(h.machine.current_state(), SingleVerState::Idle);
    assert!(h.session.is_finished());
    assert!(!h.session.is_watchdog_active());
    assert!(h.machine.feed_dog(Direction::Send).timer.is_none());

    let outcomes = h.session.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].id, 1);
    assert_eq!(outcomes[0].result, Ok(()));

    let stored: Option<u64> = h
        .metadata
        .load_meta(&watermark_key(PEER, "kv"), true)
        .unwrap();
    assert_eq!(stored, Some(2));
    let offset: Option<i64> = h.metadata.load_meta(&time_offset_key(PEER), true).unwrap();
    assert_eq!(offset, Some(7));
    assert_eq!(h.machine.with_protocol(|p| p.watermark()), 2);
}

#[test]
fn legacy_peer_skips_ability_sync() {
    let h = harness_with(2, config(), SingleVerProtocol::new());
    h.session.push_target(SyncTarget::new(1, SyncMode::Push));

    h.machine.start_sync().unwrap();
    h.machine
        .receive_message(&SyncMessage::TimeSyncAck { offset: 0 })
        .unwrap();

    // Nothing to send, so the target finishes straight away.
    assert_eq!(h.machine.current_state(), SingleVerState::Idle);
    assert_eq!(
        h.comm
            .count(|m| matches!(m, SyncMessage::AbilitySync { .. })),
        0
    );
    assert_eq!(h.session.outcomes()[0].result, Ok(()));
}

#[test]
fn second_start_while_running_is_busy() {
    let h = harness();
    h.session.push_target(SyncTarget::new(1, SyncMode::Push));
    h.session.push_target(SyncTarget::new(2, SyncMode::Push));
    h.machine.start_sync().unwrap();

    assert!(matches!(h.machine.start_sync(), Err(SyncError::Busy(_))));
    assert_eq!(h.session.pending_targets(), 1);
}

#[test]
fn next_target_follows_finished_one() {
    let h = harness();
    h.session.push_target(SyncTarget::new(1, SyncMode::Pull));
    h.session.push_target(SyncTarget::new(2, SyncMode::Pull));

    h.machine.start_sync().unwrap();
    h.machine
        .receive_message(&SyncMessage::TimeSyncAck { offset: 0 })
        .unwrap();
    h.machine
        .receive_message(&SyncMessage::AbilityAck { version: 3 })
        .unwrap();

    let ids: Vec<u32> = h.session.outcomes().iter().map(|o| o.id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(h.machine.current_state(), SingleVerState::Idle);
}

#[test]
fn stale_watchdog_tick_is_ignored() {
    let h = harness();
    h.session.push_target(SyncTarget::new(1, SyncMode::Push));
    h.machine.start_sync().unwrap();

    let live = h.session.watchdog_timer().unwrap();
    let stale = TimerId::new(live.get() + 100);
    assert_eq!(
        h.machine.timeout_callback(stale),
        Err(SyncError::UnexpectedTimer(stale.get()))
    );
    assert_eq!(h.session.retry_time(), 0);
    assert_eq!(h.machine.current_state(), SingleVerState::TimeSync);
}

#[test]
fn killed_session_ignores_ticks_and_refuses_starts() {
    let h = harness();
    h.session.push_target(SyncTarget::new(1, SyncMode::Push));
    h.machine.start_sync().unwrap();
    let live = h.session.watchdog_timer().unwrap();

    h.session.kill();
    assert!(matches!(
        h.machine.timeout_callback(live),
        Err(SyncError::UnexpectedTimer(_))
    ));
    assert!(matches!(h.machine.start_sync(), Err(SyncError::Busy(_))));
}

#[test]
fn watchdog_retries_with_backoff_then_times_out() {
    let h = harness();
    h.session.push_target(SyncTarget::new(1, SyncMode::Push));
    h.machine.start_sync().unwrap();
    assert_eq!(h.comm.count(is_time_sync), 1);

    h.timer.advance(Duration::from_secs(5));
    assert_eq!(h.session.retry_time(), 1);
    assert_eq!(h.comm.count(is_time_sync), 2);
    assert!(!h.session.need_retry());
    let id = h.session.watchdog_timer().unwrap();
    assert_eq!(h.timer.remaining(id), Some(Duration::from_secs(5)));

    h.timer.advance(Duration::from_secs(5));
    assert_eq!(h.session.retry_time(), 2);
    let id = h.session.watchdog_timer().unwrap();
    assert_eq!(h.timer.remaining(id), Some(Duration::from_secs(10)));

    h.timer.advance(Duration::from_secs(10));
    assert_eq!(h.session.retry_time(), 3);
    assert_eq!(h.comm.count(is_time_sync), 4);

    h.timer.advance(Duration::from_secs(20));
    assert_eq!(h.machine.current_state(), SingleVerState::Idle);
    assert!(!h.session.is_watchdog_active());
    assert_eq!(h.session.outcomes()[0].result, Err(SyncError::Timeout));
    assert_eq!(h.comm.count(is_time_sync), 4);
}

#[test]
fn answer_resets_retry_counter() {
    let h = harness();
    h.session.push_target(SyncTarget::new(1, SyncMode::Push));
    h.machine.start_sync().unwrap();

    h.timer.advance(Duration::from_secs(5));
    assert_eq!(h.session.retry_time(), 1);
    h.machine
        .receive_message(&SyncMessage::TimeSyncAck { offset: 1 })
        .unwrap();
    assert_eq!(h.session.retry_time(), 0);
    let id = h.session.watchdog_timer().unwrap();
    assert_eq!(h.timer.remaining(id), Some(Duration::from_secs(5)));
}

#[test]
fn target_without_retry_times_out_on_first_expiry() {
    let h = harness();
    h.session
        .push_target(SyncTarget::new(1, SyncMode::Push).without_retry());
    h.machine.start_sync().unwrap();

    h.timer.advance(Duration::from_secs(5));
    assert_eq!(h.comm.count(is_time_sync), 1);
    assert_eq!(h.session.outcomes()[0].result, Err(SyncError::Timeout));
}

#[test]
fn no_retry_config_times_out_on_first_expiry() {
    let h = harness_with(
        3,
        config().with_retry(RetryConfig::no_retry()),
        SingleVerProtocol::new(),
    );
    h.session.push_target(SyncTarget::new(1, SyncMode::Push));
    h.machine.start_sync().unwrap();

    h.timer.advance(Duration::from_secs(5));
    assert_eq!(h.machine.current_state(), SingleVerState::Idle);
    assert_eq!(h.session.outcomes()[0].result, Err(SyncError::Timeout));
}

#[test]
fn send_failure_fails_the_target() {
    let h = harness();
    h.comm.set_connected(false);
    h.session.push_target(SyncTarget::new(1, SyncMode::Push));

    h.machine.start_sync().unwrap();
    assert_eq!(h.machine.current_state(), SingleVerState::Idle);
    assert_eq!(h.session.outcomes()[0].result, Err(SyncError::NetworkError));
    assert!(!h.session.is_watchdog_active());
}

#[test]
fn skippable_targets_finish_without_io() {
    let h = harness();
    h.session
        .push_target(SyncTarget::new(1, SyncMode::Push).skippable());
    h.session.push_target(SyncTarget::new(2, SyncMode::Push));

    h.machine.start_sync().unwrap();
    let outcomes = h.session.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].skipped);
    assert_eq!(h.session.current_target().map(|t| t.id), Some(2));
}

#[test]
fn only_skippable_targets_report_no_task() {
    let h = harness();
    h.session
        .push_target(SyncTarget::new(1, SyncMode::Push).skippable());

    assert_eq!(h.machine.start_sync(), Err(SyncError::NoSyncTask));
    assert!(h.session.is_finished());
    assert_eq!(h.comm.sent().len(), 0);
}

#[test]
fn exec_next_task_drains_queue() {
    let h = harness();
    h.session.push_target(SyncTarget::new(1, SyncMode::Push));

    h.machine.exec_next_task().unwrap();
    assert!(h.session.is_watchdog_active());
    assert_eq!(h.machine.exec_next_task(), Err(SyncError::NoSyncTask));
    assert!(h.session.is_finished());
}

#[test]
fn watchdog_arm_failure_surfaces() {
    let h = harness();
    h.session.push_target(SyncTarget::new(1, SyncMode::Push));
    h.timer.fail_next_arm();

    assert!(matches!(h.machine.start_sync(), Err(SyncError::Timer(_))));
    assert!(!h.session.is_watchdog_active());
    assert_eq!(h.machine.current_state(), SingleVerState::Idle);
}

#[test]
fn abort_resets_machine_and_records_outcome() {
    let h = harness();
    h.session.push_target(SyncTarget::new(1, SyncMode::Push));
    h.machine.start_sync().unwrap();

    h.machine.abort().unwrap();
    assert_eq!(h.machine.current_state(), SingleVerState::TimeSync);
    h.timer.run_pending();

    assert_eq!(h.machine.current_state(), SingleVerState::Idle);
    assert!(!h.session.is_watchdog_active());
    assert!(matches!(
        h.session.outcomes()[0].result,
        Err(SyncError::Busy(_))
    ));
}

#[test]
fn abort_keeps_machine_alive_until_it_runs() {
    let h = harness();
    let weak = Arc::downgrade(&h.machine);
    let Harness { timer, machine, .. } = h;

    machine.abort().unwrap();
    drop(machine);
    assert!(weak.upgrade().is_some());

    timer.run_pending();
    assert!(weak.upgrade().is_none());
}

#[test]
fn inbound_batch_is_saved_and_acknowledged() {
    let h = harness();
    let entry = DataEntry {
        key: b"k".to_vec(),
        value: b"v".to_vec(),
        timestamp: 9,
    };

    h.machine
        .receive_message(&SyncMessage::Data {
            sequence_id: 4,
            entries: vec![entry.clone()],
            watermark: 9,
        })
        .unwrap();

    assert_eq!(h.storage.received(), vec![(PEER.to_string(), entry)]);
    assert!(!h.machine.is_save_data_notify_active());
    assert_eq!(
        h.comm.count(|m| matches!(
            m,
            SyncMessage::DataAck {
                sequence_id: 4,
                watermark: 9
            }
        )),
        1
    );
}

#[test]
fn inbound_handshake_is_answered() {
    let h = harness();
    h.machine
        .receive_message(&SyncMessage::AbilitySync { version: 9 })
        .unwrap();
    assert_eq!(
        h.comm.sent(),
        vec![(PEER.to_string(), SyncMessage::AbilityAck { version: 3 })]
    );
}

#[test]
fn save_data_notify_spends_its_budget() {
    let h = harness_with(3, config().with_keepalive_budget(2), SingleVerProtocol::new());
    let is_notify = |m: &SyncMessage| matches!(m, SyncMessage::SaveDataNotify { .. });

    assert!(h.machine.start_save_data_notify(11, 2, 3));
    h.timer.advance(Duration::from_secs(2));
    assert_eq!(h.comm.count(is_notify), 1);
    assert_eq!(h.machine.save_data_notify_count(), 1);

    h.timer.advance(Duration::from_secs(4));
    assert_eq!(h.comm.count(is_notify), 2);
    assert!(!h.machine.is_save_data_notify_active());
    assert_eq!(h.timer.armed_count(), 0);
    assert_eq!(
        h.comm.sent()[0].1,
        SyncMessage::SaveDataNotify {
            session_id: 11,
            sequence_id: 2,
            msg_id: 3
        }
    );
}

#[test]
fn second_save_data_notify_resets_count() {
    let h = harness();
    assert!(h.machine.start_save_data_notify(1, 1, 1));
    h.timer.advance(Duration::from_secs(4));
    assert_eq!(h.machine.save_data_notify_count(), 2);

    assert!(!h.machine.start_save_data_notify(1, 2, 2));
    assert_eq!(h.machine.save_data_notify_count(), 0);
    assert_eq!(h.timer.armed_count(), 1);

    h.machine.stop_save_data_notify();
    assert!(!h.machine.is_save_data_notify_active());
    assert_eq!(h.timer.armed_count(), 0);
}

#[test]
fn keepalive_feeds_the_watchdog() {
    let h = harness();
    h.session.push_target(SyncTarget::new(1, SyncMode::Push));
    h.machine.start_sync().unwrap();
    assert!(h.machine.start_save_data_notify(11, 1, 1));

    h.timer.advance(Duration::from_secs(12));
    assert_eq!(h.session.retry_time(), 0);
    assert_eq!(h.comm.count(is_time_sync), 1);
    assert_eq!(h.machine.current_state(), SingleVerState::TimeSync);
}

#[test]
fn feed_dog_needs_as_many_stops_as_starts() {
    let h = harness();
    assert!(h
        .machine
        .start_feed_dog_for_sync(Duration::from_secs(30), Direction::Send));
    assert!(!h
        .machine
        .start_feed_dog_for_sync(Duration::from_secs(30), Direction::Send));
    assert_eq!(h.machine.feed_dog(Direction::Send).ref_count, 2);

    h.machine.stop_feed_dog_for_sync(Direction::Send);
    let dog = h.machine.feed_dog(Direction::Send);
    assert_eq!(dog.ref_count, 1);
    assert!(dog.timer.is_some());

    h.machine.stop_feed_dog_for_sync(Direction::Send);
    let dog = h.machine.feed_dog(Direction::Send);
    assert_eq!(dog.ref_count, 0);
    assert!(dog.timer.is_none());
    assert_eq!(h.timer.armed_count(), 0);
}

#[test]
fn feed_dog_directions_are_independent() {
    let h = harness();
    assert!(h
        .machine
        .start_feed_dog_for_sync(Duration::from_secs(10), Direction::Receive));
    h.machine.stop_feed_dog_for_sync(Direction::Send);

    assert_eq!(h.machine.feed_dog(Direction::Send), FeedDogController::default());
    assert_eq!(h.machine.feed_dog(Direction::Receive).ref_count, 1);
}

#[test]
fn feed_dog_restart_raises_limit() {
    let h = harness();
    h.machine
        .start_feed_dog_for_sync(Duration::from_secs(4), Direction::Send);
    h.timer.advance(Duration::from_secs(2));
    assert_eq!(h.machine.feed_dog(Direction::Send).elapsed, 1);

    h.machine
        .start_feed_dog_for_sync(Duration::from_secs(10), Direction::Send);
    let dog = h.machine.feed_dog(Direction::Send);
    assert_eq!(dog.upper_limit, 5);
    assert_eq!(dog.elapsed, 0);

    h.machine
        .start_feed_dog_for_sync(Duration::from_secs(2), Direction::Send);
    assert_eq!(h.machine.feed_dog(Direction::Send).upper_limit, 5);
}

#[test]
fn feed_dog_stops_itself_at_limit() {
    let h = harness();
    h.machine
        .start_feed_dog_for_sync(Duration::from_secs(4), Direction::Send);

    h.timer.advance(Duration::from_secs(4));
    assert_eq!(h.machine.feed_dog(Direction::Send).elapsed, 2);
    h.timer.advance(Duration::from_secs(2));

    assert_eq!(h.machine.feed_dog(Direction::Send), FeedDogController::default());
    assert_eq!(h.timer.armed_count(), 0);
}

#[test]
fn feed_dog_arm_failure_rolls_back_reference() {
    let h = harness();
    h.timer.fail_next_arm();
    assert!(!h
        .machine
        .start_feed_dog_for_sync(Duration::from_secs(4), Direction::Send));
    assert_eq!(h.machine.feed_dog(Direction::Send).ref_count, 0);

    h.machine.stop_feed_dog_for_sync(Direction::Send);
    assert_eq!(h.machine.feed_dog(Direction::Send).ref_count, 0);
}

#[test]
fn force_stop_ignores_references() {
    let h = harness();
    h.machine
        .start_feed_dog_for_sync(Duration::from_secs(30), Direction::Send);
    h.machine
        .start_feed_dog_for_sync(Duration::from_secs(30), Direction::Send);
    h.machine.force_stop_feed_dog(Direction::Send);
    assert_eq!(h.machine.feed_dog(Direction::Send), FeedDogController::default());
}

#[test]
fn feed_dog_keeps_transfer_alive() {
    let h = harness();
    h.session.push_target(SyncTarget::new(1, SyncMode::Push));
    h.machine.start_sync().unwrap();
    h.machine
        .start_feed_dog_for_sync(Duration::from_secs(30), Direction::Receive);

    h.timer.advance(Duration::from_secs(20));
    assert_eq!(h.session.retry_time(), 0);
    assert_eq!(h.comm.count(is_time_sync), 1);
}

#[test]
fn missing_state_row_flags_error_without_switching() {
    let table = StateSwitchTable::new(3).on(
        SingleVerState::Idle,
        SingleVerEvent::Start,
        SingleVerState::TimeSync,
    );
    let h = harness_with(3, config(), SingleVerProtocol::with_tables(vec![table]));

    h.machine.switch_state(SingleVerEvent::Start).unwrap();
    assert_eq!(h.machine.current_state(), SingleVerState::TimeSync);

    h.machine.switch_state(SingleVerEvent::TimeSynced).unwrap();
    assert!(h.machine.has_state_error());
    assert_eq!(h.machine.current_state(), SingleVerState::TimeSync);
}

#[test]
fn unsupported_version_has_no_table() {
    let h = harness_with(1, config(), SingleVerProtocol::new());
    assert!(matches!(
        h.machine.switch_state(SingleVerEvent::Start),
        Err(SyncError::NotFound(_))
    ));
    assert_eq!(h.machine.current_state(), SingleVerState::Idle);
}

#[test]
fn unknown_event_leaves_state_untouched() {
    let h = harness();
    assert!(matches!(
        h.machine.switch_state(SingleVerEvent::Acked),
        Err(SyncError::NotFound(_))
    ));
    assert_eq!(h.machine.current_state(), SingleVerState::Idle);
    assert!(!h.machine.has_state_error());
}

#[test]
fn initialize_requires_collaborators() {
    let timer = Arc::new(ManualTimer::new());
    let missing_storage = SyncStateMachine::builder(SingleVerProtocol::new())
        .session(Arc::new(SyncSession::new(PEER, 1, 3)))
        .metadata(Arc::new(MemoryMetadataStore::new()))
        .communicator(Arc::new(MockCommunicator::new()))
        .timer(timer)
        .initialize();
    assert!(matches!(missing_storage, Err(SyncError::InvalidArgument(_))));

    let missing_timer = SyncStateMachine::builder(SingleVerProtocol::new())
        .session(Arc::new(SyncSession::new(PEER, 1, 3)))
        .storage(Arc::new(MemorySyncStorage::new("kv")))
        .metadata(Arc::new(MemoryMetadataStore::new()))
        .communicator(Arc::new(MockCommunicator::new()))
        .initialize();
    assert!(matches!(missing_timer, Err(SyncError::NotInitialized(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tokio_timers_drive_timeout() {
    init_tracing();
    let timer = Arc::new(TokioTimerService::current().unwrap());
    let session = Arc::new(SyncSession::new(PEER, 1, 3));
    let machine = SyncStateMachine::builder(SingleVerProtocol::new())
        .session(Arc::clone(&session))
        .storage(Arc::new(MemorySyncStorage::new("kv")))
        .metadata(Arc::new(MemoryMetadataStore::new()))
        .communicator(Arc::new(MockCommunicator::new()))
        .timer(timer.clone())
        .config(
            MachineConfig::new(3)
                .with_watchdog_timeout(Duration::from_millis(30))
                .with_retry(RetryConfig::no_retry()),
        )
        .initialize()
        .unwrap();

    session.push_target(SyncTarget::new(1, SyncMode::Push));
    machine.start_sync().unwrap();

    for _ in 0..100 {
        if session.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.outcomes()[0].result, Err(SyncError::Timeout));
    assert_eq!(machine.current_state(), SingleVerState::Idle);
}

fn event_strategy() -> impl Strategy<Value = SingleVerEvent> {
    prop::sample::select(vec![
        SingleVerEvent::Start,
        SingleVerEvent::TimeSynced,
        SingleVerEvent::AbilityAgreed,
        SingleVerEvent::BatchSent,
        SingleVerEvent::AllSent,
        SingleVerEvent::Acked,
        SingleVerEvent::NextTask,
        SingleVerEvent::AllDone,
        SingleVerEvent::Failed,
        SingleVerEvent::Timeout,
    ])
}

proptest! {
    #[test]
    fn switching_follows_the_selected_table(
        version in 2u32..6,
        events in prop::collection::vec(event_strategy(), 0..40),
    ) {
        let h = harness_with(version, config(), SingleVerProtocol::new());
        let table = if version >= 3 { ability_table() } else { legacy_table() };
        let mut model = SingleVerState::Idle;

        for event in events {
            let result = h.machine.switch_state(event);
            match table.lookup(model, event) {
                Transition::Next(next) => {
                    prop_assert!(result.is_ok());
                    model = next;
                }
                Transition::UnknownEvent => {
                    prop_assert!(matches!(result, Err(SyncError::NotFound(_))));
                }
                Transition::UnknownState => prop_assert!(false, "every state has a row"),
            }
            prop_assert_eq!(h.machine.current_state(), model);
        }
        prop_assert!(!h.machine.has_state_error());
    }
}
