//! Online/offline and broadcast scenarios of the device matrix.

use datasync_matrix::{
    DeviceMatrix, MatrixEvent, MatrixRecord, MatrixTopic, Origin, StoreRegistry, META_BUNDLE,
    META_STORE_MASK,
};
use datasync_runtime::{
    EventBus, EventCenter, ManualTimer, MemoryMetadataStore, MetaObserver, MetaSyncer,
    MetadataStore, MetadataStoreExt, StoreMetaData, SyncError,
};
use datasync_testkit::{device_id_strategy, init_tracing};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::Duration;

const PEER: &str = "14a0a92a428005db";
const LOCAL: &str = "local-device";
const TOKEN: u32 = 7;

struct Harness {
    timer: Arc<ManualTimer>,
    metadata: Arc<MemoryMetadataStore>,
    events: Arc<EventCenter<MatrixEvent>>,
    matrix: Arc<DeviceMatrix>,
    finished: Arc<Mutex<Vec<(String, u16)>>>,
    onlines: Arc<Mutex<Vec<(String, u16)>>>,
}

fn labels() -> Vec<String> {
    vec![
        "distributed_device_profile_service".into(),
        "bundle_manager_service".into(),
        "dtbhardware_manager_service".into(),
    ]
}

fn remote_record(version: u32, mask: u16, mask_info: Vec<String>) -> MatrixRecord {
    MatrixRecord {
        version,
        mask,
        mask_info,
        device_id: PEER.into(),
        origin: Origin::Remote,
    }
}

/// Builds a matrix whose online handler "syncs" every flagged store at once.
fn harness_with(records: &[MatrixRecord]) -> Harness {
    init_tracing();
    let timer = Arc::new(ManualTimer::new());
    let metadata = Arc::new(MemoryMetadataStore::new());
    for record in records {
        metadata.save_meta(&record.key(), record, false).unwrap();
    }
    let events = Arc::new(EventCenter::<MatrixEvent>::new(timer.clone()));
    let registry = StoreRegistry::new(TOKEN, "service_meta")
        .with_labels(labels())
        .unwrap();
    let matrix = DeviceMatrix::new(registry, LOCAL, metadata.clone(), events.clone()).unwrap();

    let onlines = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&onlines);
    let weak: Weak<DeviceMatrix> = Arc::downgrade(&matrix);
    events.subscribe(
        MatrixTopic::Online,
        Arc::new(move |event: &MatrixEvent| {
            seen.lock().push((event.device().to_string(), event.mask()));
            let Some(matrix) = weak.upgrade() else { return };
            for code in matrix.store_codes(event.mask()) {
                matrix.on_exchanged(event.device(), code).unwrap();
            }
        }),
    );

    let finished = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&finished);
    events.subscribe(
        MatrixTopic::Finished,
        Arc::new(move |event: &MatrixEvent| {
            sink.lock().push((event.device().to_string(), event.mask()));
        }),
    );

    Harness {
        timer,
        metadata,
        events,
        matrix,
        finished,
        onlines,
    }
}

fn harness() -> Harness {
    harness_with(&[remote_record(1, 0xF, labels())])
}

fn last_finished(h: &Harness) -> Option<(String, u16)> {
    h.finished.lock().last().cloned()
}

#[test]
fn first_online_finishes_with_persisted_mask() {
    let h = harness();
    assert_eq!(h.matrix.online(PEER).unwrap(), 0xF);
    assert!(h.finished.lock().is_empty());

    h.timer.run_pending();
    assert_eq!(last_finished(&h), Some((PEER.to_string(), 0xF)));
    let entry = h.matrix.entry(PEER).unwrap();
    assert_eq!(entry.mask, 0);
    assert_eq!(entry.exchanged_mask, 0xF);
    assert_eq!(entry.remote_version, Some(1));
}

#[test]
fn online_again_without_changes_has_nothing_to_do() {
    let h = harness();
    h.matrix.online(PEER).unwrap();
    h.timer.run_pending();

    h.matrix.offline(PEER);
    assert_eq!(h.matrix.entry(PEER).unwrap().exchanged_mask, 0);
    assert_eq!(h.matrix.online(PEER).unwrap(), 0);
    h.timer.run_pending();

    assert_eq!(last_finished(&h), Some((PEER.to_string(), 0)));
    assert_eq!(h.onlines.lock().len(), 1);
}

#[test]
fn online_again_with_local_change_flags_that_store() {
    let h = harness();
    h.matrix.online(PEER).unwrap();
    h.timer.run_pending();
    h.matrix.offline(PEER);

    let dp = StoreMetaData::new(100, "distributed_device_profile_service", "profile");
    let code = h.matrix.get_code(&dp);
    assert_eq!(code, 0x2);
    h.matrix.on_changed(code).unwrap();

    assert_eq!(h.matrix.online(PEER).unwrap(), 0x2);
    h.timer.run_pending();
    assert_eq!(last_finished(&h), Some((PEER.to_string(), 0x2)));
}

#[test]
fn new_peer_starts_from_local_pending_mask() {
    let h = harness_with(&[]);
    h.matrix.on_changed(0x4).unwrap();
    assert_eq!(h.matrix.online("fresh-peer").unwrap(), 0x4);
}

#[test]
fn newer_peer_record_flags_more_stores_while_online() {
    let h = harness_with(&[remote_record(1, 0x3, labels())]);
    assert_eq!(h.matrix.online(PEER).unwrap(), 0x3);
    h.timer.run_pending();
    assert_eq!(h.finished.lock().len(), 1);

    let update = remote_record(2, 0x4, labels());
    h.metadata.save_meta(&update.key(), &update, false).unwrap();
    assert_eq!(h.matrix.entry(PEER).unwrap().remote_version, Some(2));
    h.timer.run_pending();

    assert_eq!(h.onlines.lock().last(), Some(&(PEER.to_string(), 0x4)));
    assert_eq!(last_finished(&h), Some((PEER.to_string(), 0x7)));
    assert_eq!(h.matrix.entry(PEER).unwrap().mask, 0);
}

#[test]
fn peer_record_while_offline_waits_for_next_online() {
    let h = harness();
    h.matrix.online(PEER).unwrap();
    h.timer.run_pending();
    h.matrix.offline(PEER);

    let update = remote_record(2, 0x8, labels());
    h.metadata.save_meta(&update.key(), &update, false).unwrap();
    h.timer.run_pending();
    assert_eq!(h.onlines.lock().len(), 1);
    assert_eq!(h.matrix.entry(PEER).unwrap().mask, 0x8);

    assert_eq!(h.matrix.online(PEER).unwrap(), 0x8);
    h.timer.run_pending();
    assert_eq!(last_finished(&h), Some((PEER.to_string(), 0x8)));
}

#[test]
fn stale_peer_record_is_ignored() {
    let h = harness();
    h.matrix.online(PEER).unwrap();
    h.timer.run_pending();

    let stale = remote_record(1, 0x8, labels());
    h.metadata.save_meta(&stale.key(), &stale, false).unwrap();
    assert_eq!(h.matrix.entry(PEER).unwrap().mask, 0);
}

#[test]
fn meta_store_code() {
    let h = harness_with(&[]);
    let meta = StoreMetaData::new(0, META_BUNDLE, "service_meta").with_token(TOKEN);
    assert_eq!(h.matrix.get_code(&meta), META_STORE_MASK);
    let other = StoreMetaData::new(0, "matrix_test", "matrix_store").with_token(TOKEN);
    assert_eq!(h.matrix.get_code(&other), 0);
}

#[test]
fn broadcast_of_meta_and_label_accumulates() {
    let h = harness_with(&[]);
    assert_eq!(h.matrix.on_broadcast(PEER, META_STORE_MASK), META_STORE_MASK);

    let dp = StoreMetaData::new(0, "distributed_device_profile_service", "profile");
    let code = h.matrix.get_code(&dp);
    assert_eq!(h.matrix.on_broadcast(PEER, code), 0x3);

    h.matrix.on_exchanged(PEER, META_STORE_MASK).unwrap();
    h.matrix.on_exchanged(PEER, 0x2).unwrap();
    let other = StoreMetaData::new(0, "matrix_test", "matrix_store");
    assert_eq!(h.matrix.on_broadcast(PEER, h.matrix.get_code(&other)), 0);

    // Exchanged bits stay quiet until the peer goes offline.
    assert_eq!(h.matrix.on_broadcast(PEER, 0xFFFF), 0xC);
}

#[test]
fn broadcast_is_translated_through_peer_labels() {
    let h = harness_with(&[remote_record(
        3,
        0x1F,
        vec!["matrix_test".into(), "distributed_device_profile_service".into()],
    )]);

    assert_eq!(h.matrix.on_broadcast(PEER, 0x2), 0);
    assert_eq!(h.matrix.on_broadcast(PEER, META_STORE_MASK), META_STORE_MASK);
    assert_eq!(h.matrix.on_broadcast(PEER, 0x4), 0x3);
    h.matrix.on_exchanged(PEER, META_STORE_MASK).unwrap();
    h.matrix.on_exchanged(PEER, 0x2).unwrap();
    assert_eq!(h.matrix.on_broadcast(PEER, 0xFFFF), 0);

    h.matrix.offline(PEER);
    assert_eq!(h.matrix.on_broadcast(PEER, 0xFFFF), 0x3);
}

#[test]
fn local_change_is_persisted_and_broadcast() {
    let h = harness_with(&[]);
    let broadcasts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&broadcasts);
    h.events.subscribe(
        MatrixTopic::Broadcast,
        Arc::new(move |event: &MatrixEvent| sink.lock().push(event.clone())),
    );

    h.matrix.on_changed(0x2).unwrap();
    h.matrix.on_changed(0x2).unwrap();
    h.timer.run_pending();

    assert_eq!(
        *broadcasts.lock(),
        vec![MatrixEvent::Broadcast {
            device: LOCAL.into(),
            mask: 0x2
        }]
    );
    let record: MatrixRecord = h
        .metadata
        .load_meta(&MatrixRecord::key_of(LOCAL), false)
        .unwrap()
        .unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.mask_info, labels());
}

#[test]
fn metadata_writes_dirty_the_meta_store_through_the_syncer() {
    let h = harness_with(&[]);
    let weak = Arc::downgrade(&h.matrix);
    let syncer: MetaSyncer = Arc::new(move |_key: &str| {
        if let Some(matrix) = weak.upgrade() {
            matrix.on_changed(META_STORE_MASK).unwrap();
        }
    });
    h.metadata.set_syncer(syncer);

    let meta = StoreMetaData::new(100, "bundle", "store").with_device(LOCAL);
    h.metadata.save_meta(&meta.key(), &meta, false).unwrap();
    assert_eq!(h.matrix.local_mask(), META_STORE_MASK);

    h.matrix.on_changed(0x2).unwrap();
    assert_eq!(h.matrix.local_mask(), 0x3);
}

#[test]
fn failed_save_is_rolled_back_and_retried() {
    let h = harness_with(&[]);
    let broadcasts = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&broadcasts);
    h.events.subscribe(
        MatrixTopic::Broadcast,
        Arc::new(move |_: &MatrixEvent| *sink.lock() += 1),
    );

    h.metadata.set_fail_writes(true);
    assert!(matches!(h.matrix.on_changed(0x2), Err(SyncError::Store { .. })));
    assert_eq!(h.matrix.local_mask(), 0);

    h.metadata.set_fail_writes(false);
    h.matrix.on_changed(0x2).unwrap();
    h.timer.run_pending();
    assert_eq!(h.matrix.local_mask(), 0x2);
    assert_eq!(*broadcasts.lock(), 1);
    let record: MatrixRecord = h
        .metadata
        .load_meta(&MatrixRecord::key_of(LOCAL), false)
        .unwrap()
        .unwrap();
    assert_eq!((record.version, record.mask), (1, 0x2));
}

/// Blocks the first save of the local record until released.
struct HeldStore {
    inner: Arc<MemoryMetadataStore>,
    hold: Mutex<Option<mpsc::Receiver<()>>>,
}

impl MetadataStore for HeldStore {
    fn load(&self, key: &str, local: bool) -> Option<Vec<u8>> {
        self.inner.load(key, local)
    }

    fn load_prefix(&self, prefix: &str, local: bool) -> Vec<(String, Vec<u8>)> {
        self.inner.load_prefix(prefix, local)
    }

    fn save(&self, key: &str, value: Vec<u8>, local: bool) -> bool {
        if key == MatrixRecord::key_of(LOCAL) {
            let hold = self.hold.lock().take();
            if let Some(release) = hold {
                let _ = release.recv();
            }
        }
        self.inner.save(key, value, local)
    }

    fn delete(&self, key: &str, local: bool) -> bool {
        self.inner.delete(key, local)
    }

    fn subscribe(&self, prefix: &str, observer: MetaObserver) -> bool {
        self.inner.subscribe(prefix, observer)
    }

    fn unsubscribe(&self, prefix: &str) -> bool {
        self.inner.unsubscribe(prefix)
    }
}

fn matrix_on(metadata: Arc<dyn MetadataStore>) -> Arc<DeviceMatrix> {
    let timer = Arc::new(ManualTimer::new());
    let events = Arc::new(EventCenter::<MatrixEvent>::new(timer));
    let registry = StoreRegistry::new(TOKEN, "service_meta")
        .with_labels(labels())
        .unwrap();
    DeviceMatrix::new(registry, LOCAL, metadata, events).unwrap()
}

#[test]
fn concurrent_changes_persist_the_newest_record() {
    init_tracing();
    let inner = Arc::new(MemoryMetadataStore::new());
    let (release, hold) = mpsc::channel();
    let store = Arc::new(HeldStore {
        inner: inner.clone(),
        hold: Mutex::new(Some(hold)),
    });
    let matrix = matrix_on(store);

    let first = {
        let matrix = Arc::clone(&matrix);
        thread::spawn(move || matrix.on_changed(0x2))
    };
    thread::sleep(Duration::from_millis(50));
    let second = {
        let matrix = Arc::clone(&matrix);
        thread::spawn(move || matrix.on_changed(0x4))
    };
    thread::sleep(Duration::from_millis(50));
    release.send(()).unwrap();
    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();

    assert_eq!(matrix.local_mask(), 0x6);
    let record: MatrixRecord = inner
        .load_meta(&MatrixRecord::key_of(LOCAL), false)
        .unwrap()
        .unwrap();
    assert_eq!((record.version, record.mask), (2, 0x6));

    drop(matrix);
    assert_eq!(matrix_on(inner).local_mask(), 0x6);
}

#[test]
fn local_record_survives_restart() {
    let h = harness_with(&[]);
    h.matrix.on_changed(0x6).unwrap();
    let Harness {
        metadata, matrix, ..
    } = h;
    drop(matrix);

    let timer = Arc::new(ManualTimer::new());
    let events = Arc::new(EventCenter::<MatrixEvent>::new(timer));
    let registry = StoreRegistry::new(TOKEN, "service_meta")
        .with_labels(labels())
        .unwrap();
    let restarted = DeviceMatrix::new(registry, LOCAL, metadata, events).unwrap();
    assert_eq!(restarted.local_mask(), 0x6);
}

#[test]
fn clear_forgets_everything() {
    let h = harness();
    h.matrix.on_changed(0x2).unwrap();
    h.matrix.online(PEER).unwrap();
    h.matrix.clear();
    assert_eq!(h.matrix.local_mask(), 0);
    assert!(h.matrix.entry(PEER).is_none());
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Broadcast(u16),
    Exchange(u16),
}

fn single_bits(mask: u16) -> Vec<u16> {
    (0..4).map(|b| 1u16 << b).filter(|bit| mask & bit != 0).collect()
}

fn apply(matrix: &DeviceMatrix, device: &str, ops: &[Op]) -> u16 {
    matrix.on_broadcast(device, 0);
    for op in ops {
        match *op {
            Op::Broadcast(bit) => {
                matrix.on_broadcast(device, bit);
            }
            Op::Exchange(bit) => matrix.on_exchanged(device, bit).unwrap(),
        }
    }
    matrix.entry(device).map_or(0, |e| e.mask)
}

proptest! {
    #[test]
    fn independent_bits_commute(
        device in device_id_strategy(),
        broadcast in 0u16..16,
        exchange in 0u16..16,
        seed in any::<u64>(),
    ) {
        let exchange = exchange & !broadcast;
        let mut ops: Vec<Op> = single_bits(broadcast).into_iter().map(Op::Broadcast).collect();
        ops.extend(single_bits(exchange).into_iter().map(Op::Exchange));

        let in_order = harness_with(&[]);
        let expected = apply(&in_order.matrix, &device, &ops);

        let mut shuffled = ops.clone();
        let len = shuffled.len().max(1);
        shuffled.rotate_left((seed as usize) % len);
        shuffled.reverse();
        let reordered = harness_with(&[]);
        prop_assert_eq!(apply(&reordered.matrix, &device, &shuffled), expected);
        prop_assert_eq!(expected, broadcast);

        let mut doubled = ops.clone();
        doubled.extend(ops.iter().copied());
        let twice = harness_with(&[]);
        prop_assert_eq!(apply(&twice.matrix, &device, &doubled), expected);
    }
}
