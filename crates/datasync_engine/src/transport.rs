//! Message transport and storage collaborators of the state machine.

use datasync_runtime::{SyncError, SyncResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One changed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    /// Record key.
    pub key: Vec<u8>,
    /// Record value; empty for deletions.
    pub value: Vec<u8>,
    /// Local write timestamp.
    pub timestamp: u64,
}

/// A batch of outgoing records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataBatch {
    /// Records newer than the requested watermark.
    pub entries: Vec<DataEntry>,
    /// Timestamp of the newest record in the batch.
    pub watermark: u64,
    /// True if nothing newer is left after this batch.
    pub is_last: bool,
}

/// Messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Time synchronization request.
    TimeSync {
        /// Sender clock.
        local_time: u64,
    },
    /// Time synchronization response.
    TimeSyncAck {
        /// Offset of the responder clock to the requester clock.
        offset: i64,
    },
    /// Ability negotiation request.
    AbilitySync {
        /// Highest protocol version of the sender.
        version: u32,
    },
    /// Ability negotiation response.
    AbilityAck {
        /// Version agreed on.
        version: u32,
    },
    /// A batch of records.
    Data {
        /// Sequence number of the batch.
        sequence_id: u32,
        /// Records.
        entries: Vec<DataEntry>,
        /// Watermark after applying the batch.
        watermark: u64,
    },
    /// Acknowledgement of a data batch.
    DataAck {
        /// Sequence number acknowledged.
        sequence_id: u32,
        /// Watermark persisted by the receiver.
        watermark: u64,
    },
    /// Keepalive sent while the receiver is still saving data.
    SaveDataNotify {
        /// Session of the data packet being saved.
        session_id: u32,
        /// Sequence of the data packet being saved.
        sequence_id: u32,
        /// Message id of the data packet being saved.
        msg_id: u32,
    },
}

/// Sends messages to peer devices.
pub trait Communicator: Send + Sync {
    /// Sends `message` to `device`.
    fn send_message(&self, device: &str, message: SyncMessage) -> SyncResult<()>;
}

/// The local dataset being synchronized.
pub trait SyncStorage: Send + Sync {
    /// Returns a stable identifier of the dataset.
    fn identifier(&self) -> String;

    /// Returns up to `limit` records newer than `since`, oldest first.
    fn collect_outgoing(&self, since: u64, limit: usize) -> SyncResult<DataBatch>;

    /// Saves records received from `device`.
    fn apply_incoming(&self, device: &str, entries: &[DataEntry]) -> SyncResult<()>;
}

/// A mock communicator for testing.
#[derive(Debug)]
pub struct MockCommunicator {
    connected: AtomicBool,
    sent: Mutex<Vec<(String, SyncMessage)>>,
}

impl MockCommunicator {
    /// Creates a connected communicator.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns every message sent so far.
    pub fn sent(&self) -> Vec<(String, SyncMessage)> {
        self.sent.lock().clone()
    }

    /// Removes and returns every message sent so far.
    pub fn take_sent(&self) -> Vec<(String, SyncMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Counts sent messages matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&SyncMessage) -> bool) -> usize {
        self.sent.lock().iter().filter(|(_, m)| predicate(m)).count()
    }
}

impl Default for MockCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for MockCommunicator {
    fn send_message(&self, device: &str, message: SyncMessage) -> SyncResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::NetworkError);
        }
        self.sent.lock().push((device.to_string(), message));
        Ok(())
    }
}

/// In-memory [`SyncStorage`] for tests.
#[derive(Debug, Default)]
pub struct MemorySyncStorage {
    name: String,
    clock: AtomicU64,
    local: Mutex<Vec<DataEntry>>,
    received: Mutex<Vec<(String, DataEntry)>>,
}

impl MemorySyncStorage {
    /// Creates an empty dataset called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Writes a local record and returns its timestamp.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> u64 {
        let timestamp = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.local.lock().push(DataEntry {
            key: key.into(),
            value: value.into(),
            timestamp,
        });
        timestamp
    }

    /// Returns the records received from peers.
    pub fn received(&self) -> Vec<(String, DataEntry)> {
        self.received.lock().clone()
    }
}

impl SyncStorage for MemorySyncStorage {
    fn identifier(&self) -> String {
        self.name.clone()
    }

    fn collect_outgoing(&self, since: u64, limit: usize) -> SyncResult<DataBatch> {
        let local = self.local.lock();
        let newer: Vec<&DataEntry> = local.iter().filter(|e| e.timestamp > since).collect();
        let entries: Vec<DataEntry> = newer.iter().take(limit).map(|e| (*e).clone()).collect();
        let watermark = entries.last().map_or(since, |e| e.timestamp);
        Ok(DataBatch {
            is_last: newer.len() <= limit,
            entries,
            watermark,
        })
    }

    fn apply_incoming(&self, device: &str, entries: &[DataEntry]) -> SyncResult<()> {
        let mut received = self.received.lock();
        received.extend(entries.iter().map(|e| (device.to_string(), e.clone())));
        Ok(())
    }
}
