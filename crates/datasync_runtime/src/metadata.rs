//! Persisted metadata records.
//!
//! A [`MetadataStore`] keeps small keyed records in two namespaces: the
//! *synced* namespace, which is replicated to peers and observable through
//! [`MetadataStore::subscribe`], and the *local* namespace, which never leaves
//! the device. Typed access goes through [`MetadataStoreExt`], which encodes
//! records as CBOR.

use crate::error::{SyncError, SyncResult};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Kind of change reported to a metadata observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFlag {
    /// A new key was written.
    Insert,
    /// An existing key got a different value.
    Update,
    /// A key was removed.
    Delete,
}

/// Observer called with the key, the new value (old value on delete) and
/// the change kind.
pub type MetaObserver = Arc<dyn Fn(&str, &[u8], ChangeFlag) + Send + Sync>;

/// Hook called with the key of every synced change.
pub type MetaSyncer = Arc<dyn Fn(&str) + Send + Sync>;

/// Key/value store for metadata records.
pub trait MetadataStore: Send + Sync {
    /// Loads the raw value of `key`.
    fn load(&self, key: &str, local: bool) -> Option<Vec<u8>>;

    /// Loads every record whose key starts with `prefix`, in key order.
    fn load_prefix(&self, prefix: &str, local: bool) -> Vec<(String, Vec<u8>)>;

    /// Stores `value` under `key`. Returns false if the write failed.
    fn save(&self, key: &str, value: Vec<u8>, local: bool) -> bool;

    /// Removes `key`. Returns false if the key did not exist.
    fn delete(&self, key: &str, local: bool) -> bool;

    /// Observes synced changes under `prefix`.
    ///
    /// Returns false if `prefix` already has an observer.
    fn subscribe(&self, prefix: &str, observer: MetaObserver) -> bool;

    /// Drops the observer of `prefix`.
    fn unsubscribe(&self, prefix: &str) -> bool;
}

/// Encodes a record as CBOR.
pub fn encode_record<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| SyncError::Codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR record.
pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| SyncError::Codec(e.to_string()))
}

/// Typed access to a [`MetadataStore`].
pub trait MetadataStoreExt: MetadataStore {
    /// Loads and decodes `key`.
    fn load_meta<T: DeserializeOwned>(&self, key: &str, local: bool) -> SyncResult<Option<T>> {
        self.load(key, local)
            .map(|bytes| decode_record(&bytes))
            .transpose()
    }

    /// Encodes and stores `value` under `key`.
    fn save_meta<T: Serialize>(&self, key: &str, value: &T, local: bool) -> SyncResult<()> {
        let bytes = encode_record(value)?;
        if self.save(key, bytes, local) {
            Ok(())
        } else {
            Err(SyncError::store_retryable(format!("failed to save {key}")))
        }
    }

    /// Loads and decodes every record under `prefix`.
    fn load_metas<T: DeserializeOwned>(&self, prefix: &str, local: bool) -> SyncResult<Vec<T>> {
        self.load_prefix(prefix, local)
            .iter()
            .map(|(_, bytes)| decode_record(bytes))
            .collect()
    }
}

impl<M: MetadataStore + ?Sized> MetadataStoreExt for M {}

#[derive(Default)]
struct Namespaces {
    synced: BTreeMap<String, Vec<u8>>,
    local: BTreeMap<String, Vec<u8>>,
}

impl Namespaces {
    fn space(&mut self, local: bool) -> &mut BTreeMap<String, Vec<u8>> {
        if local {
            &mut self.local
        } else {
            &mut self.synced
        }
    }
}

/// In-memory [`MetadataStore`].
///
/// Observers and the syncer hook are called after the store lock is
/// released, so they may read or write the store.
#[derive(Default)]
pub struct MemoryMetadataStore {
    data: Mutex<Namespaces>,
    observers: RwLock<BTreeMap<String, MetaObserver>>,
    syncer: RwLock<Option<MetaSyncer>>,
    fail_writes: Mutex<bool>,
}

impl MemoryMetadataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a hook fired for every synced change.
    pub fn set_syncer(&self, syncer: MetaSyncer) {
        *self.syncer.write() = Some(syncer);
    }

    /// Makes subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    /// Returns the number of records in a namespace.
    pub fn len(&self, local: bool) -> usize {
        let data = self.data.lock();
        if local {
            data.local.len()
        } else {
            data.synced.len()
        }
    }

    /// Returns true if both namespaces are empty.
    pub fn is_empty(&self) -> bool {
        let data = self.data.lock();
        data.local.is_empty() && data.synced.is_empty()
    }

    fn notify(&self, key: &str, value: &[u8], flag: ChangeFlag) {
        let observers: Vec<MetaObserver> = self
            .observers
            .read()
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(key, value, flag);
        }
        let syncer = self.syncer.read().clone();
        if let Some(syncer) = syncer {
            syncer(key);
        }
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn load(&self, key: &str, local: bool) -> Option<Vec<u8>> {
        self.data.lock().space(local).get(key).cloned()
    }

    fn load_prefix(&self, prefix: &str, local: bool) -> Vec<(String, Vec<u8>)> {
        self.data
            .lock()
            .space(local)
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn save(&self, key: &str, value: Vec<u8>, local: bool) -> bool {
        if *self.fail_writes.lock() {
            return false;
        }
        let flag = {
            let mut data = self.data.lock();
            match data.space(local).insert(key.to_string(), value.clone()) {
                Some(old) if old == value => None,
                Some(_) => Some(ChangeFlag::Update),
                None => Some(ChangeFlag::Insert),
            }
        };
        if let (Some(flag), false) = (flag, local) {
            self.notify(key, &value, flag);
        }
        true
    }

    fn delete(&self, key: &str, local: bool) -> bool {
        if *self.fail_writes.lock() {
            return false;
        }
        let old = self.data.lock().space(local).remove(key);
        match old {
            Some(old) => {
                if !local {
                    self.notify(key, &old, ChangeFlag::Delete);
                }
                true
            }
            None => false,
        }
    }

    fn subscribe(&self, prefix: &str, observer: MetaObserver) -> bool {
        let mut observers = self.observers.write();
        if observers.contains_key(prefix) {
            return false;
        }
        observers.insert(prefix.to_string(), observer);
        true
    }

    fn unsubscribe(&self, prefix: &str) -> bool {
        self.observers.write().remove(prefix).is_some()
    }
}
