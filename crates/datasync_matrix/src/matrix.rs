//! Per-peer change matrix.

use crate::event::MatrixEvent;
use crate::record::{MatrixRecord, Origin};
use crate::registry::StoreRegistry;
use datasync_runtime::{
    decode_record, ChangeFlag, EventBus, MetaObserver, MetadataStore, MetadataStoreExt,
    StoreMetaData, SyncError, SyncResult,
};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Snapshot of what the matrix knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMatrixEntry {
    /// Peer device.
    pub device_id: String,
    /// Stores that still need reconciliation with the peer.
    pub mask: u16,
    /// Stores reconciled during the current online period.
    pub exchanged_mask: u16,
    /// Whether the peer is online.
    pub online: bool,
    /// Version of the last peer record merged in.
    pub remote_version: Option<u32>,
    /// Label layout of the peer, if its record was seen.
    pub mask_info: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
struct PeerEntry {
    mask: u16,
    exchanged: u16,
    flagged: u16,
    waiting: u16,
    online: bool,
    remote_version: Option<u32>,
    mask_info: Option<Vec<String>>,
}

impl PeerEntry {
    fn starting_from(mask: u16) -> Self {
        Self {
            mask,
            ..Self::default()
        }
    }

    fn translate(&self, registry: &StoreRegistry, mask: u16) -> u16 {
        let translated = match &self.mask_info {
            Some(labels) => registry.translate(mask, labels),
            None => mask,
        };
        translated & registry.known_mask()
    }

    /// Merges a newer peer record and returns the bits it added.
    fn absorb(&mut self, registry: &StoreRegistry, record: MatrixRecord) -> u16 {
        if self.remote_version.is_some_and(|v| record.version <= v) {
            return 0;
        }
        self.remote_version = Some(record.version);
        self.mask_info = Some(record.mask_info);
        let added = self.translate(registry, record.mask) & !self.exchanged & !self.mask;
        self.mask |= added;
        added
    }
}

#[derive(Debug, Default)]
struct MatrixState {
    local_mask: u16,
    version: u32,
    peers: HashMap<String, PeerEntry>,
}

/// Tracks, per peer, which stores changed since they were last reconciled.
///
/// Bits are set by local changes, peer broadcasts and peer records, and
/// cleared only by [`DeviceMatrix::on_exchanged`] and [`DeviceMatrix::clear`],
/// so the order of calls across devices never changes the final masks.
pub struct DeviceMatrix {
    registry: StoreRegistry,
    local_device: String,
    metadata: Arc<dyn MetadataStore>,
    events: Arc<dyn EventBus<MatrixEvent>>,
    observing: bool,
    state: Mutex<MatrixState>,
    persist: ReentrantMutex<()>,
}

impl DeviceMatrix {
    /// Creates the matrix and starts observing peer records.
    ///
    /// The local record, if any, restores the pending mask and version.
    /// Fails with [`SyncError::Busy`] if matrix records are already observed
    /// on `metadata`.
    pub fn new(
        registry: StoreRegistry,
        local_device: impl Into<String>,
        metadata: Arc<dyn MetadataStore>,
        events: Arc<dyn EventBus<MatrixEvent>>,
    ) -> SyncResult<Arc<Self>> {
        let local_device = local_device.into();
        let mut state = MatrixState::default();
        if let Some(record) =
            metadata.load_meta::<MatrixRecord>(&MatrixRecord::key_of(&local_device), false)?
        {
            state.local_mask = record.mask & registry.known_mask();
            state.version = record.version;
        }

        let matrix = Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let observer: MetaObserver =
                Arc::new(move |key: &str, value: &[u8], flag: ChangeFlag| {
                    if let Some(matrix) = weak.upgrade() {
                        matrix.on_record_changed(key, value, flag);
                    }
                });
            let observing = metadata.subscribe(MatrixRecord::PREFIX, observer);
            Self {
                registry,
                local_device,
                metadata,
                events,
                observing,
                state: Mutex::new(state),
                persist: ReentrantMutex::new(()),
            }
        });
        if !matrix.observing {
            return Err(SyncError::Busy("matrix records already observed".into()));
        }
        Ok(matrix)
    }

    /// Returns the registry.
    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    /// Returns the local device id.
    pub fn local_device(&self) -> &str {
        &self.local_device
    }

    /// Returns the code of `meta`, or 0 for an untracked store.
    pub fn get_code(&self, meta: &StoreMetaData) -> u16 {
        self.registry.code_of(meta)
    }

    /// Splits `mask` into single-bit tracked codes.
    pub fn store_codes(&self, mask: u16) -> Vec<u16> {
        self.registry.store_codes(mask)
    }

    /// Returns the local pending-change mask.
    pub fn local_mask(&self) -> u16 {
        self.state.lock().local_mask
    }

    /// Returns a snapshot of `device`'s entry.
    pub fn entry(&self, device: &str) -> Option<DeviceMatrixEntry> {
        self.state.lock().peers.get(device).map(|peer| DeviceMatrixEntry {
            device_id: device.to_string(),
            mask: peer.mask,
            exchanged_mask: peer.exchanged,
            online: peer.online,
            remote_version: peer.remote_version,
            mask_info: peer.mask_info.clone(),
        })
    }

    /// Records a local change of the stores in `code`.
    ///
    /// The bits are added to the local mask and to every known peer. When a
    /// bit is new somewhere the local record is saved with a bumped version
    /// and a broadcast is posted; otherwise nothing happens. If the save
    /// fails the local mask and version are rolled back, so the same change
    /// is persisted by the next call.
    pub fn on_changed(&self, code: u16) -> SyncResult<()> {
        let code = code & self.registry.known_mask();
        // Held across the save so records reach the store in version order.
        // Reentrant because the store's syncer may call back in here.
        let _persist = self.persist.lock();
        let (record, added) = {
            let mut state = self.state.lock();
            let fresh = code & !state.local_mask != 0
                || state.peers.values().any(|peer| code & !peer.mask != 0);
            if code == 0 || !fresh {
                return Ok(());
            }
            let added = code & !state.local_mask;
            state.local_mask |= code;
            for peer in state.peers.values_mut() {
                peer.mask |= code;
            }
            state.version += 1;
            let record = MatrixRecord {
                version: state.version,
                mask: state.local_mask,
                mask_info: self.registry.labels().to_vec(),
                device_id: self.local_device.clone(),
                origin: Origin::Local,
            };
            (record, added)
        };
        debug!(code, mask = record.mask, version = record.version, "local stores changed");
        if let Err(e) = self.metadata.save_meta(&record.key(), &record, false) {
            let mut state = self.state.lock();
            state.local_mask &= !added;
            if state.version == record.version {
                state.version -= 1;
            }
            warn!(code, version = record.version, error = %e, "local matrix record not saved");
            return Err(e);
        }
        self.events.post(MatrixEvent::Broadcast {
            device: self.local_device.clone(),
            mask: record.mask,
        })
    }

    /// Handles a peer coming online.
    ///
    /// Merges the peer's persisted record, flags every pending store and
    /// posts [`MatrixEvent::Online`]. If nothing is pending,
    /// [`MatrixEvent::Finished`] is posted right away. Returns the flagged
    /// mask.
    pub fn online(&self, device: &str) -> SyncResult<u16> {
        let remote = self.load_remote(device);
        let flagged = {
            let mut state = self.state.lock();
            let local_mask = state.local_mask;
            let peer = state
                .peers
                .entry(device.to_string())
                .or_insert_with(|| PeerEntry::starting_from(local_mask));
            if let Some(record) = remote {
                peer.absorb(&self.registry, record);
            }
            peer.online = true;
            let flagged = peer.mask & self.registry.known_mask() & !peer.exchanged;
            peer.flagged = flagged;
            peer.waiting = flagged;
            flagged
        };
        info!(device, mask = flagged, "peer online");
        let device = device.to_string();
        if flagged == 0 {
            self.events.post(MatrixEvent::Finished { device, mask: 0 })?;
        } else {
            self.events.post(MatrixEvent::Online {
                device,
                mask: flagged,
            })?;
        }
        Ok(flagged)
    }

    /// Handles a peer going offline.
    ///
    /// The exchanged bits are forgotten; the pending mask is kept.
    pub fn offline(&self, device: &str) {
        let mut state = self.state.lock();
        if let Some(peer) = state.peers.get_mut(device) {
            peer.exchanged = 0;
            peer.flagged = 0;
            peer.waiting = 0;
            peer.online = false;
            debug!(device, mask = peer.mask, "peer offline");
        }
    }

    /// Merges a change mask broadcast by `device` and returns the resulting
    /// mask of bits not yet exchanged with it.
    ///
    /// The result accumulates earlier broadcasts and records; it is not the
    /// difference made by this call. Bits already exchanged in this online
    /// period and bits we do not track are ignored.
    pub fn on_broadcast(&self, device: &str, mask: u16) -> u16 {
        let mask_info = self.load_remote(device).map(|record| record.mask_info);
        let mut state = self.state.lock();
        let local_mask = state.local_mask;
        let peer = state
            .peers
            .entry(device.to_string())
            .or_insert_with(|| PeerEntry::starting_from(local_mask));
        if peer.mask_info.is_none() {
            peer.mask_info = mask_info;
        }
        let incoming = peer.translate(&self.registry, mask) & !peer.exchanged;
        peer.mask |= incoming;
        debug!(device, incoming, pending = peer.mask, "broadcast merged");
        peer.mask & self.registry.known_mask()
    }

    /// Marks the stores in `code` as reconciled with `device`.
    ///
    /// Once every store flagged at online is exchanged,
    /// [`MatrixEvent::Finished`] is posted with the flagged mask.
    pub fn on_exchanged(&self, device: &str, code: u16) -> SyncResult<()> {
        let finished = {
            let mut state = self.state.lock();
            let Some(peer) = state.peers.get_mut(device) else {
                debug!(device, code, "exchange for unknown peer");
                return Ok(());
            };
            let code = code & self.registry.known_mask();
            peer.mask &= !code;
            peer.exchanged |= code;
            if peer.waiting != 0 {
                peer.waiting &= !code;
                (peer.waiting == 0).then_some(peer.flagged)
            } else {
                None
            }
        };
        match finished {
            Some(mask) => {
                info!(device, mask, "matrix exchange finished");
                self.events.post(MatrixEvent::Finished {
                    device: device.to_string(),
                    mask,
                })
            }
            None => Ok(()),
        }
    }

    /// Forgets every peer and the local pending mask.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.peers.clear();
        state.local_mask = 0;
    }

    fn load_remote(&self, device: &str) -> Option<MatrixRecord> {
        match self
            .metadata
            .load_meta::<MatrixRecord>(&MatrixRecord::key_of(device), false)
        {
            Ok(record) => record.filter(|r| r.device_id == device),
            Err(e) => {
                warn!(device, error = %e, "peer matrix record unreadable");
                None
            }
        }
    }

    fn on_record_changed(&self, key: &str, value: &[u8], flag: ChangeFlag) {
        let Some(device) = MatrixRecord::device_of(key) else {
            return;
        };
        if device == self.local_device || flag == ChangeFlag::Delete {
            return;
        }
        let record: MatrixRecord = match decode_record(value) {
            Ok(record) => record,
            Err(e) => {
                warn!(device, error = %e, "peer matrix record unreadable");
                return;
            }
        };
        if record.device_id != device {
            return;
        }
        let version = record.version;
        let added = {
            let mut state = self.state.lock();
            let local_mask = state.local_mask;
            let peer = state
                .peers
                .entry(device.to_string())
                .or_insert_with(|| PeerEntry::starting_from(local_mask));
            let added = peer.absorb(&self.registry, record);
            if peer.online && added != 0 {
                peer.flagged |= added;
                peer.waiting |= added;
                added
            } else {
                0
            }
        };
        debug!(device, version, added, "peer matrix record merged");
        if added != 0 {
            let event = MatrixEvent::Online {
                device: device.to_string(),
                mask: added,
            };
            if let Err(e) = self.events.post(event) {
                warn!(device, error = %e, "matrix online event not posted");
            }
        }
    }
}

impl Drop for DeviceMatrix {
    fn drop(&mut self) {
        if self.observing {
            self.metadata.unsubscribe(MatrixRecord::PREFIX);
        }
    }
}
