//! Matrix notifications.

use datasync_runtime::Event;

/// Topics of [`MatrixEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatrixTopic {
    /// A peer came online with stores to sync.
    Online,
    /// Every store flagged at online was exchanged.
    Finished,
    /// The local mask changed and peers should be told.
    Broadcast,
}

/// Notification posted by the device matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixEvent {
    /// Stores in `mask` need a sync with `device`.
    Online {
        /// Peer device.
        device: String,
        /// Flagged stores.
        mask: u16,
    },
    /// Every store flagged at online is exchanged with `device`.
    Finished {
        /// Peer device.
        device: String,
        /// Stores flagged at online.
        mask: u16,
    },
    /// The local pending mask changed.
    Broadcast {
        /// Local device.
        device: String,
        /// Local pending mask.
        mask: u16,
    },
}

impl MatrixEvent {
    /// Returns the device carried by the event.
    pub fn device(&self) -> &str {
        match self {
            MatrixEvent::Online { device, .. }
            | MatrixEvent::Finished { device, .. }
            | MatrixEvent::Broadcast { device, .. } => device,
        }
    }

    /// Returns the mask carried by the event.
    pub fn mask(&self) -> u16 {
        match self {
            MatrixEvent::Online { mask, .. }
            | MatrixEvent::Finished { mask, .. }
            | MatrixEvent::Broadcast { mask, .. } => *mask,
        }
    }
}

impl Event for MatrixEvent {
    type Topic = MatrixTopic;

    fn topic(&self) -> MatrixTopic {
        match self {
            MatrixEvent::Online { .. } => MatrixTopic::Online,
            MatrixEvent::Finished { .. } => MatrixTopic::Finished,
            MatrixEvent::Broadcast { .. } => MatrixTopic::Broadcast,
        }
    }
}
