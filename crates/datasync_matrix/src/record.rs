//! Persisted matrix record.

use serde::{Deserialize, Serialize};

/// Who wrote a matrix record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Written by this device.
    #[default]
    Local,
    /// Received from a peer.
    Remote,
}

/// A device's change mask as stored in the metadata store.
///
/// `mask_info` lists the labels behind bits `1..`, so a reader with a
/// different registry can translate the mask.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixRecord {
    /// Bumped on every local write.
    pub version: u32,
    /// Pending-change mask.
    pub mask: u16,
    /// Labels in bit order.
    pub mask_info: Vec<String>,
    /// Device owning the record.
    pub device_id: String,
    /// Who wrote the record.
    pub origin: Origin,
}

impl MatrixRecord {
    /// Prefix of every matrix record.
    pub const PREFIX: &'static str = "matrix/";

    /// Returns the key of `device`'s record.
    pub fn key_of(device: &str) -> String {
        format!("{}{device}", Self::PREFIX)
    }

    /// Returns the key of this record.
    pub fn key(&self) -> String {
        Self::key_of(&self.device_id)
    }

    /// Returns the device of a matrix record key.
    pub fn device_of(key: &str) -> Option<&str> {
        key.strip_prefix(Self::PREFIX).filter(|d| !d.is_empty())
    }
}

// Equal when mask, device and origin match.
impl PartialEq for MatrixRecord {
    fn eq(&self, other: &Self) -> bool {
        self.mask == other.mask && self.device_id == other.device_id && self.origin == other.origin
    }
}

impl Eq for MatrixRecord {}
