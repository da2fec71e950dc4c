//! Store identity to bit position mapping.

use datasync_runtime::{StoreMetaData, SyncError, SyncResult};

/// Code of the metadata store.
pub const META_STORE_MASK: u16 = 0x1;

/// Bundle owning the metadata store.
pub const META_BUNDLE: &str = "distributeddata";

/// Maximum number of labels; with the meta-store bit every code fits a `u16`.
pub const MAX_LABELS: usize = 15;

/// Fixed registry of tracked stores.
///
/// Bit 0 is the metadata store; bit `i + 1` is the `i`-th label. A store
/// that matches nothing has code 0 and is never targeted by a resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRegistry {
    local_token: u32,
    meta_store_id: String,
    labels: Vec<String>,
}

impl StoreRegistry {
    /// Creates a registry with no labels.
    pub fn new(local_token: u32, meta_store_id: impl Into<String>) -> Self {
        Self {
            local_token,
            meta_store_id: meta_store_id.into(),
            labels: Vec::new(),
        }
    }

    /// Sets the tracked labels, in bit order.
    pub fn with_labels<I, S>(mut self, labels: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.len() > MAX_LABELS {
            return Err(SyncError::InvalidArgument(format!(
                "{} labels registered, at most {MAX_LABELS} fit the mask",
                labels.len()
            )));
        }
        if let Some(dup) = labels
            .iter()
            .enumerate()
            .find(|(i, l)| labels[..*i].contains(*l))
            .map(|(_, l)| l)
        {
            return Err(SyncError::InvalidArgument(format!("duplicate label {dup}")));
        }
        self.labels = labels;
        Ok(self)
    }

    /// Returns the tracked labels in bit order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Returns the token of the local service.
    pub fn local_token(&self) -> u32 {
        self.local_token
    }

    /// Returns the mask with every tracked bit set.
    pub fn known_mask(&self) -> u16 {
        let bits = self.labels.len() + 1;
        if bits >= 16 {
            u16::MAX
        } else {
            (1u16 << bits) - 1
        }
    }

    /// Returns the code of `meta`, or 0 for an untracked store.
    pub fn code_of(&self, meta: &StoreMetaData) -> u16 {
        if meta.bundle_name == META_BUNDLE
            && meta.token_id == self.local_token
            && meta.store_id == self.meta_store_id
        {
            return META_STORE_MASK;
        }
        self.code_of_label(&meta.app_id)
    }

    /// Returns the code of `label`, or 0 if it is not registered.
    pub fn code_of_label(&self, label: &str) -> u16 {
        self.labels
            .iter()
            .position(|l| l == label)
            .map_or(0, |i| 1 << (i + 1))
    }

    /// Returns the label of a single-bit `code`.
    pub fn label_of(&self, code: u16) -> Option<&str> {
        if code.count_ones() != 1 || code == META_STORE_MASK {
            return None;
        }
        let bit = code.trailing_zeros() as usize;
        self.labels.get(bit - 1).map(String::as_str)
    }

    /// Translates `mask` from a peer's label layout into ours.
    ///
    /// The meta-store bit maps to itself. Labels we do not track are
    /// dropped, as are bits past the end of `remote_labels`.
    pub fn translate(&self, mask: u16, remote_labels: &[String]) -> u16 {
        let mut local = mask & META_STORE_MASK;
        for (i, label) in remote_labels.iter().enumerate().take(MAX_LABELS) {
            if mask & (1 << (i + 1)) != 0 {
                local |= self.code_of_label(label);
            }
        }
        local
    }

    /// Splits `mask` into its single-bit tracked codes, lowest first.
    pub fn store_codes(&self, mask: u16) -> Vec<u16> {
        let mask = mask & self.known_mask();
        (0..16)
            .map(|bit| 1u16 << bit)
            .filter(|code| mask & code != 0)
            .collect()
    }
}
