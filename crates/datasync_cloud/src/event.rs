//! Cloud sync events.

use crate::retry::Retryer;
use datasync_runtime::{AsyncDetail, Event, Query, SyncMode};
use std::fmt;
use std::time::Duration;

/// Topics of [`CloudEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudTopic {
    /// A store was written locally.
    LocalChange,
    /// A store should sync with the cloud.
    CloudSync,
    /// A bundle's schema is missing and should be fetched.
    GetSchema,
}

/// Store addressed by a cloud event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreInfo {
    /// Owning user.
    pub user: i32,
    /// Owning bundle.
    pub bundle_name: String,
    /// Store name.
    pub store_name: String,
    /// Application instance.
    pub instance_id: i32,
}

/// How a store sync should run.
#[derive(Clone)]
pub struct SyncOptions {
    /// Sync mode.
    pub mode: SyncMode,
    /// How long the store may block.
    pub wait: Duration,
    /// Whether failures are retried.
    pub auto_retry: bool,
    /// Caller's completion callback.
    pub callback: Option<AsyncDetail>,
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("mode", &self.mode)
            .field("wait", &self.wait)
            .field("auto_retry", &self.auto_retry)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Event exchanged between the cloud manager and the rest of the service.
#[derive(Debug, Clone)]
pub enum CloudEvent {
    /// A store changed locally and should be pushed.
    LocalChange {
        /// Changed store.
        store: StoreInfo,
        /// Sync options.
        options: SyncOptions,
        /// Optional query; every table when absent.
        query: Option<Query>,
    },
    /// One store should sync now.
    CloudSync {
        /// Store to sync.
        store: StoreInfo,
        /// Sync options.
        options: SyncOptions,
        /// Resolved query.
        query: Query,
        /// Retryer of the task that emitted the event.
        retryer: Retryer,
    },
    /// Schemas of `bundle_name` are missing for `user`.
    GetSchema {
        /// Owning user.
        user: i32,
        /// Bundle, empty for every bundle.
        bundle_name: String,
    },
}

impl Event for CloudEvent {
    type Topic = CloudTopic;

    fn topic(&self) -> CloudTopic {
        match self {
            CloudEvent::LocalChange { .. } => CloudTopic::LocalChange,
            CloudEvent::CloudSync { .. } => CloudTopic::CloudSync,
            CloudEvent::GetSchema { .. } => CloudTopic::GetSchema,
        }
    }
}
