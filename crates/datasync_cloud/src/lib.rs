//! # Datasync Cloud
//!
//! Scheduling of cloud store syncs.
//!
//! This crate provides:
//! - Sync requests and reversible, user-scoped sync ids
//! - Per user and bundle admission, where a new request replaces the
//!   scheduled one
//! - A bounded retryer with a shorter interval for locked stores
//! - A fast path running local-change syncs immediately with a reduced budget
//! - Lazy binding of cloud connections into store handles
//!
//! ## Key Invariants
//!
//! - At most one scheduled request per user and bundle
//! - Task bodies for the same user and bundle never overlap
//! - At most one pending retry per sync id
//! - The last attempt never reschedules; its failures reach the caller
//! - Cancellation never interrupts a running task body

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod event;
mod info;
mod manager;
mod meta;
mod retry;
mod sync_id;

pub use config::CloudSyncConfig;
pub use event::{CloudEvent, CloudTopic, StoreInfo, SyncOptions};
pub use info::{SyncInfo, DEFAULT_ID};
pub use manager::{CloudSyncManager, CloudSyncManagerBuilder};
pub use meta::{AppInfo, CloudInfo, SchemaMeta};
pub use retry::{RetryOutcome, RetryState, Retryer};
pub use sync_id::{SyncIdGenerator, USER_MASK, USER_SHIFT};
