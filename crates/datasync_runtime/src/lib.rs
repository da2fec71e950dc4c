//! # Datasync Runtime
//!
//! Collaborator interfaces shared by the datasync crates.
//!
//! This crate provides:
//! - The sync error taxonomy ([`SyncError`])
//! - Timer/executor abstraction with a tokio backend and a manual clock
//! - Topic-based event bus
//! - Metadata store with CBOR-encoded typed records
//! - Store handles and cloud connection providers
//!
//! ## Key Invariants
//!
//! - Repeating-timer finalizers run exactly once
//! - Event delivery is asynchronous with respect to `post`
//! - Observers and callbacks never run under an internal lock

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event;
mod manual;
mod metadata;
mod store;
mod timer;

pub use error::{SyncError, SyncResult};
pub use event::{Event, EventBus, EventCenter, Handler, SubscriptionId};
pub use manual::ManualTimer;
pub use metadata::{
    decode_record, encode_record, ChangeFlag, MemoryMetadataStore, MetaObserver, MetaSyncer,
    MetadataStore, MetadataStoreExt,
};
pub use store::{
    AssetLoader, AsyncDetail, CloudConnections, CloudDb, CloudServer, Database, Details,
    NetworkMonitor, Progress, ProgressDetail, Query, Store, StoreMetaData, StoreProvider,
    SyncMode, Table,
};
pub use timer::{Finalizer, Task, Tick, TimerId, TimerService, TokioTimerService};
