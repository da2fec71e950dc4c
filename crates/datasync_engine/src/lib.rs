//! # Datasync Engine
//!
//! Per-peer protocol state machine.
//!
//! This crate provides:
//! - Version-selected, table-driven state dispatch
//! - Watchdog with escalating retry backoff
//! - Save-data keepalive and per-direction feed-dog timers
//! - Session target queue with skippable targets
//! - A reference single-version peer protocol
//! - Mock communicator and in-memory dataset for tests
//!
//! ## Key Invariants
//!
//! - Exactly one switch table is selected per lookup, first match wins
//! - A missing event never mutates the state
//! - Stale watchdog ticks never touch the session
//! - A feed-dog timer exists iff its reference count is positive
//! - Every timer keeps the machine alive until its finalizer runs

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod machine;
mod protocol;
mod session;
mod single_ver;
mod table;
mod transport;

pub use config::{MachineConfig, RetryConfig};
pub use machine::{FeedDogController, MachineBuilder, SyncStateMachine};
pub use protocol::{Direction, Protocol, StepContext};
pub use session::{SyncSession, SyncTarget, TargetOutcome, UsageGuard};
pub use single_ver::{
    ability_table, legacy_table, time_offset_key, watermark_key, SingleVerEvent,
    SingleVerProtocol, SingleVerState, ABILITY_SYNC_VERSION,
};
pub use table::{select_table, StateSwitchTable, Transition};
pub use transport::{
    Communicator, DataBatch, DataEntry, MemorySyncStorage, MockCommunicator, SyncMessage,
    SyncStorage,
};
