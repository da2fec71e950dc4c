//! # Datasync Matrix
//!
//! Per-peer store change matrix.
//!
//! This crate provides:
//! - A fixed registry mapping store identities to mask bits
//! - The device matrix: local pending mask, per-peer pending and exchanged
//!   masks, online/offline handling and broadcast merging
//! - The persisted matrix record and its label-based translation
//! - Matrix events for the sync layer
//!
//! ## Key Invariants
//!
//! - Unknown stores map to code 0 and never drive a resync
//! - Bit merges are commutative and idempotent
//! - A peer's pending mask survives offline; its exchanged mask does not
//! - `Finished` is posted only after every flagged bit was exchanged

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod event;
mod matrix;
mod record;
mod registry;

pub use event::{MatrixEvent, MatrixTopic};
pub use matrix::{DeviceMatrix, DeviceMatrixEntry};
pub use record::{MatrixRecord, Origin};
pub use registry::{StoreRegistry, MAX_LABELS, META_BUNDLE, META_STORE_MASK};
