//! # bucketsync protocol
//!
//! Oplog model and wire types for bucket-oriented streaming sync.
//!
//! This crate provides:
//! - [`OpId`] and [`Checksum`], the two scalar types every other piece is built on
//! - [`OplogEntry`] and [`OpType`] for per-bucket versioned changes
//! - [`Checkpoint`], [`CheckpointDiff`] and [`BucketChecksum`]
//! - [`StreamingSyncLine`] decoding for NDJSON and CBOR line transports
//! - [`CrudEntry`] for locally captured writes
//! - [`Frame`] for the credit-based socket transport
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Wire conventions
//!
//! Op ids travel as base-10 strings (numbers are accepted when decoding).
//! Checksums are unsigned 32-bit values combined with wrapping addition; the
//! server may send them signed, so decoding truncates any integer to 32 bits.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod checksum;
mod crud;
mod error;
mod frame;
mod messages;
mod op_id;
mod oplog;

pub use checkpoint::{BucketChecksum, Checkpoint, CheckpointDiff, DEFAULT_PRIORITY};
pub use checksum::Checksum;
pub use crud::{CrudEntry, CrudEntryOutput, UpdateType};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::Frame;
pub use messages::{
    BucketRequest, CheckpointComplete, PartialCheckpointComplete, StreamingSyncLine,
    StreamingSyncRequest, SyncDataBatch, SyncDataBucket, WriteCheckpointData,
    WriteCheckpointResponse,
};
pub use op_id::{OpId, MAX_OP_ID};
pub use oplog::{OpType, OplogEntry, RowKey};
