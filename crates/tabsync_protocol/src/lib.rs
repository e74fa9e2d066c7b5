//! # tabsync protocol
//!
//! Data model, wire messages and merge rules shared by every tabsync replica.
//!
//! This crate provides:
//! - [`Record`] and [`ReplicaState`], the replicated collection
//! - [`ChangeMessage`], the JSON envelope exchanged between replicas
//! - [`QueueEntry`], the persisted form of an offline mutation
//! - [`SyncStatus`] and [`SyncMetrics`], the health snapshot
//! - [`merge_collections`] and [`resolve_record`], the conflict resolver
//! - [`IdGenerator`], identifier assignment strategies
//!
//! This is a pure crate with no I/O operations.
//!
//! ## Merge Rules
//!
//! Records present on only one side are kept. Records present on both sides
//! are resolved by, in order: writer authority, then recency, then a
//! field-level union. A claimed record never reverts to unclaimed through a
//! merge. Deletions travel as explicit tombstones and are never inferred from
//! absence.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod id;
mod merge;
mod message;
mod queue;
mod record;
mod state;
mod status;

pub use error::{ProtocolError, ProtocolResult};
pub use id::{IdGenerator, IdStrategy};
pub use merge::{merge_collections, resolve_record, IdCollision, MergeOutcome};
pub use message::{ChangeMessage, MessageType};
pub use queue::{QueueEntry, QueuedOperation};
pub use record::{ClaimStatus, Record, RecordDraft, RecordId, UpdatedBy, WriterRole};
pub use state::ReplicaState;
pub use status::{StatusSnapshot, SyncMetrics, SyncStatus};
