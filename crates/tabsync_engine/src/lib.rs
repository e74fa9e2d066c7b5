//! # tabsync engine
//!
//! Replication engine that keeps several replicas of one record collection
//! consistent on a single device.
//!
//! This crate provides:
//! - [`SyncEngine`], one replica: local mutations, inbound merges, events
//! - [`TransportChannel`], the transport ladder (broadcast → storage signal →
//!   polling) with adaptive poll intervals and primary presence
//! - [`OfflineQueue`], durable FIFO of mutations made while offline
//! - [`StatusMonitor`], the health state machine and its metrics
//! - [`RemoteStore`], the optional remote collaborator, with bounded retries
//! - [`ObserverRegistry`], observer registration with disposable handles
//!
//! ## Architecture
//!
//! Every replica shares one [`tabsync_storage::KeyValueStore`]. A mutation is
//! validated, applied to the local collection, persisted, broadcast as a
//! `data_update` and then mirrored to the remote store. Inbound snapshots are
//! merged with [`tabsync_protocol::merge_collections`]; deletions travel as
//! tombstones.
//!
//! ## Key Invariants
//!
//! - Sending never fails: a failing mechanism demotes the transport one rung
//! - Receiving always listens on every mechanism; polling always runs
//! - The `last_update` key only ever increases
//! - Offline mutations are persisted before the call returns and replayed in
//!   order once connectivity returns
//! - A claimed record never reverts to unclaimed

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod conflicts;
mod engine;
mod error;
mod observer;
mod queue;
mod remote;
mod status;
mod transport;

pub use clock::{now_ms, Clock};
pub use config::{EngineConfig, RetryConfig, StorageKeys, TransportConfig};
pub use conflicts::{ConflictKind, ConflictLog, ConflictRecord};
pub use engine::{
    AppliedChange, EngineEvent, MergeReport, MutationOutcome, RemoteSync, SyncEngine,
    SyncEngineBuilder,
};
pub use error::{SyncError, SyncResult};
pub use observer::{ObserverRegistry, Subscription};
pub use queue::{DrainReport, OfflineQueue};
pub use remote::{
    with_retry, MemoryRemote, RecordPatch, RemoteFilter, RemoteOrder, RemoteStore,
};
pub use status::{Health, StatusChange, StatusMonitor};
pub use transport::{BusPort, LocalBus, PrimaryChannel, TransportChannel, TransportMode};
