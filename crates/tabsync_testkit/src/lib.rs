//! # tabsync testkit
//!
//! Test utilities for tabsync.
//!
//! This crate provides:
//! - Device fixtures: replicas sharing one store and one bus
//! - Failing transport doubles
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tabsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn two_tabs() {
//!     let device = TestDevice::new();
//!     let admin = device.replica(WriterRole::Primary, "admin").await;
//!     let tab = device.replica(WriterRole::Secondary, "tab").await;
//!     // ... test operations
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use tabsync_engine::{EngineConfig, SyncEngine};
    pub use tabsync_protocol::{RecordDraft, WriterRole};
}

pub use fixtures::*;
pub use generators::*;
