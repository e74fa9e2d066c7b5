//! # tabsync storage
//!
//! Shared key-value store abstraction for tabsync replicas.
//!
//! Every replica on a device reads and writes the same logical store. The
//! store is the only shared mutable resource between replicas: it offers no
//! transactions and no compare-and-swap, only plain `get`/`set`/`remove`.
//!
//! ## Design Principles
//!
//! - Values are opaque text (the engine stores JSON)
//! - Writes may fail with a quota error, which callers treat as fatal
//! - Stores that can observe writes made by *other* handles expose a
//!   [`StoreWatcher`]; a handle never observes its own writes
//! - Must be `Send + Sync` for use from async tasks
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - Shared in-process store with change notifications
//! - [`FileStore`] - One file per key on disk, no change notifications
//!
//! ## Example
//!
//! ```rust
//! use tabsync_storage::{KeyValueStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! store.set("greeting", "hello").unwrap();
//! assert_eq!(store.get("greeting").unwrap().as_deref(), Some("hello"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{KeyValueStore, StoreEvent, StoreWatcher};
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::MemoryStore;
