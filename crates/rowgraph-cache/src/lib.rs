//! Shared snapshot store for rowgraph.
//!
//! `rowgraph-cache` is the **process-wide row cache**. Every object context
//! attached to storage reads committed rows through one [`SnapshotStore`] and
//! publishes its own commits back into it.
//!
//! # Role In The Architecture
//!
//! - **Snapshot cache**: identity → immutable [`RowSnapshot`](rowgraph_core::RowSnapshot),
//!   optionally bounded with strict LRU eviction.
//! - **Atomic batches**: a commit's rows become visible all at once.
//! - **Change events**: subscribers (sibling contexts) learn what other
//!   contexts committed, deleted or invalidated.
//!
//! # Example
//!
//! ```
//! use rowgraph_cache::{EventInbox, SnapshotBatch, SnapshotStore};
//! use rowgraph_core::{ObjectIdentity, RowSnapshot, Value};
//!
//! let store = SnapshotStore::bounded(100);
//! let inbox = EventInbox::new();
//! store.subscribe(inbox.clone());
//!
//! let id = ObjectIdentity::single("Artist", "id", 1_i64);
//! let row = RowSnapshot::new([("id", Value::BigInt(1)), ("name", Value::from("Monet"))]);
//! store.put_batch(SnapshotBatch::new().changed(id.clone(), row), None);
//!
//! assert!(store.get(&id).is_some());
//! assert_eq!(inbox.drain().len(), 1);
//! ```

pub mod config;
pub mod event;
mod lru;
pub mod store;

pub use config::{DEFAULT_BOUNDED_CAPACITY, SnapshotStoreConfig};
pub use event::{
    EventInbox, SnapshotBatch, SnapshotEvent, SnapshotEventKind, SnapshotListener, SubscriberId,
};
pub use store::{SnapshotStore, SnapshotStoreStats};
