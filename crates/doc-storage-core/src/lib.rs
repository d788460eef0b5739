//! Core engine for versioned CRDT document storage.
//!
//! This crate defines the storage engine and the abstractions its backends implement:
//! - `DocBackend`: Snapshot, pending update log, history and space operations
//! - `DocStorage`: The caller-facing surface (get, diff, push, rollback, events)
//! - `DocStorageAdapter`: Squashing, diffing and rollback on top of a `DocBackend`
//! - `AutoSyncDocStorage`: Replication of a main storage to followers
//! - `DocModel`: Merge and diff primitives, backed by `yrs`
//! - `SingletonLocker`: Per-document exclusive locks

mod adapter;
mod error;
mod listener;
mod lock;
mod memory;
mod model;
mod storage;
mod sync;

#[cfg(test)]
mod test_support;

pub use adapter::{DocStorage, DocStorageAdapter, DocStorageOptions};
pub use error::{FollowerError, StorageError};
pub use listener::{DocUpdateEvent, Subscription, UpdateListener, UpdateListeners};
pub use lock::{LockGuard, SingletonLocker};
pub use memory::MemoryDocBackend;
pub use model::{
    apply_update, doc_from_update, encode_full_state, encode_state_vector, DocModel, YrsDocModel,
};
pub use storage::{
    is_empty_bin, now_millis, DocBackend, DocDiff, DocRecord, DocUpdate, Editor, EditorId,
    HistoryEntry, HistoryPolicy, HistoryQuery, MonotonicClock,
};
pub use sync::AutoSyncDocStorage;
