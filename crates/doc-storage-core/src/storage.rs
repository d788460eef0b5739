use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Identifier of the user who produced an update or snapshot.
pub type EditorId = String;

/// The latest materialized snapshot of one document.
///
/// `bin` is an opaque CRDT-encoded update containing the full document state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    pub space_id: String,
    pub doc_id: String,
    #[serde(with = "serde_bytes")]
    pub bin: Vec<u8>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default)]
    pub editor: Option<EditorId>,
}

impl DocRecord {
    /// View this snapshot as the first element of a squash.
    pub fn to_update(&self) -> DocUpdate {
        DocUpdate {
            bin: self.bin.clone(),
            timestamp: self.timestamp,
            editor: self.editor.clone(),
        }
    }
}

/// A single pending mutation, not yet folded into the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocUpdate {
    #[serde(with = "serde_bytes")]
    pub bin: Vec<u8>,
    /// Milliseconds since the Unix epoch, assigned by the backend on append
    pub timestamp: i64,
    #[serde(default)]
    pub editor: Option<EditorId>,
}

impl DocUpdate {
    pub fn new(bin: Vec<u8>, timestamp: i64, editor: Option<EditorId>) -> Self {
        Self {
            bin,
            timestamp,
            editor,
        }
    }
}

/// Result of a sync handshake step. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocDiff {
    /// Delta the caller does not have yet
    pub missing: Vec<u8>,
    /// State vector of the current snapshot
    pub state: Vec<u8>,
    pub timestamp: i64,
}

/// Attribution metadata for an editor id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Editor {
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// One row of a document's history listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: i64,
    pub editor: Option<Editor>,
}

/// Pagination for history listings. Listings are newest first.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryQuery {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    /// Apply skip/limit to an already ordered listing.
    pub fn paginate<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.skip.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Decides when squashing a document creates a history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPolicy {
    /// Minimum distance between two non-forced history rows.
    pub min_interval_ms: i64,
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self {
            min_interval_ms: 10 * 60 * 1000,
        }
    }
}

impl HistoryPolicy {
    /// Keep a history row for every replaced snapshot.
    pub fn every_snapshot() -> Self {
        Self { min_interval_ms: 0 }
    }

    /// Whether a snapshot taken at `timestamp` should be written, given the
    /// timestamp of the newest existing history row.
    pub fn should_create(&self, last: Option<i64>, timestamp: i64, force: bool) -> bool {
        match last {
            None => true,
            // Same row; only a forced write replaces it
            Some(last) if last == timestamp => force,
            Some(last) => force || last < timestamp - self.min_interval_ms,
        }
    }
}

/// Byte patterns of an update or state vector that carry no content:
/// zero-length, `[0]` (empty state vector) and `[0, 0]` (empty update).
pub fn is_empty_bin(bin: &[u8]) -> bool {
    matches!(bin, [] | [0] | [0, 0])
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Hands out strictly increasing millisecond timestamps.
///
/// Backends use one per space so that no two updates or snapshots share a
/// timestamp, even when written within the same millisecond.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure later timestamps are greater than `seen` (e.g. after loading
    /// persisted data).
    pub fn observe(&self, seen: i64) {
        self.last.fetch_max(seen, Ordering::SeqCst);
    }

    pub fn next(&self) -> i64 {
        let now = now_millis();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }
}

/// Persistence contract for one space.
///
/// The engine (`DocStorageAdapter`) owns locking, squashing, history and
/// rollback; implementations only store and retrieve rows.
#[async_trait]
pub trait DocBackend: Send + Sync {
    /// The space this backend stores.
    fn space_id(&self) -> &str;

    /// Returns the backend identifier (e.g., "memory", "local").
    fn backend_name(&self) -> &'static str;

    async fn connect(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        Ok(())
    }

    // =========================================================================
    // Snapshot Operations
    // =========================================================================

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError>;

    /// Store a new snapshot. Returns false when the stored snapshot is newer
    /// than `snapshot`, in which case nothing is written.
    async fn set_doc_snapshot(&self, snapshot: &DocRecord) -> Result<bool, StorageError>;

    // =========================================================================
    // Update Log Operations
    // =========================================================================

    /// Pending updates of a document, oldest first.
    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocUpdate>, StorageError>;

    /// Append updates to the pending log. Returns the timestamps assigned to
    /// the appended updates, in order.
    async fn push_doc_updates(
        &self,
        doc_id: &str,
        updates: &[Vec<u8>],
        editor_id: Option<&str>,
    ) -> Result<Vec<i64>, StorageError>;

    /// Remove updates that were folded into a snapshot. Returns the number removed.
    async fn mark_updates_merged(
        &self,
        doc_id: &str,
        updates: &[DocUpdate],
    ) -> Result<usize, StorageError>;

    // =========================================================================
    // History Operations
    // =========================================================================

    /// Write a point-in-time history row for `snapshot`. Returns whether a row
    /// was written.
    async fn create_doc_history(
        &self,
        snapshot: &DocRecord,
        force: bool,
    ) -> Result<bool, StorageError>;

    async fn list_doc_histories(
        &self,
        doc_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<HistoryEntry>, StorageError>;

    async fn get_doc_history(
        &self,
        doc_id: &str,
        timestamp: i64,
    ) -> Result<Option<DocRecord>, StorageError>;

    // =========================================================================
    // Space Operations
    // =========================================================================

    /// Latest timestamp per document, only documents changed after `after`.
    /// `None` when the space holds no documents at all.
    async fn get_space_doc_timestamps(
        &self,
        after: Option<i64>,
    ) -> Result<Option<HashMap<String, i64>>, StorageError>;

    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError>;

    async fn delete_space(&self) -> Result<(), StorageError>;
}
