use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::storage::{
    DocBackend, DocRecord, DocUpdate, Editor, HistoryEntry, HistoryPolicy, HistoryQuery,
    MonotonicClock,
};

#[derive(Debug, Default)]
struct DocState {
    snapshot: Option<DocRecord>,
    updates: Vec<DocUpdate>,
    history: BTreeMap<i64, DocRecord>,
}

impl DocState {
    fn latest_timestamp(&self) -> Option<i64> {
        let snapshot = self.snapshot.as_ref().map(|s| s.timestamp);
        let update = self.updates.iter().map(|u| u.timestamp).max();
        snapshot.max(update)
    }
}

/// In-memory backend for one space.
///
/// Nothing survives the process; used for tests, embedding and as a
/// reference for the backend contract.
#[derive(Debug)]
pub struct MemoryDocBackend {
    space_id: String,
    docs: DashMap<String, DocState>,
    editors: DashMap<String, Editor>,
    clock: MonotonicClock,
    history_policy: HistoryPolicy,
}

impl MemoryDocBackend {
    #[must_use]
    pub fn new(space_id: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            docs: DashMap::new(),
            editors: DashMap::new(),
            clock: MonotonicClock::new(),
            history_policy: HistoryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_history_policy(mut self, policy: HistoryPolicy) -> Self {
        self.history_policy = policy;
        self
    }

    /// Register display metadata for an editor id.
    pub fn register_editor(&self, editor_id: impl Into<String>, editor: Editor) {
        self.editors.insert(editor_id.into(), editor);
    }

    /// Number of documents with a snapshot or pending updates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn resolve_editor(&self, editor_id: Option<&str>) -> Option<Editor> {
        editor_id.and_then(|id| self.editors.get(id).map(|e| e.value().clone()))
    }
}

#[async_trait]
impl DocBackend for MemoryDocBackend {
    fn space_id(&self) -> &str {
        &self.space_id
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        Ok(self.docs.get(doc_id).and_then(|d| d.snapshot.clone()))
    }

    #[instrument(skip(self, snapshot), level = "debug", fields(doc_id = %snapshot.doc_id))]
    async fn set_doc_snapshot(&self, snapshot: &DocRecord) -> Result<bool, StorageError> {
        let mut doc = self.docs.entry(snapshot.doc_id.clone()).or_default();
        if let Some(existing) = &doc.snapshot {
            if existing.timestamp > snapshot.timestamp {
                debug!(
                    "Rejected stale snapshot for {} ({} < {})",
                    snapshot.doc_id, snapshot.timestamp, existing.timestamp
                );
                return Ok(false);
            }
        }
        self.clock.observe(snapshot.timestamp);
        doc.snapshot = Some(snapshot.clone());
        Ok(true)
    }

    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocUpdate>, StorageError> {
        Ok(self
            .docs
            .get(doc_id)
            .map(|d| d.updates.clone())
            .unwrap_or_default())
    }

    #[instrument(skip(self, updates), level = "debug", fields(updates_count = updates.len()))]
    async fn push_doc_updates(
        &self,
        doc_id: &str,
        updates: &[Vec<u8>],
        editor_id: Option<&str>,
    ) -> Result<Vec<i64>, StorageError> {
        if updates.is_empty() {
            return Ok(vec![]);
        }

        let mut doc = self.docs.entry(doc_id.to_string()).or_default();
        let mut timestamps = Vec::with_capacity(updates.len());
        for bin in updates {
            let timestamp = self.clock.next();
            doc.updates.push(DocUpdate::new(
                bin.clone(),
                timestamp,
                editor_id.map(str::to_string),
            ));
            timestamps.push(timestamp);
        }

        debug!("Appended {} updates to doc {}", updates.len(), doc_id);
        Ok(timestamps)
    }

    async fn mark_updates_merged(
        &self,
        doc_id: &str,
        updates: &[DocUpdate],
    ) -> Result<usize, StorageError> {
        let merged: HashSet<i64> = updates.iter().map(|u| u.timestamp).collect();
        let Some(mut doc) = self.docs.get_mut(doc_id) else {
            return Ok(0);
        };

        let before = doc.updates.len();
        doc.updates.retain(|u| !merged.contains(&u.timestamp));
        Ok(before - doc.updates.len())
    }

    #[instrument(skip(self, snapshot), level = "debug", fields(doc_id = %snapshot.doc_id))]
    async fn create_doc_history(
        &self,
        snapshot: &DocRecord,
        force: bool,
    ) -> Result<bool, StorageError> {
        let mut doc = self.docs.entry(snapshot.doc_id.clone()).or_default();
        let last = doc.history.keys().next_back().copied();

        if !self
            .history_policy
            .should_create(last, snapshot.timestamp, force)
        {
            return Ok(false);
        }

        doc.history.insert(snapshot.timestamp, snapshot.clone());
        debug!(
            "Created history for doc {} at {}",
            snapshot.doc_id, snapshot.timestamp
        );
        Ok(true)
    }

    async fn list_doc_histories(
        &self,
        doc_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        let rows: Vec<(i64, Option<String>)> = match self.docs.get(doc_id) {
            Some(doc) => query.paginate(
                doc.history
                    .values()
                    .rev()
                    .map(|h| (h.timestamp, h.editor.clone())),
            ),
            None => return Ok(vec![]),
        };

        Ok(rows
            .into_iter()
            .map(|(timestamp, editor)| HistoryEntry {
                timestamp,
                editor: self.resolve_editor(editor.as_deref()),
            })
            .collect())
    }

    async fn get_doc_history(
        &self,
        doc_id: &str,
        timestamp: i64,
    ) -> Result<Option<DocRecord>, StorageError> {
        Ok(self
            .docs
            .get(doc_id)
            .and_then(|d| d.history.get(&timestamp).cloned()))
    }

    async fn get_space_doc_timestamps(
        &self,
        after: Option<i64>,
    ) -> Result<Option<HashMap<String, i64>>, StorageError> {
        if self.docs.is_empty() {
            return Ok(None);
        }

        let timestamps = self
            .docs
            .iter()
            .filter_map(|entry| {
                let timestamp = entry.value().latest_timestamp()?;
                match after {
                    Some(after) if timestamp <= after => None,
                    _ => Some((entry.key().clone(), timestamp)),
                }
            })
            .collect();
        Ok(Some(timestamps))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        self.docs.remove(doc_id);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_space(&self) -> Result<(), StorageError> {
        self.docs.clear();
        self.editors.clear();
        Ok(())
    }
}
