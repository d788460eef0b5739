use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::error::StorageError;
use crate::listener::{DocUpdateEvent, Subscription, UpdateListener, UpdateListeners};
use crate::lock::{LockGuard, SingletonLocker};
use crate::model::{DocModel, YrsDocModel};
use crate::storage::{
    is_empty_bin, DocBackend, DocDiff, DocRecord, DocUpdate, HistoryEntry,
    HistoryQuery,
};

/// What callers see of a space: documents, diffs, history and update events.
///
/// Implemented by [`DocStorageAdapter`] over a single backend and by
/// [`crate::AutoSyncDocStorage`] over a main storage and its followers.
#[async_trait]
pub trait DocStorage: Send + Sync {
    fn space_id(&self) -> &str;

    /// Human readable name, used in logs.
    fn storage_name(&self) -> &str;

    async fn connect(&self) -> Result<(), StorageError>;

    async fn disconnect(&self) -> Result<(), StorageError>;

    // =========================================================================
    // Document Operations
    // =========================================================================

    /// Current state of a document, squashing pending updates first.
    async fn get_doc(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError>;

    /// What a peer holding `state_vector` is missing. Without a state vector
    /// the full document is returned.
    async fn get_doc_diff(
        &self,
        doc_id: &str,
        state_vector: Option<&[u8]>,
    ) -> Result<Option<DocDiff>, StorageError>;

    /// Append updates to a document. Returns the number of updates stored.
    async fn push_doc_updates(
        &self,
        doc_id: &str,
        updates: &[Vec<u8>],
        editor_id: Option<&str>,
    ) -> Result<usize, StorageError>;

    /// Bring a document back to the content it had at `timestamp`.
    async fn rollback_doc(
        &self,
        doc_id: &str,
        timestamp: i64,
        editor_id: Option<&str>,
    ) -> Result<(), StorageError>;

    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError>;

    async fn delete_space(&self) -> Result<(), StorageError>;

    // =========================================================================
    // History and Space Queries
    // =========================================================================

    async fn get_space_doc_timestamps(
        &self,
        after: Option<i64>,
    ) -> Result<Option<HashMap<String, i64>>, StorageError>;

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
    // Events
    // =========================================================================

    /// Register a listener for updates received from a non-local origin.
    fn on_receive_doc_updates(&self, listener: UpdateListener) -> Subscription;
}

/// Collaborators injected into a [`DocStorageAdapter`].
#[derive(Clone)]
pub struct DocStorageOptions {
    pub model: Arc<dyn DocModel>,
    /// Share one locker between adapters to serialize them against each other.
    pub locker: Arc<SingletonLocker>,
}

impl Default for DocStorageOptions {
    fn default() -> Self {
        Self {
            model: Arc::new(YrsDocModel::new()),
            locker: Arc::new(SingletonLocker::new()),
        }
    }
}

/// The storage engine for one space.
///
/// Pushed updates are appended to the backend's pending log. Reads squash the
/// log into the snapshot under a per-document lock and keep the replaced
/// snapshot as history.
pub struct DocStorageAdapter<B> {
    backend: B,
    model: Arc<dyn DocModel>,
    locker: Arc<SingletonLocker>,
    listeners: UpdateListeners,
    lock_scope: String,
}

impl<B: DocBackend> DocStorageAdapter<B> {
    pub fn new(backend: B) -> Self {
        Self::with_options(backend, DocStorageOptions::default())
    }

    pub fn with_options(backend: B, options: DocStorageOptions) -> Self {
        let lock_scope = format!("space:{}:update", backend.space_id());
        Self {
            backend,
            model: options.model,
            locker: options.locker,
            listeners: UpdateListeners::new(),
            lock_scope,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Store updates that arrived from another peer and notify listeners.
    #[instrument(skip(self, updates), level = "debug", fields(updates_count = updates.len()))]
    pub async fn receive_doc_updates(
        &self,
        doc_id: &str,
        updates: &[Vec<u8>],
        editor_id: Option<&str>,
    ) -> Result<usize, StorageError> {
        let updates = non_empty(updates);
        if updates.is_empty() {
            return Ok(0);
        }

        let timestamps = self
            .backend
            .push_doc_updates(doc_id, &updates, editor_id)
            .await?;
        let Some(&timestamp) = timestamps.last() else {
            return Ok(0);
        };

        self.listeners.dispatch(&DocUpdateEvent {
            doc_id: doc_id.to_string(),
            updates,
            timestamp,
        });
        Ok(timestamps.len())
    }

    /// Fold an ordered list of updates (oldest first) into one.
    pub fn squash(&self, updates: &[DocUpdate]) -> Result<DocUpdate, StorageError> {
        let Some(last) = updates.last() else {
            return Err(StorageError::Internal("No updates to be squashed".to_string()));
        };

        if updates.len() == 1 {
            return Ok(last.clone());
        }

        let bins: Vec<&[u8]> = updates.iter().map(|u| u.bin.as_slice()).collect();
        let bin = self.model.merge_updates(&bins)?;

        Ok(DocUpdate {
            bin,
            timestamp: last.timestamp,
            editor: last.editor.clone(),
        })
    }

    async fn lock_doc(&self, doc_id: &str) -> LockGuard {
        self.locker.lock(&self.lock_scope, doc_id).await
    }

    /// Squash pending updates into the snapshot. The caller holds the doc lock.
    async fn squash_locked(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        let snapshot = self.backend.get_doc_snapshot(doc_id).await?;
        let updates = self.backend.get_doc_updates(doc_id).await?;

        if updates.is_empty() {
            return Ok(snapshot);
        }

        let mut items = Vec::with_capacity(updates.len() + 1);
        if let Some(snapshot) = &snapshot {
            items.push(snapshot.to_update());
        }
        items.extend(updates.iter().cloned());

        let squashed = self.squash(&items)?;
        let record = DocRecord {
            space_id: self.backend.space_id().to_string(),
            doc_id: doc_id.to_string(),
            bin: squashed.bin,
            timestamp: squashed.timestamp,
            editor: squashed.editor,
        };

        let stored = self.backend.set_doc_snapshot(&record).await?;
        if stored {
            if let Some(previous) = &snapshot {
                if let Err(e) = self.backend.create_doc_history(previous, false).await {
                    warn!(
                        "Failed to create history for doc {} at {}: {}",
                        doc_id, previous.timestamp, e
                    );
                }
            }
        }

        let merged = self.backend.mark_updates_merged(doc_id, &updates).await?;
        debug!(
            "Squashed {} updates into doc {} (snapshot stored: {})",
            merged, doc_id, stored
        );

        Ok(Some(record))
    }
}

fn non_empty(updates: &[Vec<u8>]) -> Vec<Vec<u8>> {
    updates
        .iter()
        .filter(|bin| !is_empty_bin(bin))
        .cloned()
        .collect()
}

#[async_trait]
impl<B: DocBackend> DocStorage for DocStorageAdapter<B> {
    fn space_id(&self) -> &str {
        self.backend.space_id()
    }

    fn storage_name(&self) -> &str {
        self.backend.backend_name()
    }

    async fn connect(&self) -> Result<(), StorageError> {
        self.backend.connect().await
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.backend.disconnect().await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_doc(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        let _guard = self.lock_doc(doc_id).await;
        self.squash_locked(doc_id).await
    }

    #[instrument(skip(self, state_vector), level = "debug")]
    async fn get_doc_diff(
        &self,
        doc_id: &str,
        state_vector: Option<&[u8]>,
    ) -> Result<Option<DocDiff>, StorageError> {
        let Some(doc) = self.get_doc(doc_id).await? else {
            return Ok(None);
        };

        let missing = match state_vector {
            Some(sv) if !sv.is_empty() => self.model.diff_update(&doc.bin, sv)?,
            _ => doc.bin.clone(),
        };
        let state = self.model.state_vector_from_update(&doc.bin)?;

        Ok(Some(DocDiff {
            missing,
            state,
            timestamp: doc.timestamp,
        }))
    }

    #[instrument(skip(self, updates), level = "debug", fields(updates_count = updates.len()))]
    async fn push_doc_updates(
        &self,
        doc_id: &str,
        updates: &[Vec<u8>],
        editor_id: Option<&str>,
    ) -> Result<usize, StorageError> {
        let updates = non_empty(updates);
        if updates.is_empty() {
            return Ok(0);
        }
        let timestamps = self
            .backend
            .push_doc_updates(doc_id, &updates, editor_id)
            .await?;
        Ok(timestamps.len())
    }

    #[instrument(skip(self), level = "debug")]
    async fn rollback_doc(
        &self,
        doc_id: &str,
        timestamp: i64,
        editor_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let _guard = self.lock_doc(doc_id).await;

        let target = self
            .backend
            .get_doc_history(doc_id, timestamp)
            .await?
            .ok_or_else(|| {
                StorageError::NotFound(format!(
                    "Can not find the version to rollback to: {}@{}",
                    doc_id, timestamp
                ))
            })?;

        let current = self.squash_locked(doc_id).await?.ok_or_else(|| {
            StorageError::NotFound(format!(
                "Can not find the current version of doc {}",
                doc_id
            ))
        })?;

        let change = self.model.rollback_update(&current.bin, &target.bin)?;
        let pushed = self
            .push_doc_updates(doc_id, &[change], editor_id)
            .await?;

        self.backend.create_doc_history(&current, true).await?;
        debug!(
            "Rolled back doc {} to {} ({} corrective updates)",
            doc_id, timestamp, pushed
        );
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        let _guard = self.lock_doc(doc_id).await;
        self.backend.delete_doc(doc_id).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_space(&self) -> Result<(), StorageError> {
        self.backend.delete_space().await
    }

    async fn get_space_doc_timestamps(
        &self,
        after: Option<i64>,
    ) -> Result<Option<HashMap<String, i64>>, StorageError> {
        self.backend.get_space_doc_timestamps(after).await
    }

    async fn list_doc_histories(
        &self,
        doc_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        self.backend.list_doc_histories(doc_id, query).await
    }

    async fn get_doc_history(
        &self,
        doc_id: &str,
        timestamp: i64,
    ) -> Result<Option<DocRecord>, StorageError> {
        self.backend.get_doc_history(doc_id, timestamp).await
    }

    fn on_receive_doc_updates(&self, listener: UpdateListener) -> Subscription {
        self.listeners.add(listener)
    }
}
