use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use doc_storage_core::{
    DocBackend, DocRecord, DocUpdate, Editor, HistoryEntry, HistoryPolicy, HistoryQuery,
    MonotonicClock, StorageError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Local filesystem backend for one space.
///
/// Organizes data by space:
/// ```text
/// {base_dir}/
///   {space_id}/
///     editors.json
///     docs/
///       {doc_id}/
///         snapshot.json
///         updates.jsonl
///         history/
///           {timestamp}.json
/// ```
#[derive(Debug)]
pub struct LocalDocBackend {
    base_dir: PathBuf,
    space_id: String,
    clock: MonotonicClock,
    history_policy: HistoryPolicy,
    /// Serializes rewrites of update logs and the editors file.
    write_lock: Mutex<()>,
}

impl LocalDocBackend {
    pub fn new(base_dir: impl AsRef<Path>, space_id: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            space_id: space_id.into(),
            clock: MonotonicClock::new(),
            history_policy: HistoryPolicy::default(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_history_policy(mut self, policy: HistoryPolicy) -> Self {
        self.history_policy = policy;
        self
    }

    fn space_dir(&self) -> PathBuf {
        self.base_dir.join(&self.space_id)
    }

    fn docs_dir(&self) -> PathBuf {
        self.space_dir().join("docs")
    }

    fn doc_dir(&self, doc_id: &str) -> Result<PathBuf, StorageError> {
        validate_doc_id(doc_id)?;
        Ok(self.docs_dir().join(doc_id))
    }

    fn snapshot_path(&self, doc_id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.doc_dir(doc_id)?.join("snapshot.json"))
    }

    fn updates_path(&self, doc_id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.doc_dir(doc_id)?.join("updates.jsonl"))
    }

    fn history_dir(&self, doc_id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.doc_dir(doc_id)?.join("history"))
    }

    fn editors_path(&self) -> PathBuf {
        self.space_dir().join("editors.json")
    }

    /// Register display metadata for an editor id.
    #[instrument(skip(self, editor), level = "debug")]
    pub async fn register_editor(&self, editor_id: &str, editor: Editor) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut editors = self.load_editors().await?;
        editors.insert(editor_id.to_string(), editor);

        ensure_dir(&self.space_dir()).await?;
        write_json_atomic(&self.editors_path(), &editors).await?;
        debug!("Registered editor {} ({} known)", editor_id, editors.len());
        Ok(())
    }

    async fn load_editors(&self) -> Result<HashMap<String, Editor>, StorageError> {
        Ok(read_json(&self.editors_path()).await?.unwrap_or_default())
    }

    async fn read_updates(&self, doc_id: &str) -> Result<Vec<DocUpdate>, StorageError> {
        let path = self.updates_path(doc_id)?;

        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to open update log {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let mut lines = BufReader::new(file).lines();
        let mut updates = Vec::new();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to read update log line: {}", e)))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let update: DocUpdate = serde_json::from_str(&line).map_err(|e| {
                StorageError::Serialization(format!("Failed to parse update entry: {}", e))
            })?;
            updates.push(update);
        }
        Ok(updates)
    }

    async fn write_updates(&self, doc_id: &str, updates: &[DocUpdate]) -> Result<(), StorageError> {
        let path = self.updates_path(doc_id)?;
        let temp_path = path.with_extension("jsonl.tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StorageError::Io(format!("Failed to create {}: {}", temp_path.display(), e))
        })?;
        for update in updates {
            write_line(&mut file, update).await?;
        }
        file.flush()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to flush update log: {}", e)))?;

        fs::rename(&temp_path, &path).await.map_err(|e| {
            StorageError::Io(format!("Failed to rename to {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    /// History row timestamps of a document, ascending.
    async fn history_timestamps(&self, doc_id: &str) -> Result<Vec<i64>, StorageError> {
        let dir = self.history_dir(doc_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to read dir {}: {}",
                    dir.display(),
                    e
                )));
            }
        };

        let mut timestamps = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to read dir entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(ts) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<i64>().ok())
                {
                    timestamps.push(ts);
                }
            }
        }

        timestamps.sort_unstable();
        Ok(timestamps)
    }

    async fn doc_ids(&self) -> Result<Vec<String>, StorageError> {
        let dir = self.docs_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to read dir {}: {}",
                    dir.display(),
                    e
                )));
            }
        };

        let mut doc_ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to read dir entry: {}", e)))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| StorageError::Io(format!("Failed to get file type: {}", e)))?
                .is_dir();
            if is_dir {
                doc_ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(doc_ids)
    }

    /// Latest snapshot or pending update timestamp of a document.
    async fn latest_timestamp(&self, doc_id: &str) -> Result<Option<i64>, StorageError> {
        let snapshot = self.get_doc_snapshot(doc_id).await?.map(|s| s.timestamp);
        let update = self
            .read_updates(doc_id)
            .await?
            .iter()
            .map(|u| u.timestamp)
            .max();
        Ok(snapshot.max(update))
    }
}

/// Doc ids become directory names and must stay inside the space.
fn validate_doc_id(doc_id: &str) -> Result<(), StorageError> {
    if doc_id.is_empty()
        || doc_id == "."
        || doc_id == ".."
        || doc_id.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::InvalidArgument(format!(
            "Invalid doc id: {:?}",
            doc_id
        )));
    }
    Ok(())
}

async fn ensure_dir(dir: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(dir).await.map_err(|e| {
        StorageError::Io(format!("Failed to create dir {}: {}", dir.display(), e))
    })
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
            StorageError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let json = serde_json::to_vec(value).map_err(|e| {
        StorageError::Serialization(format!("Failed to serialize {}: {}", path.display(), e))
    })?;

    // Write atomically via temp file
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, &json).await.map_err(|e| {
        StorageError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
    })?;
    fs::rename(&temp_path, path).await.map_err(|e| {
        StorageError::Io(format!("Failed to rename to {}: {}", path.display(), e))
    })?;
    Ok(())
}

async fn write_line<T: Serialize>(file: &mut fs::File, value: &T) -> Result<(), StorageError> {
    let mut line = serde_json::to_vec(value).map_err(|e| {
        StorageError::Serialization(format!("Failed to serialize update entry: {}", e))
    })?;
    line.push(b'\n');
    file.write_all(&line)
        .await
        .map_err(|e| StorageError::Io(format!("Failed to write update log: {}", e)))
}

async fn remove_dir_if_exists(dir: &Path) -> Result<bool, StorageError> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::Io(format!(
            "Failed to delete {}: {}",
            dir.display(),
            e
        ))),
    }
}

#[async_trait]
impl DocBackend for LocalDocBackend {
    fn space_id(&self) -> &str {
        &self.space_id
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self), level = "debug")]
    async fn connect(&self) -> Result<(), StorageError> {
        ensure_dir(&self.docs_dir()).await?;

        // Resume the clock after the newest persisted write
        let mut docs = 0;
        for doc_id in self.doc_ids().await? {
            if let Some(ts) = self.latest_timestamp(&doc_id).await? {
                self.clock.observe(ts);
            }
            if let Some(&ts) = self.history_timestamps(&doc_id).await?.last() {
                self.clock.observe(ts);
            }
            docs += 1;
        }

        info!(
            "Opened space {} at {} ({} docs)",
            self.space_id,
            self.space_dir().display(),
            docs
        );
        Ok(())
    }

    // =========================================================================
    // Snapshot Operations
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        read_json(&self.snapshot_path(doc_id)?).await
    }

    #[instrument(skip(self, snapshot), level = "debug", fields(doc_id = %snapshot.doc_id, bin_len = snapshot.bin.len()))]
    async fn set_doc_snapshot(&self, snapshot: &DocRecord) -> Result<bool, StorageError> {
        let path = self.snapshot_path(&snapshot.doc_id)?;

        if let Some(existing) = read_json::<DocRecord>(&path).await? {
            if existing.timestamp > snapshot.timestamp {
                debug!(
                    "Rejected stale snapshot for {} ({} < {})",
                    snapshot.doc_id, snapshot.timestamp, existing.timestamp
                );
                return Ok(false);
            }
        }

        ensure_dir(&self.doc_dir(&snapshot.doc_id)?).await?;
        write_json_atomic(&path, snapshot).await?;
        self.clock.observe(snapshot.timestamp);

        debug!(
            "Saved snapshot of {} at {} ({} bytes)",
            snapshot.doc_id,
            snapshot.timestamp,
            snapshot.bin.len()
        );
        Ok(true)
    }

    // =========================================================================
    // Update Log Operations
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocUpdate>, StorageError> {
        self.read_updates(doc_id).await
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

        let _guard = self.write_lock.lock().await;
        ensure_dir(&self.doc_dir(doc_id)?).await?;
        let path = self.updates_path(doc_id)?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                StorageError::Io(format!("Failed to open update log {}: {}", path.display(), e))
            })?;

        let mut timestamps = Vec::with_capacity(updates.len());
        for bin in updates {
            let update = DocUpdate::new(bin.clone(), self.clock.next(), editor_id.map(str::to_string));
            write_line(&mut file, &update).await?;
            timestamps.push(update.timestamp);
        }

        file.flush()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to flush update log: {}", e)))?;

        debug!("Appended {} updates to doc {}", updates.len(), doc_id);
        Ok(timestamps)
    }

    #[instrument(skip(self, updates), level = "debug", fields(updates_count = updates.len()))]
    async fn mark_updates_merged(
        &self,
        doc_id: &str,
        updates: &[DocUpdate],
    ) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock().await;

        let merged: HashSet<i64> = updates.iter().map(|u| u.timestamp).collect();
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .read_updates(doc_id)
            .await?
            .into_iter()
            .partition(|u| merged.contains(&u.timestamp));

        if removed.is_empty() {
            return Ok(0);
        }

        self.write_updates(doc_id, &kept).await?;
        debug!(
            "Merged {} updates of doc {}, {} pending",
            removed.len(),
            doc_id,
            kept.len()
        );
        Ok(removed.len())
    }

    // =========================================================================
    // History Operations
    // =========================================================================

    #[instrument(skip(self, snapshot), level = "debug", fields(doc_id = %snapshot.doc_id))]
    async fn create_doc_history(
        &self,
        snapshot: &DocRecord,
        force: bool,
    ) -> Result<bool, StorageError> {
        let last = self
            .history_timestamps(&snapshot.doc_id)
            .await?
            .last()
            .copied();

        if !self
            .history_policy
            .should_create(last, snapshot.timestamp, force)
        {
            return Ok(false);
        }

        let dir = self.history_dir(&snapshot.doc_id)?;
        ensure_dir(&dir).await?;
        write_json_atomic(&dir.join(format!("{}.json", snapshot.timestamp)), snapshot).await?;

        debug!(
            "Created history for doc {} at {}",
            snapshot.doc_id, snapshot.timestamp
        );
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_doc_histories(
        &self,
        doc_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        let timestamps = query.paginate(self.history_timestamps(doc_id).await?.into_iter().rev());
        if timestamps.is_empty() {
            return Ok(vec![]);
        }

        let editors = self.load_editors().await?;
        let mut entries = Vec::with_capacity(timestamps.len());
        for timestamp in timestamps {
            let editor = match self.get_doc_history(doc_id, timestamp).await? {
                Some(record) => record.editor.and_then(|id| editors.get(&id).cloned()),
                None => {
                    warn!("History row {} of doc {} disappeared", timestamp, doc_id);
                    continue;
                }
            };
            entries.push(HistoryEntry { timestamp, editor });
        }
        Ok(entries)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_doc_history(
        &self,
        doc_id: &str,
        timestamp: i64,
    ) -> Result<Option<DocRecord>, StorageError> {
        read_json(&self.history_dir(doc_id)?.join(format!("{}.json", timestamp))).await
    }

    // =========================================================================
    // Space Operations
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn get_space_doc_timestamps(
        &self,
        after: Option<i64>,
    ) -> Result<Option<HashMap<String, i64>>, StorageError> {
        let doc_ids = self.doc_ids().await?;
        if doc_ids.is_empty() {
            return Ok(None);
        }

        let mut timestamps = HashMap::new();
        for doc_id in doc_ids {
            let Some(timestamp) = self.latest_timestamp(&doc_id).await? else {
                continue;
            };
            if after.is_some_and(|after| timestamp <= after) {
                continue;
            }
            timestamps.insert(doc_id, timestamp);
        }
        Ok(Some(timestamps))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let existed = remove_dir_if_exists(&self.doc_dir(doc_id)?).await?;
        debug!("Deleted doc {} (existed: {})", doc_id, existed);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_space(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let existed = remove_dir_if_exists(&self.space_dir()).await?;
        info!("Deleted space {} (existed: {})", self.space_id, existed);
        Ok(())
    }
}
