//! Replication of one main storage to any number of followers.
//!
//! Writes go to main first and are mirrored to followers in the background.
//! Updates a follower receives from its peers are forwarded to main and
//! re-dispatched to listeners of the wrapper. On connect and after a rollback
//! the affected documents are reconciled by exchanging state vectors, so a
//! follower that was offline catches up in both directions.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::adapter::DocStorage;
use crate::error::{FollowerError, StorageError};
use crate::listener::{DocUpdateEvent, Subscription, UpdateListener, UpdateListeners};
use crate::model::{DocModel, YrsDocModel};
use crate::storage::{is_empty_bin, now_millis, DocDiff, DocRecord, HistoryEntry, HistoryQuery};

type Followers = Arc<[Arc<dyn DocStorage>]>;

/// Highest timestamps already reconciled with one follower, per side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SyncClock {
    main: Option<i64>,
    follower: Option<i64>,
}

impl SyncClock {
    /// Never moves past `started - 1`: a write stamped before the listing
    /// started may only become visible after the listing passed its doc.
    fn advance(current: Option<i64>, seen: &HashMap<String, i64>, started: i64) -> Option<i64> {
        let seen = seen.values().max().map(|&max| max.min(started - 1));
        match (current, seen) {
            (Some(current), Some(seen)) => Some(current.max(seen)),
            (current, seen) => current.or(seen),
        }
    }
}

/// Background mirror and reconcile tasks.
#[derive(Clone, Default)]
struct BackgroundTasks {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    fn pending(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(handle) = Handle::try_current() else {
            error!("No tokio runtime available, dropping background sync task");
            return;
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(task, &handle);
    }

    /// Wait for every task, including tasks spawned while waiting.
    async fn flush(&self) {
        loop {
            let mut pending = std::mem::take(
                &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
            );
            if pending.is_empty() {
                return;
            }

            while let Some(result) = pending.join_next().await {
                if let Err(e) = result {
                    error!("Background sync task failed: {}", e);
                }
            }
        }
    }
}

/// Run `action` against every follower concurrently and log each failure.
async fn iterate_followers<F, Fut>(followers: &[Arc<dyn DocStorage>], action: &str, f: F)
where
    F: Fn(usize, Arc<dyn DocStorage>) -> Fut,
    Fut: Future<Output = Result<(), StorageError>>,
{
    let results = join_all(
        followers
            .iter()
            .enumerate()
            .map(|(index, follower)| f(index, Arc::clone(follower))),
    )
    .await;

    for (follower, result) in results.into_iter().enumerate() {
        if let Err(source) = result {
            let err = FollowerError { follower, source };
            warn!(
                "Failed to {} on {}: {}",
                action,
                followers[follower].storage_name(),
                err
            );
        }
    }
}

fn non_empty(diff: Option<DocDiff>) -> Option<Vec<u8>> {
    diff.map(|d| d.missing).filter(|bin| !is_empty_bin(bin))
}

/// `missing` unless the receiver, whose full state is `receiver`, already has it.
fn news_for(
    model: &dyn DocModel,
    receiver: &[u8],
    missing: Option<Vec<u8>>,
) -> Result<Option<Vec<u8>>, StorageError> {
    match missing {
        Some(bin) if model.contains_update(receiver, &bin)? => Ok(None),
        missing => Ok(missing),
    }
}

/// Exchange what each side is missing for one document.
async fn sync_doc(
    model: &dyn DocModel,
    main: &Arc<dyn DocStorage>,
    follower: &Arc<dyn DocStorage>,
    doc_id: &str,
) -> Result<(), StorageError> {
    let main_state = main.get_doc_diff(doc_id, None).await?;
    let follower_state = follower.get_doc_diff(doc_id, None).await?;

    let (pull, push) = match (main_state, follower_state) {
        (None, None) => (None, None),
        (Some(main_doc), None) => (None, non_empty(Some(main_doc))),
        (None, Some(follower_doc)) => (non_empty(Some(follower_doc)), None),
        (Some(main_doc), Some(follower_doc)) => {
            let pull = non_empty(follower.get_doc_diff(doc_id, Some(&main_doc.state)).await?);
            let push = non_empty(main.get_doc_diff(doc_id, Some(&follower_doc.state)).await?);
            (
                news_for(model, &main_doc.missing, pull)?,
                news_for(model, &follower_doc.missing, push)?,
            )
        }
    };

    if let Some(bin) = pull {
        main.push_doc_updates(doc_id, &[bin], None).await?;
    }
    if let Some(bin) = push {
        follower.push_doc_updates(doc_id, &[bin], None).await?;
    }
    Ok(())
}

/// Reconcile every document changed on either side since the last pass.
async fn sync_follower(
    model: &dyn DocModel,
    main: &Arc<dyn DocStorage>,
    follower: &Arc<dyn DocStorage>,
    clock: &tokio::sync::Mutex<SyncClock>,
) -> Result<(), StorageError> {
    let mut clock = clock.lock().await;

    let started = now_millis();
    let main_changed = main
        .get_space_doc_timestamps(clock.main)
        .await?
        .unwrap_or_default();
    let follower_changed = follower
        .get_space_doc_timestamps(clock.follower)
        .await?
        .unwrap_or_default();

    let docs: BTreeSet<&String> = main_changed.keys().chain(follower_changed.keys()).collect();
    for doc_id in &docs {
        sync_doc(model, main, follower, doc_id).await?;
    }

    clock.main = SyncClock::advance(clock.main, &main_changed, started);
    clock.follower = SyncClock::advance(clock.follower, &follower_changed, started);
    debug!(
        "Reconciled {} docs with {} (clock {:?})",
        docs.len(),
        follower.storage_name(),
        *clock
    );
    Ok(())
}

async fn sync_all(
    model: Arc<dyn DocModel>,
    main: Arc<dyn DocStorage>,
    followers: Followers,
    clocks: Arc<[tokio::sync::Mutex<SyncClock>]>,
) {
    let model = model.as_ref();
    let main = &main;
    let clocks = &clocks;
    iterate_followers(&followers, "sync", move |index, follower| async move {
        sync_follower(model, main, &follower, &clocks[index]).await
    })
    .await;
}

/// A [`DocStorage`] that keeps followers in step with a main storage.
///
/// Reads are answered by main. Follower failures never fail the caller; they
/// are logged and retried on the next reconciliation.
///
/// Mirroring runs in background tasks owned by the wrapper. Dropping it aborts
/// the ones still running, so call [`AutoSyncDocStorage::flush`] or
/// `disconnect` first.
pub struct AutoSyncDocStorage {
    model: Arc<dyn DocModel>,
    main: Arc<dyn DocStorage>,
    followers: Followers,
    listeners: UpdateListeners,
    subscriptions: Mutex<Vec<Subscription>>,
    tasks: BackgroundTasks,
    clocks: Arc<[tokio::sync::Mutex<SyncClock>]>,
}

impl AutoSyncDocStorage {
    pub fn new(main: Arc<dyn DocStorage>, followers: Vec<Arc<dyn DocStorage>>) -> Self {
        let clocks = followers
            .iter()
            .map(|_| tokio::sync::Mutex::new(SyncClock::default()))
            .collect();
        Self {
            model: Arc::new(YrsDocModel::new()),
            main,
            followers: followers.into(),
            listeners: UpdateListeners::new(),
            subscriptions: Mutex::new(Vec::new()),
            tasks: BackgroundTasks::default(),
            clocks,
        }
    }

    /// Use another document model to compare states during reconciliation.
    pub fn with_model(mut self, model: Arc<dyn DocModel>) -> Self {
        self.model = model;
        self
    }

    pub fn main(&self) -> &Arc<dyn DocStorage> {
        &self.main
    }

    pub fn followers(&self) -> &[Arc<dyn DocStorage>] {
        &self.followers
    }

    /// Run `f` against every follower concurrently. Failures are logged with
    /// the follower's name; this never fails and never stops early.
    pub async fn iterate_followers<F, Fut>(&self, action: &str, f: F)
    where
        F: Fn(usize, Arc<dyn DocStorage>) -> Fut,
        Fut: Future<Output = Result<(), StorageError>>,
    {
        iterate_followers(&self.followers, action, f).await;
    }

    /// Forward follower updates into main and start an initial
    /// reconciliation in the background.
    pub fn start_sync(&self) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscriptions.clear();

        for follower in self.followers.iter() {
            let main = Arc::clone(&self.main);
            let listeners = self.listeners.clone();
            let tasks = self.tasks.clone();
            let source = follower.storage_name().to_string();

            subscriptions.push(follower.on_receive_doc_updates(Arc::new(
                move |event: &DocUpdateEvent| {
                    let main = Arc::clone(&main);
                    let forwarded = event.clone();
                    let source = source.clone();
                    tasks.spawn(async move {
                        if let Err(e) = main
                            .push_doc_updates(&forwarded.doc_id, &forwarded.updates, None)
                            .await
                        {
                            warn!(
                                "Failed to forward updates of doc {} from {} to main: {}",
                                forwarded.doc_id, source, e
                            );
                        }
                    });
                    listeners.dispatch(event);
                },
            )));
        }
        drop(subscriptions);

        self.tasks.spawn(sync_all(
            Arc::clone(&self.model),
            Arc::clone(&self.main),
            Arc::clone(&self.followers),
            Arc::clone(&self.clocks),
        ));
    }

    /// Reconcile every follower with main and wait for the result.
    pub async fn sync(&self) {
        sync_all(
            Arc::clone(&self.model),
            Arc::clone(&self.main),
            Arc::clone(&self.followers),
            Arc::clone(&self.clocks),
        )
        .await;
    }

    /// Reconcile one document with every follower.
    pub async fn sync_doc(&self, doc_id: &str) {
        let model = self.model.as_ref();
        let main = &self.main;
        iterate_followers(&self.followers, "sync doc", move |_, follower| async move {
            sync_doc(model, main, &follower, doc_id).await
        })
        .await;
    }

    /// Wait for all background mirror and reconcile tasks.
    pub async fn flush(&self) {
        self.tasks.flush().await;
    }

    fn mirror<F, Fut>(&self, action: &'static str, f: F)
    where
        F: Fn(Arc<dyn DocStorage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StorageError>> + Send + 'static,
    {
        let followers = Arc::clone(&self.followers);
        self.tasks.spawn(async move {
            let f = &f;
            iterate_followers(&followers, action, move |_, follower| f(follower)).await;
        });
    }
}

impl Drop for AutoSyncDocStorage {
    fn drop(&mut self) {
        let pending = self.tasks.pending();
        if pending > 0 {
            warn!(
                "Dropping auto-sync storage of space {} aborts {} background sync tasks",
                self.main.space_id(),
                pending
            );
        }
    }
}

#[async_trait]
impl DocStorage for AutoSyncDocStorage {
    fn space_id(&self) -> &str {
        self.main.space_id()
    }

    fn storage_name(&self) -> &str {
        "auto-sync"
    }

    #[instrument(skip(self), level = "debug")]
    async fn connect(&self) -> Result<(), StorageError> {
        self.main.connect().await?;
        self.iterate_followers("connect", |_, follower| async move {
            follower.connect().await
        })
        .await;
        self.start_sync();

        info!(
            "Connected space {} with {} followers",
            self.space_id(),
            self.followers.len()
        );
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn disconnect(&self) -> Result<(), StorageError> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.flush().await;

        let result = self.main.disconnect().await;
        self.iterate_followers("disconnect", |_, follower| async move {
            follower.disconnect().await
        })
        .await;
        result
    }

    async fn get_doc(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        self.main.get_doc(doc_id).await
    }

    async fn get_doc_diff(
        &self,
        doc_id: &str,
        state_vector: Option<&[u8]>,
    ) -> Result<Option<DocDiff>, StorageError> {
        self.main.get_doc_diff(doc_id, state_vector).await
    }

    #[instrument(skip(self, updates), level = "debug", fields(updates_count = updates.len()))]
    async fn push_doc_updates(
        &self,
        doc_id: &str,
        updates: &[Vec<u8>],
        editor_id: Option<&str>,
    ) -> Result<usize, StorageError> {
        let count = self.main.push_doc_updates(doc_id, updates, editor_id).await?;

        let doc_id = doc_id.to_string();
        let updates = updates.to_vec();
        let editor_id = editor_id.map(str::to_string);
        self.mirror("push updates", move |follower| {
            let doc_id = doc_id.clone();
            let updates = updates.clone();
            let editor_id = editor_id.clone();
            async move {
                follower
                    .push_doc_updates(&doc_id, &updates, editor_id.as_deref())
                    .await
                    .map(|_| ())
            }
        });
        Ok(count)
    }

    #[instrument(skip(self), level = "debug")]
    async fn rollback_doc(
        &self,
        doc_id: &str,
        timestamp: i64,
        editor_id: Option<&str>,
    ) -> Result<(), StorageError> {
        self.main.rollback_doc(doc_id, timestamp, editor_id).await?;
        self.sync_doc(doc_id).await;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        self.main.delete_doc(doc_id).await?;

        let doc_id = doc_id.to_string();
        self.mirror("delete doc", move |follower| {
            let doc_id = doc_id.clone();
            async move { follower.delete_doc(&doc_id).await }
        });
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_space(&self) -> Result<(), StorageError> {
        self.main.delete_space().await?;
        self.mirror("delete space", |follower| async move {
            follower.delete_space().await
        });
        Ok(())
    }

    async fn get_space_doc_timestamps(
        &self,
        after: Option<i64>,
    ) -> Result<Option<HashMap<String, i64>>, StorageError> {
        self.main.get_space_doc_timestamps(after).await
    }

    async fn list_doc_histories(
        &self,
        doc_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        self.main.list_doc_histories(doc_id, query).await
    }

    async fn get_doc_history(
        &self,
        doc_id: &str,
        timestamp: i64,
    ) -> Result<Option<DocRecord>, StorageError> {
        self.main.get_doc_history(doc_id, timestamp).await
    }

    fn on_receive_doc_updates(&self, listener: UpdateListener) -> Subscription {
        self.listeners.add(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DocStorageAdapter;
    use crate::memory::MemoryDocBackend;
    use crate::storage::DocBackend;
    use crate::test_support::{append_text, text_of, text_update};
    use std::sync::atomic::{AtomicUsize, Ordering};

    type MemoryStorage = DocStorageAdapter<MemoryDocBackend>;

    /// A follower whose every operation fails.
    struct FailingStorage {
        listeners: UpdateListeners,
        disconnects: AtomicUsize,
    }

    impl FailingStorage {
        fn new() -> Self {
            Self {
                listeners: UpdateListeners::new(),
                disconnects: AtomicUsize::new(0),
            }
        }

        fn err() -> StorageError {
            StorageError::Io("follower offline".to_string())
        }
    }

    #[async_trait]
    impl DocStorage for FailingStorage {
        fn space_id(&self) -> &str {
            "s1"
        }

        fn storage_name(&self) -> &str {
            "failing"
        }

        async fn connect(&self) -> Result<(), StorageError> {
            Err(Self::err())
        }

        async fn disconnect(&self) -> Result<(), StorageError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Err(Self::err())
        }

        async fn get_doc(&self, _: &str) -> Result<Option<DocRecord>, StorageError> {
            Err(Self::err())
        }

        async fn get_doc_diff(
            &self,
            _: &str,
            _: Option<&[u8]>,
        ) -> Result<Option<DocDiff>, StorageError> {
            Err(Self::err())
        }

        async fn push_doc_updates(
            &self,
            _: &str,
            _: &[Vec<u8>],
            _: Option<&str>,
        ) -> Result<usize, StorageError> {
            Err(Self::err())
        }

        async fn rollback_doc(&self, _: &str, _: i64, _: Option<&str>) -> Result<(), StorageError> {
            Err(Self::err())
        }

        async fn delete_doc(&self, _: &str) -> Result<(), StorageError> {
            Err(Self::err())
        }

        async fn delete_space(&self) -> Result<(), StorageError> {
            Err(Self::err())
        }

        async fn get_space_doc_timestamps(
            &self,
            _: Option<i64>,
        ) -> Result<Option<HashMap<String, i64>>, StorageError> {
            Err(Self::err())
        }

        async fn list_doc_histories(
            &self,
            _: &str,
            _: HistoryQuery,
        ) -> Result<Vec<HistoryEntry>, StorageError> {
            Err(Self::err())
        }

        async fn get_doc_history(&self, _: &str, _: i64) -> Result<Option<DocRecord>, StorageError> {
            Err(Self::err())
        }

        fn on_receive_doc_updates(&self, listener: UpdateListener) -> Subscription {
            self.listeners.add(listener)
        }
    }

    fn memory_storage() -> Arc<MemoryStorage> {
        Arc::new(DocStorageAdapter::new(MemoryDocBackend::new("s1")))
    }

    async fn content(storage: &dyn DocStorage, doc_id: &str) -> Option<String> {
        storage
            .get_doc(doc_id)
            .await
            .unwrap()
            .map(|record| text_of(&record.bin))
    }

    async fn setup() -> (AutoSyncDocStorage, Arc<MemoryStorage>, Arc<MemoryStorage>) {
        let main = memory_storage();
        let follower = memory_storage();
        let storage = AutoSyncDocStorage::new(main.clone(), vec![follower.clone() as Arc<dyn DocStorage>]);
        storage.connect().await.unwrap();
        storage.flush().await;
        (storage, main, follower)
    }

    #[tokio::test]
    async fn test_push_mirrors_to_followers() {
        let (storage, main, follower) = setup().await;
        let (_doc, bin) = text_update("mirrored");

        let count = storage
            .push_doc_updates("d1", &[bin], Some("alice"))
            .await
            .unwrap();
        assert_eq!(count, 1);
        storage.flush().await;

        assert_eq!(content(main.as_ref(), "d1").await.as_deref(), Some("mirrored"));
        let record = follower.get_doc("d1").await.unwrap().unwrap();
        assert_eq!(text_of(&record.bin), "mirrored");
        assert_eq!(record.editor.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_failing_follower_is_isolated() {
        let main = memory_storage();
        let healthy = memory_storage();
        let storage = AutoSyncDocStorage::new(
            main.clone(),
            vec![
                Arc::new(FailingStorage::new()) as Arc<dyn DocStorage>,
                healthy.clone(),
            ],
        );
        storage.connect().await.unwrap();

        let (_doc, bin) = text_update("still works");
        assert_eq!(storage.push_doc_updates("d1", &[bin], None).await.unwrap(), 1);
        storage.delete_doc("d2").await.unwrap();
        storage.flush().await;

        assert_eq!(content(healthy.as_ref(), "d1").await.as_deref(), Some("still works"));
        assert_eq!(content(&storage, "d1").await.as_deref(), Some("still works"));
        storage.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_main_fails_connect() {
        let storage = AutoSyncDocStorage::new(Arc::new(FailingStorage::new()), vec![]);
        assert!(matches!(storage.connect().await, Err(StorageError::Io(_))));
    }

    #[tokio::test]
    async fn test_received_updates_reach_main_and_listeners() {
        let (storage, main, follower) = setup().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _subscription = storage.on_receive_doc_updates(Arc::new(move |e: &DocUpdateEvent| {
            assert_eq!(e.doc_id, "d1");
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let (_doc, bin) = text_update("from peer");
        follower
            .receive_doc_updates("d1", &[bin], Some("peer"))
            .await
            .unwrap();
        storage.flush().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(content(main.as_ref(), "d1").await.as_deref(), Some("from peer"));
    }

    #[tokio::test]
    async fn test_connect_reconciles_both_directions() {
        let main = memory_storage();
        let follower = memory_storage();

        let (shared, base) = text_update("shared");
        main.push_doc_updates("only-main", &[text_update("main").1], None)
            .await
            .unwrap();
        follower
            .push_doc_updates("only-follower", &[text_update("follower").1], None)
            .await
            .unwrap();
        main.push_doc_updates("both", &[base.clone()], None).await.unwrap();
        follower
            .push_doc_updates("both", &[base, append_text(&shared, "!")], None)
            .await
            .unwrap();

        let storage =
            AutoSyncDocStorage::new(main.clone(), vec![follower.clone() as Arc<dyn DocStorage>]);
        storage.connect().await.unwrap();
        storage.flush().await;

        assert_eq!(content(follower.as_ref(), "only-main").await.as_deref(), Some("main"));
        assert_eq!(content(main.as_ref(), "only-follower").await.as_deref(), Some("follower"));
        assert_eq!(content(main.as_ref(), "both").await.as_deref(), Some("shared!"));
        assert_eq!(content(follower.as_ref(), "both").await.as_deref(), Some("shared!"));

        // A second pass has nothing to exchange
        storage.sync().await;
        assert_eq!(content(main.as_ref(), "both").await.as_deref(), Some("shared!"));
    }

    #[tokio::test]
    async fn test_rollback_reaches_followers() {
        let (storage, main, follower) = setup().await;
        let (doc, first) = text_update("Hello");

        storage.push_doc_updates("d1", &[first], None).await.unwrap();
        let v1 = storage.get_doc("d1").await.unwrap().unwrap();
        storage
            .push_doc_updates("d1", &[append_text(&doc, " world")], None)
            .await
            .unwrap();
        storage.get_doc("d1").await.unwrap();
        storage.flush().await;
        assert_eq!(content(follower.as_ref(), "d1").await.as_deref(), Some("Hello world"));

        storage.rollback_doc("d1", v1.timestamp, None).await.unwrap();

        assert_eq!(content(main.as_ref(), "d1").await.as_deref(), Some("Hello"));
        assert_eq!(content(follower.as_ref(), "d1").await.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn test_delete_space_mirrors() {
        let (storage, _main, follower) = setup().await;
        storage
            .push_doc_updates("d1", &[text_update("x").1], None)
            .await
            .unwrap();
        storage.flush().await;

        storage.delete_space().await.unwrap();
        storage.flush().await;

        assert!(follower.get_doc("d1").await.unwrap().is_none());
        assert!(storage.get_space_doc_timestamps(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_stops_forwarding() {
        let (storage, main, follower) = setup().await;
        storage.disconnect().await.unwrap();

        follower
            .receive_doc_updates("d1", &[text_update("late").1], None)
            .await
            .unwrap();
        storage.flush().await;

        assert!(main.get_doc("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_after_rollback_converges() {
        let (storage, main, follower) = setup().await;
        let (doc, first) = text_update("Hello");

        storage.push_doc_updates("d1", &[first], None).await.unwrap();
        let v1 = storage.get_doc("d1").await.unwrap().unwrap();
        storage
            .push_doc_updates("d1", &[append_text(&doc, " world")], None)
            .await
            .unwrap();
        storage.get_doc("d1").await.unwrap();
        storage.flush().await;

        storage.rollback_doc("d1", v1.timestamp, None).await.unwrap();
        main.get_doc("d1").await.unwrap();
        follower.get_doc("d1").await.unwrap();

        for pass in 0..3 {
            storage.sync().await;
            let main_pending = main.backend().get_doc_updates("d1").await.unwrap();
            let follower_pending = follower.backend().get_doc_updates("d1").await.unwrap();
            assert!(main_pending.is_empty(), "pass {} pushed to main", pass);
            assert!(follower_pending.is_empty(), "pass {} pushed to follower", pass);
        }
        assert_eq!(content(main.as_ref(), "d1").await.as_deref(), Some("Hello"));
        assert_eq!(content(follower.as_ref(), "d1").await.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn test_history_is_answered_by_main() {
        let main = memory_storage();
        let storage = AutoSyncDocStorage::new(
            main.clone(),
            vec![Arc::new(FailingStorage::new()) as Arc<dyn DocStorage>],
        );
        storage.connect().await.unwrap();

        let (doc, first) = text_update("v1");
        storage.push_doc_updates("d1", &[first], None).await.unwrap();
        let v1 = storage.get_doc("d1").await.unwrap().unwrap();
        storage
            .push_doc_updates("d1", &[append_text(&doc, " v2")], None)
            .await
            .unwrap();
        storage.get_doc("d1").await.unwrap();
        storage.flush().await;

        let histories = storage
            .list_doc_histories("d1", HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(
            histories,
            main.list_doc_histories("d1", HistoryQuery::default())
                .await
                .unwrap()
        );
        assert_eq!(histories.len(), 1);

        let stored = storage
            .get_doc_history("d1", v1.timestamp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text_of(&stored.bin), "v1");
    }

    #[tokio::test]
    async fn test_failing_main_still_disconnects_followers() {
        let follower = Arc::new(FailingStorage::new());
        let storage = AutoSyncDocStorage::new(
            Arc::new(FailingStorage::new()),
            vec![follower.clone() as Arc<dyn DocStorage>],
        );

        assert!(matches!(storage.disconnect().await, Err(StorageError::Io(_))));
        assert_eq!(follower.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_background_tasks_pending() {
        let tasks = BackgroundTasks::default();
        assert_eq!(tasks.pending(), 0);

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        tasks.spawn(async move {
            let _ = wait.await;
        });
        tasks.spawn(async {});
        tokio::task::yield_now().await;
        assert!(tasks.pending() >= 1);

        release.send(()).unwrap();
        tasks.flush().await;
        assert_eq!(tasks.pending(), 0);
    }

    #[test]
    fn test_sync_clock_advance() {
        let seen = HashMap::from([("a".to_string(), 5), ("b".to_string(), 9)]);
        assert_eq!(SyncClock::advance(None, &seen, 100), Some(9));
        assert_eq!(SyncClock::advance(Some(12), &seen, 100), Some(12));
        assert_eq!(SyncClock::advance(Some(3), &HashMap::new(), 100), Some(3));
        assert_eq!(SyncClock::advance(None, &HashMap::new(), 100), None);
    }

    #[test]
    fn test_sync_clock_stops_before_listing_start() {
        let seen = HashMap::from([("a".to_string(), 50), ("b".to_string(), 70)]);
        assert_eq!(SyncClock::advance(None, &seen, 60), Some(59));
        assert_eq!(SyncClock::advance(Some(65), &seen, 60), Some(65));
    }
}
