use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::error;

/// Updates received for one document from a non-local origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocUpdateEvent {
    pub doc_id: String,
    pub updates: Vec<Vec<u8>>,
    pub timestamp: i64,
}

pub type UpdateListener = Arc<dyn Fn(&DocUpdateEvent) + Send + Sync>;

#[derive(Default)]
struct ListenerTable {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, UpdateListener)>>,
}

impl ListenerTable {
    fn remove(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(listener_id, _)| *listener_id != id);
    }
}

/// Ordered set of update listeners owned by one storage instance.
///
/// Cloning yields another handle to the same set.
#[derive(Clone, Default)]
pub struct UpdateListeners {
    table: Arc<ListenerTable>,
}

impl std::fmt::Debug for UpdateListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateListeners")
            .field("len", &self.len())
            .finish()
    }
}

impl UpdateListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It stays registered until the returned
    /// subscription is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DocUpdateEvent) + Send + Sync + 'static,
    {
        self.add(Arc::new(listener))
    }

    /// Register an already shared listener.
    pub fn add(&self, listener: UpdateListener) -> Subscription {
        let id = self.table.next_id.fetch_add(1, Ordering::Relaxed);
        self.table
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));

        Subscription {
            id,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Call every listener in registration order.
    ///
    /// A panicking listener is logged and skipped; the remaining listeners
    /// still run. Listeners may subscribe or unsubscribe while being called.
    pub fn dispatch(&self, event: &DocUpdateEvent) {
        let listeners: Vec<UpdateListener> = self
            .table
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(
                    "Update listener panicked while handling {} updates for doc {}",
                    event.updates.len(),
                    event.doc_id
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration token returned by `on_receive_doc_updates`.
///
/// Dropping it removes the listener.
#[must_use = "the listener is removed as soon as the subscription is dropped"]
pub struct Subscription {
    id: u64,
    table: Weak<ListenerTable>,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(self) {}
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(self.id);
        }
    }
}
