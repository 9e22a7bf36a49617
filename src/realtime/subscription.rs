//! Reference-counted live subscriptions.
//!
//! A [`SubscriptionManager`] owns at most one listener task per resource key.
//! The task loads a snapshot, publishes it on a `watch` channel and reloads
//! whenever the [`ChangeFeed`] announces the key's topic. Every
//! [`Subscription`] for the same key shares that task; the last one dropped
//! tears it down. A new subscriber immediately sees the latest snapshot.
//!
//! Transient load failures ([`Error::BackendUnavailable`]) are retried after the
//! configured delay instead of being surfaced to subscribers. Any other failure
//! is published to every subscriber as [`Error::SubscriptionFailed`]; the
//! listener keeps running and the next change reloads the snapshot.

use super::feed::{ChangeFeed, Topic};
use crate::errors::{Error, Result};
use sea_orm::DatabaseConnection;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A query whose result can be watched live.
pub trait SnapshotQuery: Send + Sync + 'static {
    /// The value subscribers receive
    type Snapshot: Clone + Send + Sync + 'static;

    /// Name used in logs
    const NAME: &'static str;

    /// The change topic that invalidates the snapshot for `key`.
    fn topic(key: &str) -> Topic;

    /// Loads the current snapshot for `key`.
    fn load(
        db: &DatabaseConnection,
        key: &str,
    ) -> impl Future<Output = Result<Self::Snapshot>> + Send;
}

/// What the listener last produced for its key.
#[derive(Debug, Clone)]
enum Slot<T> {
    Loading,
    Ready(T),
    Failed(String),
}

struct Listener<T> {
    id: u64,
    refs: usize,
    receiver: watch::Receiver<Slot<T>>,
    task: JoinHandle<()>,
}

struct ListenerTable<T> {
    next_id: u64,
    listeners: HashMap<String, Listener<T>>,
}

type Registry<T> = Mutex<ListenerTable<T>>;

fn lock<T>(registry: &Registry<T>) -> MutexGuard<'_, ListenerTable<T>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the listener tasks for one kind of query, keyed by resource id.
pub struct SubscriptionManager<Q: SnapshotQuery> {
    database: DatabaseConnection,
    feed: ChangeFeed,
    retry_delay: Duration,
    registry: Arc<Registry<Q::Snapshot>>,
    _query: PhantomData<fn() -> Q>,
}

impl<Q: SnapshotQuery> SubscriptionManager<Q> {
    /// Creates a manager with no listeners.
    pub fn new(database: DatabaseConnection, feed: ChangeFeed, retry_delay: Duration) -> Self {
        Self {
            database,
            feed,
            retry_delay,
            registry: Arc::new(Mutex::new(ListenerTable {
                next_id: 0,
                listeners: HashMap::new(),
            })),
            _query: PhantomData,
        }
    }

    /// Subscribes to `key`, starting a listener only if none is running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, key: &str) -> Subscription<Q::Snapshot> {
        let mut table = lock(&self.registry);

        if let Some(listener) = table.listeners.get_mut(key) {
            listener.refs += 1;
            debug!(query = Q::NAME, key, refs = listener.refs, "sharing listener");
            return Subscription {
                key: key.to_string(),
                listener_id: listener.id,
                receiver: listener.receiver.clone(),
                registry: Arc::downgrade(&self.registry),
            };
        }

        let id = table.next_id;
        table.next_id += 1;

        let (sender, receiver) = watch::channel(Slot::Loading);
        // Subscribe to the feed before the first load so no change is missed.
        let events = self.feed.subscribe();
        let task = tokio::spawn(run_listener::<Q>(
            self.database.clone(),
            key.to_string(),
            events,
            sender,
            self.retry_delay,
        ));
        info!(query = Q::NAME, key, "listener started");

        table.listeners.insert(
            key.to_string(),
            Listener {
                id,
                refs: 1,
                receiver: receiver.clone(),
                task,
            },
        );

        Subscription {
            key: key.to_string(),
            listener_id: id,
            receiver,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Number of running listeners.
    pub fn active_listeners(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    /// Number of live subscriptions sharing the listener for `key`.
    pub fn ref_count(&self, key: &str) -> usize {
        lock(&self.registry)
            .listeners
            .get(key)
            .map_or(0, |listener| listener.refs)
    }

    /// Stops the listener for `key` regardless of outstanding subscriptions.
    ///
    /// Outstanding subscriptions observe [`Error::SubscriptionClosed`].
    pub fn close(&self, key: &str) {
        if let Some(listener) = lock(&self.registry).listeners.remove(key) {
            listener.task.abort();
            info!(query = Q::NAME, key, "listener closed");
        }
    }

    /// Stops every listener.
    pub fn close_all(&self) {
        let drained: Vec<(String, Listener<Q::Snapshot>)> =
            lock(&self.registry).listeners.drain().collect();
        for (key, listener) in drained {
            listener.task.abort();
            debug!(query = Q::NAME, key, "listener closed");
        }
    }
}

impl<Q: SnapshotQuery> Drop for SubscriptionManager<Q> {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// A handle on a live snapshot. Dropping it releases its share of the listener.
pub struct Subscription<T> {
    key: String,
    listener_id: u64,
    receiver: watch::Receiver<Slot<T>>,
    registry: Weak<Registry<T>>,
}

impl<T: Clone> Subscription<T> {
    /// Resource key this subscription watches.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Latest snapshot, `None` until a load succeeds or while the last load failed.
    pub fn current(&self) -> Option<T> {
        match &*self.receiver.borrow() {
            Slot::Ready(snapshot) => Some(snapshot.clone()),
            Slot::Loading | Slot::Failed(_) => None,
        }
    }

    /// Waits for the first available snapshot (the replay).
    pub async fn first(&mut self) -> Result<T> {
        self.wait_for(|_| true).await
    }

    /// Waits until a snapshot satisfies `predicate`, checking the current one first.
    ///
    /// Returns [`Error::SubscriptionFailed`] as soon as a load fails.
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Result<T> {
        let slot = self
            .receiver
            .wait_for(|slot| match slot {
                Slot::Loading => false,
                Slot::Ready(snapshot) => predicate(snapshot),
                Slot::Failed(_) => true,
            })
            .await
            .map_err(|_| Error::SubscriptionClosed {
                key: self.key.clone(),
            })?
            .clone();
        self.resolve(slot)
    }

    /// Waits for the next snapshot or failure newer than the last one observed.
    pub async fn next(&mut self) -> Result<T> {
        loop {
            self.receiver
                .changed()
                .await
                .map_err(|_| Error::SubscriptionClosed {
                    key: self.key.clone(),
                })?;
            let slot = self.receiver.borrow_and_update().clone();
            if !matches!(slot, Slot::Loading) {
                return self.resolve(slot);
            }
        }
    }

    fn resolve(&self, slot: Slot<T>) -> Result<T> {
        match slot {
            Slot::Ready(snapshot) => Ok(snapshot),
            Slot::Failed(message) => Err(Error::SubscriptionFailed {
                key: self.key.clone(),
                message,
            }),
            Slot::Loading => Err(Error::SubscriptionClosed {
                key: self.key.clone(),
            }),
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut table = lock(&registry);
        let Some(listener) = table.listeners.get_mut(&self.key) else {
            return;
        };
        if listener.id != self.listener_id {
            return;
        }

        listener.refs = listener.refs.saturating_sub(1);
        if listener.refs > 0 {
            return;
        }
        if let Some(listener) = table.listeners.remove(&self.key) {
            listener.task.abort();
            debug!(key = %self.key, "last subscriber left, listener stopped");
        }
    }
}

async fn run_listener<Q: SnapshotQuery>(
    database: DatabaseConnection,
    key: String,
    mut events: broadcast::Receiver<Topic>,
    sender: watch::Sender<Slot<Q::Snapshot>>,
    retry_delay: Duration,
) {
    let topic = Q::topic(&key);
    loop {
        match Q::load(&database, &key).await {
            Ok(snapshot) => {
                sender.send_replace(Slot::Ready(snapshot));
            }
            Err(e) if e.is_transient() => {
                warn!(
                    query = Q::NAME,
                    key = %key,
                    "load failed, retrying in {:?}: {}",
                    retry_delay,
                    e
                );
                tokio::time::sleep(retry_delay).await;
                continue;
            }
            Err(e) => {
                error!(query = Q::NAME, key = %key, "load failed: {}", e);
                sender.send_replace(Slot::Failed(e.to_string()));
            }
        }

        if !wait_for_change(&mut events, &topic).await {
            debug!(query = Q::NAME, key = %key, "change feed closed");
            return;
        }
    }
}

async fn wait_for_change(events: &mut broadcast::Receiver<Topic>, topic: &Topic) -> bool {
    loop {
        match events.recv().await {
            Ok(changed) if &changed == topic => return true,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "change feed lagged, reloading");
                return true;
            }
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}
