use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use marksync_core::{
    identity::SessionToken,
    ids::*,
    record::{Bookmark, NewBookmark},
};
use marksync_storage::{PushChannel, Query, RemoteStore, StorageError, Subscription, Topic};

/// A failure to inject into the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unavailable,
    Unauthorized,
}

impl Fault {
    fn into_error(self) -> StorageError {
        match self {
            Self::Unavailable => StorageError::Unavailable("injected fault".into()),
            Self::Unauthorized => StorageError::Unauthorized("injected fault".into()),
        }
    }
}

/// Remote store wrapper that can delay query responses and fail calls.
///
/// A held query has already read from the wrapped store; only its response
/// is delayed, like a slow network.
pub struct GatedRemote {
    inner: Arc<dyn RemoteStore>,
    gate: watch::Sender<bool>,
    held: AtomicUsize,
    queries: AtomicUsize,
    query_faults: Mutex<VecDeque<Fault>>,
    insert_faults: Mutex<VecDeque<Fault>>,
    delete_faults: Mutex<VecDeque<Fault>>,
}

impl GatedRemote {
    pub fn new(inner: Arc<dyn RemoteStore>) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner,
            gate,
            held: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            query_faults: Mutex::new(VecDeque::new()),
            insert_faults: Mutex::new(VecDeque::new()),
            delete_faults: Mutex::new(VecDeque::new()),
        }
    }

    pub fn hold_queries(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_queries(&self) {
        self.gate.send_replace(true);
    }

    /// Queries currently waiting on the gate.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn fail_next_query(&self, fault: Fault) {
        self.query_faults.lock().push_back(fault);
    }

    pub fn fail_next_insert(&self, fault: Fault) {
        self.insert_faults.lock().push_back(fault);
    }

    pub fn fail_next_delete(&self, fault: Fault) {
        self.delete_faults.lock().push_back(fault);
    }
}

#[async_trait]
impl RemoteStore for GatedRemote {
    async fn query(
        &self,
        token: &SessionToken,
        query: &Query,
    ) -> Result<Vec<Bookmark>, StorageError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let fault = self.query_faults.lock().pop_front();
        let result = match fault {
            Some(fault) => Err(fault.into_error()),
            None => self.inner.query(token, query).await,
        };

        let mut gate = self.gate.subscribe();
        let open = *gate.borrow_and_update();
        if !open {
            self.held.fetch_add(1, Ordering::SeqCst);
            drop(gate.wait_for(|open| *open).await);
            self.held.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    async fn insert(
        &self,
        token: &SessionToken,
        collection: &str,
        draft: &NewBookmark,
    ) -> Result<Bookmark, StorageError> {
        let fault = self.insert_faults.lock().pop_front();
        if let Some(fault) = fault {
            return Err(fault.into_error());
        }
        self.inner.insert(token, collection, draft).await
    }

    async fn delete(
        &self,
        token: &SessionToken,
        collection: &str,
        id: BookmarkId,
    ) -> Result<(), StorageError> {
        let fault = self.delete_faults.lock().pop_front();
        if let Some(fault) = fault {
            return Err(fault.into_error());
        }
        self.inner.delete(token, collection, id).await
    }
}

/// Push channel wrapper that fails subscribes on demand and records the
/// lifetime of every subscription it hands out.
pub struct FaultyChannel {
    inner: Arc<dyn PushChannel>,
    subscribe_faults: Mutex<VecDeque<Fault>>,
    subscribed: Mutex<Vec<SubscriptionId>>,
    unsubscribed: Mutex<Vec<SubscriptionId>>,
    attempts: AtomicUsize,
}

impl FaultyChannel {
    pub fn new(inner: Arc<dyn PushChannel>) -> Self {
        Self {
            inner,
            subscribe_faults: Mutex::new(VecDeque::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_subscribes(&self, count: usize, fault: Fault) {
        let mut faults = self.subscribe_faults.lock();
        faults.extend(std::iter::repeat_n(fault, count));
    }

    pub fn clear_faults(&self) {
        self.subscribe_faults.lock().clear();
    }

    /// Subscribe calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn subscribed(&self) -> Vec<SubscriptionId> {
        self.subscribed.lock().clone()
    }

    pub fn unsubscribed(&self) -> Vec<SubscriptionId> {
        self.unsubscribed.lock().clone()
    }

    /// Handed out and not yet released.
    pub fn active(&self) -> usize {
        let released = self.unsubscribed.lock();
        self.subscribed
            .lock()
            .iter()
            .filter(|handle| !released.contains(handle))
            .count()
    }
}

#[async_trait]
impl PushChannel for FaultyChannel {
    async fn subscribe(
        &self,
        token: &SessionToken,
        topic: &Topic,
    ) -> Result<Subscription, StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fault = self.subscribe_faults.lock().pop_front();
        if let Some(fault) = fault {
            return Err(fault.into_error());
        }
        let subscription = self.inner.subscribe(token, topic).await?;
        self.subscribed.lock().push(subscription.handle);
        Ok(subscription)
    }

    fn unsubscribe(&self, handle: SubscriptionId) {
        self.unsubscribed.lock().push(handle);
        self.inner.unsubscribe(handle);
    }
}
