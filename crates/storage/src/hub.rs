use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::{debug, warn};

use marksync_core::{feed::FeedEvent, ids::*};

use crate::error::StorageError;
use crate::traits::{Subscription, Topic};

pub const DEFAULT_FEED_CAPACITY: usize = 256;

struct Subscriber {
    topic: Topic,
    tx: mpsc::Sender<Vec<u8>>,
}

/// In-process fan-out of change events to topic subscribers.
///
/// Events travel as msgpack frames so subscribers exercise the same decode
/// path a network transport would. A subscriber whose buffer is full is
/// disconnected rather than allowed to stall publishers; its stream ends and
/// the receiving side is expected to resubscribe.
pub struct PushHub {
    capacity: usize,
    subscribers: Mutex<BTreeMap<SubscriptionId, Subscriber>>,
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl PushHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let handle = SubscriptionId::new();
        debug!(%handle, owner = %topic.owner, collection = %topic.collection, "feed subscriber registered");
        self.subscribers.lock().insert(handle, Subscriber { topic, tx });

        let events = ReceiverStream::new(rx)
            .map(|frame| FeedEvent::from_msgpack(&frame).map_err(StorageError::from));
        Subscription {
            handle,
            events: Box::pin(events),
        }
    }

    /// Returns whether the handle was registered.
    pub fn remove(&self, handle: SubscriptionId) -> bool {
        let removed = self.subscribers.lock().remove(&handle).is_some();
        if removed {
            debug!(%handle, "feed subscriber removed");
        }
        removed
    }

    /// Deliver `event` to every subscriber of (`collection`, `owner`).
    /// Returns the number of subscribers that accepted the frame.
    pub fn publish(
        &self,
        collection: &str,
        owner: SubjectId,
        event: &FeedEvent,
    ) -> Result<usize, StorageError> {
        let frame = event.to_msgpack()?;
        Ok(self.publish_frame(collection, owner, frame))
    }

    /// Deliver an already-encoded frame. Exposed so tests can push frames a
    /// well-behaved publisher would never produce.
    pub fn publish_frame(&self, collection: &str, owner: SubjectId, frame: Vec<u8>) -> usize {
        let mut subscribers = self.subscribers.lock();
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (handle, sub) in subscribers.iter() {
            if sub.topic.owner != owner || sub.topic.collection != collection {
                continue;
            }
            match sub.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(%handle, "feed subscriber lagging, disconnecting");
                    dead.push(*handle);
                }
                Err(TrySendError::Closed(_)) => dead.push(*handle),
            }
        }

        for handle in dead {
            subscribers.remove(&handle);
        }
        delivered
    }

    /// Drop every subscriber of `owner`, ending their streams.
    pub fn disconnect_owner(&self, owner: SubjectId) -> usize {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|_, sub| sub.topic.owner != owner);
        before - subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn subscriber_count_for(&self, owner: SubjectId) -> usize {
        self.subscribers
            .lock()
            .values()
            .filter(|sub| sub.topic.owner == owner)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marksync_core::{hlc::Hlc, record::Bookmark};

    fn owner(byte: u8) -> SubjectId {
        SubjectId::from_bytes([byte; 32])
    }

    fn insert_for(owner: SubjectId) -> FeedEvent {
        FeedEvent::Insert(Bookmark {
            id: BookmarkId::new(),
            title: "Example".into(),
            url: "https://example.com".into(),
            owner_id: owner,
            created_at: Hlc::new(10, 0),
            revision: Hlc::new(10, 0),
        })
    }

    #[tokio::test]
    async fn publish_reaches_only_matching_topic() {
        let hub = PushHub::new(8);
        let mut mine = hub.register(Topic::new("book_mark", owner(1)));
        let _theirs = hub.register(Topic::new("book_mark", owner(2)));

        let event = insert_for(owner(1));
        let delivered = hub.publish("book_mark", owner(1), &event).unwrap();
        assert_eq!(delivered, 1);

        let received = mine.events.next().await.unwrap().unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn full_subscriber_is_disconnected() {
        let hub = PushHub::new(1);
        let mut sub = hub.register(Topic::new("book_mark", owner(1)));

        hub.publish("book_mark", owner(1), &insert_for(owner(1))).unwrap();
        hub.publish("book_mark", owner(1), &insert_for(owner(1))).unwrap();
        assert_eq!(hub.subscriber_count(), 0);

        // The buffered frame is still readable, then the stream ends
        assert!(sub.events.next().await.is_some());
        assert!(sub.events.next().await.is_none());
    }

    #[tokio::test]
    async fn corrupt_frame_surfaces_as_error_item() {
        let hub = PushHub::new(4);
        let mut sub = hub.register(Topic::new("book_mark", owner(1)));
        hub.publish_frame("book_mark", owner(1), vec![0xc1]);
        let item = sub.events.next().await.unwrap();
        assert!(matches!(item, Err(StorageError::Core(_))));
    }

    #[test]
    fn remove_is_idempotent() {
        let hub = PushHub::new(4);
        let sub = hub.register(Topic::new("book_mark", owner(1)));
        assert!(hub.remove(sub.handle));
        assert!(!hub.remove(sub.handle));
        assert_eq!(hub.subscriber_count_for(owner(1)), 0);
    }
}
