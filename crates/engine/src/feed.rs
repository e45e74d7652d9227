use std::sync::Arc;

use tokio_stream::StreamExt;
use tracing::debug;

use marksync_core::{CoreError, feed::FeedEvent, ids::SubscriptionId};
use marksync_storage::{FeedStream, PushChannel, StorageError, Topic};

use crate::error::SyncError;
use crate::session::Subject;

/// What the listener got from the channel.
#[derive(Debug)]
pub enum FeedSignal {
    Event(FeedEvent),
    /// A frame that could not be decoded. The subscription stays up.
    Skipped(String),
    /// The stream ended or failed; the subscription is dead.
    Dropped(String),
}

/// A live push channel subscription scoped to one subject.
///
/// Released exactly once: either through `release`, which consumes the
/// guard, or on drop.
pub struct FeedSubscription {
    channel: Arc<dyn PushChannel>,
    handle: SubscriptionId,
    events: FeedStream,
    released: bool,
}

impl FeedSubscription {
    pub async fn open(
        channel: Arc<dyn PushChannel>,
        subject: &Subject,
        collection: &str,
    ) -> Result<Self, SyncError> {
        let topic = Topic::new(collection, subject.id);
        let subscription = channel.subscribe(&subject.token, &topic).await?;
        debug!(handle = %subscription.handle, subject = %subject.id, "feed subscribed");
        Ok(Self {
            channel,
            handle: subscription.handle,
            events: subscription.events,
            released: false,
        })
    }

    pub fn handle(&self) -> SubscriptionId {
        self.handle
    }

    pub async fn next_signal(&mut self) -> FeedSignal {
        match self.events.next().await {
            Some(Ok(event)) => FeedSignal::Event(event),
            Some(Err(err)) if is_bad_frame(&err) => FeedSignal::Skipped(err.to_string()),
            Some(Err(err)) => FeedSignal::Dropped(err.to_string()),
            None => FeedSignal::Dropped("stream ended".into()),
        }
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.channel.unsubscribe(self.handle);
            debug!(handle = %self.handle, "feed released");
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.release_once();
    }
}

fn is_bad_frame(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::Serialization(_)
            | StorageError::Core(CoreError::Serialization(_) | CoreError::InvalidData(_))
    )
}
