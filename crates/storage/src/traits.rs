use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;

use marksync_core::{
    feed::FeedEvent,
    identity::SessionToken,
    ids::*,
    record::{Bookmark, NewBookmark},
};

use crate::error::StorageError;

/// Collection the original deployment keeps bookmarks in.
pub const DEFAULT_COLLECTION: &str = "book_mark";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    CreatedAtDesc,
    CreatedAtAsc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::CreatedAtDesc => "ORDER BY created_at DESC, bookmark_id ASC",
            Self::CreatedAtAsc => "ORDER BY created_at ASC, bookmark_id ASC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub collection: String,
    pub owner: SubjectId,
    pub order: SortOrder,
}

impl Query {
    /// Every record of `owner` in `collection`, newest first.
    pub fn owned_by(collection: &str, owner: SubjectId) -> Self {
        Self {
            collection: collection.to_string(),
            owner,
            order: SortOrder::CreatedAtDesc,
        }
    }
}

/// Push channel topic: changes to one collection, filtered to one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub collection: String,
    pub owner: SubjectId,
}

impl Topic {
    pub fn new(collection: &str, owner: SubjectId) -> Self {
        Self {
            collection: collection.to_string(),
            owner,
        }
    }
}

pub type FeedStream = Pin<Box<dyn Stream<Item = Result<FeedEvent, StorageError>> + Send>>;

/// A live subscription. The stream ends when the channel drops the
/// subscriber; `handle` must be passed back to `unsubscribe`.
pub struct Subscription {
    pub handle: SubscriptionId,
    pub events: FeedStream,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn query(
        &self,
        token: &SessionToken,
        query: &Query,
    ) -> Result<Vec<Bookmark>, StorageError>;

    async fn insert(
        &self,
        token: &SessionToken,
        collection: &str,
        draft: &NewBookmark,
    ) -> Result<Bookmark, StorageError>;

    async fn delete(
        &self,
        token: &SessionToken,
        collection: &str,
        id: BookmarkId,
    ) -> Result<(), StorageError>;
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(
        &self,
        token: &SessionToken,
        topic: &Topic,
    ) -> Result<Subscription, StorageError>;

    /// Idempotent; unknown handles are ignored.
    fn unsubscribe(&self, handle: SubscriptionId);
}
