use std::sync::Arc;

use tempfile::TempDir;

use marksync_core::{
    feed::FeedEvent,
    identity::{SessionToken, SubjectIdentity},
    ids::*,
    record::{Bookmark, NewBookmark},
};
use marksync_engine::SyncConfig;
use marksync_storage::{PushChannel, RemoteStore, SqliteRemoteStore, StorageError};

use crate::faults::{FaultyChannel, GatedRemote};

/// A reference remote store plus the fault-injecting wrappers clients talk
/// through. Writes made directly on the backend stand in for other devices.
pub struct TestBackend {
    store: Arc<SqliteRemoteStore>,
    remote: Arc<GatedRemote>,
    channel: Arc<FaultyChannel>,
    config: SyncConfig,
    _dir: Option<TempDir>,
}

impl TestBackend {
    pub fn new() -> Result<Self, StorageError> {
        let config = Self::fast_config();
        let store = SqliteRemoteStore::open_in_memory()?.with_feed_capacity(config.feed.channel_capacity);
        Ok(Self::wrap(store, config, None))
    }

    /// Backed by a database file in a fresh temp directory.
    pub fn on_disk() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Self::fast_config();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("remote.db");
        let path = path.to_str().ok_or("non-utf8 temp path")?;
        let store = SqliteRemoteStore::open(path)?.with_feed_capacity(config.feed.channel_capacity);
        Ok(Self::wrap(store, config, Some(dir)))
    }

    fn wrap(store: SqliteRemoteStore, config: SyncConfig, dir: Option<TempDir>) -> Self {
        let store = Arc::new(store);
        Self {
            remote: Arc::new(GatedRemote::new(store.clone())),
            channel: Arc::new(FaultyChannel::new(store.clone())),
            store,
            config,
            _dir: dir,
        }
    }

    /// Defaults with short resubscribe backoff so tests stay quick.
    pub fn fast_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.feed.resubscribe_attempts = 3;
        config.feed.resubscribe_backoff_ms = 10;
        config
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteRemoteStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<GatedRemote> {
        &self.remote
    }

    pub fn channel(&self) -> &Arc<FaultyChannel> {
        &self.channel
    }

    pub fn remote_dyn(&self) -> Arc<dyn RemoteStore> {
        self.remote.clone()
    }

    pub fn channel_dyn(&self) -> Arc<dyn PushChannel> {
        self.channel.clone()
    }

    fn token(identity: &SubjectIdentity) -> Result<SessionToken, StorageError> {
        Ok(SessionToken::issue(identity, 60_000)?)
    }

    pub async fn insert_as(
        &self,
        identity: &SubjectIdentity,
        title: &str,
        url: &str,
    ) -> Result<Bookmark, StorageError> {
        let draft = NewBookmark::new(title, url)?;
        self.store
            .insert(&Self::token(identity)?, &self.config.collection, &draft)
            .await
    }

    pub fn update_as(
        &self,
        identity: &SubjectIdentity,
        id: BookmarkId,
        title: &str,
        url: &str,
    ) -> Result<Bookmark, StorageError> {
        let draft = NewBookmark::new(title, url)?;
        self.store
            .update(&Self::token(identity)?, &self.config.collection, id, &draft)
    }

    pub async fn delete_as(&self, identity: &SubjectIdentity, id: BookmarkId) -> Result<(), StorageError> {
        self.store
            .delete(&Self::token(identity)?, &self.config.collection, id)
            .await
    }

    /// Push an arbitrary event to `owner`'s subscribers, bypassing the table.
    pub fn push(&self, owner: SubjectId, event: &FeedEvent) -> Result<usize, StorageError> {
        self.store.hub().publish(&self.config.collection, owner, event)
    }

    /// End every feed stream of `owner`.
    pub fn drop_feeds(&self, owner: SubjectId) -> usize {
        self.store.hub().disconnect_owner(owner)
    }
}
