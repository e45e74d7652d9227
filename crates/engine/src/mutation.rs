use std::sync::Arc;

use tracing::debug;

use marksync_core::{
    ids::BookmarkId,
    record::{Bookmark, NewBookmark},
};
use marksync_storage::{RemoteStore, StorageError};

use crate::error::SyncError;
use crate::session::Subject;

/// Definitive outcome of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAck {
    Deleted,
    /// The remote no longer had the row. Treated as success.
    AlreadyGone,
}

#[derive(Clone)]
pub struct MutationExecutor {
    remote: Arc<dyn RemoteStore>,
    collection: String,
}

impl MutationExecutor {
    pub fn new(remote: Arc<dyn RemoteStore>, collection: &str) -> Self {
        Self {
            remote,
            collection: collection.to_string(),
        }
    }

    /// Validates the draft before any remote call.
    pub async fn create(
        &self,
        subject: &Subject,
        title: &str,
        url: &str,
    ) -> Result<Bookmark, SyncError> {
        let draft = NewBookmark::new(title, url)?;
        let record = self
            .remote
            .insert(&subject.token, &self.collection, &draft)
            .await?;
        debug!(id = %record.id, subject = %subject.id, "create confirmed");
        Ok(record)
    }

    pub async fn delete(&self, subject: &Subject, id: BookmarkId) -> Result<DeleteAck, SyncError> {
        match self.remote.delete(&subject.token, &self.collection, id).await {
            Ok(()) => Ok(DeleteAck::Deleted),
            Err(StorageError::NotFound(_)) => {
                debug!(%id, "delete target already gone");
                Ok(DeleteAck::AlreadyGone)
            }
            Err(e) => Err(e.into()),
        }
    }
}
