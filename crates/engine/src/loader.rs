use std::sync::Arc;

use tracing::debug;

use marksync_core::record::Bookmark;
use marksync_storage::{Query, RemoteStore};

use crate::error::SyncError;
use crate::session::Subject;

/// One-shot bulk retrieval of a subject's records, newest first.
#[derive(Clone)]
pub struct FetchLoader {
    remote: Arc<dyn RemoteStore>,
    collection: String,
}

impl FetchLoader {
    pub fn new(remote: Arc<dyn RemoteStore>, collection: &str) -> Self {
        Self {
            remote,
            collection: collection.to_string(),
        }
    }

    pub async fn load(&self, subject: &Subject) -> Result<Vec<Bookmark>, SyncError> {
        let query = Query::owned_by(&self.collection, subject.id);
        let records = self.remote.query(&subject.token, &query).await?;
        debug!(subject = %subject.id, count = records.len(), "collection loaded");
        Ok(records)
    }
}
