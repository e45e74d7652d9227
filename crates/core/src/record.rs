use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hlc::Hlc;
use crate::ids::{BookmarkId, SubjectId};

/// A bookmark as stored by the remote store and mirrored by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: BookmarkId,
    pub title: String,
    pub url: String,
    pub owner_id: SubjectId,
    /// Assigned once, at creation. Drives display order.
    pub created_at: Hlc,
    /// Bumped by the remote store on every write to the row.
    pub revision: Hlc,
}

impl Bookmark {
    /// Display order: newest first, ties broken by ascending id.
    pub fn display_cmp(&self, other: &Self) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then(self.id.cmp(&other.id))
    }
}

/// A bookmark that has not been created yet. Construction validates the
/// fields, so holding one means the draft may be sent to the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBookmark {
    title: String,
    url: String,
}

impl NewBookmark {
    pub fn new(title: &str, url: &str) -> Result<Self, CoreError> {
        if title.is_empty() {
            return Err(CoreError::Validation("title must not be empty".into()));
        }
        if url.is_empty() {
            return Err(CoreError::Validation("url must not be empty".into()));
        }
        Ok(Self {
            title: title.to_string(),
            url: url.to_string(),
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// blake3 digest over a set of records, independent of iteration order.
/// Two stores holding the same records at the same revisions digest equal.
pub fn digest<'a>(records: impl IntoIterator<Item = &'a Bookmark>) -> [u8; 32] {
    let mut sorted: Vec<&Bookmark> = records.into_iter().collect();
    sorted.sort_by_key(|r| r.id);

    let mut hasher = blake3::Hasher::new();
    for record in sorted {
        hasher.update(record.id.as_bytes());
        hasher.update(record.owner_id.as_bytes());
        hasher.update(&record.created_at.to_bytes());
        hasher.update(&record.revision.to_bytes());
        hasher.update(&(record.title.len() as u64).to_be_bytes());
        hasher.update(record.title.as_bytes());
        hasher.update(&(record.url.len() as u64).to_be_bytes());
        hasher.update(record.url.as_bytes());
    }
    *hasher.finalize().as_bytes()
}
