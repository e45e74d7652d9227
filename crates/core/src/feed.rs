use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::BookmarkId;
use crate::record::Bookmark;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedEventKind {
    Insert,
    Update,
    Delete,
}

impl FeedEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A change pushed by the remote store to subscribers of a collection.
///
/// Events carry no sequence number; receivers reconcile with the record's
/// `revision` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedEvent {
    Insert(Bookmark),
    Update(Bookmark),
    Delete { id: BookmarkId },
}

impl FeedEvent {
    pub fn kind(&self) -> FeedEventKind {
        match self {
            Self::Insert(_) => FeedEventKind::Insert,
            Self::Update(_) => FeedEventKind::Update,
            Self::Delete { .. } => FeedEventKind::Delete,
        }
    }

    pub fn id(&self) -> BookmarkId {
        match self {
            Self::Insert(record) | Self::Update(record) => record.id,
            Self::Delete { id } => *id,
        }
    }

    pub fn record(&self) -> Option<&Bookmark> {
        match self {
            Self::Insert(record) | Self::Update(record) => Some(record),
            Self::Delete { .. } => None,
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::Hlc;
    use crate::ids::SubjectId;

    fn sample() -> Bookmark {
        Bookmark {
            id: BookmarkId::from_u128(1),
            title: "Example".into(),
            url: "https://example.com".into(),
            owner_id: SubjectId::from_bytes([9; 32]),
            created_at: Hlc::new(1_700_000_000_000, 0),
            revision: Hlc::new(1_700_000_000_000, 3),
        }
    }

    #[test]
    fn insert_survives_wire_encoding() {
        let event = FeedEvent::Insert(sample());
        let bytes = event.to_msgpack().unwrap();
        let decoded = FeedEvent::from_msgpack(&bytes).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.record().unwrap().revision.counter(), 3);
    }

    #[test]
    fn delete_exposes_id_but_no_record() {
        let event = FeedEvent::Delete {
            id: BookmarkId::from_u128(5),
        };
        assert_eq!(event.kind(), FeedEventKind::Delete);
        assert_eq!(event.id(), BookmarkId::from_u128(5));
        assert!(event.record().is_none());
    }

    #[test]
    fn garbage_frame_is_a_serialization_error() {
        let result = FeedEvent::from_msgpack(&[0xc1, 0x00, 0x13]);
        assert!(matches!(result, Err(CoreError::Serialization(_))));
    }
}
