use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use marksync_core::{
    CoreError,
    feed::FeedEvent,
    hlc::{Hlc, HlcClock, physical_now},
    identity::SessionToken,
    ids::*,
    record::{Bookmark, NewBookmark},
};

use crate::error::StorageError;
use crate::hub::{DEFAULT_FEED_CAPACITY, PushHub};
use crate::traits::{PushChannel, Query, RemoteStore, Subscription, Topic};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

const SELECT_COLUMNS: &str = "SELECT bookmark_id, title, url, owner_id, created_at, revision FROM bookmarks";

type RawRow = (Vec<u8>, String, String, Vec<u8>, Vec<u8>, Vec<u8>);

fn raw_row(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_row(raw: RawRow) -> Result<Bookmark, StorageError> {
    let (id_bytes, title, url, owner_bytes, created_bytes, revision_bytes) = raw;
    Ok(Bookmark {
        id: BookmarkId::from_bytes(to_array::<16>(id_bytes, "bookmark_id")?),
        title,
        url,
        owner_id: SubjectId::from_bytes(to_array::<32>(owner_bytes, "owner_id")?),
        created_at: Hlc::from_bytes(&to_array::<12>(created_bytes, "created_at")?),
        revision: Hlc::from_bytes(&to_array::<12>(revision_bytes, "revision")?),
    })
}

struct Inner {
    conn: Connection,
    clock: HlcClock,
}

impl Inner {
    /// Verify the token and return the subject it speaks for.
    fn authorize(&self, token: &SessionToken) -> Result<SubjectId, StorageError> {
        match token.verify(physical_now()?) {
            Ok(()) => {}
            Err(e @ (CoreError::InvalidSignature | CoreError::TokenExpired { .. })) => {
                return Err(StorageError::Unauthorized(e.to_string()));
            }
            Err(e) => return Err(StorageError::Core(e)),
        }
        let revoked: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM revoked_sessions WHERE session_id = ?1",
                rusqlite::params![token.session_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        if revoked.is_some() {
            return Err(StorageError::Unauthorized(format!(
                "session {} revoked",
                token.session_id
            )));
        }
        Ok(token.subject)
    }

    fn get(&self, collection: &str, id: BookmarkId) -> Result<Option<Bookmark>, StorageError> {
        let sql = format!("{SELECT_COLUMNS} WHERE collection = ?1 AND bookmark_id = ?2");
        let raw = self
            .conn
            .query_row(
                &sql,
                rusqlite::params![collection, id.as_bytes().as_slice()],
                raw_row,
            )
            .optional()?;
        raw.map(decode_row).transpose()
    }
}

/// Reference remote store: a SQLite table of bookmarks with row-level
/// ownership checks, plus a push channel that announces every committed write.
pub struct SqliteRemoteStore {
    inner: Mutex<Inner>,
    hub: PushHub,
}

impl SqliteRemoteStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        crate::schema::init_schema(&conn)?;
        let mut clock = HlcClock::new();
        let newest: Option<Vec<u8>> =
            conn.query_row("SELECT MAX(revision) FROM bookmarks", [], |row| row.get(0))?;
        if let Some(bytes) = newest {
            clock.observe(Hlc::from_bytes(&to_array::<12>(bytes, "revision")?));
        }
        Ok(Self {
            inner: Mutex::new(Inner { conn, clock }),
            hub: PushHub::new(DEFAULT_FEED_CAPACITY),
        })
    }

    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.hub = PushHub::new(capacity);
        self
    }

    pub fn hub(&self) -> &PushHub {
        &self.hub
    }

    /// Reject every later request presenting this session's token.
    pub fn revoke_session(&self, session_id: SessionId) -> Result<(), StorageError> {
        self.inner.lock().conn.execute(
            "INSERT OR IGNORE INTO revoked_sessions (session_id) VALUES (?1)",
            rusqlite::params![session_id.as_bytes().as_slice()],
        )?;
        info!(%session_id, "session revoked");
        Ok(())
    }

    /// Edit a bookmark in place. The engine never issues this; it stands in
    /// for writes made by other clients of the same subject.
    pub fn update(
        &self,
        token: &SessionToken,
        collection: &str,
        id: BookmarkId,
        draft: &NewBookmark,
    ) -> Result<Bookmark, StorageError> {
        let record = {
            let mut inner = self.inner.lock();
            let owner = inner.authorize(token)?;
            let revision = inner.clock.tick()?;
            let changed = inner.conn.execute(
                "UPDATE bookmarks SET title = ?1, url = ?2, revision = ?3
                 WHERE collection = ?4 AND bookmark_id = ?5 AND owner_id = ?6",
                rusqlite::params![
                    draft.title(),
                    draft.url(),
                    &revision.to_bytes()[..],
                    collection,
                    id.as_bytes().as_slice(),
                    owner.as_bytes().as_slice(),
                ],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(id.to_string()));
            }
            inner
                .get(collection, id)?
                .ok_or_else(|| StorageError::NotFound(id.to_string()))?
        };
        self.hub
            .publish(collection, record.owner_id, &FeedEvent::Update(record.clone()))?;
        Ok(record)
    }

    pub fn count(&self, collection: &str) -> Result<u64, StorageError> {
        let count: i64 = self.inner.lock().conn.query_row(
            "SELECT COUNT(*) FROM bookmarks WHERE collection = ?1",
            rusqlite::params![collection],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[async_trait]
impl RemoteStore for SqliteRemoteStore {
    async fn query(
        &self,
        token: &SessionToken,
        query: &Query,
    ) -> Result<Vec<Bookmark>, StorageError> {
        let inner = self.inner.lock();
        let subject = inner.authorize(token)?;
        if subject != query.owner {
            return Err(StorageError::Unauthorized(format!(
                "subject {subject} may not read records of {}",
                query.owner
            )));
        }

        let sql = format!(
            "{SELECT_COLUMNS} WHERE collection = ?1 AND owner_id = ?2 {}",
            query.order.as_sql()
        );
        let mut stmt = inner.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![query.collection, query.owner.as_bytes().as_slice()],
            raw_row,
        )?;

        let mut result = Vec::new();
        for row in rows {
            result.push(decode_row(row?)?);
        }
        debug!(owner = %query.owner, count = result.len(), "query served");
        Ok(result)
    }

    async fn insert(
        &self,
        token: &SessionToken,
        collection: &str,
        draft: &NewBookmark,
    ) -> Result<Bookmark, StorageError> {
        let record = {
            let mut inner = self.inner.lock();
            let owner = inner.authorize(token)?;
            let created_at = inner.clock.tick()?;
            let record = Bookmark {
                id: BookmarkId::new(),
                title: draft.title().to_string(),
                url: draft.url().to_string(),
                owner_id: owner,
                created_at,
                revision: created_at,
            };
            let result = inner.conn.execute(
                "INSERT INTO bookmarks (collection, bookmark_id, owner_id, title, url, created_at, revision)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    collection,
                    record.id.as_bytes().as_slice(),
                    record.owner_id.as_bytes().as_slice(),
                    record.title,
                    record.url,
                    &record.created_at.to_bytes()[..],
                    &record.revision.to_bytes()[..],
                ],
            );
            match result {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(err, msg))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Err(StorageError::ConstraintViolation(
                        msg.unwrap_or_else(|| err.to_string()),
                    ));
                }
                Err(e) => return Err(StorageError::Sqlite(e)),
            }
            record
        };

        debug!(id = %record.id, owner = %record.owner_id, "bookmark inserted");
        self.hub
            .publish(collection, record.owner_id, &FeedEvent::Insert(record.clone()))?;
        Ok(record)
    }

    async fn delete(
        &self,
        token: &SessionToken,
        collection: &str,
        id: BookmarkId,
    ) -> Result<(), StorageError> {
        let owner = {
            let inner = self.inner.lock();
            let owner = inner.authorize(token)?;
            let removed = inner.conn.execute(
                "DELETE FROM bookmarks WHERE collection = ?1 AND bookmark_id = ?2 AND owner_id = ?3",
                rusqlite::params![
                    collection,
                    id.as_bytes().as_slice(),
                    owner.as_bytes().as_slice(),
                ],
            )?;
            if removed == 0 {
                return Err(StorageError::NotFound(id.to_string()));
            }
            owner
        };

        debug!(%id, %owner, "bookmark deleted");
        self.hub
            .publish(collection, owner, &FeedEvent::Delete { id })?;
        Ok(())
    }
}

#[async_trait]
impl PushChannel for SqliteRemoteStore {
    async fn subscribe(
        &self,
        token: &SessionToken,
        topic: &Topic,
    ) -> Result<Subscription, StorageError> {
        let subject = self.inner.lock().authorize(token)?;
        if subject != topic.owner {
            return Err(StorageError::Unauthorized(format!(
                "subject {subject} may not subscribe to {}",
                topic.owner
            )));
        }
        Ok(self.hub.register(topic.clone()))
    }

    fn unsubscribe(&self, handle: SubscriptionId) {
        self.hub.remove(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marksync_core::identity::SubjectIdentity;
    use tokio_stream::StreamExt;

    const COLLECTION: &str = crate::traits::DEFAULT_COLLECTION;

    fn token(identity: &SubjectIdentity) -> SessionToken {
        SessionToken::issue(identity, 60_000).unwrap()
    }

    fn draft(title: &str, url: &str) -> NewBookmark {
        NewBookmark::new(title, url).unwrap()
    }

    #[tokio::test]
    async fn insert_then_query_newest_first() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteRemoteStore::open_in_memory()?;
        let alice = SubjectIdentity::generate();
        let tok = token(&alice);

        let first = store.insert(&tok, COLLECTION, &draft("One", "https://one")).await?;
        let second = store.insert(&tok, COLLECTION, &draft("Two", "https://two")).await?;
        assert!(second.created_at > first.created_at);
        assert_eq!(first.owner_id, alice.subject_id());

        let rows = store
            .query(&tok, &Query::owned_by(COLLECTION, alice.subject_id()))
            .await?;
        let ids: Vec<_> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
        Ok(())
    }

    #[tokio::test]
    async fn query_for_other_owner_is_unauthorized() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteRemoteStore::open_in_memory()?;
        let alice = SubjectIdentity::generate();
        let bob = SubjectIdentity::generate();

        let result = store
            .query(&token(&alice), &Query::owned_by(COLLECTION, bob.subject_id()))
            .await;
        assert!(matches!(result, Err(StorageError::Unauthorized(_))));
        Ok(())
    }

    #[tokio::test]
    async fn delete_of_foreign_row_is_not_found() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteRemoteStore::open_in_memory()?;
        let alice = SubjectIdentity::generate();
        let bob = SubjectIdentity::generate();

        let record = store
            .insert(&token(&alice), COLLECTION, &draft("Mine", "https://mine"))
            .await?;
        let result = store.delete(&token(&bob), COLLECTION, record.id).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert_eq!(store.count(COLLECTION)?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn revoked_session_is_unauthorized() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteRemoteStore::open_in_memory()?;
        let alice = SubjectIdentity::generate();
        let tok = token(&alice);

        store.revoke_session(tok.session_id)?;
        let result = store.insert(&tok, COLLECTION, &draft("X", "https://x")).await;
        assert!(matches!(result, Err(StorageError::Unauthorized(_))));
        Ok(())
    }

    #[tokio::test]
    async fn writes_are_announced_to_owner_subscribers() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteRemoteStore::open_in_memory()?;
        let alice = SubjectIdentity::generate();
        let tok = token(&alice);
        let mut sub = store
            .subscribe(&tok, &Topic::new(COLLECTION, alice.subject_id()))
            .await?;

        let record = store.insert(&tok, COLLECTION, &draft("A", "https://a")).await?;
        let updated = store.update(&tok, COLLECTION, record.id, &draft("A2", "https://a2"))?;
        store.delete(&tok, COLLECTION, record.id).await?;

        assert_eq!(sub.events.next().await.unwrap()?, FeedEvent::Insert(record.clone()));
        let update = sub.events.next().await.unwrap()?;
        assert_eq!(update, FeedEvent::Update(updated.clone()));
        assert!(updated.revision > record.revision);
        assert_eq!(updated.created_at, record.created_at);
        assert_eq!(
            sub.events.next().await.unwrap()?,
            FeedEvent::Delete { id: record.id }
        );
        Ok(())
    }

    #[tokio::test]
    async fn reopened_file_keeps_rows_and_clock() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("remote.db");
        let path = path.to_str().unwrap();
        let alice = SubjectIdentity::generate();

        let first = {
            let store = SqliteRemoteStore::open(path)?;
            store.insert(&token(&alice), COLLECTION, &draft("A", "https://a")).await?
        };

        let store = SqliteRemoteStore::open(path)?;
        let second = store.insert(&token(&alice), COLLECTION, &draft("B", "https://b")).await?;
        assert!(second.created_at > first.created_at);
        assert_eq!(store.count(COLLECTION)?, 2);
        Ok(())
    }
}
