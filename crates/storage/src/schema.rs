use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS bookmarks (
    rowid INTEGER PRIMARY KEY,
    collection TEXT NOT NULL,
    bookmark_id BLOB NOT NULL UNIQUE CHECK (length(bookmark_id) = 16),
    owner_id BLOB NOT NULL CHECK (length(owner_id) = 32),
    title TEXT NOT NULL CHECK (length(title) > 0),
    url TEXT NOT NULL CHECK (length(url) > 0),
    created_at BLOB NOT NULL CHECK (length(created_at) = 12),
    revision BLOB NOT NULL CHECK (length(revision) = 12)
);
CREATE INDEX IF NOT EXISTS idx_bookmarks_owner ON bookmarks (collection, owner_id, created_at);

CREATE TABLE IF NOT EXISTS revoked_sessions (
    session_id BLOB PRIMARY KEY CHECK (length(session_id) = 16),
    revoked_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER))
);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn empty_title_violates_check() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO bookmarks (collection, bookmark_id, owner_id, title, url, created_at, revision)
             VALUES ('book_mark', zeroblob(16), zeroblob(32), '', 'https://x', zeroblob(12), zeroblob(12))",
            [],
        );
        assert!(result.is_err());
    }
}
