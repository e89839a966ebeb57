pub mod models;
pub mod queries;

use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Index parameters mismatch: index has {existing}, requested {requested}")]
    ParamMismatch { existing: String, requested: String },
    #[error("Invalid index parameters: {0}")]
    InvalidParams(String),
    #[error("Corrupt index metadata for {key}: {value}")]
    BadMeta { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Schema version written by [`Database::migrate`].
const SCHEMA_VERSION: i32 = 1;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    /// Open (creating if needed) an index for writing.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an existing index for searching. Never creates or migrates.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "{} has schema version {}, expected {}",
                path.display(),
                version,
                SCHEMA_VERSION
            )));
        }
        Ok(Self { conn })
    }

    fn init(&self) -> Result<()> {
        // WAL mode so searchers can read while the indexer writes
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version < 1 {
            self.migrate_v1()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: songs, segments (documents) and the term → segment postings.
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS index_meta (
                key     TEXT PRIMARY KEY,
                value   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS songs (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                title       TEXT NOT NULL UNIQUE,
                frames      INTEGER NOT NULL,
                histogram   TEXT,
                added_at    TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- One row per indexed segment; these are the searchable documents
            CREATE TABLE IF NOT EXISTS segments (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                song_id     INTEGER NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
                position    INTEGER NOT NULL,
                length      INTEGER NOT NULL,
                UNIQUE(song_id, position)
            );
            CREATE INDEX IF NOT EXISTS idx_segments_song ON segments(song_id);

            CREATE TABLE IF NOT EXISTS postings (
                term        INTEGER NOT NULL,
                segment_id  INTEGER NOT NULL REFERENCES segments(id) ON DELETE CASCADE,
                tf          INTEGER NOT NULL,
                PRIMARY KEY (term, segment_id)
            ) WITHOUT ROWID;
            CREATE INDEX IF NOT EXISTS idx_postings_segment ON postings(segment_id);
            ",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let version: i32 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_read_only_requires_existing_index() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Database::open_read_only(&dir.path().join("missing.db")).is_err());

        let path = dir.path().join("index.db");
        Database::open(&path).unwrap();
        let ro = Database::open_read_only(&path).unwrap();
        assert!(ro.conn.execute("DELETE FROM songs", []).is_err());
    }
}
