pub mod models;
pub mod queries;
pub mod vectors;

use crate::features::blob::MalformedFeatureError;
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Malformed feature data: {0}")]
    Malformed(#[from] MalformedFeatureError),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// One connection to the library database.
///
/// Handles are cheap to open and are scoped to a single request: the
/// connection closes when the handle drops. WAL mode lets other handles keep
/// reading while one of them writes.
pub struct Database {
    pub conn: Connection,
}

impl Database {
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

    fn init(&self) -> Result<()> {
        // WAL mode for better concurrent read performance
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.busy_timeout(std::time::Duration::from_secs(5))?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "database schema v{version} is newer than this build (v{SCHEMA_VERSION})"
            )));
        }
        if version < 1 {
            self.migrate_v1()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: songs, recordings, feature blobs, and the two vector tables.
    ///
    /// The vector tables carry no foreign keys: they model an external index
    /// and are maintained explicitly (see `vectors.rs`).
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS songs (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                title       TEXT NOT NULL,
                artist      TEXT,
                created_at  TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_songs_title ON songs(title);

            CREATE TABLE IF NOT EXISTS recordings (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                song_id         INTEGER NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
                recording_name  TEXT NOT NULL,
                duration        REAL NOT NULL,
                sample_rate     INTEGER NOT NULL,
                audio_path      TEXT NOT NULL,
                created_at      TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_recordings_song ON recordings(song_id);

            CREATE TABLE IF NOT EXISTS hpcp_features (
                recording_id    INTEGER PRIMARY KEY REFERENCES recordings(id) ON DELETE CASCADE,
                hpcp_data       BLOB NOT NULL,
                frame_count     INTEGER NOT NULL,
                hop_size        INTEGER NOT NULL,
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS hpcp_frames (
                recording_id    INTEGER NOT NULL,
                frame_index     INTEGER NOT NULL,
                hpcp_vector     BLOB NOT NULL,
                PRIMARY KEY (recording_id, frame_index)
            );

            CREATE TABLE IF NOT EXISTS hpcp_summary (
                recording_id    INTEGER PRIMARY KEY,
                mean_vector     BLOB NOT NULL,
                std_vector      BLOB NOT NULL,
                dominant_chord  BLOB NOT NULL
            );
            ",
        )?;
        Ok(())
    }
}

const SCHEMA_VERSION: i32 = 1;
