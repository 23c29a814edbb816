use super::models::{LibraryStats, NewRecording, Recording, RecordingInfo, Song};
use super::{Database, DbError, Result};
use crate::features::HpcpMatrix;
use crate::features::blob;
use rusqlite::{OptionalExtension, params};

/// Where a new recording's song comes from.
#[derive(Debug, Clone)]
pub enum SongRef {
    Existing(i64),
    New { title: String, artist: Option<String> },
}

impl Database {
    pub fn create_song(&self, title: &str, artist: Option<&str>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO songs (title, artist) VALUES (?1, ?2)",
            params![title, artist],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_song(&self, id: i64) -> Result<Option<Song>> {
        let song = self
            .conn
            .query_row(
                "SELECT id, title, artist, created_at, updated_at FROM songs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Song {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        artist: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(song)
    }

    pub fn list_songs(&self, limit: usize, offset: usize) -> Result<Vec<Song>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, artist, created_at, updated_at
             FROM songs ORDER BY id LIMIT ?1 OFFSET ?2",
        )?;

        let songs = stmt
            .query_map(params![limit as i64, offset as i64], |row| {
                Ok(Song {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    artist: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(songs)
    }

    pub fn count_songs(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM songs", [], |row| row.get(0))?)
    }

    /// Delete a song with all of its recordings, features and index rows,
    /// in one transaction. Returns false if the song does not exist.
    pub fn delete_song(&self, id: i64) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;

        let recording_ids: Vec<i64> = tx
            .prepare("SELECT id FROM recordings WHERE song_id = ?1")?
            .query_map(params![id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for rid in &recording_ids {
            Self::delete_recording_rows(&tx, *rid)?;
        }
        let deleted = tx.execute("DELETE FROM songs WHERE id = ?1", params![id])?;

        tx.commit()?;
        Ok(deleted > 0)
    }

    pub fn create_recording(&self, r: &NewRecording) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO recordings (song_id, recording_name, duration, sample_rate, audio_path)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![r.song_id, r.recording_name, r.duration, r.sample_rate, r.audio_path],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Id of the song a new recording belongs to, inserting it if needed.
    ///
    /// Not transactional on its own; ingestion calls it inside the
    /// transaction that also writes the recording and its features.
    pub fn resolve_song(&self, song: &SongRef) -> Result<i64> {
        match song {
            SongRef::Existing(id) => {
                let exists: bool = self.conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM songs WHERE id = ?1)",
                    params![id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(DbError::NotFound(format!("song {id}")));
                }
                Ok(*id)
            }
            SongRef::New { title, artist } => self.create_song(title, artist.as_deref()),
        }
    }

    pub fn get_recording(&self, id: i64) -> Result<Option<Recording>> {
        let rec = self
            .conn
            .query_row(
                "SELECT id, song_id, recording_name, duration, sample_rate, audio_path, created_at
                 FROM recordings WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Recording {
                        id: row.get(0)?,
                        song_id: row.get(1)?,
                        recording_name: row.get(2)?,
                        duration: row.get(3)?,
                        sample_rate: row.get(4)?,
                        audio_path: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(rec)
    }

    /// Recordings joined with their song, in insertion order.
    pub fn list_recordings(&self, limit: usize, offset: usize) -> Result<Vec<RecordingInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.song_id, s.title, s.artist, r.recording_name, r.duration,
                    f.recording_id IS NOT NULL
             FROM recordings r
             JOIN songs s ON s.id = r.song_id
             LEFT JOIN hpcp_features f ON f.recording_id = r.id
             ORDER BY r.id LIMIT ?1 OFFSET ?2",
        )?;

        let rows = stmt
            .query_map(params![limit as i64, offset as i64], Self::recording_info_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_recording_info(&self, id: i64) -> Result<Option<RecordingInfo>> {
        let info = self
            .conn
            .query_row(
                "SELECT r.id, r.song_id, s.title, s.artist, r.recording_name, r.duration,
                        f.recording_id IS NOT NULL
                 FROM recordings r
                 JOIN songs s ON s.id = r.song_id
                 LEFT JOIN hpcp_features f ON f.recording_id = r.id
                 WHERE r.id = ?1",
                params![id],
                Self::recording_info_row,
            )
            .optional()?;
        Ok(info)
    }

    fn recording_info_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordingInfo> {
        Ok(RecordingInfo {
            id: row.get(0)?,
            song_id: row.get(1)?,
            song_title: row.get(2)?,
            artist: row.get(3)?,
            recording_name: row.get(4)?,
            duration: row.get(5)?,
            has_features: row.get(6)?,
        })
    }

    /// Delete a recording together with its feature blob and index rows,
    /// as one transaction. Returns false if the recording does not exist.
    pub fn delete_recording(&self, id: i64) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let deleted = Self::delete_recording_rows(&tx, id)?;
        tx.commit()?;
        Ok(deleted)
    }

    fn delete_recording_rows(conn: &rusqlite::Connection, id: i64) -> Result<bool> {
        conn.execute("DELETE FROM hpcp_frames WHERE recording_id = ?1", params![id])?;
        conn.execute("DELETE FROM hpcp_summary WHERE recording_id = ?1", params![id])?;
        conn.execute("DELETE FROM hpcp_features WHERE recording_id = ?1", params![id])?;
        let deleted = conn.execute("DELETE FROM recordings WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Store (or replace) a recording's feature blob.
    pub fn store_features(&self, recording_id: i64, m: &HpcpMatrix, hop_size: usize) -> Result<()> {
        self.conn.execute(
            "INSERT INTO hpcp_features (recording_id, hpcp_data, frame_count, hop_size)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(recording_id) DO UPDATE SET
                hpcp_data = excluded.hpcp_data,
                frame_count = excluded.frame_count,
                hop_size = excluded.hop_size,
                created_at = datetime('now')",
            params![recording_id, blob::encode(m), m.frame_count() as i64, hop_size as i64],
        )?;
        Ok(())
    }

    /// Load a recording's feature matrix. `Ok(None)` if none is stored;
    /// `Err(DbError::Malformed)` if the blob cannot be decoded.
    pub fn load_features(&self, recording_id: i64) -> Result<Option<HpcpMatrix>> {
        let data: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT hpcp_data FROM hpcp_features WHERE recording_id = ?1",
                params![recording_id],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(bytes) => Ok(Some(blob::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ids of every recording that has a stored feature blob.
    pub fn feature_recording_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT recording_id FROM hpcp_features ORDER BY recording_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn recording_exists(&self, id: i64) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM recordings WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?)
    }

    pub fn library_stats(&self) -> Result<LibraryStats> {
        let (songs, recordings, with_features): (i64, i64, i64) = self.conn.query_row(
            "SELECT (SELECT COUNT(*) FROM songs),
                    (SELECT COUNT(*) FROM recordings),
                    (SELECT COUNT(*) FROM hpcp_features)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(LibraryStats {
            songs,
            recordings,
            with_features,
            vectors: self.vector_stats()?,
        })
    }
}
