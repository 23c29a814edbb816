//! Exact nearest-neighbour index over HPCP vectors, kept in two SQLite tables.
//!
//! `hpcp_frames` holds one 12-d row per frame, `hpcp_summary` one row per
//! recording with its mean / std / dominant vectors. Vectors are 48-byte
//! little-endian f32 blobs. Search is brute-force Euclidean distance.

use super::models::VectorStats;
use super::{Database, Result};
use crate::HPCP_SIZE;
use crate::features::blob::MalformedFeatureError;
use crate::features::{HpcpFrame, NormalizedHpcpMatrix};
use crate::retrieval::{CandidateHit, VectorColumn, VectorIndex};
use rayon::prelude::*;
use rusqlite::params;

const VECTOR_BYTES: usize = HPCP_SIZE * 4;

/// One indexed vector with its row key.
struct IndexedRow {
    recording_id: i64,
    frame_index: i64,
    vector: HpcpFrame,
}

impl VectorColumn {
    /// `(table, column)` backing this vector column.
    fn location(self) -> (&'static str, &'static str) {
        match self {
            Self::Frame => ("hpcp_frames", "hpcp_vector"),
            Self::Mean => ("hpcp_summary", "mean_vector"),
            Self::Std => ("hpcp_summary", "std_vector"),
            Self::Dominant => ("hpcp_summary", "dominant_chord"),
        }
    }
}

fn vector_to_blob(v: &HpcpFrame) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn blob_to_vector(bytes: &[u8]) -> std::result::Result<HpcpFrame, MalformedFeatureError> {
    if bytes.len() != VECTOR_BYTES {
        return Err(MalformedFeatureError::LengthMismatch {
            expected: VECTOR_BYTES,
            actual: bytes.len(),
        });
    }
    Ok(std::array::from_fn(|i| {
        f32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
    }))
}

fn euclidean(a: &HpcpFrame, b: &HpcpFrame) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// The `k` rows closest to `query`, ascending by distance, ties by row key.
fn top_k(rows: &[IndexedRow], query: &HpcpFrame, k: usize) -> Vec<CandidateHit> {
    if k == 0 || rows.is_empty() {
        return Vec::new();
    }

    let mut distances: Vec<(f64, i64, i64)> = rows
        .iter()
        .map(|r| (euclidean(&r.vector, query), r.recording_id, r.frame_index))
        .collect();

    let cmp = |a: &(f64, i64, i64), b: &(f64, i64, i64)| {
        a.0.total_cmp(&b.0)
            .then(a.1.cmp(&b.1))
            .then(a.2.cmp(&b.2))
    };

    // Partial sort: only need top-K smallest distances
    if distances.len() > k {
        distances.select_nth_unstable_by(k - 1, cmp);
        distances.truncate(k);
    }
    distances.sort_by(cmp);

    distances
        .into_iter()
        .map(|(distance, recording_id, _)| CandidateHit {
            recording_id,
            distance,
        })
        .collect()
}

impl Database {
    fn load_column(&self, column: VectorColumn) -> Result<Vec<IndexedRow>> {
        let (table, col) = column.location();
        let sql = match column {
            VectorColumn::Frame => format!("SELECT recording_id, frame_index, {col} FROM {table}"),
            _ => format!("SELECT recording_id, 0, {col} FROM {table}"),
        };

        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(recording_id, frame_index, bytes)| {
                Ok(IndexedRow {
                    recording_id,
                    frame_index,
                    vector: blob_to_vector(&bytes)?,
                })
            })
            .collect()
    }

    pub fn vector_stats(&self) -> Result<VectorStats> {
        let (total_frames, total_recordings, summary_records) = self.conn.query_row(
            "SELECT (SELECT COUNT(*) FROM hpcp_frames),
                    (SELECT COUNT(DISTINCT recording_id) FROM hpcp_frames),
                    (SELECT COUNT(*) FROM hpcp_summary)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(VectorStats {
            total_frames,
            total_recordings,
            summary_records,
        })
    }
}

impl VectorIndex for Database {
    /// Replace all index rows of one recording inside a single transaction,
    /// so readers see either the old rows or the new ones.
    fn reindex(&self, recording_id: i64, m: &NormalizedHpcpMatrix) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute("DELETE FROM hpcp_frames WHERE recording_id = ?1", params![recording_id])?;
        tx.execute("DELETE FROM hpcp_summary WHERE recording_id = ?1", params![recording_id])?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO hpcp_frames (recording_id, frame_index, hpcp_vector)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (i, frame) in m.frames().iter().enumerate() {
                stmt.execute(params![recording_id, i as i64, vector_to_blob(frame)])?;
            }
        }

        let summary = m.summary();
        tx.execute(
            "INSERT INTO hpcp_summary (recording_id, mean_vector, std_vector, dominant_chord)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                recording_id,
                vector_to_blob(&summary.mean),
                vector_to_blob(&summary.std),
                vector_to_blob(&summary.dominant),
            ],
        )?;

        tx.commit()?;
        log::debug!(
            "Indexed recording {} ({} frames)",
            recording_id,
            m.frame_count()
        );
        Ok(())
    }

    fn delete_recording_vectors(&self, recording_id: i64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM hpcp_frames WHERE recording_id = ?1", params![recording_id])?;
        tx.execute("DELETE FROM hpcp_summary WHERE recording_id = ?1", params![recording_id])?;
        tx.commit()?;
        Ok(())
    }

    fn search(&self, column: VectorColumn, query: &HpcpFrame, k: usize) -> Result<Vec<CandidateHit>> {
        let rows = self.load_column(column)?;
        Ok(top_k(&rows, query, k))
    }

    /// Loads the column once, then answers every query in parallel.
    fn search_many(
        &self,
        column: VectorColumn,
        queries: &[HpcpFrame],
        k: usize,
    ) -> Result<Vec<Vec<CandidateHit>>> {
        let rows = self.load_column(column)?;
        Ok(queries.par_iter().map(|q| top_k(&rows, q, k)).collect())
    }

    fn stats(&self) -> Result<VectorStats> {
        self.vector_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewRecording;
    use crate::db::queries::SongRef;
    use crate::features::{HpcpMatrix, normalize};

    fn one_hot(c: usize) -> HpcpFrame {
        let mut f = [0.0; HPCP_SIZE];
        f[c] = 1.0;
        f
    }

    fn add_recording(db: &Database, frames: Vec<HpcpFrame>) -> (i64, NormalizedHpcpMatrix) {
        let m = normalize(HpcpMatrix::new(frames).unwrap());
        let song_id = db
            .resolve_song(&SongRef::New { title: "t".into(), artist: None })
            .unwrap();
        let rid = db
            .create_recording(&NewRecording {
                song_id,
                recording_name: "original".into(),
                duration: 1.0,
                sample_rate: 44_100,
                audio_path: "t.wav".into(),
            })
            .unwrap();
        db.store_features(rid, &m, 2048).unwrap();
        (rid, m)
    }

    #[test]
    fn test_vector_blob_roundtrip() {
        let v: HpcpFrame = std::array::from_fn(|i| i as f32 / 7.0);
        let bytes = vector_to_blob(&v);
        assert_eq!(bytes.len(), VECTOR_BYTES);
        assert_eq!(blob_to_vector(&bytes).unwrap(), v);
        assert!(blob_to_vector(&bytes[..47]).is_err());
    }

    #[test]
    fn test_reindex_leaves_no_stale_rows() {
        let db = Database::open_in_memory().unwrap();
        let (rid, m) = add_recording(&db, vec![one_hot(0), one_hot(4), one_hot(7)]);

        db.reindex(rid, &m).unwrap();
        db.reindex(rid, &m).unwrap();
        assert_eq!(
            db.stats().unwrap(),
            VectorStats { total_frames: 3, total_recordings: 1, summary_records: 1 }
        );

        // A shorter new version replaces every old row
        let shorter = normalize(HpcpMatrix::new(vec![one_hot(2), one_hot(9)]).unwrap());
        db.reindex(rid, &shorter).unwrap();
        assert_eq!(db.stats().unwrap().total_frames, 2);
        let max_index: i64 = db
            .conn
            .query_row(
                "SELECT MAX(frame_index) FROM hpcp_frames WHERE recording_id = ?1",
                params![rid],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(max_index, 1);

        db.delete_recording_vectors(rid).unwrap();
        assert_eq!(db.stats().unwrap(), VectorStats::default());
    }

    #[test]
    fn test_search_orders_by_distance() {
        let db = Database::open_in_memory().unwrap();
        let (a, ma) = add_recording(&db, vec![one_hot(0); 4]);
        let (b, mb) = add_recording(&db, vec![one_hot(5); 4]);
        db.reindex(a, &ma).unwrap();
        db.reindex(b, &mb).unwrap();

        let hits = db.search(VectorColumn::Frame, &one_hot(0), 6).unwrap();
        assert_eq!(hits.len(), 6);
        assert!(hits[..4].iter().all(|h| h.recording_id == a && h.distance == 0.0));
        assert!(hits[4..].iter().all(|h| h.recording_id == b));
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));

        let summary = db.search(VectorColumn::Mean, &one_hot(5), 10).unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].recording_id, b);
        assert!((summary[1].distance - 2.0_f64.sqrt()).abs() < 1e-6);

        assert!(db.search(VectorColumn::Dominant, &one_hot(5), 0).unwrap().is_empty());
    }

    #[test]
    fn test_search_many_matches_search() {
        let db = Database::open_in_memory().unwrap();
        let (a, ma) = add_recording(&db, vec![one_hot(0), one_hot(1), one_hot(2)]);
        db.reindex(a, &ma).unwrap();

        let queries = [one_hot(1), one_hot(11)];
        let batch = db.search_many(VectorColumn::Frame, &queries, 2).unwrap();
        for (q, hits) in queries.iter().zip(&batch) {
            assert_eq!(hits, &db.search(VectorColumn::Frame, q, 2).unwrap());
        }
    }

    #[test]
    fn test_reader_sees_committed_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let writer = Database::open(&path).unwrap();
        let reader = Database::open(&path).unwrap();

        let (rid, m) = add_recording(&writer, vec![one_hot(3); 5]);
        writer.reindex(rid, &m).unwrap();

        let stats = reader.stats().unwrap();
        assert_eq!(stats.total_frames, 5);
        assert_eq!(stats.summary_records, 1);
    }
}
