//! Candidate retrieval: turn a query matrix into a short list of recordings
//! worth scoring in full.
//!
//! Frame retrieval asks the index for the nearest stored frames of every query
//! frame and ranks recordings by their mean distance. Summary retrieval issues
//! one query against a per-recording summary vector.

use crate::db::{self, DbError, models::VectorStats};
use crate::features::{HpcpFrame, InvalidShapeError, NormalizedHpcpMatrix};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Nearest stored frames fetched per query frame.
pub const FRAME_FANOUT: usize = 20;

/// Which stored vector a search runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorColumn {
    Frame,
    Mean,
    Std,
    Dominant,
}

/// A recording proposed by the index, with its distance to the query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CandidateHit {
    pub recording_id: i64,
    pub distance: f64,
}

/// Nearest-neighbour index over per-frame and per-recording HPCP vectors.
pub trait VectorIndex {
    /// Replace every stored vector of `recording_id` with those of `m`.
    fn reindex(&self, recording_id: i64, m: &NormalizedHpcpMatrix) -> db::Result<()>;

    fn delete_recording_vectors(&self, recording_id: i64) -> db::Result<()>;

    /// Top `k` hits by ascending Euclidean distance.
    fn search(&self, column: VectorColumn, query: &HpcpFrame, k: usize)
    -> db::Result<Vec<CandidateHit>>;

    fn search_many(
        &self,
        column: VectorColumn,
        queries: &[HpcpFrame],
        k: usize,
    ) -> db::Result<Vec<Vec<CandidateHit>>> {
        queries.iter().map(|q| self.search(column, q, k)).collect()
    }

    fn stats(&self) -> db::Result<VectorStats>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    /// Per-frame nearest neighbours, averaged per recording
    #[default]
    Frames,
    /// Mean chroma vector
    Mean,
    /// Strongest single frame
    Dominant,
    /// Per-class standard deviation
    Std,
}

impl SearchMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Frames => "frames",
            Self::Mean => "mean",
            Self::Dominant => "dominant",
            Self::Std => "std",
        }
    }
}

impl fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown search method '{0}' (expected frames, mean, dominant or std)")]
pub struct UnknownMethodError(pub String);

impl FromStr for SearchMethod {
    type Err = UnknownMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "frames" => Ok(Self::Frames),
            "mean" => Ok(Self::Mean),
            "dominant" => Ok(Self::Dominant),
            "std" => Ok(Self::Std),
            _ => Err(UnknownMethodError(s.to_string())),
        }
    }
}

#[derive(Error, Debug)]
pub enum RetrieveError {
    #[error(transparent)]
    InvalidShape(#[from] InvalidShapeError),
    #[error("Index error: {0}")]
    Index(#[from] DbError),
}

/// Up to `k` candidate recordings for `query`, best first.
pub fn retrieve<I: VectorIndex + ?Sized>(
    index: &I,
    query: &NormalizedHpcpMatrix,
    k: usize,
    method: SearchMethod,
) -> Result<Vec<CandidateHit>, RetrieveError> {
    if query.frame_count() == 0 {
        return Err(InvalidShapeError {
            rows: 0,
            cols: crate::HPCP_SIZE,
        }
        .into());
    }
    if k == 0 {
        return Ok(Vec::new());
    }

    let hits = match method {
        SearchMethod::Frames => {
            let per_frame = index.search_many(VectorColumn::Frame, query.frames(), FRAME_FANOUT)?;
            aggregate_by_recording(per_frame.into_iter().flatten(), k)
        }
        SearchMethod::Mean => index.search(VectorColumn::Mean, &query.mean(), k)?,
        SearchMethod::Dominant => index.search(VectorColumn::Dominant, &query.dominant(), k)?,
        SearchMethod::Std => index.search(VectorColumn::Std, &query.std(), k)?,
    };

    log::debug!("Retrieved {} candidates via {}", hits.len(), method);
    Ok(hits)
}

/// Mean distance per recording, ascending, ties by recording id.
fn aggregate_by_recording(hits: impl Iterator<Item = CandidateHit>, k: usize) -> Vec<CandidateHit> {
    let mut sums: HashMap<i64, (f64, usize)> = HashMap::new();
    for hit in hits {
        let entry = sums.entry(hit.recording_id).or_insert((0.0, 0));
        entry.0 += hit.distance;
        entry.1 += 1;
    }

    let mut ranked: Vec<CandidateHit> = sums
        .into_iter()
        .map(|(recording_id, (sum, n))| CandidateHit {
            recording_id,
            distance: sum / n as f64,
        })
        .collect();
    ranked.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then(a.recording_id.cmp(&b.recording_id))
    });
    ranked.truncate(k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HPCP_SIZE;
    use crate::db::Database;
    use crate::db::queries::SongRef;
    use crate::features::{HpcpMatrix, normalize};
    use crate::ingest::{RecordingMeta, ingest_matrix};
    use std::cell::RefCell;
    use std::path::Path;

    fn one_hot(c: usize) -> HpcpFrame {
        let mut f = [0.0; HPCP_SIZE];
        f[c] = 1.0;
        f
    }

    fn query(frames: Vec<HpcpFrame>) -> NormalizedHpcpMatrix {
        normalize(HpcpMatrix::new(frames).unwrap())
    }

    fn indexed(db: &Database, frames: Vec<HpcpFrame>) -> i64 {
        let song = SongRef::New { title: "song".into(), artist: None };
        let meta = RecordingMeta::new(song, "original", Path::new("song.wav"), 1.0);
        let m = HpcpMatrix::new(frames).unwrap();
        ingest_matrix(db, db, db, &meta, m).unwrap().recording_id
    }

    /// Records every call and answers from a fixed list.
    struct FakeIndex {
        hits: Vec<CandidateHit>,
        calls: RefCell<Vec<(VectorColumn, usize)>>,
    }

    impl VectorIndex for FakeIndex {
        fn reindex(&self, _: i64, _: &NormalizedHpcpMatrix) -> db::Result<()> {
            Ok(())
        }

        fn delete_recording_vectors(&self, _: i64) -> db::Result<()> {
            Ok(())
        }

        fn search(&self, column: VectorColumn, _: &HpcpFrame, k: usize) -> db::Result<Vec<CandidateHit>> {
            self.calls.borrow_mut().push((column, k));
            Ok(self.hits.iter().copied().take(k).collect())
        }

        fn stats(&self) -> db::Result<VectorStats> {
            Ok(VectorStats::default())
        }
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("frames".parse::<SearchMethod>().unwrap(), SearchMethod::Frames);
        assert_eq!("Dominant".parse::<SearchMethod>().unwrap(), SearchMethod::Dominant);
        let err = "cqt".parse::<SearchMethod>().unwrap_err();
        assert_eq!(err, UnknownMethodError("cqt".into()));
        assert_eq!(SearchMethod::Std.to_string(), "std");
    }

    #[test]
    fn test_frame_retrieval_averages_per_recording() {
        let fake = FakeIndex {
            hits: vec![
                CandidateHit { recording_id: 7, distance: 0.1 },
                CandidateHit { recording_id: 3, distance: 0.5 },
                CandidateHit { recording_id: 7, distance: 0.3 },
            ],
            calls: RefCell::new(Vec::new()),
        };
        let q = query(vec![one_hot(0), one_hot(4)]);
        let hits = retrieve(&fake, &q, 10, SearchMethod::Frames).unwrap();

        // Default search_many issues one search per frame with the fixed fan-out
        assert_eq!(
            *fake.calls.borrow(),
            vec![(VectorColumn::Frame, FRAME_FANOUT), (VectorColumn::Frame, FRAME_FANOUT)]
        );
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].recording_id, 7);
        assert!((hits[0].distance - 0.2).abs() < 1e-12);
        assert_eq!(hits[1].recording_id, 3);
    }

    #[test]
    fn test_frame_retrieval_ties_by_id() {
        let hits = aggregate_by_recording(
            [
                CandidateHit { recording_id: 9, distance: 1.0 },
                CandidateHit { recording_id: 2, distance: 1.0 },
                CandidateHit { recording_id: 5, distance: 0.5 },
            ]
            .into_iter(),
            2,
        );
        let ids: Vec<i64> = hits.iter().map(|h| h.recording_id).collect();
        assert_eq!(ids, vec![5, 2]);
    }

    #[test]
    fn test_summary_methods_use_one_search() {
        let fake = FakeIndex {
            hits: vec![CandidateHit { recording_id: 1, distance: 0.0 }],
            calls: RefCell::new(Vec::new()),
        };
        let q = query(vec![one_hot(2); 3]);
        for (method, column) in [
            (SearchMethod::Mean, VectorColumn::Mean),
            (SearchMethod::Dominant, VectorColumn::Dominant),
            (SearchMethod::Std, VectorColumn::Std),
        ] {
            fake.calls.borrow_mut().clear();
            retrieve(&fake, &q, 4, method).unwrap();
            assert_eq!(*fake.calls.borrow(), vec![(column, 4)]);
        }
    }

    #[test]
    fn test_zero_k_is_empty() {
        let fake = FakeIndex {
            hits: vec![CandidateHit { recording_id: 1, distance: 0.0 }],
            calls: RefCell::new(Vec::new()),
        };
        let q = query(vec![one_hot(0)]);
        assert!(retrieve(&fake, &q, 0, SearchMethod::Frames).unwrap().is_empty());
        assert!(fake.calls.borrow().is_empty());
    }

    #[test]
    fn test_retrieve_against_database() {
        let db = Database::open_in_memory().unwrap();
        let c_major = indexed(&db, vec![one_hot(0), one_hot(4), one_hot(7)]);
        let d_minor = indexed(&db, vec![one_hot(2), one_hot(5), one_hot(9)]);

        let q = query(vec![one_hot(0), one_hot(4), one_hot(7)]);
        for method in [SearchMethod::Frames, SearchMethod::Mean, SearchMethod::Dominant] {
            let hits = retrieve(&db, &q, 2, method).unwrap();
            assert_eq!(hits[0].recording_id, c_major, "method {method}");
            assert!(hits.iter().all(|h| h.recording_id == c_major || h.recording_id == d_minor));
        }

        let only_one = retrieve(&db, &q, 1, SearchMethod::Frames).unwrap();
        assert_eq!(only_one.len(), 1);
    }
}
