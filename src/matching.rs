//! Query pipeline: Retrieve → Rerank → Filter → Sort → Truncate.

use crate::db::{self, Database, DbError};
use crate::features::{HpcpMatrix, NormalizedHpcpMatrix};
use crate::retrieval::{self, CandidateHit, RetrieveError, SearchMethod, VectorIndex};
use crate::similarity;
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

/// Source of stored feature matrices.
pub trait FeatureStore {
    /// `Ok(None)` when the recording has no stored features.
    fn get_features(&self, recording_id: i64) -> db::Result<Option<HpcpMatrix>>;

    fn put_features(&self, recording_id: i64, m: &HpcpMatrix, hop_size: usize) -> db::Result<()>;
}

/// Recording metadata lookups needed while reranking.
pub trait RecordingCatalog {
    fn recording_exists(&self, recording_id: i64) -> db::Result<bool>;
}

impl FeatureStore for Database {
    fn get_features(&self, recording_id: i64) -> db::Result<Option<HpcpMatrix>> {
        self.load_features(recording_id)
    }

    fn put_features(&self, recording_id: i64, m: &HpcpMatrix, hop_size: usize) -> db::Result<()> {
        self.store_features(recording_id, m, hop_size)
    }
}

impl RecordingCatalog for Database {
    fn recording_exists(&self, recording_id: i64) -> db::Result<bool> {
        Database::recording_exists(self, recording_id)
    }
}

/// The collaborators one search runs against.
#[derive(Clone, Copy)]
pub struct MatchContext<'a> {
    pub index: &'a dyn VectorIndex,
    pub features: &'a dyn FeatureStore,
    pub catalog: &'a dyn RecordingCatalog,
}

impl<'a> MatchContext<'a> {
    /// All three collaborators backed by one database handle.
    pub fn from_database(db: &'a Database) -> Self {
        Self {
            index: db,
            features: db,
            catalog: db,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub method: SearchMethod,
    /// Results returned after filtering.
    pub limit: usize,
    /// Candidates fetched from the index before reranking.
    pub pre_filter_limit: usize,
    /// Minimum score a result must reach, in [0, 1].
    pub threshold: f64,
}

impl SearchParams {
    pub fn validate(&self) -> Result<(), MatchError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(MatchError::InvalidParams(format!(
                "threshold must be in [0, 1], got {}",
                self.threshold
            )));
        }
        if self.limit == 0 {
            return Err(MatchError::InvalidParams("limit must be at least 1".into()));
        }
        if self.pre_filter_limit < self.limit {
            return Err(MatchError::InvalidParams(format!(
                "pre_filter_limit ({}) must be >= limit ({})",
                self.pre_filter_limit, self.limit
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchResult {
    pub recording_id: i64,
    pub score: f64,
    /// Distance reported by the retrieval stage.
    pub distance: f64,
}

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("Invalid search parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Retrieve(#[from] RetrieveError),
    #[error("Store error: {0}")]
    Store(#[from] DbError),
}

/// Recordings matching `query`, best first.
pub fn search(
    ctx: &MatchContext<'_>,
    query: &NormalizedHpcpMatrix,
    params: &SearchParams,
) -> Result<Vec<MatchResult>, MatchError> {
    params.validate()?;

    let candidates = retrieval::retrieve(ctx.index, query, params.pre_filter_limit, params.method)?;
    log::info!(
        "{} candidates from {} retrieval",
        candidates.len(),
        params.method
    );

    let loaded = load_candidates(ctx, &candidates)?;

    let mut results: Vec<MatchResult> = loaded
        .par_iter()
        .map(|(hit, reference)| MatchResult {
            recording_id: hit.recording_id,
            score: similarity::score(query, reference),
            distance: hit.distance,
        })
        .filter(|r| similarity::is_match(r.score, params.threshold))
        .collect();

    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.distance.total_cmp(&b.distance))
            .then(a.recording_id.cmp(&b.recording_id))
    });
    results.truncate(params.limit);

    log::debug!(
        "{} of {} reranked candidates passed threshold {}",
        results.len(),
        loaded.len(),
        params.threshold
    );
    Ok(results)
}

/// Fetch the feature matrix of every candidate that still exists.
///
/// Candidates whose metadata is gone are dropped silently; missing or
/// undecodable features are logged and dropped.
fn load_candidates(
    ctx: &MatchContext<'_>,
    candidates: &[CandidateHit],
) -> Result<Vec<(CandidateHit, HpcpMatrix)>, MatchError> {
    let mut loaded = Vec::with_capacity(candidates.len());
    for hit in candidates {
        if !ctx.catalog.recording_exists(hit.recording_id)? {
            continue;
        }
        match ctx.features.get_features(hit.recording_id) {
            Ok(Some(m)) => loaded.push((*hit, m)),
            Ok(None) => {
                log::warn!("Recording {} has no stored features, skipping", hit.recording_id);
            }
            Err(DbError::Malformed(e)) => {
                log::warn!("Recording {} has malformed features ({}), skipping", hit.recording_id, e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HPCP_SIZE;
    use crate::db::models::VectorStats;
    use crate::db::queries::SongRef;
    use crate::features::blob::MalformedFeatureError;
    use crate::features::{HpcpFrame, normalize};
    use crate::ingest::{RecordingMeta, ingest_matrix};
    use crate::retrieval::VectorColumn;
    use std::collections::{HashMap, HashSet};
    use std::path::Path;

    /// A I-IV-V-I style progression rooted at `root`, with slow drift so
    /// the temporal profile is not flat.
    fn progression(root: usize, frames: usize) -> HpcpMatrix {
        let degrees = [0, 5, 7, 0, 9, 5, 7, 0];
        let rows: Vec<HpcpFrame> = (0..frames)
            .map(|i| {
                let d = degrees[(i * degrees.len()) / frames];
                let mut f = [0.05f32; HPCP_SIZE];
                for (k, iv) in [0usize, 4, 7].iter().enumerate() {
                    f[(root + d + iv) % HPCP_SIZE] = 1.0 - 0.2 * k as f32;
                }
                f
            })
            .collect();
        HpcpMatrix::new(rows).unwrap()
    }

    fn ingest(db: &Database, m: &HpcpMatrix) -> i64 {
        let song = SongRef::New { title: "song".into(), artist: None };
        let meta = RecordingMeta::new(song, "original", Path::new("song.wav"), 10.0);
        let outcome = ingest_matrix(db, db, db, &meta, m.clone()).unwrap();
        assert!(outcome.vector_stored());
        outcome.recording_id
    }

    fn params(threshold: f64) -> SearchParams {
        SearchParams {
            method: SearchMethod::Frames,
            limit: 5,
            pre_filter_limit: 50,
            threshold,
        }
    }

    /// In-memory collaborators with configurable gaps.
    #[derive(Default)]
    struct FakeLibrary {
        hits: Vec<CandidateHit>,
        features: HashMap<i64, HpcpMatrix>,
        corrupt: HashSet<i64>,
        known: HashSet<i64>,
    }

    impl VectorIndex for FakeLibrary {
        fn reindex(&self, _: i64, _: &NormalizedHpcpMatrix) -> db::Result<()> {
            Ok(())
        }

        fn delete_recording_vectors(&self, _: i64) -> db::Result<()> {
            Ok(())
        }

        fn search(&self, _: VectorColumn, _: &HpcpFrame, k: usize) -> db::Result<Vec<CandidateHit>> {
            Ok(self.hits.iter().copied().take(k).collect())
        }

        fn stats(&self) -> db::Result<VectorStats> {
            Ok(VectorStats::default())
        }
    }

    impl FeatureStore for FakeLibrary {
        fn get_features(&self, recording_id: i64) -> db::Result<Option<HpcpMatrix>> {
            if self.corrupt.contains(&recording_id) {
                return Err(MalformedFeatureError::BadMagic.into());
            }
            Ok(self.features.get(&recording_id).cloned())
        }

        fn put_features(&self, _: i64, _: &HpcpMatrix, _: usize) -> db::Result<()> {
            Ok(())
        }
    }

    impl RecordingCatalog for FakeLibrary {
        fn recording_exists(&self, recording_id: i64) -> db::Result<bool> {
            Ok(self.known.contains(&recording_id))
        }
    }

    fn context(lib: &FakeLibrary) -> MatchContext<'_> {
        MatchContext {
            index: lib,
            features: lib,
            catalog: lib,
        }
    }

    #[test]
    fn test_params_validation() {
        assert!(params(0.5).validate().is_ok());
        assert!(params(1.5).validate().is_err());
        assert!(params(-0.1).validate().is_err());
        assert!(params(f64::NAN).validate().is_err());
        assert!(SearchParams { limit: 0, ..params(0.5) }.validate().is_err());
        assert!(
            SearchParams { pre_filter_limit: 3, ..params(0.5) }
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_finds_transposed_recording() {
        let db = Database::open_in_memory().unwrap();
        let target = ingest(&db, &progression(0, 120));
        let _other = ingest(&db, &progression(3, 40).rolled(1));

        let query = normalize(progression(0, 120).rolled(2));
        let results = search(&MatchContext::from_database(&db), &query, &params(0.5)).unwrap();

        assert!(!results.is_empty());
        assert_eq!(results[0].recording_id, target);
        assert!(results[0].score >= 0.9, "score {}", results[0].score);
    }

    #[test]
    fn test_threshold_filters_everything() {
        let db = Database::open_in_memory().unwrap();
        ingest(&db, &progression(0, 60));

        let query = normalize(progression(0, 60));
        let results = search(&MatchContext::from_database(&db), &query, &params(1.0));
        // A perfect self-match may reach exactly 1.0; anything it returns must.
        assert!(results.unwrap().iter().all(|r| r.score >= 1.0));

        let empty = Database::open_in_memory().unwrap();
        let none = search(&MatchContext::from_database(&empty), &query, &params(0.0)).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_skips_missing_and_corrupt_candidates() {
        let m = progression(0, 40);
        let lib = FakeLibrary {
            hits: (1..=4).map(|id| CandidateHit { recording_id: id, distance: 0.1 }).collect(),
            features: [(1, m.clone()), (2, m.clone())].into_iter().collect(),
            corrupt: [3].into_iter().collect(),
            // 4 has features nowhere and 2 has no metadata
            known: [1, 3, 4].into_iter().collect(),
        };

        let results = search(&context(&lib), &normalize(m), &params(0.0)).unwrap();
        let ids: Vec<i64> = results.iter().map(|r| r.recording_id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_sort_and_truncate() {
        let m = progression(0, 40);
        let lib = FakeLibrary {
            hits: vec![
                CandidateHit { recording_id: 9, distance: 0.3 },
                CandidateHit { recording_id: 4, distance: 0.3 },
                CandidateHit { recording_id: 2, distance: 0.1 },
            ],
            features: [9, 4, 2].into_iter().map(|id| (id, m.clone())).collect(),
            known: [9, 4, 2].into_iter().collect(),
            ..Default::default()
        };

        let p = SearchParams { limit: 2, ..params(0.0) };
        let results = search(&context(&lib), &normalize(m), &p).unwrap();
        // Identical scores fall back to distance, then id
        let ids: Vec<i64> = results.iter().map(|r| r.recording_id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(results[0].score, results[1].score);
    }
}
