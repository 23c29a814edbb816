//! Storing recordings: feature blob first, index rows second.
//!
//! The metadata row and its feature blob are written in one transaction.
//! Index rows follow in their own transaction; if that fails the recording is
//! kept and the caller gets an [`IndexWriteWarning`] instead of an error.

use crate::SUPPORTED_EXTENSIONS;
use crate::analyzer::decode::{self, DecodeError};
use crate::analyzer::spectrum::HOP_SIZE;
use crate::analyzer::{self, ExtractionError};
use crate::db::models::NewRecording;
use crate::db::queries::SongRef;
use crate::db::{Database, DbError};
use crate::features::{HpcpMatrix, NormalizedHpcpMatrix, normalize};
use crate::matching::FeatureStore;
use crate::retrieval::VectorIndex;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Recording name used when none is given.
pub const DEFAULT_RECORDING_NAME: &str = "original";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// The recording was stored but its index rows were not written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexWriteWarning {
    pub recording_id: i64,
    pub reason: String,
}

impl fmt::Display for IndexWriteWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recording {} is stored but not searchable: {}",
            self.recording_id, self.reason
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub song_id: i64,
    pub recording_id: i64,
    pub frame_count: usize,
    pub index_warning: Option<IndexWriteWarning>,
}

impl IngestOutcome {
    /// Whether the recording is reachable through the vector index.
    pub fn vector_stored(&self) -> bool {
        self.index_warning.is_none()
    }
}

/// Metadata for one recording to ingest.
#[derive(Debug, Clone)]
pub struct RecordingMeta {
    pub song: SongRef,
    pub recording_name: String,
    pub audio_path: String,
    pub duration: f64,
    pub sample_rate: u32,
}

impl RecordingMeta {
    /// Metadata for a recording decoded from `path` at [`crate::SAMPLE_RATE`].
    pub fn new(song: SongRef, recording_name: &str, path: &Path, duration: f64) -> Self {
        Self {
            song,
            recording_name: recording_name.to_string(),
            audio_path: path.to_string_lossy().to_string(),
            duration,
            sample_rate: crate::SAMPLE_RATE,
        }
    }
}

/// Normalize `matrix`, store it with `meta`, then index it.
///
/// The song, recording and feature blob commit together: a failing
/// `store` leaves nothing behind.
pub fn ingest_matrix<S, I>(
    db: &Database,
    store: &S,
    index: &I,
    meta: &RecordingMeta,
    matrix: HpcpMatrix,
) -> Result<IngestOutcome, IngestError>
where
    S: FeatureStore + ?Sized,
    I: VectorIndex + ?Sized,
{
    let normalized = normalize(matrix);

    let tx = db.conn.unchecked_transaction().map_err(DbError::from)?;
    let song_id = db.resolve_song(&meta.song)?;
    let recording_id = db.create_recording(&NewRecording {
        song_id,
        recording_name: meta.recording_name.clone(),
        duration: meta.duration,
        sample_rate: meta.sample_rate,
        audio_path: meta.audio_path.clone(),
    })?;
    store.put_features(recording_id, &normalized, HOP_SIZE)?;
    tx.commit().map_err(DbError::from)?;

    let index_warning = index_recording(index, recording_id, &normalized);
    log::info!(
        "Stored recording {} ({} frames) under song {}",
        recording_id,
        normalized.frame_count(),
        song_id
    );

    Ok(IngestOutcome {
        song_id,
        recording_id,
        frame_count: normalized.frame_count(),
        index_warning,
    })
}

fn index_recording<I: VectorIndex + ?Sized>(
    index: &I,
    recording_id: i64,
    m: &NormalizedHpcpMatrix,
) -> Option<IndexWriteWarning> {
    match index.reindex(recording_id, m) {
        Ok(()) => None,
        Err(e) => {
            let warning = IndexWriteWarning {
                recording_id,
                reason: e.to_string(),
            };
            log::warn!("{}", warning);
            Some(warning)
        }
    }
}

/// Decode and extract one file, ready for [`ingest_matrix`].
pub fn analyze_file(path: &Path) -> Result<(HpcpMatrix, f64), IngestError> {
    let signal = decode::load_audio(path)?;
    let matrix = analyzer::extract(&signal)?;
    Ok((matrix, signal.duration_secs()))
}

/// Decode, extract and store one audio file.
pub fn ingest_file<S, I>(
    db: &Database,
    store: &S,
    index: &I,
    path: &Path,
    song: SongRef,
    recording_name: Option<&str>,
) -> Result<IngestOutcome, IngestError>
where
    S: FeatureStore + ?Sized,
    I: VectorIndex + ?Sized,
{
    let (matrix, duration) = analyze_file(path)?;
    let name = recording_name.unwrap_or(DEFAULT_RECORDING_NAME);
    let meta = RecordingMeta::new(song, name, path, duration);
    ingest_matrix(db, store, index, &meta, matrix)
}

#[derive(Debug, Default, Serialize)]
pub struct ImportResult {
    pub imported: u64,
    pub failed: u64,
    /// Stored but not indexed.
    pub unindexed: u64,
}

/// Every supported audio file under `paths`, sorted.
pub fn collect_audio_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = paths
        .iter()
        .flat_map(|p| WalkDir::new(p).follow_links(true).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let ext = e
                .path()
                .extension()
                .and_then(|x| x.to_str())
                .unwrap_or("")
                .to_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Song title for an imported file: its stem.
fn title_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

/// Import every audio file under `paths` as a new song with one recording.
pub fn import_dirs(
    db: &Database,
    paths: &[PathBuf],
    jobs: usize,
) -> Result<ImportResult, IngestError> {
    let files = collect_audio_files(paths);
    let mut result = ImportResult::default();

    if files.is_empty() {
        log::info!("No audio files to import");
        return Ok(result);
    }

    log::info!("Importing {} files with {} workers", files.len(), jobs);

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;

    // Extract a chunk in parallel, then store it before moving on
    let chunk_size = jobs.max(1) * 2;

    for chunk in files.chunks(chunk_size) {
        let analyzed: Vec<_> = pool.install(|| {
            use rayon::prelude::*;
            chunk
                .par_iter()
                .map(|path| {
                    let r = analyze_file(path);
                    pb.inc(1);
                    (path, r)
                })
                .collect()
        });

        for (path, analysis) in analyzed {
            let stored = analysis.and_then(|(matrix, duration)| {
                let song = SongRef::New {
                    title: title_for(path),
                    artist: None,
                };
                let meta = RecordingMeta::new(song, DEFAULT_RECORDING_NAME, path, duration);
                ingest_matrix(db, db, db, &meta, matrix)
            });
            match stored {
                Ok(outcome) => {
                    result.imported += 1;
                    if !outcome.vector_stored() {
                        result.unindexed += 1;
                    }
                }
                Err(e) => {
                    log::warn!("Import failed for {}: {}", path.display(), e);
                    result.failed += 1;
                }
            }
        }

        pb.set_message(format!("{} stored, {} failed", result.imported, result.failed));
    }

    pb.finish_with_message(format!(
        "Done: {} imported, {} failed",
        result.imported, result.failed
    ));

    Ok(result)
}

#[derive(Debug, Default, Serialize)]
pub struct ReindexResult {
    pub reindexed: u64,
    pub failed: u64,
}

/// Rebuild the index rows of every recording from its stored feature blob.
pub fn reindex_all<I: VectorIndex + ?Sized>(
    db: &Database,
    index: &I,
) -> Result<ReindexResult, IngestError> {
    let ids = db.feature_recording_ids()?;
    let mut result = ReindexResult::default();

    for id in ids {
        let stored = match db.load_features(id) {
            Ok(Some(m)) => m,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("Skipping recording {}: {}", id, e);
                result.failed += 1;
                continue;
            }
        };
        // Blobs are written normalized by ingest_matrix
        let m = NormalizedHpcpMatrix::assume_normalized(stored);
        match index.reindex(id, &m) {
            Ok(()) => result.reindexed += 1,
            Err(e) => {
                log::warn!("Reindex failed for recording {}: {}", id, e);
                result.failed += 1;
            }
        }
    }

    log::info!(
        "Reindexed {} recordings ({} failed)",
        result.reindexed,
        result.failed
    );
    Ok(result)
}
