use serde::Serialize;

/// A musical work; several recordings may belong to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Song {
    pub id: i64,
    pub title: String,
    pub artist: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Data for inserting a recording.
#[derive(Debug, Clone)]
pub struct NewRecording {
    pub song_id: i64,
    /// e.g. "original", "karaoke", "pitch +2"
    pub recording_name: String,
    pub duration: f64,
    pub sample_rate: u32,
    pub audio_path: String,
}

/// A recording row read from the database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recording {
    pub id: i64,
    pub song_id: i64,
    pub recording_name: String,
    pub duration: f64,
    pub sample_rate: u32,
    pub audio_path: String,
    pub created_at: String,
}

/// Recording joined with its song, for listings and search output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingInfo {
    pub id: i64,
    pub song_id: i64,
    pub song_title: String,
    pub artist: Option<String>,
    pub recording_name: String,
    pub duration: f64,
    pub has_features: bool,
}

/// Row counts of the vector tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VectorStats {
    pub total_frames: i64,
    pub total_recordings: i64,
    pub summary_records: i64,
}

/// Library-wide counts for `stats`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LibraryStats {
    pub songs: i64,
    pub recordings: i64,
    pub with_features: i64,
    pub vectors: VectorStats,
}
