pub mod analyzer;
pub mod config;
pub mod db;
pub mod features;
pub mod ingest;
pub mod matching;
pub mod retrieval;
pub mod similarity;

/// Audio file extensions picked up by `import` (decoded through ffmpeg)
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "wav", "mp3", "m4a", "flac", "ogg",
    "aif", "aiff", "aac", "opus",
];

/// Sample rate every signal is analyzed at.
pub const SAMPLE_RATE: u32 = 44_100;

/// Number of pitch classes per HPCP frame (C through B).
pub const HPCP_SIZE: usize = 12;

/// Application name for XDG paths
pub const APP_NAME: &str = "songmatch";
