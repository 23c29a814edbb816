use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use songmatch::db::Database;
use songmatch::db::models::RecordingInfo;
use songmatch::db::queries::SongRef;
use songmatch::features::{HpcpMatrix, blob, normalize};
use songmatch::matching::{MatchContext, MatchResult, SearchParams};
use songmatch::retrieval::SearchMethod;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "songmatch", version, about = "Cover-robust song identification")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract an HPCP fingerprint from an audio file
    Extract {
        file: PathBuf,

        /// Write the base64 blob here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Add one recording to the library
    Add {
        file: PathBuf,

        /// Attach to an existing song
        #[arg(long, conflicts_with_all = ["title", "artist"])]
        song_id: Option<i64>,

        /// Title of the new song (defaults to the file name)
        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        artist: Option<String>,

        /// Recording label, e.g. "karaoke" or "live"
        #[arg(long, default_value = songmatch::ingest::DEFAULT_RECORDING_NAME)]
        name: String,
    },

    /// Import every audio file under the given directories, one song per file
    Import {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Find library recordings matching an audio file or blob
    Search {
        input: PathBuf,

        /// Minimum score in [0, 1]
        #[arg(short, long)]
        threshold: f64,

        /// Treat INPUT as a fingerprint blob (raw or base64) instead of audio
        #[arg(long)]
        blob: bool,

        /// Retrieval method (defaults to config)
        #[arg(short, long, value_enum)]
        method: Option<SearchMethod>,

        /// Number of results (defaults to config)
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Candidates to rerank (defaults to config)
        #[arg(long)]
        pre_filter_limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Score two audio files or blobs against each other
    Compare {
        query: PathBuf,
        reference: PathBuf,

        /// Treat both inputs as fingerprint blobs
        #[arg(long)]
        blob: bool,

        /// Print a match verdict against this threshold
        #[arg(short, long)]
        threshold: Option<f64>,

        #[arg(long)]
        json: bool,
    },

    /// List songs
    Songs {
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// List recordings
    Recordings {
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Delete a recording with its fingerprint and index rows
    DeleteRecording { id: i64 },

    /// Delete a song and all of its recordings
    DeleteSong { id: i64 },

    /// Rebuild the vector index from stored fingerprints
    Reindex,

    /// Show library and index statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = songmatch::config::AppConfig::load();

    let db_path = config.resolve_db_path(cli.db_path);
    let open_db = || {
        log::info!("Database: {}", db_path.display());
        Database::open(&db_path).context("Failed to open database")
    };

    match cli.command {
        Commands::Extract { file, out } => {
            let (matrix, duration) = songmatch::ingest::analyze_file(&file)
                .with_context(|| format!("Failed to extract {}", file.display()))?;
            let normalized = normalize(matrix);
            let encoded = blob::encode_base64(&normalized);

            match out {
                Some(path) => {
                    std::fs::write(&path, &encoded)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!(
                        "Extracted {} frames ({:.1}s) to {}",
                        normalized.frame_count(),
                        duration,
                        path.display()
                    );
                }
                None => {
                    eprintln!("{} frames, {:.1}s", normalized.frame_count(), duration);
                    println!("{encoded}");
                }
            }
        }

        Commands::Add {
            file,
            song_id,
            title,
            artist,
            name,
        } => {
            let db = open_db()?;
            let song = match song_id {
                Some(id) => SongRef::Existing(id),
                None => SongRef::New {
                    title: title.unwrap_or_else(|| file_title(&file)),
                    artist,
                },
            };
            let outcome = songmatch::ingest::ingest_file(&db, &db, &db, &file, song, Some(&name))
                .with_context(|| format!("Failed to add {}", file.display()))?;
            println!(
                "Added recording {} (song {}, {} frames)",
                outcome.recording_id, outcome.song_id, outcome.frame_count
            );
            if let Some(warning) = &outcome.index_warning {
                println!("Warning: {warning}. Run `songmatch reindex` to retry.");
            }
        }

        Commands::Import { paths, jobs } => {
            let db = open_db()?;
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let result = songmatch::ingest::import_dirs(&db, &paths, workers)
                .context("Import failed")?;
            println!(
                "Import complete: {} imported, {} failed, {} not indexed",
                result.imported, result.failed, result.unindexed
            );
        }

        Commands::Search {
            input,
            threshold,
            blob: is_blob,
            method,
            limit,
            pre_filter_limit,
            json,
        } => {
            let db = open_db()?;
            let query = normalize(load_input(&input, is_blob)?);
            let params = SearchParams {
                method: method.unwrap_or(config.search.method),
                limit: limit.unwrap_or(config.search.limit),
                pre_filter_limit: pre_filter_limit.unwrap_or(config.search.pre_filter_limit),
                threshold,
            };

            let results = songmatch::matching::search(&MatchContext::from_database(&db), &query, &params)
                .context("Search failed")?;

            let rows: Vec<(MatchResult, Option<RecordingInfo>)> = results
                .into_iter()
                .map(|r| -> songmatch::db::Result<_> { Ok((r, db.get_recording_info(r.recording_id)?)) })
                .collect::<songmatch::db::Result<_>>()
                .context("Failed to load recording metadata")?;

            if json {
                let out: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|(r, info)| serde_json::json!({ "match": r, "recording": info }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else if rows.is_empty() {
                println!("No matches at threshold {threshold}");
            } else {
                print_match_table(&rows);
            }
        }

        Commands::Compare {
            query,
            reference,
            blob: is_blob,
            threshold,
            json,
        } => {
            let q = normalize(load_input(&query, is_blob)?);
            let r = normalize(load_input(&reference, is_blob)?);
            let breakdown = songmatch::similarity::score_breakdown(&q, &r);
            let verdict = threshold.map(|t| songmatch::similarity::is_match(breakdown.score, t));

            if json {
                let out = serde_json::json!({ "breakdown": breakdown, "match": verdict });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Global:     {:.4} (shift {})", breakdown.global, breakdown.best_shift);
                println!("Histogram:  {:.4}", breakdown.histogram);
                println!("Temporal:   {:.4}", breakdown.temporal);
                println!(
                    "Length:     ratio {:.2}, penalty {:.2}",
                    breakdown.length_ratio, breakdown.penalty
                );
                println!("Score:      {:.4}", breakdown.score);
                if let (Some(t), Some(m)) = (threshold, verdict) {
                    println!("Match:      {} (threshold {t})", if m { "yes" } else { "no" });
                }
            }
        }

        Commands::Songs { limit, offset } => {
            let db = open_db()?;
            let songs = db.list_songs(limit, offset).context("Failed to list songs")?;
            println!("{:>6}  {:<40} {}", "ID", "Title", "Artist");
            println!("{}", "-".repeat(70));
            for s in &songs {
                println!(
                    "{:>6}  {:<40} {}",
                    s.id,
                    truncate(&s.title, 40),
                    s.artist.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Recordings { limit, offset } => {
            let db = open_db()?;
            let recs = db
                .list_recordings(limit, offset)
                .context("Failed to list recordings")?;
            println!(
                "{:>6} {:>6}  {:<30} {:<16} {:>7}  {}",
                "ID", "Song", "Title", "Name", "Secs", "Indexed"
            );
            println!("{}", "-".repeat(80));
            for r in &recs {
                println!(
                    "{:>6} {:>6}  {:<30} {:<16} {:>7.1}  {}",
                    r.id,
                    r.song_id,
                    truncate(&r.song_title, 30),
                    truncate(&r.recording_name, 16),
                    r.duration,
                    if r.has_features { "yes" } else { "no" }
                );
            }
        }

        Commands::DeleteRecording { id } => {
            let db = open_db()?;
            if db.delete_recording(id).context("Delete failed")? {
                println!("Deleted recording {id}");
            } else {
                anyhow::bail!("Recording {id} not found");
            }
        }

        Commands::DeleteSong { id } => {
            let db = open_db()?;
            if db.delete_song(id).context("Delete failed")? {
                println!("Deleted song {id}");
            } else {
                anyhow::bail!("Song {id} not found");
            }
        }

        Commands::Reindex => {
            let db = open_db()?;
            let result = songmatch::ingest::reindex_all(&db, &db).context("Reindex failed")?;
            println!(
                "Reindex complete: {} recordings indexed, {} failed",
                result.reindexed, result.failed
            );
        }

        Commands::Stats { json } => {
            let db = open_db()?;
            let stats = db.library_stats().context("Failed to get stats")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Library Statistics");
                println!("==================");
                println!("Songs:               {}", stats.songs);
                println!("Recordings:          {}", stats.recordings);
                println!("With fingerprints:   {}", stats.with_features);
                println!();
                println!("Vector Index");
                println!("============");
                println!("Indexed frames:      {}", stats.vectors.total_frames);
                println!("Indexed recordings:  {}", stats.vectors.total_recordings);
                println!("Summary rows:        {}", stats.vectors.summary_records);
            }
        }
    }

    Ok(())
}

/// Load a query matrix from an audio file, or from a raw or base64 blob.
fn load_input(path: &Path, is_blob: bool) -> Result<HpcpMatrix> {
    if !is_blob {
        let (matrix, _) = songmatch::ingest::analyze_file(path)
            .with_context(|| format!("Failed to extract {}", path.display()))?;
        return Ok(matrix);
    }

    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let matrix = if bytes.starts_with(blob::MAGIC) {
        blob::decode(&bytes)
    } else {
        blob::decode_base64(&String::from_utf8_lossy(&bytes))
    };
    matrix.with_context(|| format!("Invalid fingerprint blob {}", path.display()))
}

fn file_title(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "untitled".to_string())
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() > width {
        let head: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        s.to_string()
    }
}

/// Print search results, best first.
fn print_match_table(rows: &[(MatchResult, Option<RecordingInfo>)]) {
    println!(
        "{:>6} {:>7} {:>8}  {:<30} {:<20} {}",
        "Rec", "Score", "Dist", "Song", "Artist", "Recording"
    );
    println!("{}", "-".repeat(90));

    for (r, info) in rows {
        let (title, artist, name) = match info {
            Some(i) => (
                truncate(&i.song_title, 30),
                truncate(i.artist.as_deref().unwrap_or(""), 20),
                i.recording_name.clone(),
            ),
            None => ("?".to_string(), String::new(), String::new()),
        };
        println!(
            "{:>6} {:>7.4} {:>8.4}  {:<30} {:<20} {}",
            r.recording_id, r.score, r.distance, title, artist, name
        );
    }
}
