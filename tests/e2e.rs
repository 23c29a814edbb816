//! Scoring checks against real recordings.
//!
//! These need audio fixtures and `ffmpeg`, so they are ignored by default:
//!
//! ```text
//! SONGMATCH_E2E_DIR=/path/to/fixtures cargo test --test e2e -- --ignored
//! ```
//!
//! Expected files in the fixture directory:
//! `song_a.wav`, `song_b.wav`, `song_c.wav` (three unrelated 30 s songs),
//! `song_a_pitch+2.wav` (song A, +2 semitones),
//! `song_a_tempo0.90x.wav` (song A at 0.9x tempo),
//! `studio.wav` and `karaoke.wav` (same song, different vocals).

use songmatch::db::Database;
use songmatch::db::queries::SongRef;
use songmatch::features::{NormalizedHpcpMatrix, normalize};
use songmatch::matching::{self, MatchContext, SearchParams};
use songmatch::retrieval::SearchMethod;
use songmatch::similarity::score;
use std::path::PathBuf;

fn fixture(name: &str) -> PathBuf {
    let dir = std::env::var("SONGMATCH_E2E_DIR").expect("SONGMATCH_E2E_DIR not set");
    PathBuf::from(dir).join(name)
}

fn fingerprint(name: &str) -> NormalizedHpcpMatrix {
    let (m, _) = songmatch::ingest::analyze_file(&fixture(name))
        .unwrap_or_else(|e| panic!("extracting {name}: {e}"));
    normalize(m)
}

#[test]
#[ignore]
fn scenario_a_distinct_songs() {
    let songs: Vec<_> = ["song_a.wav", "song_b.wav", "song_c.wav"]
        .iter()
        .map(|n| fingerprint(n))
        .collect();

    for (i, a) in songs.iter().enumerate() {
        let own = score(a, a);
        assert!(own >= 0.95, "self score {i}: {own}");
        for (j, b) in songs.iter().enumerate() {
            if i != j {
                let cross = score(a, b);
                assert!(cross < 0.89, "cross score {i}/{j}: {cross}");
            }
        }
    }
}

#[test]
#[ignore]
fn scenario_b_pitch_and_tempo_shift() {
    let reference = fingerprint("song_a.wav");

    for name in ["song_a_pitch+2.wav", "song_a_tempo0.90x.wav"] {
        let s = score(&fingerprint(name), &reference);
        assert!(s >= 0.85, "{name} vs reference: {s}");
    }
}

#[test]
#[ignore]
fn scenario_c_karaoke() {
    let studio = fingerprint("studio.wav");
    let karaoke = fingerprint("karaoke.wav");
    let unrelated = fingerprint("song_b.wav");

    let same = score(&karaoke, &studio);
    assert!(same >= 0.85, "karaoke vs studio: {same}");
    let other = score(&karaoke, &unrelated);
    assert!(other < 0.85, "karaoke vs unrelated: {other}");
}

#[test]
#[ignore]
fn search_finds_karaoke_source() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(&dir.path().join("library.db")).unwrap();

    let mut studio_id = None;
    for name in ["studio.wav", "song_b.wav", "song_c.wav"] {
        let outcome = songmatch::ingest::ingest_file(
            &db,
            &db,
            &db,
            &fixture(name),
            SongRef::New { title: name.into(), artist: None },
            None,
        )
        .unwrap();
        assert!(outcome.vector_stored());
        if name == "studio.wav" {
            studio_id = Some(outcome.recording_id);
        }
    }

    let params = SearchParams {
        method: SearchMethod::Frames,
        limit: 3,
        pre_filter_limit: 10,
        threshold: 0.85,
    };
    let results = matching::search(
        &MatchContext::from_database(&db),
        &fingerprint("karaoke.wav"),
        &params,
    )
    .unwrap();
    assert_eq!(results.first().map(|r| r.recording_id), studio_id);
}
