//! Transposition- and tempo-robust similarity between two HPCP matrices.
//!
//! The score blends three views of the material:
//!
//! - **global**: mean chroma, compared under the best of 12 cyclic shifts
//! - **histogram**: per-class value distributions, compared at the best shift
//! - **temporal**: 10-segment mean/std profile, compared at the best shift
//!
//! A mild penalty applies when the two frame counts differ by more than a
//! plausible tempo change.

use crate::HPCP_SIZE;
use crate::features::{HpcpFrame, HpcpMatrix, roll};
use serde::Serialize;

const EPSILON: f64 = 1e-6;

const HIST_BINS: usize = 32;
const TEMPORAL_SEGMENTS: usize = 10;

const GLOBAL_WEIGHT: f64 = 0.25;
const HIST_WEIGHT: f64 = 0.25;
const TEMPORAL_WEIGHT: f64 = 0.5;

/// Frame-count ratios above this are treated as tempo drift (≈0.8×–1.25×).
const LENGTH_RATIO_TOLERANCE: f64 = 0.64;
const LENGTH_PENALTY: f64 = 0.95;

/// All intermediate values of one comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimilarityBreakdown {
    pub global: f64,
    pub histogram: f64,
    pub temporal: f64,
    pub best_shift: usize,
    pub length_ratio: f64,
    pub penalty: f64,
    pub score: f64,
}

/// Similarity in [0, 1] between a query and a reference matrix.
pub fn score(query: &HpcpMatrix, reference: &HpcpMatrix) -> f64 {
    score_breakdown(query, reference).score
}

/// Decision rule: the caller always supplies the threshold.
pub fn is_match(score: f64, threshold: f64) -> bool {
    score >= threshold
}

pub fn score_breakdown(query: &HpcpMatrix, reference: &HpcpMatrix) -> SimilarityBreakdown {
    let (best_shift, global) = global_similarity(query, reference);
    let histogram = histogram_similarity(query, reference, best_shift);
    let temporal = temporal_similarity(query, reference, best_shift);

    let (nq, nr) = (query.frame_count() as f64, reference.frame_count() as f64);
    let length_ratio = nq.min(nr) / nq.max(nr);
    let penalty = length_penalty(length_ratio);

    let raw = GLOBAL_WEIGHT * global + HIST_WEIGHT * histogram + TEMPORAL_WEIGHT * temporal;
    SimilarityBreakdown {
        global,
        histogram,
        temporal,
        best_shift,
        length_ratio,
        penalty,
        score: (raw * penalty).clamp(0.0, 1.0),
    }
}

fn length_penalty(ratio: f64) -> f64 {
    if ratio > LENGTH_RATIO_TOLERANCE {
        1.0
    } else {
        LENGTH_PENALTY
    }
}

/// Best cyclic shift of the query's mean chroma, and its combined similarity.
fn global_similarity(query: &HpcpMatrix, reference: &HpcpMatrix) -> (usize, f64) {
    let q = unit(&widen(&query.mean()));
    let r = unit(&widen(&reference.mean()));

    let mut best_shift = 0;
    let mut best = f64::NEG_INFINITY;
    for shift in 0..HPCP_SIZE {
        let shifted: Vec<f64> = (0..HPCP_SIZE)
            .map(|i| q[(i + HPCP_SIZE - shift) % HPCP_SIZE])
            .collect();
        let combined = harmonic_mean(cosine(&shifted, &r), inverse_distance(&shifted, &r));
        // Strict: the first maximum wins
        if combined > best {
            best = combined;
            best_shift = shift;
        }
    }
    (best_shift, best)
}

fn histogram_similarity(query: &HpcpMatrix, reference: &HpcpMatrix, shift: usize) -> f64 {
    let shifted: Vec<HpcpFrame> = query.frames().iter().map(|f| roll(f, shift)).collect();
    let q = class_histograms(&shifted);
    let r = class_histograms(reference.frames());

    let l1: f64 = q.iter().zip(&r).map(|(a, b)| (a - b).abs()).sum();
    let chi2: f64 = q
        .iter()
        .zip(&r)
        .map(|(a, b)| (a - b) * (a - b) / (a + b + EPSILON))
        .sum();

    ((1.0 - l1 / 2.0) + 1.0 / (1.0 + chi2)) / 2.0
}

/// Concatenated 32-bin histograms of each pitch class over [0, 1], C to B,
/// L1-normalized.
fn class_histograms(frames: &[HpcpFrame]) -> Vec<f64> {
    let mut hist = vec![0.0_f64; HPCP_SIZE * HIST_BINS];
    for frame in frames {
        for (c, &v) in frame.iter().enumerate() {
            if let Some(bin) = histogram_bin(v) {
                hist[c * HIST_BINS + bin] += 1.0;
            }
        }
    }

    let total: f64 = hist.iter().sum();
    for h in &mut hist {
        *h /= total + EPSILON;
    }
    hist
}

/// Bin index in [0, 1] with 32 equal bins; 1.0 goes in the last bin and
/// anything outside the range (or NaN) is dropped.
fn histogram_bin(v: f32) -> Option<usize> {
    if !(0.0..=1.0).contains(&v) {
        return None;
    }
    Some(((v as f64 * HIST_BINS as f64) as usize).min(HIST_BINS - 1))
}

fn temporal_similarity(query: &HpcpMatrix, reference: &HpcpMatrix, shift: usize) -> f64 {
    let shifted: Vec<HpcpFrame> = query.frames().iter().map(|f| roll(f, shift)).collect();
    let q = unit(&segment_profile(&shifted));
    let r = unit(&segment_profile(reference.frames()));
    (cosine(&q, &r) + inverse_distance(&q, &r)) / 2.0
}

/// Per-segment mean then std of each pitch class, 10 × 2 × 12 values.
///
/// Segments are `n / 10` frames long and the last one takes the remainder.
/// With fewer than 10 frames the leading segments are empty and contribute
/// zeros.
fn segment_profile(frames: &[HpcpFrame]) -> Vec<f64> {
    let n = frames.len();
    let size = n / TEMPORAL_SEGMENTS;
    let mut out = Vec::with_capacity(TEMPORAL_SEGMENTS * 2 * HPCP_SIZE);

    for i in 0..TEMPORAL_SEGMENTS {
        let start = i * size;
        let end = if i < TEMPORAL_SEGMENTS - 1 { (i + 1) * size } else { n };
        let segment = &frames[start..end];

        let mut mean = [0.0_f64; HPCP_SIZE];
        let mut std = [0.0_f64; HPCP_SIZE];
        if !segment.is_empty() {
            let len = segment.len() as f64;
            for frame in segment {
                for (c, &v) in frame.iter().enumerate() {
                    mean[c] += v as f64;
                }
            }
            for m in &mut mean {
                *m /= len;
            }
            for frame in segment {
                for (c, &v) in frame.iter().enumerate() {
                    let d = v as f64 - mean[c];
                    std[c] += d * d;
                }
            }
            for s in &mut std {
                *s = (*s / len).sqrt();
            }
        }
        out.extend_from_slice(&mean);
        out.extend_from_slice(&std);
    }
    out
}

fn widen(v: &HpcpFrame) -> Vec<f64> {
    v.iter().map(|&x| x as f64).collect()
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// `v / (‖v‖ + ε)`
fn unit(v: &[f64]) -> Vec<f64> {
    let n = norm(v) + EPSILON;
    v.iter().map(|x| x / n).collect()
}

/// Cosine similarity between two vectors.
fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;

    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0)
    }
}

/// `1 / (1 + ‖a − b‖)`
fn inverse_distance(a: &[f64], b: &[f64]) -> f64 {
    let d: f64 = a
        .iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt();
    1.0 / (1.0 + d)
}

fn harmonic_mean(a: f64, b: f64) -> f64 {
    if a + b <= 0.0 {
        0.0
    } else {
        2.0 * a * b / (a + b)
    }
}
