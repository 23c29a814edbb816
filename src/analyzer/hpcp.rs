//! Harmonic pitch-class profile of one frame's spectral peaks.
//!
//! Every peak is read as harmonic h = 1..=8 of a fundamental `f / h`, weighted
//! `0.8^(h-1)`, and spread onto the nearest pitch-class bins with a cos²
//! kernel one semitone wide. Peaks up to 500 Hz and above it are accumulated
//! into separate bands, each scaled to unit max, then summed.

use super::spectrum::SpectralPeak;
use crate::HPCP_SIZE;
use crate::features::HpcpFrame;
use std::f64::consts::PI;
use std::sync::OnceLock;

pub const REFERENCE_FREQUENCY: f64 = 440.0;
const MIN_FREQUENCY: f64 = 100.0;
const MAX_FREQUENCY: f64 = 5000.0;
const BAND_SPLIT_FREQUENCY: f64 = 500.0;
const HARMONICS: usize = 8;
const HARMONIC_DECAY: f64 = 0.8;
/// Kernel width in semitones.
const WINDOW_SIZE: f64 = 1.0;
/// A sits nine semitones above C.
const A_PITCH_CLASS: f64 = 9.0;
/// Harmonic offsets closer than this (in semitones) are merged.
const OFFSET_PRECISION: f64 = 1e-5;

/// Distinct pitch-class offsets of harmonics 1..=8 (semitones below the peak,
/// folded into one octave) with their summed strengths.
fn harmonic_offsets() -> &'static [(f64, f64)] {
    static TABLE: OnceLock<Vec<(f64, f64)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: Vec<(f64, f64)> = Vec::new();
        for h in 1..=HARMONICS {
            let offset = (12.0 * (h as f64).log2()).rem_euclid(12.0);
            let strength = HARMONIC_DECAY.powi(h as i32 - 1);
            match table
                .iter_mut()
                .find(|(o, _)| (o - offset).abs() < OFFSET_PRECISION)
            {
                Some(entry) => entry.1 += strength,
                None => table.push((offset, strength)),
            }
        }
        table
    })
}

/// Pitch of `freq` in semitones above C (unfolded; 12 per octave).
fn pitch_of(freq: f64) -> f64 {
    12.0 * (freq / REFERENCE_FREQUENCY).log2() + A_PITCH_CLASS
}

fn add_contribution(band: &mut [f64; HPCP_SIZE], pitch: f64, energy: f64) {
    for (offset, strength) in harmonic_offsets() {
        let fundamental = pitch - offset;
        for (bin, value) in band.iter_mut().enumerate() {
            // Wrapped distance to the bin centre, in [-6, 6)
            let d = (fundamental - bin as f64 + 6.0).rem_euclid(12.0) - 6.0;
            if d.abs() <= 0.5 * WINDOW_SIZE {
                let w = (PI * d / WINDOW_SIZE).cos();
                *value += w * w * energy * strength;
            }
        }
    }
}

fn scale_to_unit_max(band: &mut [f64; HPCP_SIZE]) {
    let max = band.iter().copied().fold(0.0_f64, f64::max);
    if max > 0.0 {
        for v in band.iter_mut() {
            *v /= max;
        }
    }
}

/// The low band includes the split frequency itself.
fn in_low_band(freq: f64) -> bool {
    freq <= BAND_SPLIT_FREQUENCY
}

/// Build one HPCP frame from a frame's spectral peaks.
pub fn hpcp_from_peaks(peaks: &[SpectralPeak]) -> HpcpFrame {
    let mut low = [0.0_f64; HPCP_SIZE];
    let mut high = [0.0_f64; HPCP_SIZE];

    for peak in peaks {
        let freq = peak.frequency as f64;
        if !(MIN_FREQUENCY..=MAX_FREQUENCY).contains(&freq) {
            continue;
        }
        let mag = peak.magnitude as f64;
        let band = if in_low_band(freq) {
            &mut low
        } else {
            &mut high
        };
        add_contribution(band, pitch_of(freq), mag * mag);
    }

    scale_to_unit_max(&mut low);
    scale_to_unit_max(&mut high);

    let mut combined: [f64; HPCP_SIZE] = std::array::from_fn(|i| low[i] + high[i]);
    scale_to_unit_max(&mut combined);
    combined.map(|v| v as f32)
}
