use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

/// Analysis frame length in samples.
pub const FRAME_SIZE: usize = 4096;

/// Distance between consecutive frame starts.
pub const HOP_SIZE: usize = 2048;

/// Peaks below this fraction of the frame's loudest bin are ignored (-60 dB).
const PEAK_THRESHOLD_RATIO: f32 = 1e-3;

/// Peak search stops at this frequency.
const MAX_PEAK_FREQUENCY: f32 = 5000.0;

/// Keep at most this many peaks per frame (loudest first).
const MAX_PEAKS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralPeak {
    pub frequency: f32,
    pub magnitude: f32,
}

/// Windowed magnitude spectrum of fixed-size frames.
///
/// Shared read-only across rayon workers; every call allocates its own buffer.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            fft: planner.plan_fft_forward(FRAME_SIZE),
            window: blackman_harris_62(FRAME_SIZE),
        }
    }

    /// Magnitude spectrum (FRAME_SIZE / 2 + 1 bins) of one frame.
    pub fn magnitudes(&self, frame: &[f32]) -> Vec<f32> {
        debug_assert_eq!(frame.len(), FRAME_SIZE);
        let mut buffer: Vec<Complex<f32>> = frame
            .iter()
            .zip(&self.window)
            .map(|(&s, &w)| Complex::new(s * w, 0.0))
            .collect();
        self.fft.process(&mut buffer);
        buffer[..FRAME_SIZE / 2 + 1].iter().map(|c| c.norm()).collect()
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Blackman-Harris window with 62 dB sidelobe rejection, scaled to area 2.
pub fn blackman_harris_62(size: usize) -> Vec<f32> {
    const A0: f64 = 0.44959;
    const A1: f64 = 0.49364;
    const A2: f64 = 0.05677;

    let denom = (size.max(2) - 1) as f64;
    let raw: Vec<f64> = (0..size)
        .map(|i| {
            let x = 2.0 * PI * i as f64 / denom;
            A0 - A1 * x.cos() + A2 * (2.0 * x).cos()
        })
        .collect();
    let area: f64 = raw.iter().sum();
    raw.iter().map(|w| (2.0 * w / area) as f32).collect()
}

/// Find spectral peaks and refine them by parabolic interpolation.
///
/// Returned peaks are sorted by ascending frequency.
pub fn detect_peaks(magnitudes: &[f32], sample_rate: f32) -> Vec<SpectralPeak> {
    if magnitudes.len() < 3 {
        return Vec::new();
    }
    // Bin k sits at k * sr / N, where N = 2 * (bins - 1)
    let bin_hz = sample_rate / (2 * (magnitudes.len() - 1)) as f32;
    let last_bin = ((MAX_PEAK_FREQUENCY / bin_hz) as usize).min(magnitudes.len() - 2);

    let max_mag = magnitudes[..=last_bin + 1]
        .iter()
        .copied()
        .fold(0.0_f32, f32::max);
    if max_mag <= 0.0 {
        return Vec::new();
    }
    let threshold = max_mag * PEAK_THRESHOLD_RATIO;

    let mut peaks: Vec<SpectralPeak> = Vec::new();
    for k in 1..=last_bin {
        let (a, b, c) = (magnitudes[k - 1], magnitudes[k], magnitudes[k + 1]);
        if b <= threshold || b <= a || b <= c {
            continue;
        }
        // Strict maximum → curvature is negative, denominator non-zero
        let p = 0.5 * (a - c) / (a - 2.0 * b + c);
        peaks.push(SpectralPeak {
            frequency: (k as f32 + p) * bin_hz,
            magnitude: b - 0.25 * (a - c) * p,
        });
    }

    if peaks.len() > MAX_PEAKS {
        peaks.sort_by(|x, y| y.magnitude.total_cmp(&x.magnitude));
        peaks.truncate(MAX_PEAKS);
    }
    peaks.sort_by(|x, y| x.frequency.total_cmp(&y.frequency));
    peaks
}
