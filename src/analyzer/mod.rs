pub mod decode;
pub mod hpcp;
pub mod spectrum;

use crate::SAMPLE_RATE;
use crate::features::{HpcpFrame, HpcpMatrix, InvalidShapeError};
use rayon::prelude::*;
use spectrum::{FRAME_SIZE, HOP_SIZE, SpectrumAnalyzer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("audio signal is empty")]
    Empty,
    #[error("audio too short: {samples} samples, need at least {frame_size}")]
    TooShort { samples: usize, frame_size: usize },
    #[error("unsupported sample rate {0} Hz (expected 44100)")]
    UnsupportedSampleRate(u32),
    #[error("non-finite sample at index {0}")]
    NonFiniteSample(usize),
    #[error(transparent)]
    Shape(#[from] InvalidShapeError),
}

/// Mono PCM audio at [`SAMPLE_RATE`].
#[derive(Debug, Clone)]
pub struct AudioSignal {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioSignal {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Number of full analysis frames in a signal of `len` samples.
pub fn frame_count(len: usize) -> usize {
    if len < FRAME_SIZE {
        0
    } else {
        (len - FRAME_SIZE) / HOP_SIZE + 1
    }
}

/// Extract the HPCP matrix of a signal.
///
/// Frames start at sample 0 and advance by [`HOP_SIZE`]; a trailing partial
/// frame is dropped. Frames are analyzed in parallel, output order is
/// chronological.
pub fn extract(signal: &AudioSignal) -> Result<HpcpMatrix, ExtractionError> {
    let samples = &signal.samples;
    if samples.is_empty() {
        return Err(ExtractionError::Empty);
    }
    if signal.sample_rate != SAMPLE_RATE {
        return Err(ExtractionError::UnsupportedSampleRate(signal.sample_rate));
    }
    if samples.len() < FRAME_SIZE {
        return Err(ExtractionError::TooShort {
            samples: samples.len(),
            frame_size: FRAME_SIZE,
        });
    }
    if let Some(i) = samples.iter().position(|s| !s.is_finite()) {
        return Err(ExtractionError::NonFiniteSample(i));
    }

    let n_frames = frame_count(samples.len());
    let analyzer = SpectrumAnalyzer::new();
    let sr = signal.sample_rate as f32;

    let frames: Vec<HpcpFrame> = (0..n_frames)
        .into_par_iter()
        .map(|i| {
            let start = i * HOP_SIZE;
            let mags = analyzer.magnitudes(&samples[start..start + FRAME_SIZE]);
            let peaks = spectrum::detect_peaks(&mags, sr);
            hpcp::hpcp_from_peaks(&peaks)
        })
        .collect();

    log::debug!(
        "Extracted {} HPCP frames from {:.1}s of audio",
        frames.len(),
        signal.duration_secs()
    );

    Ok(HpcpMatrix::new(frames)?)
}
