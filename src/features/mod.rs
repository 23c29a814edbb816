//! HPCP matrices and the per-recording vectors derived from them.
//!
//! An [`HpcpMatrix`] is a chronologically ordered sequence of 12-bin pitch-class
//! frames (bin 0 = C). Width 12 and a non-zero frame count are enforced at
//! construction, so every downstream consumer can rely on them.

pub mod blob;

use crate::HPCP_SIZE;
use std::ops::Deref;
use thiserror::Error;

/// One analysis frame: pitch-class energies C, C#, ..., B.
pub type HpcpFrame = [f32; HPCP_SIZE];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("HPCP matrix must have shape (frames >= 1, 12), got ({rows}, {cols})")]
pub struct InvalidShapeError {
    pub rows: usize,
    pub cols: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HpcpMatrix {
    frames: Vec<HpcpFrame>,
}

impl HpcpMatrix {
    pub fn new(frames: Vec<HpcpFrame>) -> Result<Self, InvalidShapeError> {
        if frames.is_empty() {
            return Err(InvalidShapeError {
                rows: 0,
                cols: HPCP_SIZE,
            });
        }
        Ok(Self { frames })
    }

    pub fn frames(&self) -> &[HpcpFrame] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Mean over frames.
    pub fn mean(&self) -> HpcpFrame {
        let means = column_means(&self.frames);
        to_frame(&means)
    }

    /// Population standard deviation over frames, per pitch class.
    pub fn std(&self) -> HpcpFrame {
        let means = column_means(&self.frames);
        let n = self.frames.len() as f64;
        let mut vars = [0.0_f64; HPCP_SIZE];
        for frame in &self.frames {
            for (c, &v) in frame.iter().enumerate() {
                let d = v as f64 - means[c];
                vars[c] += d * d;
            }
        }
        let stds: Vec<f64> = vars.iter().map(|v| (v / n).sqrt()).collect();
        to_frame(&stds)
    }

    /// The frame with the largest L2 norm (first one on ties).
    pub fn dominant(&self) -> HpcpFrame {
        let mut best = 0;
        let mut best_norm = f64::NEG_INFINITY;
        for (i, frame) in self.frames.iter().enumerate() {
            let n = l2_norm(frame);
            if n > best_norm {
                best_norm = n;
                best = i;
            }
        }
        self.frames[best]
    }

    pub fn summary(&self) -> SummaryVectors {
        SummaryVectors {
            mean: self.mean(),
            std: self.std(),
            dominant: self.dominant(),
        }
    }

    /// Cyclically shift every frame's pitch-class axis (a key transposition).
    pub fn rolled(&self, shift: usize) -> HpcpMatrix {
        HpcpMatrix {
            frames: self.frames.iter().map(|f| roll(f, shift)).collect(),
        }
    }
}

/// Whole-recording summary used for coarse retrieval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryVectors {
    pub mean: HpcpFrame,
    pub std: HpcpFrame,
    pub dominant: HpcpFrame,
}

/// An [`HpcpMatrix`] whose non-zero frames all have unit L2 norm.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedHpcpMatrix(HpcpMatrix);

impl NormalizedHpcpMatrix {
    /// Wrap a matrix that is known to be normalized already, e.g. one read
    /// back from the feature store (ingestion only ever stores normalized data).
    pub fn assume_normalized(m: HpcpMatrix) -> Self {
        Self(m)
    }
}

impl Deref for NormalizedHpcpMatrix {
    type Target = HpcpMatrix;

    fn deref(&self) -> &HpcpMatrix {
        &self.0
    }
}

/// L2-normalize each frame. Zero frames stay zero.
pub fn normalize(m: HpcpMatrix) -> NormalizedHpcpMatrix {
    let frames = m
        .frames
        .into_iter()
        .map(|frame| {
            let norm = l2_norm(&frame);
            if norm == 0.0 {
                frame
            } else {
                frame.map(|v| (v as f64 / norm) as f32)
            }
        })
        .collect();
    NormalizedHpcpMatrix(HpcpMatrix { frames })
}

/// `roll(v, s)[i] = v[(i - s) mod 12]`
pub fn roll(v: &HpcpFrame, shift: usize) -> HpcpFrame {
    let s = shift % HPCP_SIZE;
    std::array::from_fn(|i| v[(i + HPCP_SIZE - s) % HPCP_SIZE])
}

pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt()
}

fn column_means(frames: &[HpcpFrame]) -> [f64; HPCP_SIZE] {
    let mut sums = [0.0_f64; HPCP_SIZE];
    for frame in frames {
        for (c, &v) in frame.iter().enumerate() {
            sums[c] += v as f64;
        }
    }
    let n = frames.len().max(1) as f64;
    sums.map(|s| s / n)
}

fn to_frame(values: &[f64]) -> HpcpFrame {
    std::array::from_fn(|i| values[i] as f32)
}
