use super::AudioSignal;
use crate::SAMPLE_RATE;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("ffmpeg not found — required for audio decoding")]
    FfmpegNotFound,
    #[error("ffmpeg decode error: {0}")]
    Ffmpeg(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode any ffmpeg-readable file to mono f32 PCM at 44.1 kHz.
///
/// ffmpeg does the downmix and resampling; raw little-endian floats come back
/// on stdout, so no temp file is needed.
pub fn load_audio(path: &Path) -> Result<AudioSignal, DecodeError> {
    if !path.exists() {
        return Err(DecodeError::NotFound(path.display().to_string()));
    }

    // Check ffmpeg is available
    if Command::new("ffmpeg").arg("-version").output().is_err() {
        return Err(DecodeError::FfmpegNotFound);
    }

    let output = Command::new("ffmpeg")
        .args(["-nostdin", "-v", "error", "-i"])
        .arg(path)
        .args([
            "-ac",
            "1",
            "-ar",
            &SAMPLE_RATE.to_string(),
            "-f",
            "f32le",
            "-acodec",
            "pcm_f32le",
            "-",
        ])
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DecodeError::Ffmpeg(stderr.trim().to_string()));
    }

    let samples = pcm_f32le_to_samples(&output.stdout);
    log::debug!(
        "Decoded {}: {} samples",
        path.file_name().and_then(|f| f.to_str()).unwrap_or("?"),
        samples.len()
    );

    Ok(AudioSignal::new(samples, SAMPLE_RATE))
}

/// Interpret raw bytes as little-endian f32 samples. A trailing partial
/// sample is dropped.
fn pcm_f32le_to_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
