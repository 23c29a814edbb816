//! Self-describing byte format for persisted HPCP matrices.
//!
//! Layout (little-endian):
//!
//! ```text
//! "HPCP" | version: u16 | rows: u32 | cols: u32 | rows*cols f32, row-major
//! ```
//!
//! Floats are written with `to_le_bytes`, so decoding is bit-exact. Across a
//! process boundary the blob travels as a standard base64 string.

use super::{HpcpFrame, HpcpMatrix};
use crate::HPCP_SIZE;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"HPCP";
const VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4 + 4;

#[derive(Error, Debug)]
pub enum MalformedFeatureError {
    #[error("blob too short: {0} bytes")]
    Truncated(usize),
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported blob version {0}")]
    UnsupportedVersion(u16),
    #[error("feature must be a (frames >= 1, 12) array, got ({rows}, {cols})")]
    BadShape { rows: usize, cols: usize },
    #[error("payload length {actual} does not match header ({expected} bytes)")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub fn encode(m: &HpcpMatrix) -> Vec<u8> {
    let frames = m.frames();
    let mut out = Vec::with_capacity(HEADER_LEN + frames.len() * HPCP_SIZE * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    out.extend_from_slice(&(HPCP_SIZE as u32).to_le_bytes());
    for frame in frames {
        for v in frame {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

pub fn decode(bytes: &[u8]) -> Result<HpcpMatrix, MalformedFeatureError> {
    if bytes.len() < HEADER_LEN {
        return Err(MalformedFeatureError::Truncated(bytes.len()));
    }
    if &bytes[0..4] != MAGIC {
        return Err(MalformedFeatureError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(MalformedFeatureError::UnsupportedVersion(version));
    }
    let rows = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    let cols = u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]) as usize;
    if cols != HPCP_SIZE || rows == 0 {
        return Err(MalformedFeatureError::BadShape { rows, cols });
    }

    let payload = &bytes[HEADER_LEN..];
    let expected = rows
        .checked_mul(HPCP_SIZE * 4)
        .ok_or(MalformedFeatureError::BadShape { rows, cols })?;
    if payload.len() != expected {
        return Err(MalformedFeatureError::LengthMismatch {
            expected,
            actual: payload.len(),
        });
    }

    let frames: Vec<HpcpFrame> = payload
        .chunks_exact(HPCP_SIZE * 4)
        .map(|row| {
            std::array::from_fn(|i| {
                let b = &row[i * 4..i * 4 + 4];
                f32::from_le_bytes([b[0], b[1], b[2], b[3]])
            })
        })
        .collect();

    HpcpMatrix::new(frames).map_err(|e| MalformedFeatureError::BadShape {
        rows: e.rows,
        cols: e.cols,
    })
}

pub fn encode_base64(m: &HpcpMatrix) -> String {
    STANDARD.encode(encode(m))
}

pub fn decode_base64(s: &str) -> Result<HpcpMatrix, MalformedFeatureError> {
    let bytes = STANDARD.decode(s.trim())?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> HpcpMatrix {
        HpcpMatrix::new(vec![
            std::array::from_fn(|i| i as f32 * 0.1),
            std::array::from_fn(|i| 1.0 / (i as f32 + 3.0)),
            [f32::MIN_POSITIVE, 1e-38, 0.0, -0.0, 1.0, 0.333_333_34, 0.0, 0.0, 0.0, 0.0, 0.0, 7.5],
        ])
        .unwrap()
    }

    #[test]
    fn test_roundtrip_is_bit_exact() {
        let m = matrix();
        let back = decode(&encode(&m)).unwrap();
        assert_eq!(back.frame_count(), 3);
        for (a, b) in m.frames().iter().zip(back.frames()) {
            for (x, y) in a.iter().zip(b) {
                assert_eq!(x.to_bits(), y.to_bits());
            }
        }
    }

    #[test]
    fn test_base64_roundtrip() {
        let m = matrix();
        let s = encode_base64(&m);
        assert_eq!(decode_base64(&s).unwrap(), m);
    }

    #[test]
    fn test_rejects_wrong_width() {
        let mut bytes = encode(&matrix());
        bytes[10..14].copy_from_slice(&13u32.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(MalformedFeatureError::BadShape { cols: 13, .. })
        ));
    }

    #[test]
    fn test_rejects_truncated_and_garbage() {
        let bytes = encode(&matrix());
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(MalformedFeatureError::LengthMismatch { .. })
        ));
        assert!(matches!(decode(b"HP"), Err(MalformedFeatureError::Truncated(2))));
        assert!(matches!(
            decode(b"NOPE0000000000"),
            Err(MalformedFeatureError::BadMagic)
        ));
        assert!(matches!(
            decode_base64("!!not base64!!"),
            Err(MalformedFeatureError::Base64(_))
        ));
    }

    #[test]
    fn test_rejects_zero_rows() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&12u32.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(MalformedFeatureError::BadShape { rows: 0, .. })
        ));
    }
}
