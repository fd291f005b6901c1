//! Stateless conversion between f32 samples and the PCM16 wire format.
//!
//! - encode: clamp to [-1, 1] → scale by 32767 → round → i16
//! - decode: LE i16 bytes → divide by 32767 → clamp to [-1, 1]

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::frame::{AudioFrame, PlaybackBuffer};
use crate::error::DecodeError;

const PCM16_SCALE: f32 = 32767.0;

/// Quantize one sample.
#[inline]
pub fn quantize(sample: f32) -> i16 {
    // NaN clamps to NaN and casts to 0
    (sample.clamp(-1.0, 1.0) * PCM16_SCALE).round() as i16
}

/// Inverse of [`quantize`]. -32768 (never produced by us) maps to -1.0.
#[inline]
pub fn dequantize(sample: i16) -> f32 {
    (sample as f32 / PCM16_SCALE).max(-1.0)
}

/// Encode captured samples into a PCM16 frame tagged with `source_rate`.
pub fn encode(samples: &[f32], source_rate: u32) -> AudioFrame {
    AudioFrame::new(samples.iter().map(|&s| quantize(s)).collect(), source_rate)
}

/// Decode little-endian PCM16 bytes received at `rate`.
pub fn decode(bytes: &[u8], rate: u32) -> Result<PlaybackBuffer, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| dequantize(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();
    Ok(PlaybackBuffer::new(samples, rate))
}

/// Decode the base64 text form of a PCM16 chunk.
pub fn decode_base64(text: &str, rate: u32) -> Result<PlaybackBuffer, DecodeError> {
    let bytes = STANDARD.decode(text.trim())?;
    decode(&bytes, rate)
}
