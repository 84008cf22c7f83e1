//! Audio transport codec for the conversational agent wire format
//!
//! Stateless transforms between local float audio and the agent's PCM16
//! base64 frames.
//!
//! # Pipeline
//!
//! ```text
//! Outbound:  f32 @ device rate ──▶ resample (16kHz) ──▶ quantize (i16) ──▶ LE bytes ──▶ base64
//! Inbound:   base64 ──▶ LE bytes ──▶ i16 ──▶ f32 @ 24kHz (played as-is, never resampled)
//! ```

use base64::{engine::general_purpose::STANDARD, Engine};

/// Errors produced while decoding an inbound frame
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("frame is not valid base64: {0}")]
    InvalidEncoding(String),
    #[error("PCM16 payload has odd length ({0} bytes)")]
    OddLength(usize),
}

/// A block of mono samples at a known rate
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback duration of this frame in milliseconds
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Number of output samples `resample` produces for `input_len` samples.
///
/// Always `round(input_len * dst_rate / src_rate)`.
pub fn resampled_len(input_len: usize, src_rate: u32, dst_rate: u32) -> usize {
    if src_rate == 0 || dst_rate == 0 || src_rate == dst_rate {
        return input_len;
    }
    ((input_len as f64) * (dst_rate as f64) / (src_rate as f64)).round() as usize
}

/// Resample mono audio with linear interpolation.
///
/// Identity when the rates are equal. Zero rates return the input unchanged.
pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == 0 || dst_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            src_rate,
            dst_rate
        );
        return samples.to_vec();
    }
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = resampled_len(samples.len(), src_rate, dst_rate);
    let step = src_rate as f64 / dst_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64).clamp(0.0, 1.0) as f32;
            let a = samples[idx];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

/// Convert float samples to signed 16-bit PCM.
///
/// Values are clamped to [-1, 1]; negatives scale by 32768 and positives by
/// 32767 so both ends of the i16 range are reachable. Non-finite samples
/// become silence.
pub fn float_to_quantized(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            if !s.is_finite() {
                return 0;
            }
            let s = s.clamp(-1.0, 1.0);
            let scaled = if s < 0.0 {
                s * 32768.0
            } else {
                s * 32767.0
            };
            scaled.round() as i16
        })
        .collect()
}

/// Convert signed 16-bit PCM back to floats in [-1, 1].
pub fn quantized_to_float(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&q| {
            if q < 0 {
                q as f32 / 32768.0
            } else {
                q as f32 / 32767.0
            }
        })
        .collect()
}

/// Serialize PCM16 samples as little-endian bytes
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Parse little-endian PCM16 bytes
pub fn bytes_to_pcm(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Binary to text framing (standard base64)
pub fn encode_frame(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Text to binary framing; exact inverse of `encode_frame`
pub fn decode_frame(text: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| CodecError::InvalidEncoding(e.to_string()))
}

/// Full outbound path for one microphone block
pub fn encode_outbound(samples: &[f32], src_rate: u32, wire_rate: u32) -> String {
    let resampled = resample(samples, src_rate, wire_rate);
    let pcm = float_to_quantized(&resampled);
    encode_frame(&pcm_to_bytes(&pcm))
}

/// Full inbound path for one agent frame. No resampling is applied.
pub fn decode_inbound(text: &str, wire_rate: u32) -> Result<AudioFrame, CodecError> {
    let bytes = decode_frame(text)?;
    let pcm = bytes_to_pcm(&bytes)?;
    Ok(AudioFrame::new(quantized_to_float(&pcm), wire_rate))
}
