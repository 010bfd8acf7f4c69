//! PCM codec: pure conversions between f32 samples and the base64-wrapped
//! signed-16-bit little-endian wire encoding.

use crate::error::MentorError;
use crate::types::AudioBlob;
use base64::Engine as _;

use super::INPUT_SAMPLE_RATE_HZ;

/// A decoded audio buffer ready for the playback scheduler: de-interleaved
/// f32 samples per channel at a fixed sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl PlaybackChunk {
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Duration in seconds on the playback timeline.
    pub fn duration_secs(&self) -> f64 {
        self.frame_count() as f64 / self.sample_rate as f64
    }
}

/// Encodes one captured frame into its wire form: each sample multiplied by
/// 32768 and truncated to i16 (no clamp, no dithering; out-of-range input
/// wraps), packed little-endian and base64-encoded.
pub fn encode_frame(samples: &[f32]) -> AudioBlob {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // i64 intermediate keeps the raw integer-truncation (wrapping)
        // semantics instead of Rust's saturating f32 -> i16 cast.
        let value = (sample * 32768.0) as i64 as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    AudioBlob {
        mime_type: format!("audio/pcm;rate={INPUT_SAMPLE_RATE_HZ}"),
        data: base64::engine::general_purpose::STANDARD.encode(&bytes),
    }
}

/// Inverse base64 transport decoding to raw PCM bytes.
pub fn decode_chunk(data: &str) -> Result<Vec<u8>, MentorError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| MentorError::Decode(format!("invalid base64 audio payload: {e}")))
}

/// Reinterprets raw bytes as PCM16LE, recovers the float range (divide by
/// 32768) and de-interleaves by channel count.
pub fn bytes_to_playback_chunk(
    bytes: &[u8],
    sample_rate: u32,
    channel_count: u16,
) -> Result<PlaybackChunk, MentorError> {
    if channel_count == 0 {
        return Err(MentorError::Decode("channel count must be non-zero".to_string()));
    }
    let channel_count = channel_count as usize;
    if bytes.len() % (2 * channel_count) != 0 {
        return Err(MentorError::Decode(format!(
            "payload length {} is not a multiple of {} (2 bytes x {} channels)",
            bytes.len(),
            2 * channel_count,
            channel_count
        )));
    }

    let frame_count = bytes.len() / 2 / channel_count;
    let mut channels = vec![Vec::with_capacity(frame_count); channel_count];
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
        channels[i % channel_count].push(sample);
    }

    Ok(PlaybackChunk {
        channels,
        sample_rate,
    })
}
