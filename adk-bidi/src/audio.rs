//! Audio format definitions and utilities.

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{BidiError, Result};

/// Audio encodings understood by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AudioEncoding {
    /// 16-bit signed little-endian linear PCM.
    #[serde(rename = "pcm")]
    #[default]
    Pcm16,
}

impl std::fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pcm16 => write!(f, "pcm"),
        }
    }
}

/// Complete audio format specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of audio channels (1 = mono).
    pub channels: u16,
    /// Bits per sample.
    pub bits_per_sample: u16,
    /// Audio encoding format.
    pub encoding: AudioEncoding,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::pcm16_16khz()
    }
}

impl AudioFormat {
    /// Create a new audio format specification.
    pub fn new(
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
        encoding: AudioEncoding,
    ) -> Self {
        Self { sample_rate, channels, bits_per_sample, encoding }
    }

    /// PCM16 mono at 16kHz, the session default for input and output.
    pub fn pcm16_16khz() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bits_per_sample: 16,
            encoding: AudioEncoding::Pcm16,
        }
    }

    /// Bytes occupied by one sample of one channel.
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample / 8) as usize
    }

    /// Calculate bytes per second for this format.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * self.bytes_per_sample()
    }

    /// Byte length of a frame lasting `duration_ms`.
    pub fn frame_bytes(&self, duration_ms: u32) -> usize {
        self.bytes_per_second() * duration_ms as usize / 1000
    }

    /// Calculate duration in milliseconds for a given number of bytes.
    pub fn duration_ms(&self, bytes: usize) -> f64 {
        let bytes_per_ms = self.bytes_per_second() as f64 / 1000.0;
        bytes as f64 / bytes_per_ms
    }
}

/// One fixed-duration slice of audio exchanged in a single streaming step.
///
/// The payload is reference counted, so cloning a frame for fan-out does not
/// copy the samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Raw audio data.
    pub data: Bytes,
    /// Audio format of this frame.
    pub format: AudioFormat,
    /// Position of this frame in its source, starting at 0.
    pub sequence: u64,
}

impl AudioFrame {
    /// Create a new audio frame.
    pub fn new(data: impl Into<Bytes>, format: AudioFormat, sequence: u64) -> Self {
        Self { data: data.into(), format, sequence }
    }

    /// An all-zero frame of `len` bytes.
    pub fn silence(len: usize, format: AudioFormat, sequence: u64) -> Self {
        Self::new(vec![0u8; len], format, sequence)
    }

    /// Get duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        self.format.duration_ms(self.data.len())
    }

    /// Encode audio data as base64.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    /// Decode audio data from base64.
    pub fn from_base64(encoded: &str, format: AudioFormat, sequence: u64) -> Result<Self> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| BidiError::audio(format!("invalid base64 audio: {e}")))?;
        Ok(Self::new(data, format, sequence))
    }

    /// Convert the audio data to i16 samples (PCM16 little-endian).
    pub fn to_i16_samples(&self) -> Result<Vec<i16>> {
        if self.data.len() % 2 != 0 {
            return Err(BidiError::audio(format!(
                "Invalid data length for PCM16: {} (must be even)",
                self.data.len()
            )));
        }
        Ok(self.data.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect())
    }

    /// Largest absolute sample value, 0 for an empty or odd-length frame.
    pub fn peak_amplitude(&self) -> u16 {
        self.to_i16_samples()
            .map(|samples| samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Whether every sample is zero.
    pub fn is_silent(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }
}

/// Split `pcm` into frames of exactly `frame_bytes`.
///
/// A trailing partial frame is kept as-is rather than padded.
pub fn split_frames(pcm: &Bytes, frame_bytes: usize) -> Vec<Bytes> {
    if frame_bytes == 0 {
        return Vec::new();
    }
    (0..pcm.len())
        .step_by(frame_bytes)
        .map(|start| pcm.slice(start..(start + frame_bytes).min(pcm.len())))
        .collect()
}
