//! # Audio Decoding
//!
//! Turns raw little-endian PCM frames from the client into normalized mono
//! `f32` samples, and turns finished segments back into the PCM16 frames the
//! recognition backend expects.
//!
//! ## Supported encodings:
//! - **pcm16**: signed 16-bit integers, scaled by 1/32768
//! - **float32**: IEEE 754 floats, clamped to [-1.0, 1.0]
//!
//! Interleaved multi-channel input is averaged down to mono.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

/// Sample encoding of incoming binary audio frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    #[serde(alias = "int16")]
    Pcm16,
    Float32,
}

impl SampleEncoding {
    /// Bytes occupied by one sample of one channel.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::Pcm16 => 2,
            SampleEncoding::Float32 => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SampleEncoding::Pcm16 => "pcm16",
            SampleEncoding::Float32 => "float32",
        }
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pcm16" | "int16" | "s16le" => Ok(SampleEncoding::Pcm16),
            "float32" | "f32le" => Ok(SampleEncoding::Float32),
            other => Err(format!("Unsupported sample encoding: {}", other)),
        }
    }
}

/// Audio format negotiated for one connection.
///
/// ## Fields:
/// - `sample_rate`: rate the client records at (resampled to the target rate later)
/// - `channels`: interleaved channel count
/// - `encoding`: how each sample is laid out in the binary frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, encoding: SampleEncoding) -> Self {
        Self {
            sample_rate,
            channels,
            encoding,
        }
    }

    /// Size in bytes of one interleaved frame (one sample per channel).
    pub fn frame_bytes(&self) -> usize {
        self.encoding.bytes_per_sample() * self.channels as usize
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(16_000, 1, SampleEncoding::Pcm16)
    }
}

/// Malformed audio payload. The chunk is dropped and the session continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{len} bytes is not a whole number of {encoding} frames ({frame} bytes each)")]
    MisalignedLength {
        len: usize,
        frame: usize,
        encoding: SampleEncoding,
    },

    #[error("audio format declares zero channels")]
    ZeroChannels,

    #[error("audio format declares a zero sample rate")]
    ZeroSampleRate,
}

/// Decode one binary frame into mono samples in [-1.0, 1.0].
///
/// ## Returns:
/// - **Ok(samples)**: one sample per interleaved frame, empty for empty input
/// - **Err(DecodeError)**: the byte count does not fit the declared format
pub fn decode_chunk(bytes: &[u8], format: &AudioFormat) -> Result<Vec<f32>, DecodeError> {
    if format.channels == 0 {
        return Err(DecodeError::ZeroChannels);
    }
    if format.sample_rate == 0 {
        return Err(DecodeError::ZeroSampleRate);
    }

    let frame = format.frame_bytes();
    if bytes.len() % frame != 0 {
        return Err(DecodeError::MisalignedLength {
            len: bytes.len(),
            frame,
            encoding: format.encoding,
        });
    }

    let mut interleaved = Vec::with_capacity(bytes.len() / format.encoding.bytes_per_sample());
    let mut cursor = Cursor::new(bytes);
    match format.encoding {
        SampleEncoding::Pcm16 => {
            while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
                interleaved.push(sample as f32 / 32768.0);
            }
        }
        SampleEncoding::Float32 => {
            while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
                let sample = if sample.is_finite() { sample } else { 0.0 };
                interleaved.push(sample.clamp(-1.0, 1.0));
            }
        }
    }

    Ok(downmix(&interleaved, format.channels as usize))
}

/// Average interleaved channels into a single mono channel.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Convert float samples to PCM16 little-endian bytes, split into frames of
/// at most `frame_bytes` bytes (rounded down to whole samples).
pub fn to_pcm16_frames(samples: &[f32], frame_bytes: usize) -> Vec<Vec<u8>> {
    let samples_per_frame = (frame_bytes / 2).max(1);
    samples
        .chunks(samples_per_frame)
        .map(|chunk| {
            let mut frame = vec![0u8; chunk.len() * 2];
            for (i, &sample) in chunk.iter().enumerate() {
                let scaled = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
                LittleEndian::write_i16(&mut frame[i * 2..i * 2 + 2], scaled);
            }
            frame
        })
        .collect()
}
