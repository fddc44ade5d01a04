//! # Audio Processing Module
//!
//! Everything between a binary WebSocket frame and a segment ready for the
//! recognition backend.
//!
//! ## Key Components:
//! - **decode**: PCM16 / float32 decoding, channel down-mix, PCM16 framing
//! - **resampler**: streaming sample-rate conversion to the recognition rate
//! - **vad**: high-pass + energy + zero-crossing voice activity detection
//! - **segmenter**: bounded utterance segmentation on silence or length
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: any positive rate, converted to 16 kHz by default
//! - **Encoding**: little-endian PCM16 or float32
//! - **Channels**: interleaved, averaged to mono

pub mod decode;
pub mod resampler;
pub mod segmenter;
pub mod vad;

pub use decode::{AudioFormat, DecodeError, SampleEncoding};
pub use segmenter::{AudioSegment, AudioSegmenter, ChunkOutcome, SegmenterConfig, SegmenterUpdate};
