//! # Audio Segmenter
//!
//! Turns an unbounded stream of binary audio chunks into bounded utterances
//! for the recognition backend. Pure and synchronous: no I/O, no tasks.
//!
//! ## Pipeline per chunk:
//! 1. **Decode** raw bytes to mono `f32` (see [`crate::audio::decode`])
//! 2. **Resample** to the target rate with a stateful resampler
//! 3. **Voice activity** check on the resampled chunk
//! 4. **Segmentation**, in priority order:
//!    - *Forced cut*: appending would push the pending buffer past the
//!      maximum segment length, so the pending buffer is cut first and the
//!      chunk starts the next segment
//!    - *Silence cut*: `silence_chunks` consecutive non-voice chunks with
//!      audio pending; the chunk that crosses the count is not kept
//!    - otherwise the chunk is appended
//!
//! Every completed segment satisfies `0 < len <= max_segment_samples`.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::audio::decode::{decode_chunk, AudioFormat, DecodeError};
use crate::audio::resampler::StreamResampler;
use crate::audio::vad::VoiceActivityDetector;

/// Tunables for segmentation. All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmenterConfig {
    pub target_sample_rate: u32,
    pub chunk_duration_ms: u32,
    pub vad_threshold: f32,
    pub silence_duration_ms: u32,
    pub max_segment_duration_ms: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16_000,
            chunk_duration_ms: 100,
            vad_threshold: 0.02,
            silence_duration_ms: 500,
            max_segment_duration_ms: 5_000,
        }
    }
}

impl SegmenterConfig {
    /// Consecutive non-voice chunks that end a segment.
    pub fn silence_chunks(&self) -> u32 {
        (self.silence_duration_ms / self.chunk_duration_ms.max(1)).max(1)
    }

    /// Hard ceiling on a segment's length in samples at the target rate.
    pub fn max_segment_samples(&self) -> usize {
        ((self.target_sample_rate as u64 * self.max_segment_duration_ms as u64) / 1000).max(1) as usize
    }
}

/// Runtime changes accepted from a `configure` message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmenterUpdate {
    pub vad_threshold: Option<f32>,
    pub silence_duration_ms: Option<u32>,
}

/// A bounded run of samples at the target sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioSegment {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Result of feeding one chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkOutcome {
    /// Samples produced at the target rate for this chunk.
    pub samples: usize,
    /// At least one segment was completed by this chunk.
    pub segment_complete: bool,
    pub voice: bool,
}

#[derive(Debug)]
pub struct AudioSegmenter {
    config: SegmenterConfig,
    vad: VoiceActivityDetector,
    resampler: Option<StreamResampler>,
    pending: Vec<f32>,
    completed: VecDeque<AudioSegment>,
    silence_counter: u32,
}

impl AudioSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            vad: VoiceActivityDetector::new(config.vad_threshold),
            resampler: None,
            pending: Vec::with_capacity(config.max_segment_samples()),
            completed: VecDeque::new(),
            silence_counter: 0,
            config,
        }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Samples waiting for a boundary.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    /// Decode, resample, classify and segment one chunk.
    ///
    /// ## Returns:
    /// - **Ok(outcome)**: `segment_complete` is true when the chunk closed a segment;
    ///   collect it with [`AudioSegmenter::pop_completed`]
    /// - **Err(DecodeError)**: the bytes do not match `format`; no state changed
    pub fn process_chunk(&mut self, bytes: &[u8], format: &AudioFormat) -> Result<ChunkOutcome, DecodeError> {
        let decoded = decode_chunk(bytes, format)?;
        let samples = self.resample(decoded, format.sample_rate);

        if samples.is_empty() {
            return Ok(ChunkOutcome {
                samples: 0,
                segment_complete: false,
                voice: false,
            });
        }

        let completed_before = self.completed.len();
        let decision = self.vad.analyze(&samples);
        let max = self.config.max_segment_samples();

        if !self.pending.is_empty() && self.pending.len() + samples.len() > max {
            debug!(
                "Forced segment cut: pending={} adding={} max={}",
                self.pending.len(),
                samples.len(),
                max
            );
            self.cut();
        }

        if decision.is_voice {
            self.silence_counter = 0;
            self.append(&samples);
        } else {
            self.silence_counter += 1;
            if self.silence_counter >= self.config.silence_chunks() && !self.pending.is_empty() {
                debug!(
                    "Silence cut after {} chunks: {} samples",
                    self.silence_counter,
                    self.pending.len()
                );
                self.cut();
            } else {
                self.append(&samples);
            }
        }

        Ok(ChunkOutcome {
            samples: samples.len(),
            segment_complete: self.completed.len() > completed_before,
            voice: decision.is_voice,
        })
    }

    /// Next segment closed by a boundary, oldest first.
    pub fn pop_completed(&mut self) -> Option<AudioSegment> {
        self.completed.pop_front()
    }

    /// Take the next available segment: a completed one if any, otherwise
    /// whatever is pending. Resets the silence counter.
    pub fn get_segment(&mut self) -> Option<AudioSegment> {
        if let Some(segment) = self.completed.pop_front() {
            return Some(segment);
        }
        self.silence_counter = 0;
        if self.pending.is_empty() {
            return None;
        }
        Some(self.take_pending())
    }

    /// Clear buffers, counters and filter state.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.completed.clear();
        self.silence_counter = 0;
        self.vad.reset();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    pub fn configure(&mut self, update: &SegmenterUpdate) {
        if let Some(threshold) = update.vad_threshold {
            self.config.vad_threshold = threshold;
            self.vad.set_threshold(threshold);
        }
        if let Some(silence_ms) = update.silence_duration_ms {
            self.config.silence_duration_ms = silence_ms;
        }
        debug!(
            "Segmenter configured: threshold={} silence_chunks={}",
            self.config.vad_threshold,
            self.config.silence_chunks()
        );
    }

    /// Append samples, splitting off full segments if a single chunk is
    /// longer than the ceiling.
    fn append(&mut self, mut samples: &[f32]) {
        let max = self.config.max_segment_samples();
        while self.pending.len() + samples.len() > max {
            let take = max - self.pending.len();
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];
            self.cut();
        }
        self.pending.extend_from_slice(samples);
    }

    fn cut(&mut self) {
        self.silence_counter = 0;
        if !self.pending.is_empty() {
            let segment = self.take_pending();
            self.completed.push_back(segment);
        }
    }

    fn take_pending(&mut self) -> AudioSegment {
        let samples = std::mem::replace(
            &mut self.pending,
            Vec::with_capacity(self.config.max_segment_samples()),
        );
        AudioSegment {
            samples,
            sample_rate: self.config.target_sample_rate,
        }
    }

    fn resample(&mut self, samples: Vec<f32>, in_hz: u32) -> Vec<f32> {
        let target = self.config.target_sample_rate;
        if in_hz == target {
            return samples;
        }

        let stale = self
            .resampler
            .as_ref()
            .map_or(true, |r| r.input_rate() != in_hz);
        if stale {
            match StreamResampler::new(in_hz, target) {
                Ok(resampler) => self.resampler = Some(resampler),
                Err(e) => {
                    warn!("{}; passing audio through unresampled", e);
                    self.resampler = None;
                    return samples;
                }
            }
        }

        match self.resampler.as_mut() {
            Some(resampler) => resampler.push(&samples),
            None => samples,
        }
    }
}
