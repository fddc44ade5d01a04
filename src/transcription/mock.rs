//! # Mock Transcription Backend
//!
//! Deterministic in-process backend for development and tests. Each segment
//! yields an optional partial result followed by one final result. The text
//! cycles through a fixed phrase list and word timings are spread evenly over
//! the segment. Silent segments produce an empty final result.
//!
//! Failures can be injected for tests: a refused `connect()`, or a stream
//! error on chosen segment calls.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tracing::debug;

use crate::transcription::events::{Recognition, RecognitionEvent, WordTiming};
use crate::transcription::service::{EventStream, StreamRequest, TranscriptionError, TranscriptionService};

const PHRASES: &[&str] = &[
    "hello this is a test of the transcription system",
    "the quick brown fox jumps over the lazy dog",
    "real time speech recognition is working correctly",
    "audio streaming from browser to server is functional",
    "the websocket connection is stable and responsive",
];

/// RMS below this is treated as silence.
const SILENCE_RMS: f64 = 1e-3;

#[derive(Debug, Default)]
pub struct MockTranscriptionService {
    connected: bool,
    calls: usize,
    fail_connect: bool,
    fail_calls: HashSet<usize>,
    close_count: Arc<AtomicUsize>,
}

impl MockTranscriptionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every `connect()`.
    pub fn with_connect_failure(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Fail the `n`th `stream_transcribe` call (zero based) after its partial.
    pub fn fail_on_call(mut self, n: usize) -> Self {
        self.fail_calls.insert(n);
        self
    }

    /// Count `close()` calls into a counter owned by the caller.
    pub fn with_close_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.close_count = counter;
        self
    }

    /// Counter incremented by every `close()`.
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        self.close_count.clone()
    }

    fn recognize(&self, request: &StreamRequest, call: usize) -> Vec<Result<RecognitionEvent, TranscriptionError>> {
        let duration = request.duration();
        if pcm16_rms(&request.frames) < SILENCE_RMS {
            return vec![Ok(RecognitionEvent::Final(Recognition::new("", Vec::new(), 0.0)))];
        }

        let phrase = PHRASES[call % PHRASES.len()];
        let words: Vec<&str> = phrase.split_whitespace().collect();
        let step = duration / words.len() as f64;
        let timings: Vec<WordTiming> = words
            .iter()
            .enumerate()
            .map(|(i, word)| WordTiming {
                word: word.to_string(),
                start: i as f64 * step,
                end: (i + 1) as f64 * step,
                confidence: 0.9,
            })
            .collect();

        let mut events = Vec::with_capacity(2);
        if request.enable_partials {
            let half = (words.len() / 2).max(1);
            events.push(Ok(RecognitionEvent::Partial(Recognition::new(
                words[..half].join(" "),
                timings[..half].to_vec(),
                0.6,
            ))));
        }

        if self.fail_calls.contains(&call) {
            events.push(Err(TranscriptionError::Stream(format!(
                "injected failure on segment call {}",
                call
            ))));
            return events;
        }

        events.push(Ok(RecognitionEvent::Final(Recognition::new(phrase, timings, 0.9))));
        events
    }
}

fn pcm16_rms(frames: &[Vec<u8>]) -> f64 {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for frame in frames {
        for pair in frame.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]) as f64 / 32768.0;
            sum += sample * sample;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}

#[async_trait::async_trait]
impl TranscriptionService for MockTranscriptionService {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), TranscriptionError> {
        if self.fail_connect {
            return Err(TranscriptionError::Connection("mock backend refused the connection".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn stream_transcribe(&mut self, request: StreamRequest) -> Result<EventStream, TranscriptionError> {
        if !self.connected {
            return Err(TranscriptionError::Closed);
        }
        let call = self.calls;
        self.calls += 1;
        debug!(
            "Mock recognizing segment call {} ({:.2}s, {} hotwords)",
            call,
            request.duration(),
            request.hotwords.len()
        );
        Ok(stream::iter(self.recognize(&request, call)).boxed())
    }

    async fn close(&mut self) {
        self.connected = false;
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}
