//! # Transcription Worker
//!
//! One task per recording session. It pulls completed segments off the
//! session's bounded queue, streams each one to the backend and relays the
//! resulting events to the client in order.
//!
//! ## Cancellation:
//! The worker receives an explicit cancel signal (`watch::Receiver<bool>`)
//! and checks it at every suspension point: the queue wait, opening the
//! backend stream, and each backend event. A dropped sender counts as
//! cancelled.
//!
//! ## Bookkeeping:
//! The worker owns the [`TranscriptState`] while it runs and hands it back
//! through its `JoinHandle`, so no session field is written from two tasks.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::audio::decode::to_pcm16_frames;
use crate::audio::segmenter::AudioSegment;
use crate::error::BridgeError;
use crate::protocol::{now, ServerMessage, TranscriptMessage, WordMessage};
use crate::session::{Outbound, SessionStats};
use crate::transcription::events::{Recognition, RecognitionEvent};
use crate::transcription::service::{SharedService, StreamRequest};

/// Running transcript for one recording.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptState {
    /// Id given to the next segment.
    pub segment_id: u64,
    pub final_texts: Vec<String>,
    pub partial_text: String,
    /// Audio duration of all segments that produced a final result.
    pub time_offset: f64,
    /// Audio duration of every segment sent to the backend.
    pub total_audio_secs: f64,
    pub segments: u64,
}

impl TranscriptState {
    /// Finals joined by spaces, followed by the last partial if any.
    pub fn full_transcript(&self) -> String {
        let mut parts: Vec<&str> = self.final_texts.iter().map(String::as_str).collect();
        let partial = self.partial_text.trim();
        if !partial.is_empty() {
            parts.push(partial);
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    Completed,
    Cancelled,
}

/// Everything needed to turn one segment into client messages.
#[derive(Clone)]
pub struct SegmentTranscriber {
    pub connection_id: String,
    pub service: SharedService,
    pub outbound: Outbound,
    pub stats: Arc<SessionStats>,
    pub enable_partials: bool,
    pub hotwords: Vec<String>,
    pub frame_bytes: usize,
}

/// Resolves once cancellation is requested or the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|flag| *flag).await;
}

impl SegmentTranscriber {
    fn emit(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            debug!(connection_id = %self.connection_id, "Client channel closed, dropping message");
        }
    }

    fn transcript(&self, segment_id: u64, offset: f64, result: Recognition, is_final: bool) -> TranscriptMessage {
        TranscriptMessage {
            segment_id,
            text: result.text.trim().to_string(),
            is_final,
            confidence: result.confidence,
            words: result
                .words
                .into_iter()
                .map(|w| WordMessage {
                    word: w.word,
                    start_time: offset + w.start,
                    end_time: offset + w.end,
                    confidence: w.confidence,
                })
                .collect(),
            time_offset: offset,
            timestamp: now(),
        }
    }

    /// Stream one segment through the backend.
    ///
    /// ## Behavior:
    /// - Partial results replace `partial_text`
    /// - Final results are appended to `final_texts` and clear the partial
    /// - A backend error is reported for this segment only
    /// - `time_offset` advances once if the segment produced a final result
    pub async fn transcribe(
        &self,
        segment: AudioSegment,
        state: &mut TranscriptState,
        cancel: &mut watch::Receiver<bool>,
    ) -> SegmentOutcome {
        let segment_id = state.segment_id;
        let duration = segment.duration();
        let started = Instant::now();
        let request = StreamRequest {
            frames: to_pcm16_frames(&segment.samples, self.frame_bytes),
            sample_rate: segment.sample_rate,
            enable_partials: self.enable_partials,
            hotwords: self.hotwords.clone(),
        };

        let opened = tokio::select! {
            biased;
            _ = cancelled(cancel) => return SegmentOutcome::Cancelled,
            opened = async { self.service.lock().await.stream_transcribe(request).await } => opened,
        };

        let mut got_final = false;
        match opened {
            Ok(mut events) => loop {
                let next = tokio::select! {
                    biased;
                    _ = cancelled(cancel) => return SegmentOutcome::Cancelled,
                    next = events.next() => next,
                };

                match next {
                    None => break,
                    Some(Ok(RecognitionEvent::Partial(result))) => {
                        state.partial_text = result.text.trim().to_string();
                        if self.enable_partials {
                            self.stats.transcriptions.fetch_add(1, Ordering::Relaxed);
                            self.emit(ServerMessage::Partial(self.transcript(
                                segment_id,
                                state.time_offset,
                                result,
                                false,
                            )));
                        }
                    }
                    Some(Ok(RecognitionEvent::Final(result))) => {
                        got_final = true;
                        state.partial_text.clear();
                        let text = result.text.trim().to_string();
                        if !text.is_empty() {
                            state.final_texts.push(text);
                            self.stats.transcriptions.fetch_add(1, Ordering::Relaxed);
                            self.emit(ServerMessage::Transcription(self.transcript(
                                segment_id,
                                state.time_offset,
                                result,
                                true,
                            )));
                        }
                    }
                    Some(Ok(RecognitionEvent::Error { message, .. })) => {
                        warn!(connection_id = %self.connection_id, segment_id, "Backend reported: {}", message);
                        self.emit(ServerMessage::error(&BridgeError::BackendStream(message), Some(segment_id)));
                    }
                    Some(Err(e)) => {
                        error!(connection_id = %self.connection_id, segment_id, "Segment stream failed: {}", e);
                        self.emit(ServerMessage::error(&BridgeError::from(e), Some(segment_id)));
                        break;
                    }
                }
            },
            Err(e) => {
                error!(connection_id = %self.connection_id, segment_id, "Could not start segment stream: {}", e);
                self.emit(ServerMessage::error(&BridgeError::from(e), Some(segment_id)));
            }
        }

        if got_final {
            state.time_offset += duration;
        }
        state.total_audio_secs += duration;
        state.segments += 1;
        state.segment_id += 1;
        self.stats.segments.fetch_add(1, Ordering::Relaxed);
        self.stats.next_segment_id.store(state.segment_id, Ordering::SeqCst);
        self.stats
            .recorded_audio_ms
            .store((state.total_audio_secs * 1000.0).round() as u64, Ordering::SeqCst);

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            connection_id = %self.connection_id,
            segment_id,
            "Segment {:.2}s transcribed in {:.3}s (RTF {:.3})",
            duration,
            elapsed,
            if duration > 0.0 { elapsed / duration } else { 0.0 }
        );

        SegmentOutcome::Completed
    }
}

/// Worker loop: drain the queue until it closes or cancellation is requested.
pub async fn run(
    transcriber: SegmentTranscriber,
    mut queue: mpsc::Receiver<AudioSegment>,
    mut cancel: watch::Receiver<bool>,
    poll: Duration,
) -> TranscriptState {
    let mut state = TranscriptState::default();
    debug!(connection_id = %transcriber.connection_id, "Transcription worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            next = tokio::time::timeout(poll, queue.recv()) => next,
        };

        match next {
            // Poll timeout, check cancellation again
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(segment)) => {
                if transcriber.transcribe(segment, &mut state, &mut cancel).await == SegmentOutcome::Cancelled {
                    break;
                }
            }
        }
    }

    debug!(
        connection_id = %transcriber.connection_id,
        segments = state.segments,
        "Transcription worker finished"
    );
    state
}
