//! # Transcription Session
//!
//! Per-connection state machine binding control messages to the audio flow.
//!
//! ## States:
//! - **Idle**: initial state; binary audio is dropped silently
//! - **Recording**: audio goes through the segmenter, completed segments go
//!   to the worker over a bounded queue
//!
//! ## Transitions:
//! - `start`: Idle → Recording (`AlreadyActive` otherwise). Connects the
//!   backend on first use; a failed connect leaves the session Idle.
//! - `stop`: Recording → Idle (`NotActive` otherwise). Closes the queue, gives
//!   the worker a grace period to drain it, cancels it if needed, flushes the
//!   pending audio as a last segment and reports the joined transcript.
//! - `configure`: either state, never changes recording state.
//!
//! The worker owns the transcript while recording; the session gets it back
//! from the worker's `JoinHandle` before it touches the transcript again.

pub mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::audio::decode::AudioFormat;
use crate::audio::segmenter::{AudioSegment, AudioSegmenter, SegmenterConfig, SegmenterUpdate};
use crate::config::AppConfig;
use crate::error::BridgeError;
use crate::protocol::{now, BridgeMetrics, ConfigureRequest, ConnectionMetrics, ServerMessage, StartRequest};
use crate::transcription::service::SharedService;

use self::worker::{SegmentTranscriber, TranscriptState};

/// Sender half of a connection's outbound message queue.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Per-connection counters, readable without locking the session.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub recording: AtomicBool,
    pub audio_chunks: AtomicU64,
    pub segments: AtomicU64,
    /// Partial and final results sent to the client.
    pub transcriptions: AtomicU64,
    pub dropped_segments: AtomicU64,
    /// Id of the next segment in the current recording.
    pub next_segment_id: AtomicU64,
    /// Audio sent to the backend in the current recording, in milliseconds.
    pub recorded_audio_ms: AtomicU64,
}

impl SessionStats {
    /// Transcript state to continue from when the worker's own state is lost.
    /// Texts are gone, segment ids and offsets carry on where the worker stopped.
    pub fn resume_state(&self) -> TranscriptState {
        let next_segment_id = self.next_segment_id.load(Ordering::SeqCst);
        let audio_secs = self.recorded_audio_ms.load(Ordering::SeqCst) as f64 / 1000.0;
        TranscriptState {
            segment_id: next_segment_id,
            segments: next_segment_id,
            time_offset: audio_secs,
            total_audio_secs: audio_secs,
            ..Default::default()
        }
    }
}

/// Session tunables derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub segmenter: SegmenterConfig,
    pub format: AudioFormat,
    pub queue_capacity: usize,
    pub stop_grace: Duration,
    pub queue_poll: Duration,
    pub frame_bytes: usize,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            segmenter: config.audio.segmenter_config(),
            format: config.audio.default_format(),
            queue_capacity: config.audio.queue_capacity,
            stop_grace: Duration::from_millis(config.session.stop_grace_ms),
            queue_poll: Duration::from_millis(config.session.queue_poll_ms),
            frame_bytes: config.backend.frame_bytes,
        }
    }
}

struct ActiveRecording {
    queue: mpsc::Sender<AudioSegment>,
    cancel: watch::Sender<bool>,
    worker: JoinHandle<TranscriptState>,
    transcriber: SegmentTranscriber,
}

pub struct TranscriptionSession {
    connection_id: String,
    created_at: DateTime<Utc>,
    settings: SessionSettings,
    format: AudioFormat,
    segmenter: AudioSegmenter,
    service: SharedService,
    outbound: Outbound,
    stats: Arc<SessionStats>,
    recording: Option<ActiveRecording>,
    closed: bool,
}

impl TranscriptionSession {
    pub fn new(connection_id: String, settings: SessionSettings, service: SharedService, outbound: Outbound) -> Self {
        Self {
            connection_id,
            created_at: Utc::now(),
            format: settings.format,
            segmenter: AudioSegmenter::new(settings.segmenter.clone()),
            settings,
            service,
            outbound,
            stats: Arc::new(SessionStats::default()),
            recording: None,
            closed: false,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Queue a message for the client. A closed channel means the client is
    /// gone and teardown is already under way.
    pub fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            debug!(connection_id = %self.connection_id, "Client channel closed, dropping message");
        }
    }

    /// Idle → Recording.
    pub async fn start(&mut self, request: StartRequest) -> Result<(), BridgeError> {
        if self.recording.is_some() {
            return Err(BridgeError::AlreadyActive);
        }

        let format = match &request.config {
            Some(requested) => requested.apply(self.format)?,
            None => self.format,
        };

        {
            let mut service = self.service.lock().await;
            if !service.is_connected() {
                service.connect().await?;
                info!(connection_id = %self.connection_id, backend = service.name(), "Backend connected");
            }
        }

        self.format = format;
        self.segmenter.reset();
        self.stats.next_segment_id.store(0, Ordering::SeqCst);
        self.stats.recorded_audio_ms.store(0, Ordering::SeqCst);

        let (queue_tx, queue_rx) = mpsc::channel(self.settings.queue_capacity);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let transcriber = SegmentTranscriber {
            connection_id: self.connection_id.clone(),
            service: self.service.clone(),
            outbound: self.outbound.clone(),
            stats: self.stats.clone(),
            enable_partials: request.enable_partials,
            hotwords: request.hotwords.clone(),
            frame_bytes: self.settings.frame_bytes,
        };
        let worker = tokio::spawn(worker::run(
            transcriber.clone(),
            queue_rx,
            cancel_rx,
            self.settings.queue_poll,
        ));

        self.recording = Some(ActiveRecording {
            queue: queue_tx,
            cancel: cancel_tx,
            worker,
            transcriber,
        });
        self.stats.recording.store(true, Ordering::SeqCst);

        info!(
            connection_id = %self.connection_id,
            sample_rate = format.sample_rate,
            channels = format.channels,
            encoding = %format.encoding,
            "Transcription started"
        );
        self.send(ServerMessage::SessionStarted {
            enable_partials: request.enable_partials,
            hotwords: request.hotwords,
            audio_format: format,
            timestamp: now(),
        });
        Ok(())
    }

    /// Feed one binary frame. Dropped silently while Idle.
    ///
    /// ## Returns:
    /// - **Err(Decode)**: the frame did not match the negotiated format and was dropped
    pub fn push_audio(&mut self, bytes: &[u8]) -> Result<(), BridgeError> {
        let Some(active) = self.recording.as_ref() else {
            trace!(connection_id = %self.connection_id, "Audio while idle dropped ({} bytes)", bytes.len());
            return Ok(());
        };

        self.stats.audio_chunks.fetch_add(1, Ordering::Relaxed);
        let outcome = self.segmenter.process_chunk(bytes, &self.format)?;
        if !outcome.segment_complete {
            return Ok(());
        }

        while let Some(segment) = self.segmenter.pop_completed() {
            match active.queue.try_send(segment) {
                Ok(()) => {}
                Err(TrySendError::Full(segment)) => {
                    self.stats.dropped_segments.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        connection_id = %self.connection_id,
                        "Audio queue full, dropping {:.2}s segment",
                        segment.duration()
                    );
                    self.send(ServerMessage::error(&BridgeError::QueueFull, None));
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(connection_id = %self.connection_id, "Worker gone, dropping segment");
                }
            }
        }
        Ok(())
    }

    /// Recording → Idle.
    pub async fn stop(&mut self) -> Result<(), BridgeError> {
        let Some(active) = self.recording.take() else {
            return Err(BridgeError::NotActive);
        };
        let ActiveRecording {
            queue,
            cancel,
            mut worker,
            transcriber,
        } = active;

        // Closing the queue lets the worker finish what is already queued
        drop(queue);
        let grace = self.settings.stop_grace;
        let mut state = match tokio::time::timeout(grace, &mut worker).await {
            Ok(joined) => self.joined_state(joined),
            Err(_) => {
                warn!(connection_id = %self.connection_id, "Worker still busy after {:?}, cancelling", grace);
                let _ = cancel.send(true);
                match tokio::time::timeout(grace, &mut worker).await {
                    Ok(joined) => self.joined_state(joined),
                    Err(_) => {
                        error!(connection_id = %self.connection_id, "Worker ignored cancellation, aborting");
                        worker.abort();
                        self.stats.resume_state()
                    }
                }
            }
        };

        let (_flush_guard, mut flush_cancel) = watch::channel(false);
        while let Some(segment) = self.segmenter.get_segment() {
            let flushed = tokio::time::timeout(grace, transcriber.transcribe(segment, &mut state, &mut flush_cancel)).await;
            if flushed.is_err() {
                warn!(connection_id = %self.connection_id, "Final segment flush timed out");
                break;
            }
        }
        self.segmenter.reset();
        self.stats.recording.store(false, Ordering::SeqCst);

        info!(
            connection_id = %self.connection_id,
            segments = state.segments,
            "Transcription stopped after {:.2}s of audio",
            state.total_audio_secs
        );
        self.send(ServerMessage::RecordingStopped {
            final_transcript: state.full_transcript(),
            total_duration: state.total_audio_secs,
            total_segments: state.segments,
            timestamp: now(),
        });
        Ok(())
    }

    fn joined_state(&self, joined: Result<TranscriptState, tokio::task::JoinError>) -> TranscriptState {
        joined.unwrap_or_else(|e| {
            error!(connection_id = %self.connection_id, "Worker failed: {}", e);
            self.stats.resume_state()
        })
    }

    /// Update input rate and segmentation parameters.
    pub fn configure(&mut self, request: ConfigureRequest) -> Result<(), BridgeError> {
        request.validate()?;

        if let Some(rate) = request.sample_rate {
            self.format.sample_rate = rate;
        }
        self.segmenter.configure(&SegmenterUpdate {
            vad_threshold: request.vad_threshold,
            silence_duration_ms: request.silence_duration.map(|secs| (secs * 1000.0).round() as u32),
        });

        let config = self.segmenter.config();
        self.send(ServerMessage::Configured {
            sample_rate: self.format.sample_rate,
            vad_threshold: config.vad_threshold,
            silence_duration: config.silence_duration_ms as f32 / 1000.0,
            timestamp: now(),
        });
        Ok(())
    }

    pub fn pong(&self, timestamp: Option<serde_json::Value>) {
        self.send(ServerMessage::Pong {
            timestamp,
            server_time: now(),
        });
    }

    pub fn connection_metrics(&self) -> ConnectionMetrics {
        connection_metrics(&self.connection_id, self.created_at, &self.stats)
    }

    pub fn send_metrics(&self, bridge: BridgeMetrics) {
        self.send(ServerMessage::Metrics {
            bridge,
            connection: self.connection_metrics(),
            timestamp: now(),
        });
    }

    /// Stop if recording, then close the backend handle exactly once.
    pub async fn shutdown(&mut self) {
        if self.recording.is_some() {
            if let Err(e) = self.stop().await {
                warn!(connection_id = %self.connection_id, "Stop during shutdown failed: {}", e);
            }
        }
        if !self.closed {
            self.closed = true;
            self.service.lock().await.close().await;
            debug!(connection_id = %self.connection_id, "Backend handle closed");
        }
    }
}

pub fn connection_metrics(connection_id: &str, created_at: DateTime<Utc>, stats: &SessionStats) -> ConnectionMetrics {
    ConnectionMetrics {
        connection_id: connection_id.to_string(),
        created_at: created_at.to_rfc3339(),
        recording: stats.recording.load(Ordering::SeqCst),
        audio_chunks: stats.audio_chunks.load(Ordering::Relaxed),
        segments: stats.segments.load(Ordering::Relaxed),
        transcriptions: stats.transcriptions.load(Ordering::Relaxed),
        dropped_segments: stats.dropped_segments.load(Ordering::Relaxed),
    }
}
