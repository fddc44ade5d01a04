//! # Transcription Service Boundary
//!
//! The bridge never talks to a recognition engine directly. Every backend
//! implements [`TranscriptionService`]: connect once, stream one segment at a
//! time, close once.
//!
//! ## Contract:
//! - `connect()` may be called again after a failure
//! - `stream_transcribe()` takes the PCM16 frames of one segment and yields a
//!   finite stream of events that ends after the segment's final result
//! - `close()` releases the backend handle; the session calls it exactly once

use std::sync::Arc;

use futures_util::stream::BoxStream;
use tokio::sync::Mutex;

use crate::config::{BackendConfig, BackendMode};
use crate::transcription::events::RecognitionEvent;
use crate::transcription::mock::MockTranscriptionService;
use crate::transcription::remote::RemoteTranscriptionService;

/// Failures at the backend boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptionError {
    #[error("backend connection failed: {0}")]
    Connection(String),

    #[error("backend stream failed: {0}")]
    Stream(String),

    #[error("backend handle is closed")]
    Closed,
}

/// One segment's worth of audio plus recognition options.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// PCM16 little-endian mono frames at `sample_rate`.
    pub frames: Vec<Vec<u8>>,
    pub sample_rate: u32,
    pub enable_partials: bool,
    pub hotwords: Vec<String>,
}

impl StreamRequest {
    /// Audio duration carried by the frames.
    pub fn duration(&self) -> f64 {
        let bytes: usize = self.frames.iter().map(Vec::len).sum();
        (bytes / 2) as f64 / self.sample_rate.max(1) as f64
    }
}

pub type EventStream = BoxStream<'static, Result<RecognitionEvent, TranscriptionError>>;

#[async_trait::async_trait]
pub trait TranscriptionService: Send {
    /// Backend name for logging and the connection ack.
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn connect(&mut self) -> Result<(), TranscriptionError>;

    /// Start recognizing one segment.
    async fn stream_transcribe(&mut self, request: StreamRequest) -> Result<EventStream, TranscriptionError>;

    async fn close(&mut self);
}

/// Backend handle shared by one session and its worker.
pub type SharedService = Arc<Mutex<Box<dyn TranscriptionService>>>;

/// Creates one backend handle per connection.
pub type ServiceFactory = Arc<dyn Fn() -> Box<dyn TranscriptionService> + Send + Sync>;

pub fn shared(service: Box<dyn TranscriptionService>) -> SharedService {
    Arc::new(Mutex::new(service))
}

/// Build the factory selected by `backend.mode`.
pub fn factory_from_config(config: &BackendConfig) -> ServiceFactory {
    match config.mode {
        BackendMode::Mock => Arc::new(|| Box::new(MockTranscriptionService::new()) as Box<dyn TranscriptionService>),
        BackendMode::Remote => {
            let config = config.clone();
            Arc::new(move || Box::new(RemoteTranscriptionService::new(config.clone())) as Box<dyn TranscriptionService>)
        }
    }
}
