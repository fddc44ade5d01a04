//! # Transcription Module
//!
//! The boundary to the speech recognition backend. The bridge only needs an
//! engine that accepts a segment of PCM16 frames and yields partial and final
//! results; everything model-specific lives on the other side of
//! [`TranscriptionService`].
//!
//! ## Key Components:
//! - **service**: the backend trait, error type and per-connection factory
//! - **events**: partial / final / error recognition events
//! - **mock**: deterministic in-process backend (`backend.mode = "mock"`)
//! - **remote**: WebSocket client for a recognition server (`backend.mode = "remote"`)

pub mod events;
pub mod mock;
pub mod remote;
pub mod service;

pub use events::{Recognition, RecognitionEvent, WordTiming};
pub use mock::MockTranscriptionService;
pub use remote::RemoteTranscriptionService;
pub use service::{
    factory_from_config, shared, EventStream, ServiceFactory, SharedService, StreamRequest, TranscriptionError,
    TranscriptionService,
};
