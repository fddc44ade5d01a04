//! Recognition events produced by a transcription backend.

use serde::{Deserialize, Serialize};

/// Timing for one recognized word, relative to the start of its segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
    pub confidence: f32,
}

/// Text recognized for (part of) a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub text: String,
    #[serde(default)]
    pub words: Vec<WordTiming>,
    pub confidence: f32,
    /// RFC 3339 time the backend produced this result.
    pub timestamp: String,
}

impl Recognition {
    pub fn new(text: impl Into<String>, words: Vec<WordTiming>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            words,
            confidence,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// Provisional text, may still change.
    Partial(Recognition),
    /// Confirmed text for the segment.
    Final(Recognition),
    /// Backend reported a problem with this segment.
    Error { message: String, timestamp: String },
}

impl RecognitionEvent {
    pub fn error(message: impl Into<String>) -> Self {
        RecognitionEvent::Error {
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, RecognitionEvent::Final(_))
    }
}
