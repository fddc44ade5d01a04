//! # Client Wire Protocol
//!
//! JSON control messages and binary audio frames exchanged with browser
//! clients on `/ws/transcribe`.
//!
//! ## Client → Server (`type` field):
//! - `start_transcription` / `start_recording`: `enable_partials?`, `hotwords?`, `config?`
//! - `stop_transcription` / `stop_recording`
//! - `configure`: `sample_rate?`, `vad_threshold?`, `silence_duration?` (seconds)
//! - `ping`: `timestamp?`
//! - `get_metrics`
//! - binary frames: little-endian PCM in the negotiated format
//!
//! ## Server → Client:
//! `connection`, `session_started`, `recording_stopped`, `partial`,
//! `transcription`, `configured`, `pong`, `metrics`, `error`.
//!
//! ## Frame classification:
//! Text frames are always control messages. Some clients send control JSON
//! as binary frames, so a binary frame whose first byte is `{` is tried as
//! JSON first. When that decode fails the frame is audio that happens to
//! start with `0x7B` and is routed to the segmenter as
//! [`FrameClass::MisroutedAudio`]; it is never dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::decode::{AudioFormat, SampleEncoding};
use crate::error::BridgeError;

pub const PROTOCOL_VERSION: &str = "1.0";

pub const SUPPORTED_SAMPLE_RATES: &[u32] = &[8_000, 16_000, 22_050, 44_100, 48_000];
pub const SUPPORTED_CHANNELS: &[u16] = &[1, 2];

/// Reject any input rate outside [`SUPPORTED_SAMPLE_RATES`]. The resampler's
/// FFT grows with the input rate, so arbitrary client values are not accepted.
pub fn check_sample_rate(sample_rate: u32) -> Result<(), BridgeError> {
    if SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
        Ok(())
    } else {
        Err(BridgeError::InvalidMessage(format!(
            "unsupported sample_rate {}, expected one of {:?}",
            sample_rate, SUPPORTED_SAMPLE_RATES
        )))
    }
}

/// A raw frame as received from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Where a frame should be routed.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameClass {
    /// JSON control message text.
    Control(String),
    /// Raw audio.
    Audio(Vec<u8>),
    /// Binary frame starting with `{` that is not JSON. Handled as audio.
    MisroutedAudio(Vec<u8>),
}

pub fn classify(frame: InboundFrame) -> FrameClass {
    match frame {
        InboundFrame::Text(text) => FrameClass::Control(text),
        InboundFrame::Binary(bytes) if bytes.first() == Some(&b'{') => match String::from_utf8(bytes) {
            Ok(text) if serde_json::from_str::<Value>(&text).is_ok() => FrameClass::Control(text),
            Ok(text) => FrameClass::MisroutedAudio(text.into_bytes()),
            Err(e) => FrameClass::MisroutedAudio(e.into_bytes()),
        },
        InboundFrame::Binary(bytes) => FrameClass::Audio(bytes),
    }
}

/// Audio format override sent with `start_transcription`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FormatRequest {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub encoding: Option<SampleEncoding>,
}

impl FormatRequest {
    /// Overlay the requested fields on `base`.
    pub fn apply(&self, base: AudioFormat) -> Result<AudioFormat, BridgeError> {
        let format = AudioFormat {
            sample_rate: self.sample_rate.unwrap_or(base.sample_rate),
            channels: self.channels.unwrap_or(base.channels),
            encoding: self.encoding.unwrap_or(base.encoding),
        };
        check_sample_rate(format.sample_rate)?;
        if !SUPPORTED_CHANNELS.contains(&format.channels) {
            return Err(BridgeError::InvalidMessage(format!(
                "unsupported channel count {}",
                format.channels
            )));
        }
        Ok(format)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub enable_partials: bool,
    pub hotwords: Vec<String>,
    pub config: Option<FormatRequest>,
}

impl Default for StartRequest {
    fn default() -> Self {
        Self {
            enable_partials: true,
            hotwords: Vec::new(),
            config: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigureRequest {
    pub sample_rate: Option<u32>,
    pub vad_threshold: Option<f32>,
    /// Seconds of silence that end a segment.
    pub silence_duration: Option<f32>,
}

impl ConfigureRequest {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if let Some(rate) = self.sample_rate {
            check_sample_rate(rate)?;
        }
        if let Some(threshold) = self.vad_threshold {
            if !(threshold > 0.0 && threshold < 1.0) {
                return Err(BridgeError::InvalidMessage("vad_threshold must be in (0, 1)".to_string()));
            }
        }
        if let Some(silence) = self.silence_duration {
            if !(silence > 0.0 && silence.is_finite()) {
                return Err(BridgeError::InvalidMessage("silence_duration must be positive".to_string()));
            }
        }
        Ok(())
    }
}

/// Control messages a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    StartTranscription(StartRequest),
    StopTranscription,
    Configure(ConfigureRequest),
    Ping { timestamp: Option<Value> },
    GetMetrics,
    /// Well-formed JSON with a `type` this server does not know.
    Unknown(String),
}

impl ClientMessage {
    /// Parse a control message.
    ///
    /// ## Returns:
    /// - **Err(InvalidJson)**: the text is not JSON
    /// - **Err(InvalidMessage)**: no `type` field, or fields of the wrong shape
    /// - **Ok(Unknown)**: any other `type`
    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        let value: Value = serde_json::from_str(text).map_err(|e| BridgeError::InvalidJson(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::InvalidMessage("missing string field `type`".to_string()))?
            .to_string();

        let message = match kind.as_str() {
            "start_transcription" | "start_recording" => ClientMessage::StartTranscription(payload(value)?),
            "stop_transcription" | "stop_recording" => ClientMessage::StopTranscription,
            "configure" => ClientMessage::Configure(payload(value)?),
            "ping" => ClientMessage::Ping {
                timestamp: value.get("timestamp").cloned(),
            },
            "get_metrics" => ClientMessage::GetMetrics,
            _ => ClientMessage::Unknown(kind),
        };
        Ok(message)
    }
}

fn payload<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, BridgeError> {
    serde_json::from_value(value).map_err(|e| BridgeError::InvalidMessage(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupportedFormats {
    pub sample_rates: Vec<u32>,
    pub encodings: Vec<SampleEncoding>,
    pub channels: Vec<u16>,
}

impl Default for SupportedFormats {
    fn default() -> Self {
        Self {
            sample_rates: SUPPORTED_SAMPLE_RATES.to_vec(),
            encodings: vec![SampleEncoding::Pcm16, SampleEncoding::Float32],
            channels: SUPPORTED_CHANNELS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WordMessage {
    pub word: String,
    pub start_time: f64,
    pub end_time: f64,
    pub confidence: f32,
}

/// Payload of `partial` and `transcription` messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptMessage {
    pub segment_id: u64,
    pub text: String,
    pub is_final: bool,
    pub confidence: f32,
    pub words: Vec<WordMessage>,
    /// Absolute start of the segment within the session, in seconds.
    pub time_offset: f64,
    pub timestamp: String,
}

/// Bridge-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BridgeMetrics {
    pub total_connections: u64,
    pub active_connections: usize,
    pub active_transcription_sessions: usize,
    pub total_audio_chunks_processed: u64,
    pub total_transcriptions: u64,
}

/// Counters for one connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionMetrics {
    pub connection_id: String,
    pub created_at: String,
    pub recording: bool,
    pub audio_chunks: u64,
    pub segments: u64,
    pub transcriptions: u64,
    pub dropped_segments: u64,
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connection {
        connection_id: String,
        server: String,
        version: String,
        protocol_version: String,
        backend: String,
        audio_format: AudioFormat,
        chunk_duration_ms: u32,
        supported_formats: SupportedFormats,
        timestamp: String,
    },
    SessionStarted {
        enable_partials: bool,
        hotwords: Vec<String>,
        audio_format: AudioFormat,
        timestamp: String,
    },
    RecordingStopped {
        final_transcript: String,
        total_duration: f64,
        total_segments: u64,
        timestamp: String,
    },
    Partial(TranscriptMessage),
    Transcription(TranscriptMessage),
    Configured {
        sample_rate: u32,
        vad_threshold: f32,
        silence_duration: f32,
        timestamp: String,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
        server_time: String,
    },
    Metrics {
        bridge: BridgeMetrics,
        connection: ConnectionMetrics,
        timestamp: String,
    },
    Error {
        error: String,
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        segment_id: Option<u64>,
        timestamp: String,
    },
}

impl ServerMessage {
    pub fn error(err: &BridgeError, segment_id: Option<u64>) -> Self {
        ServerMessage::Error {
            error: err.to_string(),
            code: err.code().to_string(),
            segment_id,
            timestamp: now(),
        }
    }

    /// Wire name of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connection { .. } => "connection",
            ServerMessage::SessionStarted { .. } => "session_started",
            ServerMessage::RecordingStopped { .. } => "recording_stopped",
            ServerMessage::Partial(_) => "partial",
            ServerMessage::Transcription(_) => "transcription",
            ServerMessage::Configured { .. } => "configured",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Metrics { .. } => "metrics",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Segment this message belongs to, if any.
    pub fn segment_id(&self) -> Option<u64> {
        match self {
            ServerMessage::Partial(t) | ServerMessage::Transcription(t) => Some(t.segment_id),
            ServerMessage::Error { segment_id, .. } => *segment_id,
            _ => None,
        }
    }
}

pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}
