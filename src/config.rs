//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: derive `Serialize`/`Deserialize` so the `config` crate can map sources onto structs
//! - **Nested structs**: one struct per concern keeps each section small
//! - **Result<T, E>**: loading and validation both report failures instead of panicking
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_AUDIO__VAD_THRESHOLD=0.03`, `APP_BACKEND__MODE=remote`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)
//!
//! The loaded value is immutable for the life of the process; the bridge
//! receives it wrapped in an `Arc`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

use crate::audio::decode::{AudioFormat, SampleEncoding};
use crate::audio::segmenter::SegmenterConfig;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub websocket: WebSocketConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub backend: BackendConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production, behind a TLS proxy)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

/// Transport limits for the client WebSocket.
///
/// ## Fields:
/// - `max_connections`: connections beyond this are refused with HTTP 503 at upgrade time
/// - `ping_interval_secs`: how often the server pings idle clients
/// - `client_timeout_secs`: close the connection when nothing was heard for this long
/// - `max_message_size`: largest accepted frame in bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    pub max_connections: usize,
    pub ping_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            ping_interval_secs: 30,
            client_timeout_secs: 60,
            max_message_size: 10 * 1024 * 1024,
        }
    }
}

/// Audio format defaults and segmentation tunables.
///
/// `sample_rate`, `channels` and `encoding` describe what clients send until
/// they negotiate otherwise in `start_transcription` or `configure`.
/// Segmentation thresholds are starting values, tune them per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
    pub target_sample_rate: u32,
    pub chunk_duration_ms: u32,
    pub vad_threshold: f32,
    pub silence_duration_ms: u32,
    pub max_segment_duration_ms: u32,
    /// Completed segments waiting for the worker before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            encoding: SampleEncoding::Pcm16,
            target_sample_rate: 16_000,
            chunk_duration_ms: 100,
            vad_threshold: 0.02,
            silence_duration_ms: 500,
            max_segment_duration_ms: 5_000,
            queue_capacity: 32,
        }
    }
}

impl AudioConfig {
    pub fn default_format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels, self.encoding)
    }

    pub fn segmenter_config(&self) -> SegmenterConfig {
        SegmenterConfig {
            target_sample_rate: self.target_sample_rate,
            chunk_duration_ms: self.chunk_duration_ms,
            vad_threshold: self.vad_threshold,
            silence_duration_ms: self.silence_duration_ms,
            max_segment_duration_ms: self.max_segment_duration_ms,
        }
    }
}

/// Worker lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long `stop` waits for queued segments before cancelling the worker.
    pub stop_grace_ms: u64,
    /// Bounded wait on the audio queue between cancellation checks.
    pub queue_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_grace_ms: 3_000,
            queue_poll_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Deterministic in-process recognizer.
    Mock,
    /// WebSocket recognition server at `backend.url`.
    Remote,
}

/// Recognition backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub mode: BackendMode,
    pub url: String,
    pub connect_timeout_ms: u64,
    /// Size of each binary frame sent to the backend.
    pub frame_bytes: usize,
    pub language_code: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::Mock,
            url: "ws://127.0.0.1:50052/asr".to_string(),
            connect_timeout_ms: 5_000,
            frame_bytes: 8_192,
            language_code: "en-US".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_ (sections split by `__`)
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`
    /// - `APP_WEBSOCKET__MAX_CONNECTIONS=250`
    /// - `APP_BACKEND__MODE=remote`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup keeps them from surfacing
    /// later as confusing per-connection failures.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.websocket.max_connections == 0 {
            return Err(anyhow::anyhow!("Max connections must be greater than 0"));
        }

        if self.websocket.ping_interval_secs == 0
            || self.websocket.client_timeout_secs <= self.websocket.ping_interval_secs
        {
            return Err(anyhow::anyhow!("Client timeout must be longer than a non-zero ping interval"));
        }

        if self.websocket.max_message_size == 0 {
            return Err(anyhow::anyhow!("Max message size must be greater than 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.target_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio must have at least one channel"));
        }

        if self.audio.chunk_duration_ms == 0 {
            return Err(anyhow::anyhow!("Chunk duration must be greater than 0"));
        }

        if !(self.audio.vad_threshold > 0.0 && self.audio.vad_threshold < 1.0) {
            return Err(anyhow::anyhow!("VAD threshold must be between 0 and 1"));
        }

        if self.audio.max_segment_duration_ms < self.audio.chunk_duration_ms {
            return Err(anyhow::anyhow!("Max segment duration must cover at least one chunk"));
        }

        if self.audio.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Audio queue capacity must be greater than 0"));
        }

        if self.session.queue_poll_ms == 0 {
            return Err(anyhow::anyhow!("Queue poll interval must be greater than 0"));
        }

        if self.backend.frame_bytes < 2 {
            return Err(anyhow::anyhow!("Backend frame size must hold at least one sample"));
        }

        if self.backend.mode == BackendMode::Remote && !self.backend.url.starts_with("ws") {
            return Err(anyhow::anyhow!("Remote backend URL must be a ws:// or wss:// URL"));
        }

        Ok(())
    }
}
