//! # Transcribe Bridge
//!
//! WebSocket bridge between browser-style audio clients and a streaming
//! speech recognition backend.
//!
//! ## Architecture:
//! - **audio**: decoding, resampling, voice activity detection and segmentation
//! - **transcription**: the recognition backend seam and its implementations
//! - **session**: per-connection state machine and segment worker
//! - **connection**: registry of live connections and frame routing
//! - **protocol**: JSON control and result messages
//! - **websocket**: the actix actor serving `/ws/transcribe`
//! - **config**, **error**, **state**, **health**, **handlers**: the HTTP service around it

pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod health;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transcription;
pub mod websocket;
