//! # Remote Transcription Backend
//!
//! Streams segments to a recognition server over WebSocket.
//!
//! ## Backend Protocol (one connection per segment):
//! 1. Client sends `{"type":"start", sample_rate, encoding, enable_partials, hotwords, language_code}`
//! 2. Client sends the segment as binary PCM16 frames
//! 3. Client sends `{"type":"end"}`
//! 4. Server answers with `partial` / `final` / `error` JSON messages and
//!    finishes with `{"type":"end"}` or by closing the socket
//!
//! `connect()` opens a warm socket so the first segment of a session skips
//! the handshake, and doubles as the reachability check for `start`.

use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use futures_util::SinkExt;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::transcription::events::{Recognition, RecognitionEvent, WordTiming};
use crate::transcription::service::{EventStream, StreamRequest, TranscriptionError, TranscriptionService};

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct BackendResult {
    text: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    words: Vec<WordTiming>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BackendMessage {
    Partial(BackendResult),
    Final(BackendResult),
    Error { message: String },
    End,
}

impl BackendMessage {
    fn into_event(self) -> Option<RecognitionEvent> {
        match self {
            BackendMessage::Partial(r) => Some(RecognitionEvent::Partial(Recognition::new(r.text, r.words, r.confidence))),
            BackendMessage::Final(r) => Some(RecognitionEvent::Final(Recognition::new(r.text, r.words, r.confidence))),
            BackendMessage::Error { message } => Some(RecognitionEvent::error(message)),
            BackendMessage::End => None,
        }
    }
}

pub struct RemoteTranscriptionService {
    config: BackendConfig,
    warm: Option<BackendSocket>,
    connected: bool,
}

impl RemoteTranscriptionService {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            warm: None,
            connected: false,
        }
    }

    async fn open(&self) -> Result<BackendSocket, TranscriptionError> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        match tokio::time::timeout(timeout, connect_async(self.config.url.as_str())).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(TranscriptionError::Connection(format!("{}: {}", self.config.url, e))),
            Err(_) => Err(TranscriptionError::Connection(format!(
                "{}: timed out after {}ms",
                self.config.url, self.config.connect_timeout_ms
            ))),
        }
    }

    async fn send_segment(&self, socket: &mut BackendSocket, request: StreamRequest) -> Result<(), TranscriptionError> {
        let start = serde_json::json!({
            "type": "start",
            "sample_rate": request.sample_rate,
            "encoding": "pcm16",
            "enable_partials": request.enable_partials,
            "hotwords": request.hotwords,
            "language_code": self.config.language_code,
        });

        let send_err = |e: tokio_tungstenite::tungstenite::Error| TranscriptionError::Stream(e.to_string());
        socket.send(Message::Text(start.to_string())).await.map_err(send_err)?;
        for frame in request.frames {
            socket.send(Message::Binary(frame)).await.map_err(send_err)?;
        }
        socket
            .send(Message::Text(serde_json::json!({ "type": "end" }).to_string()))
            .await
            .map_err(send_err)
    }
}

/// Read backend messages until `end`, close, or the first failure.
fn event_stream(socket: BackendSocket) -> EventStream {
    stream::unfold(Some(socket), |state| async move {
        let mut socket = state?;
        loop {
            match socket.next().await {
                None | Some(Ok(Message::Close(_))) => return None,
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<BackendMessage>(&text) {
                    Ok(message) => match message.into_event() {
                        Some(event) => return Some((Ok(event), Some(socket))),
                        None => {
                            let _ = socket.close(None).await;
                            return None;
                        }
                    },
                    Err(e) => {
                        warn!("Unparseable backend message: {}", e);
                        return Some((Err(TranscriptionError::Stream(format!("bad backend message: {}", e))), None));
                    }
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some((Err(TranscriptionError::Stream(e.to_string())), None)),
            }
        }
    })
    .boxed()
}

#[async_trait::async_trait]
impl TranscriptionService for RemoteTranscriptionService {
    fn name(&self) -> &str {
        "remote"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), TranscriptionError> {
        let socket = self.open().await?;
        info!("Connected to recognition backend at {}", self.config.url);
        self.warm = Some(socket);
        self.connected = true;
        Ok(())
    }

    async fn stream_transcribe(&mut self, request: StreamRequest) -> Result<EventStream, TranscriptionError> {
        if !self.connected {
            return Err(TranscriptionError::Closed);
        }
        let mut socket = match self.warm.take() {
            Some(socket) => socket,
            None => self.open().await?,
        };
        debug!("Streaming {:.2}s segment to backend", request.duration());
        self.send_segment(&mut socket, request).await?;
        Ok(event_stream(socket))
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.warm.take() {
            let _ = socket.close(None).await;
        }
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_backend_message_parsing() {
        let msg: BackendMessage = serde_json::from_str(
            r#"{"type":"final","text":"hi there","confidence":0.8,"words":[{"word":"hi","start":0.0,"end":0.2,"confidence":0.9}]}"#,
        )
        .unwrap();
        match msg.into_event() {
            Some(RecognitionEvent::Final(r)) => {
                assert_eq!(r.text, "hi there");
                assert_eq!(r.words.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        let end: BackendMessage = serde_json::from_str(r#"{"type":"end"}"#).unwrap();
        assert!(end.into_event().is_none());

        let partial: BackendMessage = serde_json::from_str(r#"{"type":"partial","text":"hi"}"#).unwrap();
        assert!(matches!(partial.into_event(), Some(RecognitionEvent::Partial(_))));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let mut config = BackendConfig::default();
        // Nothing listens on port 9 of the loopback interface
        config.url = "ws://127.0.0.1:9/asr".to_string();
        config.connect_timeout_ms = 500;
        let mut service = RemoteTranscriptionService::new(config);
        assert!(matches!(service.connect().await, Err(TranscriptionError::Connection(_))));
        assert!(!service.is_connected());
    }

    #[tokio::test]
    async fn test_streams_segment_against_local_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // The warm connection from connect() is reused for the first segment
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut audio_bytes = 0;
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(data) => audio_bytes += data.len(),
                    Message::Text(text) if text.contains("\"end\"") => break,
                    _ => {}
                }
            }
            ws.send(Message::Text(r#"{"type":"partial","text":"hello","confidence":0.5}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"type":"final","text":"hello world","confidence":0.9}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"type":"end"}"#.into())).await.unwrap();
            audio_bytes
        });

        let mut config = BackendConfig::default();
        config.url = format!("ws://{}/asr", addr);
        let mut service = RemoteTranscriptionService::new(config);
        service.connect().await.unwrap();

        let request = StreamRequest {
            frames: vec![vec![0u8; 8192], vec![0u8; 100]],
            sample_rate: 16_000,
            enable_partials: true,
            hotwords: vec!["bridge".to_string()],
        };
        let events: Vec<_> = service.stream_transcribe(request).await.unwrap().collect().await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Ok(RecognitionEvent::Partial(r)) if r.text == "hello"));
        assert!(matches!(&events[1], Ok(RecognitionEvent::Final(r)) if r.text == "hello world"));
        assert_eq!(server.await.unwrap(), 8292);

        service.close().await;
        assert!(!service.is_connected());
    }
}
