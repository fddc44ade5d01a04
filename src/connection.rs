//! # Connection Manager
//!
//! Registry of live client connections. Each connection owns one
//! [`TranscriptionSession`] with its own backend handle; the manager routes
//! inbound frames to the right session and aggregates bridge-wide metrics.
//!
//! ## Key Responsibilities:
//! - **Admission**: refuses new connections once `max_connections` is reached
//! - **Routing**: text frames are control messages, binary frames are audio
//! - **Teardown**: stopping the session and closing its backend handle, once
//!
//! The registry lock is only held for map operations, never across an await.
//! Frames of one connection are handled in arrival order because each
//! dispatch holds that session's lock until it is done.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::BridgeError;
use crate::protocol::{
    classify, now, BridgeMetrics, ClientMessage, ConnectionMetrics, FrameClass, InboundFrame, ServerMessage,
    SupportedFormats, PROTOCOL_VERSION,
};
use crate::session::{connection_metrics, Outbound, SessionSettings, SessionStats, TranscriptionSession};
use crate::transcription::service::{factory_from_config, shared, ServiceFactory};

pub const SERVER_NAME: &str = "transcribe-bridge";

struct ConnectionEntry {
    session: Arc<tokio::sync::Mutex<TranscriptionSession>>,
    stats: Arc<SessionStats>,
    created_at: DateTime<Utc>,
}

struct Inner {
    config: Arc<AppConfig>,
    factory: ServiceFactory,
    registry: Mutex<HashMap<String, ConnectionEntry>>,
    total_connections: AtomicU64,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: Arc<AppConfig>, factory: ServiceFactory) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                registry: Mutex::new(HashMap::new()),
                total_connections: AtomicU64::new(0),
            }),
        }
    }

    /// Manager whose backend is chosen by `backend.mode`.
    pub fn from_config(config: Arc<AppConfig>) -> Self {
        let factory = factory_from_config(&config.backend);
        Self::new(config, factory)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, ConnectionEntry>> {
        // A panic while holding the lock leaves the map itself consistent
        self.inner.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new client and send it the `connection` acknowledgement.
    ///
    /// ## Returns:
    /// - **Ok(connection_id)**: the connection is live
    /// - **Err(CapacityReached)**: nothing was registered
    pub fn add_connection(&self, outbound: Outbound) -> Result<String, BridgeError> {
        let config = &self.inner.config;
        let max = config.websocket.max_connections;
        if self.connection_count() >= max {
            warn!("Connection refused, {} connections open", max);
            return Err(BridgeError::CapacityReached { max });
        }

        let connection_id = Uuid::new_v4().to_string();
        let service = (self.inner.factory)();
        let backend = service.name().to_string();
        let settings = SessionSettings::from_config(config);
        let ack = ServerMessage::Connection {
            connection_id: connection_id.clone(),
            server: SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            backend: backend.clone(),
            audio_format: settings.format,
            chunk_duration_ms: settings.segmenter.chunk_duration_ms,
            supported_formats: SupportedFormats::default(),
            timestamp: now(),
        };

        let session = TranscriptionSession::new(connection_id.clone(), settings, shared(service), outbound.clone());
        let entry = ConnectionEntry {
            stats: session.stats(),
            created_at: session.created_at(),
            session: Arc::new(tokio::sync::Mutex::new(session)),
        };

        {
            let mut registry = self.registry();
            // Re-check under the lock so concurrent accepts cannot overshoot
            if registry.len() >= max {
                warn!("Connection refused, {} connections open", max);
                return Err(BridgeError::CapacityReached { max });
            }
            registry.insert(connection_id.clone(), entry);
        }
        let total = self.inner.total_connections.fetch_add(1, Ordering::Relaxed) + 1;

        info!(connection_id = %connection_id, backend = %backend, total, "Client connected");
        let _ = outbound.send(ack);
        Ok(connection_id)
    }

    /// Tear a connection down. Unknown ids are ignored, so calling this twice
    /// is harmless.
    pub async fn remove_connection(&self, connection_id: &str) {
        let entry = self.registry().remove(connection_id);
        let Some(entry) = entry else {
            debug!(connection_id = %connection_id, "Connection already removed");
            return;
        };

        entry.session.lock().await.shutdown().await;
        info!(connection_id = %connection_id, "Client disconnected");
    }

    fn session(&self, connection_id: &str) -> Result<Arc<tokio::sync::Mutex<TranscriptionSession>>, BridgeError> {
        self.registry()
            .get(connection_id)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| BridgeError::ConnectionNotFound(connection_id.to_string()))
    }

    /// Route one inbound WebSocket frame. Errors are reported to the client
    /// on the connection's channel; nothing here closes the connection.
    pub async fn dispatch(&self, connection_id: &str, frame: InboundFrame) {
        let session = match self.session(connection_id) {
            Ok(session) => session,
            Err(e) => {
                debug!("Frame for unknown connection dropped: {}", e);
                return;
            }
        };
        let mut session = session.lock().await;

        let result = match classify(frame) {
            FrameClass::Audio(bytes) => session.push_audio(&bytes),
            FrameClass::MisroutedAudio(bytes) => {
                debug!(connection_id = %connection_id, "Binary frame starting with '{{' treated as audio");
                session.push_audio(&bytes)
            }
            FrameClass::Control(text) => match ClientMessage::parse(&text) {
                Ok(message) => self.handle_control(&mut session, message).await,
                Err(e) => Err(e),
            },
        };

        if let Err(e) = result {
            if e.is_client_visible() {
                warn!(connection_id = %connection_id, code = e.code(), "{}", e);
                session.send(ServerMessage::error(&e, None));
            } else {
                debug!(connection_id = %connection_id, "Dropped frame: {}", e);
            }
        }
    }

    async fn handle_control(&self, session: &mut TranscriptionSession, message: ClientMessage) -> Result<(), BridgeError> {
        match message {
            ClientMessage::StartTranscription(request) => session.start(request).await,
            ClientMessage::StopTranscription => session.stop().await,
            ClientMessage::Configure(request) => session.configure(request),
            ClientMessage::Ping { timestamp } => {
                session.pong(timestamp);
                Ok(())
            }
            ClientMessage::GetMetrics => {
                session.send_metrics(self.get_metrics());
                Ok(())
            }
            ClientMessage::Unknown(kind) => Err(BridgeError::UnknownMessageType(kind)),
        }
    }

    /// Bridge-wide counters. Per-connection totals cover live connections only.
    pub fn get_metrics(&self) -> BridgeMetrics {
        let registry = self.registry();
        let mut metrics = BridgeMetrics {
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            active_connections: registry.len(),
            ..Default::default()
        };
        for entry in registry.values() {
            if entry.stats.recording.load(Ordering::SeqCst) {
                metrics.active_transcription_sessions += 1;
            }
            metrics.total_audio_chunks_processed += entry.stats.audio_chunks.load(Ordering::Relaxed);
            metrics.total_transcriptions += entry.stats.transcriptions.load(Ordering::Relaxed);
        }
        metrics
    }

    pub fn connection_metrics(&self) -> Vec<ConnectionMetrics> {
        self.registry()
            .iter()
            .map(|(id, entry)| connection_metrics(id, entry.created_at, &entry.stats))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.registry().len()
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn shared_config(&self) -> Arc<AppConfig> {
        self.inner.config.clone()
    }

    /// Tear down every live connection, used on server shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.registry().keys().cloned().collect();
        for id in ids {
            self.remove_connection(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::mock::MockTranscriptionService;
    use crate::transcription::service::TranscriptionService;
    use tokio::sync::mpsc;

    fn manager(max_connections: usize) -> ConnectionManager {
        let mut config = AppConfig::default();
        config.websocket.max_connections = max_connections;
        let factory: ServiceFactory =
            Arc::new(|| Box::new(MockTranscriptionService::new()) as Box<dyn TranscriptionService>);
        ConnectionManager::new(Arc::new(config), factory)
    }

    #[tokio::test]
    async fn test_add_connection_sends_ack() {
        let manager = manager(4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = manager.add_connection(tx).unwrap();

        match rx.try_recv().unwrap() {
            ServerMessage::Connection {
                connection_id,
                server,
                backend,
                protocol_version,
                ..
            } => {
                assert_eq!(connection_id, id);
                assert_eq!(server, SERVER_NAME);
                assert_eq!(backend, "mock");
                assert_eq!(protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let manager = manager(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = manager.add_connection(tx.clone()).unwrap();
        assert!(matches!(
            manager.add_connection(tx.clone()),
            Err(BridgeError::CapacityReached { max: 1 })
        ));

        manager.remove_connection(&first).await;
        assert!(manager.add_connection(tx).is_ok());
        assert_eq!(manager.get_metrics().total_connections, 2);
    }

    #[tokio::test]
    async fn test_ping_and_unknown_type() {
        let manager = manager(4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = manager.add_connection(tx).unwrap();
        let _ack = rx.try_recv();

        manager
            .dispatch(&id, InboundFrame::Text(r#"{"type":"ping","timestamp":42}"#.into()))
            .await;
        match rx.try_recv().unwrap() {
            ServerMessage::Pong { timestamp, .. } => assert_eq!(timestamp, Some(serde_json::json!(42))),
            other => panic!("unexpected {:?}", other),
        }

        manager
            .dispatch(&id, InboundFrame::Text(r#"{"type":"dance"}"#.into()))
            .await;
        match rx.try_recv().unwrap() {
            ServerMessage::Error { code, .. } => assert_eq!(code, "unknown_message_type"),
            other => panic!("unexpected {:?}", other),
        }

        manager.dispatch(&id, InboundFrame::Text("not json".into())).await;
        match rx.try_recv().unwrap() {
            ServerMessage::Error { code, .. } => assert_eq!(code, "invalid_json"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_metrics_reply() {
        let manager = manager(4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = manager.add_connection(tx).unwrap();
        let _ack = rx.try_recv();

        manager
            .dispatch(&id, InboundFrame::Text(r#"{"type":"get_metrics"}"#.into()))
            .await;
        match rx.try_recv().unwrap() {
            ServerMessage::Metrics { bridge, connection, .. } => {
                assert_eq!(bridge.active_connections, 1);
                assert_eq!(bridge.active_transcription_sessions, 0);
                assert_eq!(connection.connection_id, id);
                assert!(!connection.recording);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_connection_is_ignored() {
        let manager = manager(4);
        manager.dispatch("missing", InboundFrame::Binary(vec![0, 0])).await;
        manager.remove_connection("missing").await;
        assert_eq!(manager.connection_count(), 0);
    }
}
