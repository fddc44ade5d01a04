//! End-to-end scenarios through the connection manager with the in-process
//! recognizer: frames go in through `dispatch`, client messages come out of
//! the connection's outbound channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use transcribe_bridge::config::AppConfig;
use transcribe_bridge::connection::ConnectionManager;
use transcribe_bridge::protocol::{InboundFrame, ServerMessage};
use transcribe_bridge::transcription::mock::MockTranscriptionService;
use transcribe_bridge::transcription::service::{ServiceFactory, TranscriptionService};

const CHUNK: usize = 1600;

fn factory(make: impl Fn() -> MockTranscriptionService + Send + Sync + 'static) -> ServiceFactory {
    Arc::new(move || Box::new(make()) as Box<dyn TranscriptionService>)
}

fn manager_with(factory: ServiceFactory) -> ConnectionManager {
    ConnectionManager::new(Arc::new(AppConfig::default()), factory)
}

/// 100 ms of a 440 Hz tone as PCM16, continuing the phase at `chunk_index`.
fn tone_chunk(chunk_index: usize) -> Vec<u8> {
    (0..CHUNK)
        .map(|i| {
            let t = (chunk_index * CHUNK + i) as f32 / 16_000.0;
            ((0.3 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()) * 32767.0) as i16
        })
        .flat_map(|s| s.to_le_bytes())
        .collect()
}

fn text(json: &str) -> InboundFrame {
    InboundFrame::Text(json.to_string())
}

async fn connect(manager: &ConnectionManager) -> (String, mpsc::UnboundedReceiver<ServerMessage>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = manager.add_connection(tx).expect("connection accepted");
    match rx.recv().await {
        Some(ServerMessage::Connection { connection_id, .. }) => assert_eq!(connection_id, id),
        other => panic!("expected connection ack, got {:?}", other),
    }
    (id, rx)
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("message within 5s")
        .expect("channel open")
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[tokio::test]
async fn test_six_seconds_of_speech_yields_two_segments() {
    let manager = manager_with(factory(MockTranscriptionService::new));
    let (id, mut rx) = connect(&manager).await;

    manager.dispatch(&id, text(r#"{"type":"start_transcription"}"#)).await;
    assert_eq!(next_message(&mut rx).await.kind(), "session_started");

    for i in 0..60 {
        manager.dispatch(&id, InboundFrame::Binary(tone_chunk(i))).await;
    }
    manager.dispatch(&id, text(r#"{"type":"stop_transcription"}"#)).await;

    let messages = drain(&mut rx);
    let kinds: Vec<&str> = messages.iter().map(ServerMessage::kind).collect();
    assert_eq!(
        kinds,
        vec!["partial", "transcription", "partial", "transcription", "recording_stopped"]
    );

    let finals: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Transcription(t) => Some(t.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(finals[0].segment_id, 0);
    assert_eq!(finals[1].segment_id, 1);
    assert!((finals[0].time_offset - 0.0).abs() < 1e-9);
    assert!((finals[1].time_offset - 5.0).abs() < 1e-9);
    assert!(finals[1].words.iter().all(|w| w.start_time >= 5.0));

    match messages.last() {
        Some(ServerMessage::RecordingStopped {
            final_transcript,
            total_duration,
            total_segments,
            ..
        }) => {
            assert_eq!(*final_transcript, format!("{} {}", finals[0].text, finals[1].text));
            assert!((total_duration - 6.0).abs() < 1e-9);
            assert_eq!(*total_segments, 2);
        }
        other => panic!("unexpected {:?}", other),
    }

    let metrics = manager.get_metrics();
    assert_eq!(metrics.total_audio_chunks_processed, 60);
    assert_eq!(metrics.total_transcriptions, 4);
    assert_eq!(metrics.active_transcription_sessions, 0);
}

#[tokio::test]
async fn test_state_guards_and_unknown_type() {
    let manager = manager_with(factory(MockTranscriptionService::new));
    let (id, mut rx) = connect(&manager).await;

    manager.dispatch(&id, text(r#"{"type":"stop_transcription"}"#)).await;
    manager.dispatch(&id, text(r#"{"type":"start_transcription"}"#)).await;
    manager.dispatch(&id, text(r#"{"type":"start_transcription"}"#)).await;
    manager.dispatch(&id, text(r#"{"type":"rewind"}"#)).await;
    manager.dispatch(&id, text(r#"{"no_type":true}"#)).await;

    let codes: Vec<String> = drain(&mut rx)
        .into_iter()
        .map(|m| match m {
            ServerMessage::Error { code, .. } => code,
            other => other.kind().to_string(),
        })
        .collect();
    assert_eq!(
        codes,
        vec![
            "not_active",
            "session_started",
            "already_active",
            "unknown_message_type",
            "invalid_message"
        ]
    );
    assert_eq!(manager.get_metrics().active_transcription_sessions, 1);
}

#[tokio::test]
async fn test_backend_stream_error_keeps_recording() {
    let manager = manager_with(factory(|| MockTranscriptionService::new().fail_on_call(0)));
    let (id, mut rx) = connect(&manager).await;

    manager
        .dispatch(&id, text(r#"{"type":"start_transcription","enable_partials":false}"#))
        .await;
    assert_eq!(next_message(&mut rx).await.kind(), "session_started");

    // The 51st chunk forces the first 5 s segment out
    for i in 0..51 {
        manager.dispatch(&id, InboundFrame::Binary(tone_chunk(i))).await;
    }
    match next_message(&mut rx).await {
        ServerMessage::Error { code, segment_id, .. } => {
            assert_eq!(code, "backend_stream_error");
            assert_eq!(segment_id, Some(0));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(manager.get_metrics().active_transcription_sessions, 1);

    manager.dispatch(&id, text(r#"{"type":"stop_transcription"}"#)).await;
    match drain(&mut rx).pop() {
        Some(ServerMessage::RecordingStopped {
            final_transcript,
            total_segments,
            ..
        }) => {
            // The failed segment adds nothing; the flushed 100 ms does
            assert!(!final_transcript.is_empty());
            assert_eq!(total_segments, 2);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_connect_failure_stays_idle() {
    let manager = manager_with(factory(|| MockTranscriptionService::new().with_connect_failure()));
    let (id, mut rx) = connect(&manager).await;

    manager.dispatch(&id, text(r#"{"type":"start_transcription"}"#)).await;
    match next_message(&mut rx).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "backend_connection_error"),
        other => panic!("unexpected {:?}", other),
    }

    manager.dispatch(&id, InboundFrame::Binary(tone_chunk(0))).await;
    manager.dispatch(&id, text(r#"{"type":"stop_transcription"}"#)).await;
    match next_message(&mut rx).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "not_active"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(manager.get_metrics().total_audio_chunks_processed, 0);
}

#[tokio::test]
async fn test_remove_is_idempotent_and_closes_backend_once() {
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    let manager = manager_with(factory(move || {
        MockTranscriptionService::new().with_close_counter(counter.clone())
    }));
    let (id, mut rx) = connect(&manager).await;

    manager.dispatch(&id, text(r#"{"type":"start_transcription"}"#)).await;
    for i in 0..5 {
        manager.dispatch(&id, InboundFrame::Binary(tone_chunk(i))).await;
    }

    manager.remove_connection(&id).await;
    manager.remove_connection(&id).await;

    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(manager.connection_count(), 0);
    assert_eq!(drain(&mut rx).last().map(ServerMessage::kind), Some("recording_stopped"));

    // Frames after teardown are ignored
    manager.dispatch(&id, InboundFrame::Binary(tone_chunk(0))).await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_capacity_refuses_extra_connections() {
    let mut config = AppConfig::default();
    config.websocket.max_connections = 2;
    let manager = ConnectionManager::new(Arc::new(config), factory(MockTranscriptionService::new));

    let (first, _rx1) = connect(&manager).await;
    let (_second, _rx2) = connect(&manager).await;
    let (tx, _rx3) = mpsc::unbounded_channel();
    let err = manager.add_connection(tx).unwrap_err();
    assert_eq!(err.code(), "capacity_reached");

    manager.remove_connection(&first).await;
    let (tx, _rx4) = mpsc::unbounded_channel();
    assert!(manager.add_connection(tx).is_ok());
}

#[tokio::test]
async fn test_brace_prefixed_binary_is_audio() {
    let manager = manager_with(factory(MockTranscriptionService::new));
    let (id, mut rx) = connect(&manager).await;

    manager.dispatch(&id, text(r#"{"type":"start_transcription"}"#)).await;
    assert_eq!(next_message(&mut rx).await.kind(), "session_started");

    let mut chunk = tone_chunk(0);
    chunk[0] = b'{';
    manager.dispatch(&id, InboundFrame::Binary(chunk)).await;

    // A JSON control message sent as a binary frame still works
    manager
        .dispatch(&id, InboundFrame::Binary(br#"{"type":"ping","timestamp":7}"#.to_vec()))
        .await;

    match next_message(&mut rx).await {
        ServerMessage::Pong { timestamp, .. } => assert_eq!(timestamp, Some(serde_json::json!(7))),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(manager.get_metrics().total_audio_chunks_processed, 1);
}

#[tokio::test]
async fn test_configure_changes_silence_window() {
    let manager = manager_with(factory(MockTranscriptionService::new));
    let (id, mut rx) = connect(&manager).await;

    manager
        .dispatch(&id, text(r#"{"type":"configure","silence_duration":0.2}"#))
        .await;
    match next_message(&mut rx).await {
        ServerMessage::Configured { silence_duration, .. } => assert!((silence_duration - 0.2).abs() < 1e-6),
        other => panic!("unexpected {:?}", other),
    }

    manager
        .dispatch(&id, text(r#"{"type":"start_transcription","enable_partials":false}"#))
        .await;
    assert_eq!(next_message(&mut rx).await.kind(), "session_started");

    // 1 s of speech then two silent chunks closes the segment
    for i in 0..10 {
        manager.dispatch(&id, InboundFrame::Binary(tone_chunk(i))).await;
    }
    for _ in 0..2 {
        manager.dispatch(&id, InboundFrame::Binary(vec![0u8; CHUNK * 2])).await;
    }
    match next_message(&mut rx).await {
        ServerMessage::Transcription(t) => assert_eq!(t.segment_id, 0),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_unsupported_sample_rate_is_rejected_on_both_paths() {
    let manager = manager_with(factory(MockTranscriptionService::new));
    let (id, mut rx) = connect(&manager).await;

    manager
        .dispatch(&id, text(r#"{"type":"configure","sample_rate":4294967295}"#))
        .await;
    manager
        .dispatch(&id, text(r#"{"type":"start_transcription","config":{"sample_rate":2000003}}"#))
        .await;

    let codes: Vec<String> = drain(&mut rx)
        .into_iter()
        .map(|m| match m {
            ServerMessage::Error { code, .. } => code,
            other => other.kind().to_string(),
        })
        .collect();
    assert_eq!(codes, vec!["invalid_message", "invalid_message"]);
    assert_eq!(manager.get_metrics().active_transcription_sessions, 0);

    // The connection still works at the default rate
    manager.dispatch(&id, text(r#"{"type":"start_transcription"}"#)).await;
    match next_message(&mut rx).await {
        ServerMessage::SessionStarted { .. } => {}
        other => panic!("unexpected {:?}", other),
    }
}
