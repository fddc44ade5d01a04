//! # WebSocket Transcription Endpoint
//!
//! Clients connect to `/ws/transcribe`, receive a `connection` message, then
//! drive a transcription session with JSON control messages and binary audio.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: server sends `connection` with the default audio format
//! 2. **Start**: client sends `start_transcription`, server answers `session_started`
//! 3. **Audio Streaming**: binary frames of raw PCM in the negotiated format
//! 4. **Results**: `partial` and `transcription` messages as segments complete
//! 5. **Stop**: client sends `stop_transcription`, server answers `recording_stopped`
//!
//! ## Actor Layout:
//! - Inbound frames are forwarded, in order, to a per-connection dispatch task
//!   so a slow backend never stalls the heartbeat
//! - Outbound messages arrive on an unbounded channel added as an actor stream
//! - When the inbound side closes, the dispatch task tears the connection down

use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionManager;
use crate::error::AppError;
use crate::protocol::{InboundFrame, ServerMessage};
use crate::state::AppState;

/// One client connection.
pub struct BridgeSocket {
    manager: ConnectionManager,
    connection_id: String,
    last_heartbeat: Instant,
    ping_interval: Duration,
    client_timeout: Duration,
    outbound: Option<mpsc::UnboundedReceiver<ServerMessage>>,
    inbound: Option<mpsc::UnboundedSender<InboundFrame>>,
}

impl BridgeSocket {
    pub fn new(
        manager: ConnectionManager,
        connection_id: String,
        outbound: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Self {
        let ping_interval = Duration::from_secs(manager.config().websocket.ping_interval_secs);
        let client_timeout = Duration::from_secs(manager.config().websocket.client_timeout_secs);
        Self {
            ping_interval,
            client_timeout,
            manager,
            connection_id,
            last_heartbeat: Instant::now(),
            outbound: Some(outbound),
            inbound: None,
        }
    }

    fn forward(&mut self, frame: InboundFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let delivered = self.inbound.as_ref().map(|tx| tx.send(frame).is_ok()).unwrap_or(false);
        if !delivered {
            warn!(connection_id = %self.connection_id, "Dispatch task gone, closing connection");
            ctx.stop();
        }
    }
}

/// Handle every inbound frame in arrival order, then tear the connection down.
async fn dispatch_loop(manager: ConnectionManager, connection_id: String, mut frames: mpsc::UnboundedReceiver<InboundFrame>) {
    while let Some(frame) = frames.recv().await {
        manager.dispatch(&connection_id, frame).await;
    }
    manager.remove_connection(&connection_id).await;
}

impl Actor for BridgeSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "WebSocket connection started");

        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound = Some(tx);
        tokio::spawn(dispatch_loop(self.manager.clone(), self.connection_id.clone(), rx));

        ctx.run_interval(self.ping_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(connection_id = %act.connection_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "WebSocket connection stopped");
        // Closing the inbound channel ends the dispatch task, which removes the connection
        self.inbound.take();
    }
}

/// Outbound messages produced by the session and its worker.
impl StreamHandler<ServerMessage> for BridgeSocket {
    fn handle(&mut self, message: ServerMessage, ctx: &mut Self::Context) {
        match serde_json::to_string(&message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(connection_id = %self.connection_id, "Failed to serialize {}: {}", message.kind(), e),
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(connection_id = %self.connection_id, "Outbound channel closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for BridgeSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.forward(InboundFrame::Text(text.to_string()), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.forward(InboundFrame::Binary(data.to_vec()), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.connection_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.connection_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// The connection is registered before the upgrade so a full server answers
/// with HTTP 503 instead of accepting and closing.
pub async fn transcribe_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    let manager = state.connections.clone();
    let (tx, rx) = mpsc::unbounded_channel();
    let connection_id = manager.add_connection(tx).map_err(AppError::from)?;

    let max_frame = manager.config().websocket.max_message_size;
    let actor = BridgeSocket::new(manager.clone(), connection_id.clone(), rx);
    match ws::WsResponseBuilder::new(actor, &req, stream).frame_size(max_frame).start() {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!(connection_id = %connection_id, "WebSocket upgrade failed: {}", e);
            manager.remove_connection(&connection_id).await;
            Err(e)
        }
    }
}
