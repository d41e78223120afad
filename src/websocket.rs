//! # WebSocket Voice Streaming Handler
//!
//! Clients connect to `/ws/voice?session_id=...` and stream microphone audio;
//! the server answers with transcripts and synthesized reply audio.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the session is created (or resumed) and
//!    `connection_established` is sent
//! 2. **Configuration**: optional `session_init` rebinds the session id and
//!    declares the capture format
//! 3. **Audio Streaming**: binary frames (raw PCM) or `audio_data` messages,
//!    each acknowledged with `audio_received`
//! 4. **Results**: `transcription` and `audio_response` arrive asynchronously
//!    as processing cycles complete
//! 5. **Teardown**: closing the connection releases its registry entry once
//!    and tears the session down
//!
//! Malformed frames are answered with `error` and never close the connection.

use crate::audio::session::{ConnectionState, SessionError, VoiceSession};
use crate::pipeline::VoicePipeline;
use crate::protocol::{now_millis, parse_client_message, ClientMessage, ServerMessage};
use crate::registry::ConnectionSender;
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Protocol state of one client connection, independent of the transport.
///
/// Every inbound message yields at most one direct reply; cycle output is
/// delivered separately through the connection registry.
pub struct VoiceConnection {
    connection_id: String,
    pipeline: Arc<VoicePipeline>,
    session: Arc<VoiceSession>,
    sender: ConnectionSender,
    closed: bool,
}

impl VoiceConnection {
    /// Create or resume the session and register this connection for it.
    ///
    /// ## Returns:
    /// The connection and the `connection_established` acknowledgment.
    pub fn open(
        pipeline: Arc<VoicePipeline>,
        session_id: Option<String>,
        sender: ConnectionSender,
    ) -> Result<(Self, ServerMessage), SessionError> {
        let connection_id = Uuid::new_v4().to_string();
        let session = pipeline.sessions().create_session(session_id)?;
        pipeline
            .registry()
            .register(&session.session_id, &connection_id, sender.clone());

        info!(
            session_id = %session.session_id,
            connection_id = %connection_id,
            "Voice connection opened"
        );

        let welcome = ServerMessage::ConnectionEstablished {
            session_id: session.session_id.clone(),
            timestamp: now_millis(),
        };
        let connection = Self {
            connection_id,
            pipeline,
            session,
            sender,
            closed: false,
        };
        Ok((connection, welcome))
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn session(&self) -> &Arc<VoiceSession> {
        &self.session
    }

    /// Parse and dispatch one text frame.
    pub fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        match parse_client_message(text) {
            Ok(Some(message)) => Some(self.dispatch(message)),
            Ok(None) => None,
            Err(err) => {
                warn!(session_id = %self.session_id(), error = %err, "Unparsable client message");
                Some(ServerMessage::error("invalid_message", err.to_string()))
            }
        }
    }

    fn dispatch(&mut self, message: ClientMessage) -> ServerMessage {
        match message {
            ClientMessage::SessionInit {
                session_id,
                audio_format,
            } => self.init_session(session_id, audio_format),
            ClientMessage::AudioData { data } => self.handle_audio(data),
            ClientMessage::StartStreaming => {
                self.session.touch();
                self.session.set_connection_state(ConnectionState::Streaming);
                ServerMessage::StreamingStarted {
                    session_id: self.session_id().to_string(),
                    timestamp: now_millis(),
                }
            }
            ClientMessage::StopStreaming => {
                self.session.touch();
                self.session.set_connection_state(ConnectionState::Connected);
                let outcome = self.pipeline.flush(&self.session);
                debug!(session_id = %self.session_id(), ?outcome, "Speaking turn ended");
                ServerMessage::StreamingStopped {
                    session_id: self.session_id().to_string(),
                    timestamp: now_millis(),
                }
            }
            ClientMessage::Ping { timestamp } => {
                self.session.touch();
                ServerMessage::Pong {
                    timestamp: timestamp.unwrap_or_else(now_millis),
                }
            }
        }
    }

    fn init_session(
        &mut self,
        session_id: Option<String>,
        audio_format: Option<crate::audio::format::AudioFormat>,
    ) -> ServerMessage {
        if let Some(requested) = session_id.filter(|id| !id.trim().is_empty() && id != self.session_id()) {
            let session = match self.pipeline.sessions().create_session(Some(requested)) {
                Ok(session) => session,
                Err(err) => return ServerMessage::error("session_unavailable", err.to_string()),
            };

            let previous = std::mem::replace(&mut self.session, session);
            self.release(&previous.session_id);
            self.pipeline
                .registry()
                .register(self.session_id(), &self.connection_id, self.sender.clone());
            info!(
                from = %previous.session_id,
                to = %self.session_id(),
                "Connection rebound to session"
            );
        }

        if let Some(format) = audio_format {
            if let Err(err) = self.session.set_capture_format(format) {
                return ServerMessage::error("unsupported_format", err.to_string());
            }
        }

        ServerMessage::ConnectionEstablished {
            session_id: self.session_id().to_string(),
            timestamp: now_millis(),
        }
    }

    /// Buffer one audio chunk and acknowledge it.
    pub fn handle_audio(&mut self, data: Vec<u8>) -> ServerMessage {
        let bytes = data.len();
        match self.pipeline.ingest(&self.session, data) {
            Ok(outcome) => ServerMessage::AudioReceived {
                bytes,
                pending_duration_ms: outcome.pending_ms(),
                timestamp: now_millis(),
            },
            Err(err) => {
                debug!(session_id = %self.session_id(), bytes, error = %err, "Audio chunk rejected");
                ServerMessage::error("invalid_audio", err.to_string())
            }
        }
    }

    /// Unregister and tear the session down if this connection still owns it.
    fn release(&self, session_id: &str) {
        if self.pipeline.registry().unregister(session_id, &self.connection_id) {
            self.pipeline.sessions().clear(session_id);
        } else {
            debug!(
                session_id = %session_id,
                connection_id = %self.connection_id,
                "Session owned by a newer connection, leaving it in place"
            );
        }
    }

    /// Release the connection. Only the first call has any effect.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.release(&self.session.session_id);
        info!(
            session_id = %self.session_id(),
            connection_id = %self.connection_id,
            "Voice connection closed"
        );
        true
    }
}

impl Drop for VoiceConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// WebSocket actor wrapping a [`VoiceConnection`].
///
/// ## Actor Model:
/// One actor per connection serializes inbound frames; cycle output reaches
/// it through the registry channel, added to the context as a stream.
pub struct VoiceWebSocket {
    state: web::Data<AppState>,
    requested_session_id: Option<String>,
    connection: Option<VoiceConnection>,
    heartbeat_interval: Duration,
    /// Close after this long without client frames, if set
    max_idle: Option<Duration>,
    last_activity: Instant,
}

impl VoiceWebSocket {
    pub fn new(state: web::Data<AppState>, requested_session_id: Option<String>) -> Self {
        let config = state.get_config();
        let max_idle = (config.server.connection_max_idle_secs > 0)
            .then(|| Duration::from_secs(config.server.connection_max_idle_secs));

        Self {
            state,
            requested_session_id,
            connection: None,
            heartbeat_interval: Duration::from_secs(config.server.heartbeat_interval_secs),
            max_idle,
            last_activity: Instant::now(),
        }
    }

    fn send(ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => warn!(error = %err, "Failed to serialize outbound message"),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = match self.max_idle {
            Some(max_idle) => self.heartbeat_interval.min(max_idle),
            None => self.heartbeat_interval,
        };

        ctx.run_interval(interval, |act, ctx| {
            if let Some(max_idle) = act.max_idle {
                if act.last_activity.elapsed() > max_idle {
                    info!("WebSocket idle timeout, closing connection");
                    ctx.close(Some(ws::CloseCode::Away.into()));
                    ctx.stop();
                    return;
                }
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (tx, rx) = mpsc::unbounded_channel();
        let requested = self.requested_session_id.take();

        match VoiceConnection::open(Arc::clone(&self.state.pipeline), requested, tx) {
            Ok((connection, welcome)) => {
                ctx.add_stream(UnboundedReceiverStream::new(rx));
                Self::send(ctx, &welcome);
                self.connection = Some(connection);
                self.state.connection_opened();
                self.start_heartbeat(ctx);
            }
            Err(err) => {
                warn!(error = %err, "Rejecting voice connection");
                Self::send(ctx, &ServerMessage::error("session_unavailable", err.to_string()));
                ctx.close(Some(ws::CloseCode::Again.into()));
                ctx.stop();
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
            self.state.connection_closed();
        }
    }
}

/// Inbound frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_activity = Instant::now();
                if let Some(reply) = connection.handle_text(&text) {
                    Self::send(ctx, &reply);
                }
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_activity = Instant::now();
                let reply = connection.handle_audio(data.to_vec());
                Self::send(ctx, &reply);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %connection.session_id(), ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
                Self::send(
                    ctx,
                    &ServerMessage::error("invalid_message", "Fragmented frames are not supported"),
                );
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(error = %err, "WebSocket protocol error, closing");
                ctx.stop();
            }
        }
    }
}

/// Outbound messages produced by processing cycles.
impl StreamHandler<ServerMessage> for VoiceWebSocket {
    fn handle(&mut self, msg: ServerMessage, ctx: &mut Self::Context) {
        Self::send(ctx, &msg);
    }

    // The channel outlives the actor; its end must not stop the connection
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

#[derive(Debug, Deserialize)]
pub struct VoiceQuery {
    pub session_id: Option<String>,
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the connection to a `VoiceWebSocket` actor.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let query = web::Query::<VoiceQuery>::from_query(req.query_string())
        .map(|q| q.into_inner())
        .unwrap_or(VoiceQuery { session_id: None });

    info!(
        peer = ?req.connection_info().peer_addr(),
        session_id = ?query.session_id,
        "New voice WebSocket connection request"
    );

    ws::start(VoiceWebSocket::new(state, query.session_id), &req, stream)
}
