//! # WebSocket Transport
//!
//! Clients connect to `/ws` and speak the JSON envelope protocol described in
//! [`crate::session::protocol`]. Each connection is one actix actor that only
//! shuttles frames: text frames go to the session orchestrator over a channel,
//! and whatever the orchestrator emits is written back to the socket.
//!
//! ## Connection lifecycle:
//! 1. **Upgrade**: refused with 503 once `performance.max_concurrent_sessions`
//!    connections are open
//! 2. **Session**: the orchestrator runs as its own task for as long as the
//!    socket is open
//! 3. **Heartbeat**: a ping every 30s; the connection is dropped after 60s
//!    without a ping or pong from the client
//! 4. **Close**: either side may end it; the actor closing drops the inbound
//!    channel, which ends the session

use crate::error::AppError;
use crate::session::{Outbound, SessionOrchestrator};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// One client connection.
pub struct CompanionSocket {
    app: AppState,

    /// Client text frames toward the orchestrator; dropped when the socket stops
    inbound: Option<mpsc::UnboundedSender<String>>,

    /// Last ping or pong seen from the client
    last_heartbeat: Instant,
}

impl CompanionSocket {
    pub fn new(app: AppState) -> Self {
        Self {
            app,
            inbound: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn forward(&mut self, frame: String, ctx: &mut ws::WebsocketContext<Self>) {
        let delivered = self
            .inbound
            .as_ref()
            .is_some_and(|inbound| inbound.send(frame).is_ok());
        if !delivered {
            debug!("Session already finished, closing socket");
            ctx.stop();
        }
    }
}

impl Actor for CompanionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connection started");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.inbound = Some(inbound_tx);

        let orchestrator = SessionOrchestrator::new(self.app.clone());
        tokio::spawn(orchestrator.run(inbound_rx, outbound_tx));
        ctx.add_stream(UnboundedReceiverStream::new(outbound_rx));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.inbound = None;
        self.app.release_session();
        info!("WebSocket connection stopped");
    }
}

/// Frames arriving from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CompanionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.forward(text.to_string(), ctx),
            Ok(ws::Message::Binary(data)) => {
                warn!(bytes = data.len(), "Ignoring binary frame; audio must be sent as a JSON audio frame");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Frames the orchestrator wants written. The stream ending also stops the actor.
impl StreamHandler<Outbound> for CompanionSocket {
    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Message(message) => ctx.text(message.to_json()),
            Outbound::Close => {
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// Counts the connection before upgrading; the actor releases it when it stops.
pub async fn companion_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    let max_sessions = app_state.get_config().performance.max_concurrent_sessions;
    if !app_state.try_acquire_session(max_sessions) {
        warn!(max_sessions, "Session limit reached, refusing connection");
        return Err(AppError::ServiceUnavailable("Too many active sessions".to_string()).into());
    }

    let socket = CompanionSocket::new(app_state.get_ref().clone());
    ws::start(socket, &req, stream).map_err(|e| {
        // the actor never started, so it will not release the slot itself
        app_state.release_session();
        e
    })
}
