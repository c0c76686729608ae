//! # WebSocket AudioHook Endpoint
//!
//! Accepts AudioHook connections at `/api/v1/audiohook/ws` and bridges the
//! socket to a [`ServerSession`] state machine.
//!
//! ## Connection flow:
//! 1. **Upgrade**: the HTTP request is upgraded; its headers are snapshotted
//!    for signature verification
//! 2. **Session**: a `ServerSession` is created with the connection's
//!    authenticators attached and handed to a driver task
//! 3. **Events**: inbound frames flow through an ordered queue into the
//!    driver; outbound messages come back to the actor as actix messages
//! 4. **Teardown**: socket close drains the session's close/fini handlers

use crate::auth::{initiate_request_authentication, RequestAuthContext};
use crate::error::AppError;
use crate::httpsig::HeaderFields;
use crate::session::server::{ServerSession, ServerSessionOptions};
use crate::session::SessionWebSocket;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Interval for native WebSocket liveness pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Connection is dropped when no pong arrives within this window.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Transport events forwarded to the session driver in arrival order.
enum TransportEvent {
    Text(String),
    Binary(Vec<u8>),
    Closed(u16),
}

/// Outbound frame from the session to the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

#[derive(Message)]
#[rtype(result = "()")]
struct SendBinary(Vec<u8>);

#[derive(Message)]
#[rtype(result = "()")]
struct CloseConnection;

/// `SessionWebSocket` implementation over the actor's address. Safe to call
/// from the driver task; delivery happens on the actor's context.
struct ActorSocket {
    addr: Addr<AudioHookWebSocket>,
}

impl SessionWebSocket for ActorSocket {
    fn send_text(&self, data: String) {
        self.addr.do_send(SendText(data));
    }

    fn send_binary(&self, data: Vec<u8>) {
        self.addr.do_send(SendBinary(data));
    }

    fn close(&self) {
        self.addr.do_send(CloseConnection);
    }
}

/// WebSocket actor for one AudioHook connection.
pub struct AudioHookWebSocket {
    app_state: web::Data<AppState>,
    auth_context: RequestAuthContext,
    session_id: Uuid,
    event_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    last_heartbeat: Instant,
}

impl AudioHookWebSocket {
    fn new(app_state: web::Data<AppState>, auth_context: RequestAuthContext) -> Self {
        // The session id may arrive in the upgrade request; otherwise the
        // first protocol message establishes it.
        let session_id =
            crate::httpsig::query_canonicalized_header_field(
                &auth_context.headers,
                "audiohook-session-id",
            )
            .and_then(|v| Uuid::parse_str(&v).ok())
            .unwrap_or_else(Uuid::nil);
        Self {
            app_state,
            auth_context,
            session_id,
            event_tx: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn forward(&self, event: TransportEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

impl Actor for AudioHookWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connection started (session: {})", self.session_id);
        self.app_state.metrics.session_started();

        let config = self.app_state.get_config();
        let mut session = ServerSession::new(ServerSessionOptions {
            ws: Box::new(ActorSocket {
                addr: ctx.address(),
            }),
            id: self.session_id,
            time_provider: None,
            supported_languages: Some(config.session.supported_languages.clone()),
        });
        initiate_request_authentication(
            &mut session,
            self.auth_context.clone(),
            self.app_state.secrets(),
            Duration::from_millis(config.auth.min_failure_delay_ms),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.event_tx = Some(tx);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    TransportEvent::Text(data) => session.on_text_message(data).await,
                    TransportEvent::Binary(data) => session.on_binary_message(data).await,
                    TransportEvent::Closed(code) => {
                        session.on_ws_close(code).await;
                        break;
                    }
                }
            }
        });

        // Native WebSocket heartbeat, independent of the protocol's own
        // application-level ping.
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("WebSocket connection stopped (session: {})", self.session_id);
        self.app_state.metrics.session_ended();
        // Covers abnormal teardown; the driver ignores this if a close
        // event already ended its loop.
        self.forward(TransportEvent::Closed(1006));
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioHookWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.forward(TransportEvent::Text(text.to_string()));
            }
            Ok(ws::Message::Binary(data)) => {
                self.forward(TransportEvent::Binary(data.to_vec()));
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {reason:?}");
                let code = reason
                    .as_ref()
                    .map(|r| u16::from(r.code))
                    .unwrap_or(1005);
                self.forward(TransportEvent::Closed(code));
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!("WebSocket protocol error: {err}");
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for AudioHookWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<SendBinary> for AudioHookWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendBinary, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

impl Handler<CloseConnection> for AudioHookWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseConnection, ctx: &mut Self::Context) {
        ctx.close(None);
        ctx.stop();
    }
}

/// HTTP-to-WebSocket upgrade handler for the AudioHook endpoint.
pub async fn audiohook_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New AudioHook connection request from: {:?}",
        req.connection_info().peer_addr()
    );

    if !app_state.can_accept_session() {
        return Err(AppError::Unavailable("session limit reached".into()).into());
    }

    let mut headers = HeaderFields::new();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_ascii_lowercase())
                .or_default()
                .push(value.to_string());
        }
    }
    let auth_context = RequestAuthContext {
        headers,
        request_target: req.uri().path_and_query().map(|pq| pq.to_string()),
    };
    debug!(
        "Upgrade request target: {:?}",
        auth_context.request_target
    );

    ws::start(AudioHookWebSocket::new(app_state, auth_context), &req, stream)
}
