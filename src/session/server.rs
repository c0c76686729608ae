//! # Server Session State Machine
//!
//! Authoritative lifecycle of one AudioHook connection on the server side:
//! sequence bookkeeping, the multi-phase open transaction, close/finalize
//! draining, pause/resume, and audio position accounting.
//!
//! ## Lifecycle:
//! `PREPARING → OPENING → ACTIVE ⇄ PAUSED → CLOSING → CLOSED → FINALIZING →
//! DISCONNECTED`, with `SIGNALED-ERROR` and `UNAUTHORIZED` short-circuits
//! reachable from any non-terminal state.
//!
//! ## Driving model:
//! The session owns its state exclusively and is driven by a single task
//! calling the `on_*` methods in transport order. The open transaction is
//! awaited in-line, so a `close` arriving behind an `open` is processed only
//! once the open transaction has settled. Handler batches within one phase
//! run concurrently and the phase advances only after every sibling settled.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures_util::future::{join_all, BoxFuture};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::protocol::duration::StreamDuration;
use crate::protocol::media::{MediaDataFrame, MediaParameter};
use crate::protocol::message::{
    parse_client_value, ClientMessage, ClientMessageKind, CloseParameters, DisconnectParameters,
    DisconnectReason, DiscardedParameters, EmptyParameters, ErrorParameters, EventEntity,
    EventParameters, MessageParseError, OpenParameters, OpenedParameters, ProtocolVersion,
    ResumedParameters, ServerMessage, ServerMessageKind, UpdateParameters, MAX_MESSAGE_SIZE,
};
use crate::session::events::Listeners;
use crate::session::{SessionWebSocket, TimeProvider, TokioTimeProvider};

/// Server-side session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSessionState {
    Preparing,
    Opening,
    Active,
    Paused,
    Closing,
    Closed,
    SignaledError,
    Unauthorized,
    Finalizing,
    Disconnected,
}

/// Whether error signaling to the client is suppressed in a state (the
/// socket is gone or an error/disconnect was already delivered).
const fn suppress_error_signal(state: ServerSessionState) -> bool {
    matches!(
        state,
        ServerSessionState::Closed
            | ServerSessionState::SignaledError
            | ServerSessionState::Unauthorized
            | ServerSessionState::Finalizing
            | ServerSessionState::Disconnected
    )
}

/// Whether a `disconnect` message may still be sent in a state.
const fn send_disconnect_in_state(state: ServerSessionState) -> bool {
    matches!(
        state,
        ServerSessionState::Preparing
            | ServerSessionState::Opening
            | ServerSessionState::Active
            | ServerSessionState::Paused
    )
}

/// Outcome of an authenticator: pass, or reject with optional detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Pass,
    Fail { info: Option<String> },
}

pub type Authenticator = Box<
    dyn for<'a> FnOnce(
            &'a mut ServerSession,
            &'a OpenParameters,
        ) -> BoxFuture<'a, anyhow::Result<AuthOutcome>>
        + Send,
>;

/// Filters/reorders the offered media list; the first surviving entry wins.
pub type MediaSelector = Box<
    dyn for<'a> FnOnce(
            &'a mut ServerSession,
            Vec<MediaParameter>,
            &'a OpenParameters,
        ) -> BoxFuture<'a, anyhow::Result<Vec<MediaParameter>>>
        + Send,
>;

pub type OpenHandler =
    Box<dyn FnOnce(OpenContext) -> BoxFuture<'static, anyhow::Result<Option<CloseHandler>>> + Send>;

pub type CloseHandler =
    Box<dyn FnOnce(CloseContext) -> BoxFuture<'static, anyhow::Result<Option<FiniHandler>>> + Send>;

pub type FiniHandler =
    Box<dyn FnOnce(FiniContext) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Runs on every `update` message while the session is active or paused.
/// Unlike the transaction handlers, update handlers are not consumed.
pub type UpdateHandler = Box<dyn FnMut(&mut ServerSession, Option<&UpdateParameters>) + Send>;

/// Registering a handler outside its allowed state window is a programmer
/// contract violation, reported as an error rather than silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot add {handler} in state {state:?}")]
pub struct HandlerRegistrationError {
    pub handler: &'static str,
    pub state: ServerSessionState,
}

/// Snapshot of the session visible to concurrently running handlers.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub state: ServerSessionState,
    pub position: StreamDuration,
    pub language: Option<String>,
    pub selected_media: Option<MediaParameter>,
}

#[derive(Default)]
struct OpenIntents {
    start_paused: Option<bool>,
    discard_to: Option<StreamDuration>,
    disconnect: Option<(DisconnectReason, Option<String>)>,
    open_handlers: Vec<OpenHandler>,
    close_handlers: Vec<CloseHandler>,
    fini_handlers: Vec<FiniHandler>,
}

/// Context handed to each open handler. Handlers in one batch run
/// concurrently, so mutations are recorded as intents and applied by the
/// session when the batch settles.
#[derive(Clone)]
pub struct OpenContext {
    pub session: SessionInfo,
    pub open_params: Arc<OpenParameters>,
    intents: Arc<Mutex<OpenIntents>>,
}

impl OpenContext {
    pub fn set_start_paused(&self, value: bool) {
        self.intents.lock().unwrap().start_paused = Some(value);
    }

    /// Request that the client discards buffered audio up to `value`. The
    /// largest position requested across all handlers wins.
    pub fn set_discard_to(&self, value: StreamDuration) {
        let mut intents = self.intents.lock().unwrap();
        intents.discard_to = Some(match intents.discard_to {
            Some(current) if current >= value => current,
            _ => value,
        });
    }

    /// Abort the open transaction with a disconnect once the batch settles.
    pub fn disconnect(&self, reason: DisconnectReason, info: Option<String>) {
        let mut intents = self.intents.lock().unwrap();
        if intents.disconnect.is_none() {
            intents.disconnect = Some((reason, info));
        }
    }

    pub fn add_open_handler(&self, handler: OpenHandler) {
        self.intents.lock().unwrap().open_handlers.push(handler);
    }

    pub fn add_close_handler(&self, handler: CloseHandler) {
        self.intents.lock().unwrap().close_handlers.push(handler);
    }

    pub fn add_fini_handler(&self, handler: FiniHandler) {
        self.intents.lock().unwrap().fini_handlers.push(handler);
    }
}

#[derive(Default)]
struct CleanupIntents {
    close_handlers: Vec<CloseHandler>,
    fini_handlers: Vec<FiniHandler>,
}

/// Context handed to each close handler.
#[derive(Clone)]
pub struct CloseContext {
    pub session: SessionInfo,
    pub close_params: Option<CloseParameters>,
    intents: Arc<Mutex<CleanupIntents>>,
}

impl CloseContext {
    pub fn add_close_handler(&self, handler: CloseHandler) {
        self.intents.lock().unwrap().close_handlers.push(handler);
    }

    pub fn add_fini_handler(&self, handler: FiniHandler) {
        self.intents.lock().unwrap().fini_handlers.push(handler);
    }
}

/// Context handed to each fini handler.
#[derive(Clone)]
pub struct FiniContext {
    pub session: SessionInfo,
    intents: Arc<Mutex<CleanupIntents>>,
}

impl FiniContext {
    pub fn add_fini_handler(&self, handler: FiniHandler) {
        self.intents.lock().unwrap().fini_handlers.push(handler);
    }
}

/// Round-trip statistics reported by the client via `ping.rtt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatisticsInfo {
    pub rtt: StreamDuration,
}

/// Typed observer lists for everything a server session reports outward.
#[derive(Default)]
pub struct ServerSessionEvents {
    pub paused: Listeners<()>,
    pub resumed: Listeners<ResumedParameters>,
    pub audio: Listeners<MediaDataFrame>,
    pub discarded: Listeners<DiscardedParameters>,
    pub update: Listeners<UpdateParameters>,
    pub error: Listeners<ErrorParameters>,
    pub statistics: Listeners<StatisticsInfo>,
    pub server_message: Listeners<ServerMessage>,
    pub client_message: Listeners<ClientMessage>,
}

pub struct ServerSessionOptions {
    pub ws: Box<dyn SessionWebSocket>,
    /// Session id; `Uuid::nil()` lets the first client message establish it.
    pub id: Uuid,
    pub time_provider: Option<Arc<dyn TimeProvider>>,
    pub supported_languages: Option<Vec<String>>,
}

pub struct ServerSession {
    ws: Box<dyn SessionWebSocket>,
    time: Arc<dyn TimeProvider>,
    id: Uuid,
    seq: u64,
    clientseq: u64,
    state: ServerSessionState,
    selected_media: Option<MediaParameter>,
    language: Option<String>,
    send_supported_languages: bool,
    supported_languages: Option<Vec<String>>,
    position: StreamDuration,
    start_paused: bool,
    discard_to: Option<StreamDuration>,
    last_ping_timestamp: u64,

    authenticators: VecDeque<Authenticator>,
    media_selectors: VecDeque<MediaSelector>,
    open_handlers: VecDeque<OpenHandler>,
    update_handlers: Vec<UpdateHandler>,
    close_handlers: VecDeque<CloseHandler>,
    fini_handlers: VecDeque<FiniHandler>,

    pub events: ServerSessionEvents,
}

impl ServerSession {
    pub fn new(options: ServerSessionOptions) -> Self {
        let time = options
            .time_provider
            .unwrap_or_else(|| Arc::new(TokioTimeProvider::new()));
        let last_ping_timestamp = time.highres_timestamp();
        Self {
            ws: options.ws,
            time,
            id: options.id,
            seq: 0,
            clientseq: 0,
            state: ServerSessionState::Preparing,
            selected_media: None,
            language: None,
            send_supported_languages: false,
            supported_languages: options.supported_languages,
            position: StreamDuration::ZERO,
            start_paused: false,
            discard_to: None,
            last_ping_timestamp,
            authenticators: VecDeque::new(),
            media_selectors: VecDeque::new(),
            open_handlers: VecDeque::new(),
            update_handlers: Vec::new(),
            close_handlers: VecDeque::new(),
            fini_handlers: VecDeque::new(),
            events: ServerSessionEvents::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ServerSessionState {
        self.state
    }

    pub fn position(&self) -> StreamDuration {
        self.position
    }

    pub fn selected_media(&self) -> Option<&MediaParameter> {
        self.selected_media.as_ref()
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Nanosecond timestamp of the most recent `ping` received.
    pub fn last_ping_timestamp(&self) -> u64 {
        self.last_ping_timestamp
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            state: self.state,
            position: self.position,
            language: self.language.clone(),
            selected_media: self.selected_media.clone(),
        }
    }

    fn set_state(&mut self, state: ServerSessionState) {
        trace!("session {} state {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    // ---- Handler registration ------------------------------------------------

    pub fn add_authenticator(
        &mut self,
        handler: Authenticator,
    ) -> Result<(), HandlerRegistrationError> {
        if self.state == ServerSessionState::Preparing {
            self.authenticators.push_back(handler);
            Ok(())
        } else {
            Err(HandlerRegistrationError {
                handler: "authenticator",
                state: self.state,
            })
        }
    }

    pub fn add_media_selector(
        &mut self,
        handler: MediaSelector,
    ) -> Result<(), HandlerRegistrationError> {
        if self.state == ServerSessionState::Preparing {
            self.media_selectors.push_back(handler);
            Ok(())
        } else {
            Err(HandlerRegistrationError {
                handler: "media selector",
                state: self.state,
            })
        }
    }

    pub fn add_open_handler(
        &mut self,
        handler: OpenHandler,
    ) -> Result<(), HandlerRegistrationError> {
        if matches!(
            self.state,
            ServerSessionState::Preparing | ServerSessionState::Opening
        ) {
            self.open_handlers.push_back(handler);
            Ok(())
        } else {
            Err(HandlerRegistrationError {
                handler: "open handler",
                state: self.state,
            })
        }
    }

    pub fn add_update_handler(
        &mut self,
        handler: UpdateHandler,
    ) -> Result<(), HandlerRegistrationError> {
        if !matches!(
            self.state,
            ServerSessionState::Finalizing | ServerSessionState::Disconnected
        ) {
            self.update_handlers.push(handler);
            Ok(())
        } else {
            Err(HandlerRegistrationError {
                handler: "update handler",
                state: self.state,
            })
        }
    }

    pub fn add_close_handler(
        &mut self,
        handler: CloseHandler,
    ) -> Result<(), HandlerRegistrationError> {
        if !matches!(
            self.state,
            ServerSessionState::Finalizing | ServerSessionState::Disconnected
        ) {
            self.close_handlers.push_back(handler);
            Ok(())
        } else {
            Err(HandlerRegistrationError {
                handler: "close handler",
                state: self.state,
            })
        }
    }

    pub fn add_fini_handler(
        &mut self,
        handler: FiniHandler,
    ) -> Result<(), HandlerRegistrationError> {
        if self.state != ServerSessionState::Disconnected {
            self.fini_handlers.push_back(handler);
            Ok(())
        } else {
            Err(HandlerRegistrationError {
                handler: "fini handler",
                state: self.state,
            })
        }
    }

    // ---- Public control operations -------------------------------------------

    /// Request the client to pause streaming. Before the session is active
    /// this only records intent (`startPaused` in the opened message).
    /// Re-sending pause while already paused is legal: it is a request, not
    /// an edge-triggered command.
    pub fn pause(&mut self) {
        match self.state {
            ServerSessionState::Preparing | ServerSessionState::Opening => {
                self.start_paused = true;
            }
            ServerSessionState::Active | ServerSessionState::Paused => {
                self.build_and_send(ServerMessageKind::Pause(EmptyParameters {}));
            }
            _ => {}
        }
    }

    pub fn resume(&mut self) {
        match self.state {
            ServerSessionState::Preparing | ServerSessionState::Opening => {
                self.start_paused = false;
            }
            ServerSessionState::Active | ServerSessionState::Paused => {
                self.build_and_send(ServerMessageKind::Resume(EmptyParameters {}));
            }
            _ => {}
        }
    }

    /// Send a `disconnect` to the client. Permitted only while the state
    /// allows it; `unauthorized` forces the UNAUTHORIZED state first and
    /// `error` routes through the error-signaling path.
    pub fn disconnect(&mut self, reason: DisconnectReason, info: Option<String>) {
        if !send_disconnect_in_state(self.state) {
            return;
        }
        match reason {
            DisconnectReason::Error => {
                self.signal_client_error(info.unwrap_or_default());
            }
            DisconnectReason::Unauthorized => {
                self.set_state(ServerSessionState::Unauthorized);
                self.build_and_send(ServerMessageKind::Disconnect(DisconnectParameters {
                    reason,
                    info,
                }));
            }
            DisconnectReason::Completed => {
                self.build_and_send(ServerMessageKind::Disconnect(DisconnectParameters {
                    reason,
                    info,
                }));
            }
        }
    }

    /// Best-effort event delivery; returns false outside ACTIVE/PAUSED/CLOSING.
    pub fn send_event(&mut self, entities: Vec<EventEntity>) -> bool {
        if matches!(
            self.state,
            ServerSessionState::Active | ServerSessionState::Paused | ServerSessionState::Closing
        ) {
            self.build_and_send(ServerMessageKind::Event(EventParameters { entities }));
            true
        } else {
            false
        }
    }

    // ---- Error signaling ------------------------------------------------------

    /// Signal a server-side failure to the client. Suppressed once the
    /// session reached a state where the disconnect would be duplicate or
    /// the socket is already gone.
    pub fn signal_error(&mut self, info: impl Into<String>) {
        let info = info.into();
        if suppress_error_signal(self.state) {
            warn!(
                "Server error signaling suppressed in state {:?}: {info}",
                self.state
            );
        } else {
            warn!("Server error (state: {:?}): {info}", self.state);
            self.set_state(ServerSessionState::SignaledError);
            self.build_and_send(ServerMessageKind::Disconnect(DisconnectParameters {
                reason: DisconnectReason::Error,
                info: Some(info),
            }));
        }
    }

    /// Signal a protocol violation by the client.
    pub fn signal_client_error(&mut self, info: impl Into<String>) {
        let info = info.into();
        if suppress_error_signal(self.state) {
            warn!(
                "Client error signaling suppressed in state {:?}: {info}",
                self.state
            );
        } else {
            warn!("Signaling error (state: {:?}): {info}", self.state);
            self.set_state(ServerSessionState::SignaledError);
            self.build_and_send(ServerMessageKind::Disconnect(DisconnectParameters {
                reason: DisconnectReason::Error,
                info: Some(format!("Client Error: {info}")),
            }));
        }
    }

    // ---- Outbound messages ----------------------------------------------------

    fn build_and_send(&mut self, kind: ServerMessageKind) {
        self.seq += 1;
        let message = ServerMessage {
            version: ProtocolVersion,
            id: self.id,
            seq: self.seq,
            clientseq: self.clientseq,
            kind,
        };
        self.events.server_message.emit(&message);
        match serde_json::to_string(&message) {
            Ok(json) => {
                debug!("send_message - {}", json.chars().take(2048).collect::<String>());
                self.ws.send_text(json);
            }
            Err(err) => {
                warn!("Failed to serialize outbound message: {err}");
            }
        }
    }

    // ---- Inbound transport events ---------------------------------------------

    pub async fn on_text_message(&mut self, data: String) {
        if data.len() > MAX_MESSAGE_SIZE {
            return self.signal_client_error(format!(
                "Text message too large (>64K). Length: {}",
                data.len()
            ));
        }
        let value: serde_json::Value = match serde_json::from_str(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!("on_text_message - Error parsing message as JSON ({err})");
                return self.signal_client_error("Text message not valid JSON");
            }
        };

        let envelope = match crate::protocol::message::validate_client_envelope(&value) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("on_text_message - Message not a valid client message: {err}");
                return self.signal_client_error("Message not a well-formed client message");
            }
        };

        if envelope.seq != self.clientseq + 1 {
            warn!(
                "on_text_message - Sequence number mismatch. clientseq={}, message.seq={} (type: {})",
                self.clientseq, envelope.seq, envelope.message_type
            );
            return self.signal_client_error("Invalid seq value (not monotonically increasing)");
        }
        self.clientseq = envelope.seq;

        if envelope.serverseq > self.seq {
            // The client cannot have seen a message we did not send yet.
            warn!(
                "on_text_message - Client message serverseq ({}) is higher than server's seq ({})",
                envelope.serverseq, self.seq
            );
            return self.signal_client_error("Invalid serverseq value");
        }

        if envelope.id != self.id {
            if self.id.is_nil() {
                // Id wasn't set and this is the first message. Adopt it.
                self.id = envelope.id;
            } else {
                warn!(
                    "on_text_message - Session id mismatch. Expected={}, message: {}",
                    self.id, envelope.id
                );
                return self.signal_client_error("Session identifier mismatch");
            }
        }

        let message = match parse_client_value(value) {
            Ok(message) => message,
            Err(MessageParseError::UnknownType(message_type)) => {
                warn!("on_text_message - Unknown client message type: '{message_type}'");
                return self.signal_client_error(format!(
                    "Invalid Message: '{message_type}' is not a supported client message"
                ));
            }
            Err(err) => {
                warn!("on_text_message - {err}");
                return self.signal_client_error("Invalid Message: Invalid/missing parameters");
            }
        };

        self.events.client_message.emit(&message);
        match message.kind {
            ClientMessageKind::Open(params) => self.on_open_message(params).await,
            ClientMessageKind::Close(params) => self.on_close_message(params).await,
            ClientMessageKind::Discarded(params) => self.on_discarded_message(params),
            ClientMessageKind::Error(params) => self.on_error_message(params),
            ClientMessageKind::Paused(_) => self.on_paused_message(),
            ClientMessageKind::Ping(params) => self.on_ping_message(params),
            ClientMessageKind::Resumed(params) => self.on_resumed_message(params),
            ClientMessageKind::Update(params) => self.on_update_message(params),
        }
    }

    /// Binary frames carry audio for the selected media; valid only while
    /// ACTIVE with media negotiated.
    pub async fn on_binary_message(&mut self, data: Vec<u8>) {
        trace!("Binary message. Size: {}", data.len());
        if self.state != ServerSessionState::Active {
            return self.signal_client_error(format!("Received audio in state {:?}", self.state));
        }
        let Some(media) = self.selected_media.clone() else {
            return self.signal_client_error("Unexpected binary message: No media selected");
        };
        match MediaDataFrame::from_message(data, &media) {
            Ok(frame) => {
                self.position = self.position.with_added_samples(frame.sample_count, frame.rate);
                self.events.audio.emit(&frame);
            }
            Err(err) => {
                let info = format!("Binary data not a valid audio frame. Error: {err}");
                warn!("{info}");
                self.signal_client_error(info);
            }
        }
    }

    /// Socket closed: force FINALIZING, drain close handlers (covering the
    /// no-graceful-close case), then fini handlers, ending DISCONNECTED.
    /// This guarantees handler cleanup runs exactly once.
    pub async fn on_ws_close(&mut self, code: u16) {
        if self.state != ServerSessionState::Closed {
            warn!(
                "on_ws_close - WebSocket closed in state {:?}! Code: {code}",
                self.state
            );
        } else {
            info!("on_ws_close - WebSocket closed. Code: {code}");
        }
        self.set_state(ServerSessionState::Finalizing);
        self.run_close_handlers(None).await;
        self.run_fini_handlers().await;
        self.set_state(ServerSessionState::Disconnected);
        info!("on_ws_close - All fini handlers completed, changed state to DISCONNECTED");
    }

    pub fn on_ws_error(&mut self, error: &str) {
        warn!(
            "WebSocket error, forcing close (state: {:?}): {error}",
            self.state
        );
        self.ws.close();
    }

    // ---- Message dispatch -----------------------------------------------------

    async fn on_open_message(&mut self, params: OpenParameters) {
        if self.state != ServerSessionState::Preparing {
            warn!(
                "on_open_message - Ignoring 'open' message in state {:?}",
                self.state
            );
            return;
        }
        self.set_state(ServerSessionState::Opening);
        let params = Arc::new(params);
        self.discard_to = None;

        // Phase 1: authenticators. Failures inside a handler become signaled
        // server errors; rejections become an unauthorized disconnect.
        self.run_authenticators(&params).await;

        // Phase 2: media selection.
        if self.state == ServerSessionState::Opening {
            if let Err(err) = self.run_media_selectors(&params).await {
                warn!("on_open_message - Error during media selection: {err}");
                self.signal_error(format!("Server error: {err}"));
            } else if self.state == ServerSessionState::Opening {
                info!(
                    "on_open_message - Selected media: {:?}",
                    self.selected_media
                );
            }
        } else {
            info!(
                "on_open_message - State changed to {:?} during authentication",
                self.state
            );
        }

        // Phase 3: supported-languages negotiation.
        if self.state == ServerSessionState::Opening {
            self.send_supported_languages = params.supported_languages.unwrap_or(false);
            if self.send_supported_languages {
                info!(
                    "on_open_message - Send supported languages: {:?}",
                    self.supported_languages
                );
            }
        }

        // Phase 4: open handlers, drained to exhaustion in parallel batches.
        if self.state == ServerSessionState::Opening {
            self.language = params.language.as_ref().map(|l| l.to_lowercase());
            if let Err(err) = self.run_open_handlers(params.clone()).await {
                warn!("on_open_message - Error during open transaction: {err}");
                self.signal_error(format!("Server error: {err}"));
            }
        }

        // Phase 5: report the outcome and go active.
        if self.state == ServerSessionState::Opening {
            info!("on_open_message - Open handlers complete, session opened");
            let mut opened = OpenedParameters {
                media: self.selected_media.iter().cloned().collect(),
                start_paused: Some(self.start_paused),
                ..Default::default()
            };
            if let Some(discard_to) = self.discard_to {
                if discard_to > self.position {
                    opened.discard_to = Some(discard_to);
                }
            }
            if self.send_supported_languages {
                opened.supported_languages =
                    Some(self.supported_languages.clone().unwrap_or_default());
            }
            self.build_and_send(ServerMessageKind::Opened(opened));
            self.set_state(ServerSessionState::Active);
        } else {
            info!(
                "on_open_message - State changed to {:?} during open transaction",
                self.state
            );
        }
    }

    async fn on_close_message(&mut self, params: CloseParameters) {
        if self.state == ServerSessionState::Closing {
            info!("on_close_message - Ignoring message in state {:?}", self.state);
            return;
        }
        // A close transaction is acceptable in any other state, including
        // UNAUTHORIZED: the disconnect reason was already delivered and this
        // is the client's orderly exit path.
        info!("on_close_message - Closing session (state: {:?})...", self.state);
        self.set_state(ServerSessionState::Closing);
        self.run_close_handlers(Some(params)).await;
        info!("on_close_message - Close handlers completed, session closed");
        if self.state == ServerSessionState::Closing {
            self.build_and_send(ServerMessageKind::Closed(EmptyParameters {}));
            self.set_state(ServerSessionState::Closed);
        }
    }

    fn on_ping_message(&mut self, params: crate::protocol::message::PingParameters) {
        debug!(
            "on_ping_message - RTT: {}",
            params
                .rtt
                .map(|d| d.to_string())
                .unwrap_or_default()
        );
        self.build_and_send(ServerMessageKind::Pong(EmptyParameters {}));
        self.last_ping_timestamp = self.time.highres_timestamp();
        if let Some(rtt) = params.rtt {
            self.events.statistics.emit(&StatisticsInfo { rtt });
        }
    }

    fn on_error_message(&mut self, params: ErrorParameters) {
        warn!(
            "on_error_message - code: {:?}, message: {}",
            params.code, params.message
        );
        self.events.error.emit(&params);
    }

    fn on_discarded_message(&mut self, params: DiscardedParameters) {
        debug!(
            "on_discarded_message - start: {}, discarded: {}",
            params.start, params.discarded
        );
        self.events.discarded.emit(&params);
    }

    fn on_paused_message(&mut self) {
        if self.state == ServerSessionState::Active {
            self.set_state(ServerSessionState::Paused);
            self.events.paused.emit(&());
        } else {
            warn!(
                "on_paused_message - Ignoring 'paused' message in state {:?}",
                self.state
            );
        }
    }

    fn on_resumed_message(&mut self, params: ResumedParameters) {
        if self.state == ServerSessionState::Paused {
            self.set_state(ServerSessionState::Active);
            self.events.resumed.emit(&params);
        } else {
            warn!(
                "on_resumed_message - Ignoring 'resumed' message in state {:?}",
                self.state
            );
        }
    }

    fn on_update_message(&mut self, params: UpdateParameters) {
        info!("on_update_message - language: {}", params.language);
        if !matches!(
            self.state,
            ServerSessionState::Active | ServerSessionState::Paused
        ) {
            warn!(
                "on_update_message - Ignoring 'update' message in state {:?}",
                self.state
            );
            return;
        }
        self.language = Some(params.language.to_lowercase());
        let mut handlers = std::mem::take(&mut self.update_handlers);
        for handler in &mut handlers {
            handler(self, Some(&params));
        }
        // Handlers registered while the batch ran are appended behind the
        // existing ones and first run on the next update message.
        let added = std::mem::take(&mut self.update_handlers);
        self.update_handlers = handlers;
        self.update_handlers.extend(added);
        self.events.update.emit(&params);
    }

    // ---- Handler chain execution ----------------------------------------------

    async fn run_authenticators(&mut self, params: &OpenParameters) {
        while self.state == ServerSessionState::Opening {
            let Some(handler) = self.authenticators.pop_front() else {
                break;
            };
            match handler(self, params).await {
                Ok(outcome) => {
                    if self.state != ServerSessionState::Opening {
                        break;
                    }
                    if let AuthOutcome::Fail { info } = outcome {
                        self.disconnect(DisconnectReason::Unauthorized, info);
                    }
                }
                Err(err) => {
                    warn!("run_authenticators - Error running authentication handler: {err}");
                    self.signal_error(format!("Server error: {err}"));
                }
            }
        }
    }

    async fn run_media_selectors(&mut self, params: &OpenParameters) -> anyhow::Result<()> {
        let mut offered = params.media.clone();
        while self.state == ServerSessionState::Opening {
            let Some(handler) = self.media_selectors.pop_front() else {
                break;
            };
            offered = handler(self, offered, params).await?;
        }
        if self.state == ServerSessionState::Opening {
            // First entry of whatever survived the selectors' filters; with
            // no selectors registered this picks the first offered. An empty
            // result is valid ("no media", e.g. a probe session).
            self.selected_media = offered.into_iter().next();
        }
        Ok(())
    }

    /// Drain the open handler queue in concurrent batches until it is empty
    /// or the state moved away from OPENING. Handlers may enqueue further
    /// open/close/fini handlers, so the queue is re-checked after each batch
    /// settles rather than iterating a fixed snapshot.
    async fn run_open_handlers(&mut self, params: Arc<OpenParameters>) -> anyhow::Result<()> {
        while !self.open_handlers.is_empty() && self.state == ServerSessionState::Opening {
            let intents = Arc::new(Mutex::new(OpenIntents::default()));
            let mut batch = Vec::with_capacity(self.open_handlers.len());
            while let Some(handler) = self.open_handlers.pop_front() {
                let context = OpenContext {
                    session: self.info(),
                    open_params: params.clone(),
                    intents: intents.clone(),
                };
                batch.push(handler(context));
            }
            let results = join_all(batch).await;
            let mut last_err = None;
            for result in results {
                match result {
                    Ok(Some(close_handler)) => self.close_handlers.push_back(close_handler),
                    Ok(None) => {}
                    Err(err) => last_err = Some(err),
                }
            }
            self.apply_open_intents(&intents);
            if let Some(err) = last_err {
                return Err(err);
            }
        }
        Ok(())
    }

    fn apply_open_intents(&mut self, intents: &Arc<Mutex<OpenIntents>>) {
        let mut intents = intents.lock().unwrap();
        if let Some(value) = intents.start_paused.take() {
            self.start_paused = value;
        }
        if let Some(value) = intents.discard_to.take() {
            self.discard_to = Some(match self.discard_to {
                Some(current) if current >= value => current,
                _ => value,
            });
        }
        self.open_handlers.extend(intents.open_handlers.drain(..));
        self.close_handlers.extend(intents.close_handlers.drain(..));
        self.fini_handlers.extend(intents.fini_handlers.drain(..));
        if let Some((reason, info)) = intents.disconnect.take() {
            self.disconnect(reason, info);
        }
    }

    /// Drain close handlers to exhaustion. Failures are logged, never
    /// signaled: the session is already on its way down.
    async fn run_close_handlers(&mut self, params: Option<CloseParameters>) {
        while !self.close_handlers.is_empty() {
            let intents = Arc::new(Mutex::new(CleanupIntents::default()));
            let mut batch = Vec::with_capacity(self.close_handlers.len());
            while let Some(handler) = self.close_handlers.pop_front() {
                let context = CloseContext {
                    session: self.info(),
                    close_params: params.clone(),
                    intents: intents.clone(),
                };
                batch.push(handler(context));
            }
            for result in join_all(batch).await {
                match result {
                    Ok(Some(fini_handler)) => self.fini_handlers.push_back(fini_handler),
                    Ok(None) => {}
                    Err(err) => warn!("Error executing close handler: {err}"),
                }
            }
            let mut intents = intents.lock().unwrap();
            self.close_handlers.extend(intents.close_handlers.drain(..));
            self.fini_handlers.extend(intents.fini_handlers.drain(..));
        }
    }

    async fn run_fini_handlers(&mut self) {
        while !self.fini_handlers.is_empty() {
            let intents = Arc::new(Mutex::new(CleanupIntents::default()));
            let mut batch = Vec::with_capacity(self.fini_handlers.len());
            while let Some(handler) = self.fini_handlers.pop_front() {
                let context = FiniContext {
                    session: self.info(),
                    intents: intents.clone(),
                };
                batch.push(handler(context));
            }
            for result in join_all(batch).await {
                if let Err(err) = result {
                    warn!("Error executing fini handler: {err}");
                }
            }
            let mut intents = intents.lock().unwrap();
            self.fini_handlers.extend(intents.fini_handlers.drain(..));
        }
    }
}
