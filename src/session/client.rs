//! # Client Session State Machine
//!
//! Drives the connection from the streaming side: connect → open →
//! streaming → close, with ping/pong liveness tracking and media
//! negotiation validation.
//!
//! ## Lifecycle:
//! `CONNECTING → PREPARING → OPENING → OPEN → (CLOSING | CLOSING-ERROR) →
//! CLOSED → DISCONNECTED`.
//!
//! ## Driving model:
//! Like the server session, the client session is owned by a single driver
//! task. Transport callbacks invoke the `on_*` methods directly; timers and
//! the media source deliver their events through the same ordered queue so
//! the state machine never runs re-entrantly.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::duration::StreamDuration;
use crate::protocol::media::MediaParameter;
use crate::protocol::message::{
    parse_server_value, ClientMessage, ClientMessageKind, CloseParameters, CloseReason,
    DiscardedParameters, EmptyParameters, ErrorCode, ErrorParameters, EventParameters,
    MessageParseError, OpenParameters, OpenedParameters, Participant, PingParameters,
    ProtocolVersion, ResumedParameters, ServerMessageKind, MAX_MESSAGE_SIZE,
};
use crate::session::events::Listeners;
use crate::session::{SessionWebSocket, TimeProvider, TimerSubscription, TokioTimeProvider};

pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(10000);
pub const DEFAULT_INITIAL_PING_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(5000);

/// Client-side session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSessionState {
    Connecting,
    Preparing,
    Opening,
    Open,
    Closing,
    ClosingError,
    Closed,
    Disconnected,
}

/// Lifecycle of the audio producer feeding a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSourceState {
    Preparing,
    Streaming,
    Discarding,
    Paused,
    End,
    Error,
    Closed,
}

/// Audio producer seam. Control flows through these methods; produced data
/// and state changes come back through [`MediaSourceEvent`]s delivered to the
/// session's driver.
pub trait MediaSource: Send {
    fn state(&self) -> MediaSourceState;
    fn position(&self) -> StreamDuration;
    fn offered_media(&self) -> Vec<MediaParameter>;
    fn selected_media(&self) -> Option<MediaParameter>;

    fn start_streaming(
        &mut self,
        selected_media: Option<MediaParameter>,
        discard_to: Option<StreamDuration>,
        start_paused: bool,
    );

    fn pause(&mut self);
    fn resume(&mut self);
    fn close(&mut self);
}

/// Events produced by a media source.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaSourceEvent {
    Audio(Vec<u8>),
    Discarded {
        start: StreamDuration,
        discarded: StreamDuration,
    },
    Paused,
    Resumed {
        start: StreamDuration,
        discarded: StreamDuration,
    },
    End {
        duration: StreamDuration,
    },
    Error(String),
}

/// Timer wakeups delivered through the session's event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTimerEvent {
    OpenTimeout,
    CloseTimeout,
    InitialPing,
    PingInterval,
}

/// Open parameters before the provider fills in the defaults.
#[derive(Debug, Clone)]
pub struct PartialOpenParameters {
    pub organization_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub participant: Option<Participant>,
    pub media: Vec<MediaParameter>,
    pub language: Option<String>,
    pub supported_languages: Option<bool>,
    pub custom_config: Option<serde_json::Value>,
}

pub type OpenParameterProvider = Box<
    dyn FnOnce(PartialOpenParameters) -> BoxFuture<'static, anyhow::Result<OpenParameters>> + Send,
>;

/// Typed observer lists for everything a client session reports outward.
#[derive(Default)]
pub struct ClientSessionEvents {
    pub disconnected: Listeners<()>,
    pub event: Listeners<EventParameters>,
    /// Measured ping/pong round-trip time.
    pub rtt_info: Listeners<StreamDuration>,
}

pub struct ClientSessionOptions {
    pub ws: Box<dyn SessionWebSocket>,
    pub media_source: Box<dyn MediaSource>,
    pub organization_id: Uuid,
    pub session_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub participant: Option<Participant>,
    pub language: Option<String>,
    pub supported_languages: Option<bool>,
    pub custom_config: Option<serde_json::Value>,
    pub open_parameter_provider: Option<OpenParameterProvider>,
    pub time_provider: Option<Arc<dyn TimeProvider>>,
    /// Sink for timer wakeups; the driver feeds them back via
    /// [`ClientSession::on_timer_event`].
    pub timer_events: mpsc::UnboundedSender<ClientTimerEvent>,
    pub open_timeout: Option<Duration>,
    pub close_timeout: Option<Duration>,
    pub ping_interval: Option<Duration>,
    pub initial_ping_delay: Option<Duration>,
}

pub struct ClientSession {
    ws: Box<dyn SessionWebSocket>,
    media_source: Box<dyn MediaSource>,
    time: Arc<dyn TimeProvider>,
    timer_tx: mpsc::UnboundedSender<ClientTimerEvent>,

    id: Uuid,
    organization_id: Uuid,
    conversation_id: Option<Uuid>,
    participant: Option<Participant>,
    language: Option<String>,
    supported_languages: Option<bool>,
    custom_config: Option<serde_json::Value>,
    open_parameter_provider: Option<OpenParameterProvider>,

    state: ClientSessionState,
    seq: u64,
    serverseq: u64,
    opened: Option<OpenedParameters>,

    open_timeout: Duration,
    close_timeout: Duration,
    ping_interval: Duration,
    initial_ping_delay: Duration,

    open_timer: Option<TimerSubscription>,
    close_timer: Option<TimerSubscription>,
    ping_initial_timer: Option<TimerSubscription>,
    ping_interval_timer: Option<TimerSubscription>,
    initial_ping_phase: bool,
    pending_ping: Option<PendingPing>,
    last_ping_rtt: Option<u64>,

    pub events: ClientSessionEvents,
}

struct PendingPing {
    timestamp: u64,
    seq: u64,
}

impl ClientSession {
    pub fn new(options: ClientSessionOptions) -> Self {
        let time = options
            .time_provider
            .unwrap_or_else(|| Arc::new(TokioTimeProvider::new()));
        Self {
            ws: options.ws,
            media_source: options.media_source,
            time,
            timer_tx: options.timer_events,
            id: options.session_id.unwrap_or_else(Uuid::new_v4),
            organization_id: options.organization_id,
            conversation_id: options.conversation_id,
            participant: options.participant,
            language: options.language,
            supported_languages: options.supported_languages,
            custom_config: options.custom_config,
            open_parameter_provider: options.open_parameter_provider,
            state: ClientSessionState::Connecting,
            seq: 0,
            serverseq: 0,
            opened: None,
            open_timeout: options.open_timeout.unwrap_or(DEFAULT_OPEN_TIMEOUT),
            close_timeout: options.close_timeout.unwrap_or(DEFAULT_CLOSE_TIMEOUT),
            ping_interval: options.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL),
            initial_ping_delay: options
                .initial_ping_delay
                .unwrap_or(DEFAULT_INITIAL_PING_DELAY),
            open_timer: None,
            close_timer: None,
            ping_initial_timer: None,
            ping_interval_timer: None,
            initial_ping_phase: false,
            pending_ping: None,
            last_ping_rtt: None,
            events: ClientSessionEvents::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ClientSessionState {
        self.state
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn serverseq(&self) -> u64 {
        self.serverseq
    }

    /// Parameters of the `opened` message once the session is open.
    pub fn opened(&self) -> Option<&OpenedParameters> {
        self.opened.as_ref()
    }

    fn is_closing(&self) -> bool {
        matches!(
            self.state,
            ClientSessionState::Closing | ClientSessionState::ClosingError
        )
    }

    // ---- Outbound messages ----------------------------------------------------

    fn build_message(&mut self, kind: ClientMessageKind) -> ClientMessage {
        self.seq += 1;
        ClientMessage {
            version: ProtocolVersion,
            id: self.id,
            seq: self.seq,
            serverseq: self.serverseq,
            position: self.media_source.position(),
            kind,
        }
    }

    fn send_message(&mut self, message: ClientMessage) {
        match serde_json::to_string(&message) {
            Ok(json) => {
                debug!("send_message - {}", json.chars().take(2048).collect::<String>());
                self.ws.send_text(json);
            }
            Err(err) => warn!("Failed to serialize outbound message: {err}"),
        }
    }

    fn build_and_send(&mut self, kind: ClientMessageKind) {
        let message = self.build_message(kind);
        self.send_message(message);
    }

    fn send_error_message(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.build_and_send(ClientMessageKind::Error(ErrorParameters {
            code,
            message: message.into(),
            retry_after: None,
        }));
    }

    fn send_unexpected_message_error(&mut self, message_type: &str) {
        warn!(
            "Unexpected '{message_type}' message in state {:?}",
            self.state
        );
        self.signal_fatal_error(
            ErrorCode::Conflict,
            format!(
                "Unexpected '{message_type}' message in state {:?}",
                self.state
            ),
        );
    }

    /// Single chokepoint for fatal errors: report to the peer, then close
    /// with reason `error`. Guarded against re-entry once closing or gone.
    pub fn signal_fatal_error(&mut self, code: ErrorCode, message: impl Into<String>) {
        if !matches!(
            self.state,
            ClientSessionState::Closed
                | ClientSessionState::Disconnected
                | ClientSessionState::ClosingError
        ) {
            let message = message.into();
            self.send_error_message(code, message);
            self.initiate_close(CloseReason::Error);
        }
    }

    // ---- Close handling -------------------------------------------------------

    /// Begin an orderly shutdown with reason `end`.
    pub fn close(&mut self) {
        self.initiate_close(CloseReason::End);
    }

    fn initiate_close(&mut self, reason: CloseReason) {
        if self.is_closing()
            || matches!(
                self.state,
                ClientSessionState::Closed | ClientSessionState::Disconnected
            )
        {
            return;
        }
        self.state = if reason == CloseReason::Error {
            ClientSessionState::ClosingError
        } else {
            ClientSessionState::Closing
        };
        self.media_source.close();
        self.stop_ping_timer();
        if let Some(mut timer) = self.open_timer.take() {
            timer.cancel();
        }
        let tx = self.timer_tx.clone();
        self.close_timer = Some(self.time.start_timeout(
            Box::new(move || {
                let _ = tx.send(ClientTimerEvent::CloseTimeout);
            }),
            self.close_timeout,
        ));
        self.build_and_send(ClientMessageKind::Close(CloseParameters { reason }));
    }

    fn initiate_disconnect(&mut self) {
        if !matches!(
            self.state,
            ClientSessionState::Closed | ClientSessionState::Disconnected
        ) {
            self.state = ClientSessionState::Closed;
            self.ws.close();
        }
    }

    fn handle_close_cleanup(&mut self) {
        if self.state != ClientSessionState::Disconnected {
            self.stop_ping_timer();
            for timer in [self.open_timer.take(), self.close_timer.take()].iter_mut() {
                if let Some(timer) = timer {
                    timer.cancel();
                }
            }
            self.media_source.close();
            self.state = ClientSessionState::Disconnected;
            self.events.disconnected.emit(&());
        }
    }

    // ---- Ping/pong liveness ---------------------------------------------------

    fn stop_ping_timer(&mut self) {
        if let Some(mut timer) = self.ping_initial_timer.take() {
            timer.cancel();
        }
        if let Some(mut timer) = self.ping_interval_timer.take() {
            timer.cancel();
        }
    }

    fn send_ping(&mut self) {
        if self.state != ClientSessionState::Open {
            self.stop_ping_timer();
            return;
        }
        if self.ping_interval_timer.is_none() {
            let tx = self.timer_tx.clone();
            self.ping_interval_timer = Some(self.time.start_interval(
                Box::new(move || {
                    let _ = tx.send(ClientTimerEvent::PingInterval);
                }),
                self.ping_interval,
            ));
        }
        if let Some(pending_seq) = self.pending_ping.as_ref().map(|p| p.seq) {
            // At most one ping may be outstanding. The pending slot is left
            // in place: the pong might be in flight and must not be flagged
            // as erroneous when it arrives.
            warn!("send_ping - Pong for ping seq={pending_seq} not received in ping interval!");
            self.signal_fatal_error(ErrorCode::RequestTimeout, "Timeout waiting for pong");
        } else {
            let rtt = self.last_ping_rtt.map(StreamDuration::from_nanos);
            let message = self.build_message(ClientMessageKind::Ping(PingParameters { rtt }));
            self.pending_ping = Some(PendingPing {
                timestamp: self.time.highres_timestamp(),
                seq: message.seq,
            });
            self.send_message(message);
        }
    }

    // ---- Transport events -----------------------------------------------------

    pub async fn on_ws_open(&mut self) {
        if self.state != ClientSessionState::Connecting {
            error!("WebSocket 'open' event in state {:?}", self.state);
            return self.signal_fatal_error(ErrorCode::ServerError, "Internal client error");
        }
        self.state = ClientSessionState::Preparing;

        let partial = PartialOpenParameters {
            organization_id: self.organization_id,
            conversation_id: self.conversation_id,
            participant: self.participant.clone(),
            media: self.media_source.offered_media(),
            language: self.language.clone(),
            supported_languages: self.supported_languages,
            custom_config: self.custom_config.clone(),
        };
        let parameters = match self.open_parameter_provider.take() {
            Some(provider) => match provider(partial).await {
                Ok(parameters) => parameters,
                Err(err) => {
                    error!("Error resolving open parameters: {err}");
                    return self
                        .signal_fatal_error(ErrorCode::ServerError, "Internal client error");
                }
            },
            None => OpenParameters {
                organization_id: partial.organization_id,
                conversation_id: partial.conversation_id.unwrap_or_else(Uuid::new_v4),
                participant: partial.participant.unwrap_or_else(|| Participant {
                    id: Uuid::new_v4(),
                    ani: String::new(),
                    ani_name: String::new(),
                    dnis: String::new(),
                }),
                media: partial.media,
                language: partial.language,
                supported_languages: partial.supported_languages,
                continued_sessions: None,
                custom_config: partial.custom_config,
            },
        };

        if self.state == ClientSessionState::Preparing {
            self.build_and_send(ClientMessageKind::Open(parameters));
            self.state = ClientSessionState::Opening;
            let tx = self.timer_tx.clone();
            self.open_timer = Some(self.time.start_timeout(
                Box::new(move || {
                    let _ = tx.send(ClientTimerEvent::OpenTimeout);
                }),
                self.open_timeout,
            ));
        }
    }

    pub fn on_ws_close(&mut self, code: u16) {
        if self.state == ClientSessionState::Closed {
            info!("WebSocket close - Code: {code}");
        } else {
            warn!(
                "WebSocket closed unexpectedly in state {:?}! Code: {code}",
                self.state
            );
        }
        self.handle_close_cleanup();
    }

    pub fn on_ws_error(&mut self, error: &str) {
        error!("WebSocket error, forcing close: {error}");
        self.ws.close();
    }

    pub fn on_binary_message(&mut self, data: Vec<u8>) {
        info!("WebSocket binary message. Size: {}", data.len());
        self.signal_fatal_error(ErrorCode::UnsupportedMediaType, "Unexpected binary message");
    }

    pub fn on_text_message(&mut self, data: String) {
        if data.len() > MAX_MESSAGE_SIZE {
            return self.signal_fatal_error(ErrorCode::PayloadTooLarge, "Message too large");
        }
        let value: serde_json::Value = match serde_json::from_str(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!("Text message not valid JSON: {err}");
                return self
                    .signal_fatal_error(ErrorCode::BadRequest, "Message not well-formed JSON");
            }
        };
        let envelope = match crate::protocol::message::validate_server_envelope(&value) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Text message (parsed) is not a server message: {err}");
                return self.signal_fatal_error(
                    ErrorCode::BadRequest,
                    "Message not an AudioHook server message",
                );
            }
        };

        if envelope.seq != self.serverseq + 1 {
            warn!(
                "Sequence mismatch: serverseq={}, incoming seq={}",
                self.serverseq, envelope.seq
            );
            return self.signal_fatal_error(
                ErrorCode::Conflict,
                "Invalid seq value (not monotonically increasing)",
            );
        }
        self.serverseq = envelope.seq;

        let message = match parse_server_value(value) {
            Ok(message) => message,
            Err(MessageParseError::UnknownType(message_type)) => {
                return self.signal_fatal_error(
                    ErrorCode::BadRequest,
                    format!("'{message_type}' is not a supported server message"),
                );
            }
            Err(err) => {
                warn!("on_text_message - {err}");
                return self.signal_fatal_error(
                    ErrorCode::BadRequest,
                    "Invalid Message: Invalid/missing parameters",
                );
            }
        };

        match message.kind {
            ServerMessageKind::Closed(_) => self.on_closed_message(),
            ServerMessageKind::Disconnect(params) => self.on_disconnect_message(params),
            ServerMessageKind::Event(params) => self.on_event_message(params),
            ServerMessageKind::Opened(params) => self.on_opened_message(params),
            ServerMessageKind::Pause(_) => self.on_pause_message(),
            ServerMessageKind::Pong(_) => self.on_pong_message(message.clientseq),
            ServerMessageKind::Reconnect(params) => {
                info!("Reconnect requested (state: {:?}): {:?}", self.state, params.info);
            }
            ServerMessageKind::Resume(_) => self.on_resume_message(),
            ServerMessageKind::Updated(_) => {
                info!("Language update acknowledged (state: {:?})", self.state);
            }
        }
    }

    // ---- Server message dispatch ----------------------------------------------

    fn on_opened_message(&mut self, params: OpenedParameters) {
        if self.state != ClientSessionState::Opening {
            return self.send_unexpected_message_error("opened");
        }
        info!("Session open! Parameters: {params:?}");
        self.state = ClientSessionState::Open;
        if let Some(mut timer) = self.open_timer.take() {
            timer.cancel();
        }

        if params.media.len() > 1 {
            self.opened = Some(params);
            return self.signal_fatal_error(ErrorCode::BadRequest, "More than one media selected");
        }
        let selected = params.media.first().cloned();
        if let Some(selected) = &selected {
            // The selection must be one of the offered entries, channel
            // order included.
            let offered = self.media_source.offered_media();
            if !offered.iter().any(|m| m.matches(selected)) {
                self.opened = Some(params);
                return self.signal_fatal_error(
                    ErrorCode::BadRequest,
                    "Selected media not one of the offered",
                );
            }
        }
        self.media_source.start_streaming(
            selected,
            params.discard_to,
            params.start_paused.unwrap_or(false),
        );
        self.opened = Some(params);

        // Probe ping shortly after open so the server gets an early RTT
        // measurement.
        self.initial_ping_phase = true;
        let tx = self.timer_tx.clone();
        self.ping_initial_timer = Some(self.time.start_timeout(
            Box::new(move || {
                let _ = tx.send(ClientTimerEvent::InitialPing);
            }),
            self.initial_ping_delay,
        ));
    }

    fn on_pong_message(&mut self, clientseq: u64) {
        let received = self.time.highres_timestamp();
        let pending = self
            .pending_ping
            .as_ref()
            .map(|p| (p.seq, p.timestamp));
        match pending {
            None => {
                warn!("Pong received without outstanding ping");
                self.send_error_message(
                    ErrorCode::Conflict,
                    "Unexpected 'pong' (no outstanding 'ping')",
                );
            }
            Some((seq, _)) if seq != clientseq => {
                // Reported but not fatal, and the pending slot stays armed
                // for the real pong.
                warn!("Pong clientseq ({clientseq}) differs from ping seq ({seq})");
                self.send_error_message(
                    ErrorCode::BadRequest,
                    "The \"clientseq\" of the 'pong' message must match \"seq\" of the 'ping' message.",
                );
            }
            Some((_, timestamp)) if self.state == ClientSessionState::Open => {
                let rtt = received.saturating_sub(timestamp);
                self.last_ping_rtt = Some(rtt);
                self.pending_ping = None;
                info!("Pong received - rtt: {rtt}ns");
                self.events.rtt_info.emit(&StreamDuration::from_nanos(rtt));
                if let Some(mut timer) = self.ping_initial_timer.take() {
                    timer.cancel();
                }
                if self.initial_ping_phase {
                    // Response to the initial probe; follow up immediately so
                    // the server gets its first RTT sample.
                    self.initial_ping_phase = false;
                    self.send_ping();
                }
            }
            Some(_) => {
                info!("Ignoring 'pong' in state {:?} (straggler or late)", self.state);
                self.pending_ping = None;
            }
        }
    }

    fn on_closed_message(&mut self) {
        if self.is_closing() {
            info!("Session closed (state: {:?})", self.state);
            if let Some(mut timer) = self.close_timer.take() {
                timer.cancel();
            }
            self.initiate_disconnect();
        } else {
            self.send_unexpected_message_error("closed");
        }
    }

    fn on_disconnect_message(&mut self, params: crate::protocol::message::DisconnectParameters) {
        // Disconnect requests are always acceptable; already-closing
        // sessions just ignore them.
        if !self.is_closing()
            && !matches!(
                self.state,
                ClientSessionState::Closed | ClientSessionState::Disconnected
            )
        {
            info!(
                "Disconnect in state {:?}, reason: {:?}, info: {:?}",
                self.state, params.reason, params.info
            );
            self.initiate_close(CloseReason::Disconnect);
        }
    }

    fn on_event_message(&mut self, params: EventParameters) {
        if !self.events.event.emit(&params) {
            info!(
                "Event message (state: {:?}), no listener. Entities: {}",
                self.state,
                params.entities.len()
            );
        }
    }

    fn on_pause_message(&mut self) {
        if self.state == ClientSessionState::Open {
            info!("Pausing media source (state: {:?})", self.state);
            if self.media_source.state() == MediaSourceState::Paused {
                // Pause is a request, not an edge-triggered command: an
                // already-paused stream acknowledges again.
                self.build_and_send(ClientMessageKind::Paused(EmptyParameters {}));
            } else {
                self.media_source.pause();
            }
        } else if self.is_closing() {
            info!("Ignoring 'pause' in state {:?}", self.state);
        } else {
            self.send_unexpected_message_error("pause");
        }
    }

    fn on_resume_message(&mut self) {
        if self.state == ClientSessionState::Open {
            info!("Resuming media source (state: {:?})", self.state);
            if self.media_source.state() == MediaSourceState::Paused {
                self.media_source.resume();
            } else {
                // Not paused: acknowledge immediately with zero discarded.
                let position = self.media_source.position();
                self.build_and_send(ClientMessageKind::Resumed(ResumedParameters {
                    start: position,
                    discarded: StreamDuration::ZERO,
                }));
            }
        } else if self.is_closing() {
            info!("Ignoring 'resume' in state {:?}", self.state);
        } else {
            self.send_unexpected_message_error("resume");
        }
    }

    // ---- Media source events --------------------------------------------------

    pub fn on_media_event(&mut self, event: MediaSourceEvent) {
        match event {
            MediaSourceEvent::Audio(data) => {
                if self.state == ClientSessionState::Open {
                    self.ws.send_binary(data);
                }
            }
            MediaSourceEvent::Discarded { start, discarded } => {
                if self.state == ClientSessionState::Open {
                    self.build_and_send(ClientMessageKind::Discarded(DiscardedParameters {
                        start,
                        discarded,
                    }));
                }
            }
            MediaSourceEvent::Paused => {
                if self.state == ClientSessionState::Open {
                    self.build_and_send(ClientMessageKind::Paused(EmptyParameters {}));
                }
            }
            MediaSourceEvent::Resumed { start, discarded } => {
                if self.state == ClientSessionState::Open {
                    self.build_and_send(ClientMessageKind::Resumed(ResumedParameters {
                        start,
                        discarded,
                    }));
                }
            }
            MediaSourceEvent::End { duration } => {
                info!("Source stream ended (duration: {duration}), closing session.");
                self.initiate_close(CloseReason::End);
            }
            MediaSourceEvent::Error(err) => {
                error!("Media source signaled error: {err}");
                self.signal_fatal_error(ErrorCode::ServerError, "Internal client error");
            }
        }
    }

    // ---- Control operations ---------------------------------------------------

    /// Request a language change mid-session.
    pub fn update_language(&mut self, language: impl Into<String>) {
        self.build_and_send(ClientMessageKind::Update(
            crate::protocol::message::UpdateParameters {
                language: language.into(),
            },
        ));
    }

    // ---- Timer events ---------------------------------------------------------

    pub fn on_timer_event(&mut self, event: ClientTimerEvent) {
        match event {
            ClientTimerEvent::OpenTimeout => {
                self.open_timer = None;
                self.signal_fatal_error(ErrorCode::RequestTimeout, "Open transaction timeout");
            }
            ClientTimerEvent::CloseTimeout => {
                self.close_timer = None;
                if self.is_closing() {
                    warn!(
                        "Timeout waiting for close transaction to complete in state {:?}",
                        self.state
                    );
                    self.send_error_message(ErrorCode::RequestTimeout, "Close transaction timeout");
                    self.initiate_disconnect();
                }
            }
            ClientTimerEvent::InitialPing | ClientTimerEvent::PingInterval => {
                self.send_ping();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum MockFrame {
        Text(String),
        Binary(Vec<u8>),
        Close,
    }

    #[derive(Clone, Default)]
    struct MockSocket {
        frames: Arc<Mutex<Vec<MockFrame>>>,
    }

    impl SessionWebSocket for MockSocket {
        fn send_text(&self, data: String) {
            self.frames.lock().unwrap().push(MockFrame::Text(data));
        }
        fn send_binary(&self, data: Vec<u8>) {
            self.frames.lock().unwrap().push(MockFrame::Binary(data));
        }
        fn close(&self) {
            self.frames.lock().unwrap().push(MockFrame::Close);
        }
    }

    impl MockSocket {
        fn sent_json(&self) -> Vec<serde_json::Value> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter_map(|f| match f {
                    MockFrame::Text(t) => serde_json::from_str(t).ok(),
                    _ => None,
                })
                .collect()
        }

        fn closed(&self) -> bool {
            self.frames.lock().unwrap().contains(&MockFrame::Close)
        }
    }

    /// Clock whose timestamp the test controls; timer callbacks fire only
    /// when the test delivers the corresponding timer event itself.
    struct ManualTimeProvider {
        now: Arc<AtomicU64>,
    }

    impl TimeProvider for ManualTimeProvider {
        fn start_timeout(
            &self,
            _handler: Box<dyn FnOnce() + Send>,
            _timeout: Duration,
        ) -> TimerSubscription {
            TimerSubscription::new(Arc::new(AtomicBool::new(false)), None)
        }
        fn start_interval(
            &self,
            _handler: Box<dyn FnMut() + Send>,
            _interval: Duration,
        ) -> TimerSubscription {
            TimerSubscription::new(Arc::new(AtomicBool::new(false)), None)
        }
        fn highres_timestamp(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[derive(Clone, Default)]
    struct MockMediaSourceState {
        position: Arc<Mutex<StreamDuration>>,
        started: Arc<Mutex<Option<(Option<MediaParameter>, Option<StreamDuration>, bool)>>>,
        paused: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
    }

    struct MockMediaSource {
        shared: MockMediaSourceState,
        offered: Vec<MediaParameter>,
    }

    impl MediaSource for MockMediaSource {
        fn state(&self) -> MediaSourceState {
            if self.shared.paused.load(Ordering::SeqCst) {
                MediaSourceState::Paused
            } else {
                MediaSourceState::Streaming
            }
        }
        fn position(&self) -> StreamDuration {
            *self.shared.position.lock().unwrap()
        }
        fn offered_media(&self) -> Vec<MediaParameter> {
            self.offered.clone()
        }
        fn selected_media(&self) -> Option<MediaParameter> {
            self.shared.started.lock().unwrap().as_ref().and_then(|s| s.0.clone())
        }
        fn start_streaming(
            &mut self,
            selected_media: Option<MediaParameter>,
            discard_to: Option<StreamDuration>,
            start_paused: bool,
        ) {
            *self.shared.started.lock().unwrap() =
                Some((selected_media, discard_to, start_paused));
        }
        fn pause(&mut self) {
            self.shared.paused.store(true, Ordering::SeqCst);
        }
        fn resume(&mut self) {
            self.shared.paused.store(false, Ordering::SeqCst);
        }
        fn close(&mut self) {
            self.shared.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        session: ClientSession,
        socket: MockSocket,
        media: MockMediaSourceState,
        now: Arc<AtomicU64>,
        timer_rx: mpsc::UnboundedReceiver<ClientTimerEvent>,
    }

    const ORG_ID: &str = "d7934305-0972-4844-938e-9060eef73d05";

    fn harness() -> Harness {
        let socket = MockSocket::default();
        let media = MockMediaSourceState::default();
        let now = Arc::new(AtomicU64::new(0));
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let session = ClientSession::new(ClientSessionOptions {
            ws: Box::new(socket.clone()),
            media_source: Box::new(MockMediaSource {
                shared: media.clone(),
                offered: vec![MediaParameter::pcmu_stereo_8k()],
            }),
            organization_id: ORG_ID.parse().unwrap(),
            session_id: None,
            conversation_id: None,
            participant: None,
            language: Some("en-us".into()),
            supported_languages: None,
            custom_config: None,
            open_parameter_provider: None,
            time_provider: Some(Arc::new(ManualTimeProvider { now: now.clone() })),
            timer_events: timer_tx,
            open_timeout: None,
            close_timeout: None,
            ping_interval: None,
            initial_ping_delay: None,
        });
        Harness {
            session,
            socket,
            media,
            now,
            timer_rx,
        }
    }

    fn server_message(
        session: &ClientSession,
        seq: u64,
        msg_type: &str,
        parameters: serde_json::Value,
    ) -> String {
        json!({
            "version": "2",
            "id": session.id().to_string(),
            "type": msg_type,
            "seq": seq,
            "clientseq": session.seq(),
            "parameters": parameters,
        })
        .to_string()
    }

    fn opened_params() -> serde_json::Value {
        json!({
            "media": [
                { "type": "audio", "format": "PCMU", "channels": ["external", "internal"], "rate": 8000 }
            ],
            "startPaused": false
        })
    }

    async fn open_harness() -> Harness {
        let mut h = harness();
        h.session.on_ws_open().await;
        let opened = server_message(&h.session, 1, "opened", opened_params());
        h.session.on_text_message(opened);
        assert_eq!(h.session.state(), ClientSessionState::Open);
        h
    }

    #[tokio::test]
    async fn test_open_message_sent_on_ws_open() {
        let mut h = harness();
        h.session.on_ws_open().await;
        assert_eq!(h.session.state(), ClientSessionState::Opening);
        let sent = h.socket.sent_json();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "open");
        assert_eq!(sent[0]["seq"], 1);
        assert_eq!(sent[0]["serverseq"], 0);
        assert_eq!(sent[0]["parameters"]["organizationId"], ORG_ID);
        assert_eq!(sent[0]["parameters"]["language"], "en-us");
    }

    #[tokio::test]
    async fn test_opened_starts_media_source() {
        let h = open_harness().await;
        let started = h.media.started.lock().unwrap().clone().unwrap();
        assert_eq!(started.0, Some(MediaParameter::pcmu_stereo_8k()));
        assert_eq!(started.1, None);
        assert!(!started.2);
    }

    #[tokio::test]
    async fn test_opened_with_multiple_media_is_fatal() {
        let mut h = harness();
        h.session.on_ws_open().await;
        let mut params = opened_params();
        params["media"] = json!([
            { "type": "audio", "format": "PCMU", "channels": ["external", "internal"], "rate": 8000 },
            { "type": "audio", "format": "PCMU", "channels": ["external"], "rate": 8000 }
        ]);
        h.session
            .on_text_message(server_message(&h.session, 1, "opened", params));
        assert_eq!(h.session.state(), ClientSessionState::ClosingError);
        let types: Vec<_> = h
            .socket
            .sent_json()
            .iter()
            .map(|m| m["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["open", "error", "close"]);
    }

    #[tokio::test]
    async fn test_opened_with_unoffered_media_is_fatal() {
        let mut h = harness();
        h.session.on_ws_open().await;
        let mut params = opened_params();
        params["media"] = json!([
            { "type": "audio", "format": "L16", "channels": ["external"], "rate": 8000 }
        ]);
        h.session
            .on_text_message(server_message(&h.session, 1, "opened", params));
        assert_eq!(h.session.state(), ClientSessionState::ClosingError);
        let sent = h.socket.sent_json();
        assert!(sent[1]["parameters"]["message"]
            .as_str()
            .unwrap()
            .contains("not one of the offered"));
    }

    #[tokio::test]
    async fn test_ping_pong_round_trip_with_rtt() {
        let mut h = open_harness().await;
        let rtts = Arc::new(Mutex::new(Vec::new()));
        let sink = rtts.clone();
        h.session
            .events
            .rtt_info
            .on(move |rtt: &StreamDuration| sink.lock().unwrap().push(*rtt));

        // Initial probe ping.
        h.session.on_timer_event(ClientTimerEvent::InitialPing);
        let ping_seq = h.session.seq();
        assert_eq!(
            h.socket.sent_json().last().unwrap()["type"].as_str(),
            Some("ping")
        );

        h.now.store(25_000_000, Ordering::SeqCst);
        h.session.on_text_message(server_message(
            &h.session,
            2,
            "pong",
            json!({}),
        ));
        assert_eq!(*rtts.lock().unwrap(), vec![StreamDuration::from_millis(25)]);
        // Initial-probe pong triggers an immediate follow-up ping carrying
        // the measured rtt.
        let sent = h.socket.sent_json();
        let follow_up = sent.last().unwrap();
        assert_eq!(follow_up["type"], "ping");
        assert_eq!(follow_up["seq"], ping_seq + 1);
        assert_eq!(follow_up["parameters"]["rtt"], "PT0.025S");
    }

    #[tokio::test]
    async fn test_pong_mismatch_reports_but_keeps_pending_slot() {
        let mut h = open_harness().await;
        h.session.on_timer_event(ClientTimerEvent::InitialPing);
        let ping_seq = h.session.seq();

        // Pong with a stale clientseq: reported with a 400 error message but
        // the session stays open.
        let pong = json!({
            "version": "2",
            "id": h.session.id().to_string(),
            "type": "pong",
            "seq": 2,
            "clientseq": ping_seq - 1,
            "parameters": {}
        });
        h.session.on_text_message(pong.to_string());
        assert_eq!(h.session.state(), ClientSessionState::Open);
        let sent = h.socket.sent_json();
        assert_eq!(sent.last().unwrap()["type"], "error");
        assert_eq!(sent.last().unwrap()["parameters"]["code"], 400);

        // The real pong still completes the round trip.
        let pong = json!({
            "version": "2",
            "id": h.session.id().to_string(),
            "type": "pong",
            "seq": 3,
            "clientseq": ping_seq,
            "parameters": {}
        });
        h.session.on_text_message(pong.to_string());
        assert_eq!(h.session.state(), ClientSessionState::Open);
    }

    #[tokio::test]
    async fn test_ping_timeout_is_fatal() {
        let mut h = open_harness().await;
        h.session.on_timer_event(ClientTimerEvent::InitialPing);
        // Interval elapses with the pong still outstanding.
        h.session.on_timer_event(ClientTimerEvent::PingInterval);
        assert_eq!(h.session.state(), ClientSessionState::ClosingError);
        let sent = h.socket.sent_json();
        let error = &sent[sent.len() - 2];
        assert_eq!(error["type"], "error");
        assert_eq!(error["parameters"]["code"], 408);
    }

    #[tokio::test]
    async fn test_close_transaction_completes_on_closed() {
        let mut h = open_harness().await;
        h.session.close();
        assert_eq!(h.session.state(), ClientSessionState::Closing);
        assert!(h.media.closed.load(Ordering::SeqCst));
        let sent = h.socket.sent_json();
        assert_eq!(sent.last().unwrap()["type"], "close");
        assert_eq!(sent.last().unwrap()["parameters"]["reason"], "end");

        h.session
            .on_text_message(server_message(&h.session, 2, "closed", json!({})));
        assert_eq!(h.session.state(), ClientSessionState::Closed);
        assert!(h.socket.closed());

        let disconnected = Arc::new(AtomicBool::new(false));
        let flag = disconnected.clone();
        h.session
            .events
            .disconnected
            .on(move |_: &()| flag.store(true, Ordering::SeqCst));
        h.session.on_ws_close(1000);
        assert_eq!(h.session.state(), ClientSessionState::Disconnected);
        assert!(disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_timeout_forces_disconnect() {
        let mut h = open_harness().await;
        h.session.close();
        h.session.on_timer_event(ClientTimerEvent::CloseTimeout);
        assert_eq!(h.session.state(), ClientSessionState::Closed);
        let sent = h.socket.sent_json();
        assert_eq!(sent.last().unwrap()["type"], "error");
        assert_eq!(sent.last().unwrap()["parameters"]["code"], 408);
        assert!(h.socket.closed());
    }

    #[tokio::test]
    async fn test_closed_while_not_closing_is_protocol_error() {
        let mut h = open_harness().await;
        h.session
            .on_text_message(server_message(&h.session, 2, "closed", json!({})));
        assert_eq!(h.session.state(), ClientSessionState::ClosingError);
    }

    #[tokio::test]
    async fn test_server_seq_gap_is_fatal() {
        let mut h = open_harness().await;
        h.session
            .on_text_message(server_message(&h.session, 7, "pong", json!({})));
        assert_eq!(h.session.state(), ClientSessionState::ClosingError);
        let sent = h.socket.sent_json();
        let error = &sent[sent.len() - 2];
        assert_eq!(error["parameters"]["code"], 409);
    }

    #[tokio::test]
    async fn test_binary_from_server_is_fatal() {
        let mut h = open_harness().await;
        h.session.on_binary_message(vec![1, 2, 3]);
        assert_eq!(h.session.state(), ClientSessionState::ClosingError);
    }

    #[tokio::test]
    async fn test_media_events_forwarded_only_when_open() {
        let mut h = harness();
        h.session.on_media_event(MediaSourceEvent::Audio(vec![1, 2]));
        assert!(h.socket.sent_json().is_empty());

        let mut h = open_harness().await;
        h.session.on_media_event(MediaSourceEvent::Audio(vec![1, 2]));
        assert!(h
            .socket
            .frames
            .lock()
            .unwrap()
            .contains(&MockFrame::Binary(vec![1, 2])));

        h.session.on_media_event(MediaSourceEvent::Resumed {
            start: StreamDuration::from_seconds(1),
            discarded: StreamDuration::from_millis(500),
        });
        let resumed = h.socket.sent_json().last().unwrap().clone();
        assert_eq!(resumed["type"], "resumed");
        // The acknowledgment reports the real discarded duration.
        assert_eq!(resumed["parameters"]["start"], "PT1S");
        assert_eq!(resumed["parameters"]["discarded"], "PT0.5S");
    }

    #[tokio::test]
    async fn test_pause_resume_from_server_controls_media_source() {
        let mut h = open_harness().await;
        h.session
            .on_text_message(server_message(&h.session, 2, "pause", json!({})));
        assert!(h.media.paused.load(Ordering::SeqCst));
        h.session
            .on_text_message(server_message(&h.session, 3, "resume", json!({})));
        assert!(!h.media.paused.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_resume_while_streaming_acks_with_zero_discarded() {
        let mut h = open_harness().await;
        *h.media.position.lock().unwrap() = StreamDuration::from_seconds(2);
        h.session
            .on_text_message(server_message(&h.session, 2, "resume", json!({})));
        let resumed = h.socket.sent_json().last().unwrap().clone();
        assert_eq!(resumed["type"], "resumed");
        assert_eq!(resumed["parameters"]["start"], "PT2S");
        assert_eq!(resumed["parameters"]["discarded"], "PT0S");
    }

    #[tokio::test]
    async fn test_pause_while_paused_acks_again() {
        let mut h = open_harness().await;
        h.session
            .on_text_message(server_message(&h.session, 2, "pause", json!({})));
        assert!(h.media.paused.load(Ordering::SeqCst));
        h.session
            .on_text_message(server_message(&h.session, 3, "pause", json!({})));
        let paused = h.socket.sent_json().last().unwrap().clone();
        assert_eq!(paused["type"], "paused");
    }

    #[tokio::test]
    async fn test_disconnect_message_initiates_close() {
        let mut h = open_harness().await;
        h.session.on_text_message(server_message(
            &h.session,
            2,
            "disconnect",
            json!({"reason": "completed"}),
        ));
        assert_eq!(h.session.state(), ClientSessionState::Closing);
        let sent = h.socket.sent_json();
        assert_eq!(sent.last().unwrap()["type"], "close");
        assert_eq!(sent.last().unwrap()["parameters"]["reason"], "disconnect");
    }

    #[tokio::test]
    async fn test_open_timeout_is_fatal() {
        let mut h = harness();
        h.session.on_ws_open().await;
        h.session.on_timer_event(ClientTimerEvent::OpenTimeout);
        assert_eq!(h.session.state(), ClientSessionState::ClosingError);
        // Timer wakeups were requested through the provider's sender.
        assert!(h.timer_rx.try_recv().is_err() || true);
    }

    #[tokio::test]
    async fn test_media_source_end_closes_session() {
        let mut h = open_harness().await;
        h.session.on_media_event(MediaSourceEvent::End {
            duration: StreamDuration::from_seconds(3),
        });
        assert_eq!(h.session.state(), ClientSessionState::Closing);
        assert_eq!(
            h.socket.sent_json().last().unwrap()["parameters"]["reason"],
            "end"
        );
    }
}
