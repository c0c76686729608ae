//! # Wire Message Model
//!
//! The closed set of AudioHook client/server messages and their validation.
//!
//! ## Envelope (JSON over WebSocket text frames, ≤65535 bytes):
//! ```json
//! { "version": "2", "id": "<uuid>", "type": "<type>", "seq": 1,
//!   "serverseq": 0, "position": "PT0S", "parameters": {} }
//! ```
//! Client messages carry `serverseq` + `position`; server messages carry
//! `clientseq` instead.
//!
//! ## Validation:
//! Parsing is two-stage so the session can report precise protocol errors:
//! the envelope shape is checked first, then the type is matched against the
//! known set (unknown type vs. known-type-with-bad-parameters are distinct
//! failures). Anything not matching is rejected outright.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use super::duration::StreamDuration;
use super::media::MediaParameter;

/// Maximum size of a text frame accepted or produced by a session.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Protocol version marker; always serializes as the string `"2"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolVersion;

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2")
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "2" {
            Ok(ProtocolVersion)
        } else {
            Err(de::Error::custom(format!("unsupported version {s:?}")))
        }
    }
}

/// Call participant identity carried in the open parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: Uuid,
    pub ani: String,
    pub ani_name: String,
    pub dnis: String,
}

/// Reference to a prior session continued by this connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuedSession {
    pub id: Uuid,
    pub serverseq: u64,
    pub clientseq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenParameters {
    pub organization_id: Uuid,
    pub conversation_id: Uuid,
    pub participant: Participant,
    pub media: Vec<MediaParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_languages: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continued_sessions: Option<Vec<ContinuedSession>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpenedParameters {
    pub media: Vec<MediaParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discard_to: Option<StreamDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_languages: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    End,
    Error,
    Disconnect,
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseParameters {
    pub reason: CloseReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectReason {
    Completed,
    Unauthorized,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectParameters {
    pub reason: DisconnectReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardedParameters {
    pub start: StreamDuration,
    pub discarded: StreamDuration,
}

/// HTTP-status-like protocol error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ErrorCode {
    BadRequest = 400,
    MethodNotAllowed = 405,
    RequestTimeout = 408,
    Conflict = 409,
    PayloadTooLarge = 413,
    UnsupportedMediaType = 415,
    TooManyRequests = 429,
    ServerError = 500,
    ServiceUnavailable = 503,
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            400 => Ok(ErrorCode::BadRequest),
            405 => Ok(ErrorCode::MethodNotAllowed),
            408 => Ok(ErrorCode::RequestTimeout),
            409 => Ok(ErrorCode::Conflict),
            413 => Ok(ErrorCode::PayloadTooLarge),
            415 => Ok(ErrorCode::UnsupportedMediaType),
            429 => Ok(ErrorCode::TooManyRequests),
            500 => Ok(ErrorCode::ServerError),
            503 => Ok(ErrorCode::ServiceUnavailable),
            other => Err(format!("unknown error code {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorParameters {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<StreamDuration>,
}

/// Opaque analytics entity (`transcript`, `agentassist`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventParameters {
    pub entities: Vec<EventEntity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt: Option<StreamDuration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReconnectParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumedParameters {
    pub start: StreamDuration,
    pub discarded: StreamDuration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateParameters {
    pub language: String,
}

/// Parameter set for messages that carry none (`{}` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EmptyParameters {}

/// Message sent from the streaming client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub version: ProtocolVersion,
    pub id: Uuid,
    pub seq: u64,
    pub serverseq: u64,
    pub position: StreamDuration,
    #[serde(flatten)]
    pub kind: ClientMessageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters", rename_all = "lowercase")]
pub enum ClientMessageKind {
    Open(OpenParameters),
    Close(CloseParameters),
    Discarded(DiscardedParameters),
    Error(ErrorParameters),
    Paused(EmptyParameters),
    Ping(PingParameters),
    Resumed(ResumedParameters),
    Update(UpdateParameters),
}

impl ClientMessageKind {
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessageKind::Open(_) => "open",
            ClientMessageKind::Close(_) => "close",
            ClientMessageKind::Discarded(_) => "discarded",
            ClientMessageKind::Error(_) => "error",
            ClientMessageKind::Paused(_) => "paused",
            ClientMessageKind::Ping(_) => "ping",
            ClientMessageKind::Resumed(_) => "resumed",
            ClientMessageKind::Update(_) => "update",
        }
    }
}

/// Message sent from the server to the streaming client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub version: ProtocolVersion,
    pub id: Uuid,
    pub seq: u64,
    pub clientseq: u64,
    #[serde(flatten)]
    pub kind: ServerMessageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters", rename_all = "lowercase")]
pub enum ServerMessageKind {
    Closed(EmptyParameters),
    Disconnect(DisconnectParameters),
    Event(EventParameters),
    Opened(OpenedParameters),
    Pause(EmptyParameters),
    Pong(EmptyParameters),
    Reconnect(ReconnectParameters),
    Resume(EmptyParameters),
    Updated(EmptyParameters),
}

impl ServerMessageKind {
    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessageKind::Closed(_) => "closed",
            ServerMessageKind::Disconnect(_) => "disconnect",
            ServerMessageKind::Event(_) => "event",
            ServerMessageKind::Opened(_) => "opened",
            ServerMessageKind::Pause(_) => "pause",
            ServerMessageKind::Pong(_) => "pong",
            ServerMessageKind::Reconnect(_) => "reconnect",
            ServerMessageKind::Resume(_) => "resume",
            ServerMessageKind::Updated(_) => "updated",
        }
    }
}

pub const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "open",
    "close",
    "discarded",
    "error",
    "paused",
    "ping",
    "resumed",
    "update",
];

pub const SERVER_MESSAGE_TYPES: &[&str] = &[
    "closed",
    "disconnect",
    "event",
    "opened",
    "pause",
    "pong",
    "reconnect",
    "resume",
    "updated",
];

/// Why a decoded text frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageParseError {
    #[error("message not valid JSON: {0}")]
    InvalidJson(String),
    #[error("message not a well-formed {direction} message: {detail}")]
    NotAMessage {
        direction: &'static str,
        detail: String,
    },
    #[error("'{0}' is not a supported message type")]
    UnknownType(String),
    #[error("invalid '{message_type}' message (invalid/missing parameters): {detail}")]
    BadParameters {
        message_type: String,
        detail: String,
    },
}

fn envelope_error(direction: &'static str, detail: impl Into<String>) -> MessageParseError {
    MessageParseError::NotAMessage {
        direction,
        detail: detail.into(),
    }
}

/// Envelope fields of a structurally valid client message, before its type
/// and parameters are checked.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEnvelope {
    pub id: Uuid,
    pub message_type: String,
    pub seq: u64,
    pub serverseq: u64,
    pub position: StreamDuration,
}

/// Envelope fields of a structurally valid server message.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEnvelope {
    pub id: Uuid,
    pub message_type: String,
    pub seq: u64,
    pub clientseq: u64,
}

fn check_common_envelope(
    obj: &serde_json::Map<String, Value>,
    direction: &'static str,
) -> Result<(Uuid, String, u64), MessageParseError> {
    match obj.get("version").and_then(Value::as_str) {
        Some("2") => {}
        _ => return Err(envelope_error(direction, "\"version\" must be the string \"2\"")),
    }
    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| envelope_error(direction, "\"id\" must be a UUID string"))?;
    let seq = obj
        .get("seq")
        .and_then(Value::as_u64)
        .ok_or_else(|| envelope_error(direction, "\"seq\" must be a non-negative integer"))?;
    if !obj.get("parameters").map(Value::is_object).unwrap_or(false) {
        return Err(envelope_error(direction, "\"parameters\" must be an object"));
    }
    let message_type = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| envelope_error(direction, "\"type\" must be a string"))?;
    Ok((id, message_type.to_string(), seq))
}

/// Structural envelope check for a client message (`isClientMessageBase`).
/// Does not check whether the type is known.
pub fn validate_client_envelope(value: &Value) -> Result<ClientEnvelope, MessageParseError> {
    let obj = value
        .as_object()
        .ok_or_else(|| envelope_error("client", "not a JSON object"))?;
    let (id, message_type, seq) = check_common_envelope(obj, "client")?;
    let serverseq = obj
        .get("serverseq")
        .and_then(Value::as_u64)
        .ok_or_else(|| envelope_error("client", "\"serverseq\" must be a non-negative integer"))?;
    let position = obj
        .get("position")
        .and_then(Value::as_str)
        .and_then(|p| p.parse::<StreamDuration>().ok())
        .ok_or_else(|| {
            envelope_error("client", "\"position\" must be an ISO-8601 seconds duration")
        })?;
    Ok(ClientEnvelope {
        id,
        message_type,
        seq,
        serverseq,
        position,
    })
}

/// Structural envelope check for a server message (`isServerMessageBase`).
pub fn validate_server_envelope(value: &Value) -> Result<ServerEnvelope, MessageParseError> {
    let obj = value
        .as_object()
        .ok_or_else(|| envelope_error("server", "not a JSON object"))?;
    let (id, message_type, seq) = check_common_envelope(obj, "server")?;
    let clientseq = obj
        .get("clientseq")
        .and_then(Value::as_u64)
        .ok_or_else(|| envelope_error("server", "\"clientseq\" must be a non-negative integer"))?;
    Ok(ServerEnvelope {
        id,
        message_type,
        seq,
        clientseq,
    })
}

/// Parse and fully validate a client text frame.
pub fn parse_client_message(data: &str) -> Result<ClientMessage, MessageParseError> {
    let value: Value =
        serde_json::from_str(data).map_err(|e| MessageParseError::InvalidJson(e.to_string()))?;
    parse_client_value(value)
}

/// Validate an already decoded JSON value as a client message.
pub fn parse_client_value(value: Value) -> Result<ClientMessage, MessageParseError> {
    let envelope = validate_client_envelope(&value)?;
    if !CLIENT_MESSAGE_TYPES.contains(&envelope.message_type.as_str()) {
        return Err(MessageParseError::UnknownType(envelope.message_type));
    }
    serde_json::from_value(value).map_err(|e| MessageParseError::BadParameters {
        message_type: envelope.message_type,
        detail: e.to_string(),
    })
}

/// Validate an already decoded JSON value as a server message.
pub fn parse_server_value(value: Value) -> Result<ServerMessage, MessageParseError> {
    let envelope = validate_server_envelope(&value)?;
    if !SERVER_MESSAGE_TYPES.contains(&envelope.message_type.as_str()) {
        return Err(MessageParseError::UnknownType(envelope.message_type));
    }
    serde_json::from_value(value).map_err(|e| MessageParseError::BadParameters {
        message_type: envelope.message_type,
        detail: e.to_string(),
    })
}

/// Parse and fully validate a server text frame.
pub fn parse_server_message(data: &str) -> Result<ServerMessage, MessageParseError> {
    let value: Value =
        serde_json::from_str(data).map_err(|e| MessageParseError::InvalidJson(e.to_string()))?;
    parse_server_value(value)
}
