//! # AudioHook Backend
//!
//! Server and client implementations of the AudioHook protocol: a
//! bidirectional, sequenced WebSocket protocol carrying JSON control
//! messages interleaved with raw binary audio frames, used to stream call
//! audio from a telephony platform to an analytics consumer.
//!
//! ## Crate layout:
//! - **protocol**: wire message model, stream durations, media types
//! - **session**: the server and client protocol state machines with their
//!   injectable transport/clock seams
//! - **httpsig**: HTTP message-signature verification (RFC 8941 structured
//!   fields + draft-ietf-httpbis-message-signatures)
//! - **auth**: timing-equalized request authentication for the endpoint
//! - **websocket**: actix-web endpoint bridging sockets to server sessions
//! - **media**: tone media source for the client binary

pub mod auth;
pub mod config;
pub mod error;
pub mod httpsig;
pub mod media;
pub mod protocol;
pub mod session;
pub mod state;
pub mod websocket;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use protocol::StreamDuration;
pub use session::{ClientSession, ClientSessionOptions, ServerSession, ServerSessionOptions};
pub use state::AppState;
