//! AudioHook protocol model: durations, media descriptions, and the wire
//! message types with their validators.

pub mod duration;
pub mod media;
pub mod message;

pub use duration::StreamDuration;
pub use media::{MediaChannel, MediaDataFrame, MediaFormat, MediaParameter, MediaType};
pub use message::{
    ClientMessage, ClientMessageKind, CloseReason, DisconnectReason, ErrorCode, ServerMessage,
    ServerMessageKind,
};
