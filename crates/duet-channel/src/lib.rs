//! Backend-facing side of duet.
//!
//! The voice-turn exchange runs over a persistent WebSocket
//! ([`ChannelSession`]); plain text and document submissions go through the
//! request/response [`Backend`] trait.

mod http;
mod protocol;
mod session;

pub use http::{Backend, FALLBACK_SUMMARY, HttpBackend, RequestError};
pub use protocol::{
    AudioSegment, InboundMessage, MalformedMessage, OutboundMessage, decode_inbound,
};
pub use session::{ChannelError, ChannelEvent, ChannelSession, Loopback};
