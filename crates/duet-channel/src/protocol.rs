//! Wire format of the voice-turn channel.
//!
//! Every message is a JSON text frame tagged by `kind`. Audio travels as
//! base64; inbound payloads may also arrive as `data:` URLs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A synthesized segment pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSegment {
    /// Encoded audio (WAV, MP3, ...)
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Which synthesized voice is speaking
    pub speaker_id: String,
    /// Transcript of the segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Conversation stage reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<u32>,
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InboundMessage {
    AudioSegment(AudioSegment),
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OutboundMessage {
    /// A finished recording, WAV encoded
    #[serde(rename_all = "camelCase")]
    AudioSubmission {
        #[serde(with = "base64_bytes")]
        blob: Vec<u8>,
        sample_rate: u32,
        channels: u16,
    },
    /// The client finished playing the last segment it was sent
    TurnDone,
}

#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("unexpected binary frame ({0} bytes)")]
    Binary(usize),
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode one inbound text frame.
pub fn decode_inbound(text: &str) -> Result<InboundMessage, MalformedMessage> {
    Ok(serde_json::from_str(text)?)
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        // Accept `data:audio/mpeg;base64,....` as well as bare base64.
        let encoded = match encoded.split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => encoded.as_str(),
        };
        STANDARD.decode(encoded.trim()).map_err(de::Error::custom)
    }
}
