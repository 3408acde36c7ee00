// WebSocket envelopes for the syncroom room protocol.
//
// Server -> client traffic is always a JSON envelope tagged by `type`.
// Client -> server traffic is the full document text: verbatim in a text
// frame, or wrapped in a `content` envelope in a binary frame.

use serde::{Deserialize, Serialize};

use crate::types::{PresenceUser, Role};

/// Close code sent when the bearer credential is missing, invalid or expired.
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4401;
/// Close code sent when the credential is valid but grants no role on the room.
pub const CLOSE_ACCESS_DENIED: u16 = 4403;
/// Close code sent when a backing service fails during the handshake.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Close code sent to every live connection when the instance shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

pub const AUTHENTICATION_FAILED_REASON: &str = "Invalid or expired token";
pub const ACCESS_DENIED_REASON: &str = "Access denied to this room";
pub const INTERNAL_ERROR_REASON: &str = "Room is temporarily unavailable";
pub const SHUTDOWN_REASON: &str = "Server shutting down";

pub const VIEWER_EDIT_REJECTED: &str = "Viewers cannot edit the document";
pub const SAVE_FAILED: &str = "Failed to save document; please retry";
pub const INVALID_MESSAGE: &str = "Binary message is not a content envelope";
pub const EDIT_TOO_LARGE: &str = "Document exceeds the maximum edit size";

/// Every envelope the server sends on a room connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full document text. `edited_by` is absent on the join snapshot.
    Content {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        edited_by: Option<String>,
    },

    /// Complete online-user list for the room.
    Presence { users: Vec<PresenceUser> },

    /// The receiving connection's role, sent once after the snapshot.
    Role { role: Role },

    /// Per-message failure reported to the offending sender only.
    Error { message: String },
}

impl ServerMessage {
    pub fn snapshot(data: impl Into<String>) -> Self {
        Self::Content { data: data.into(), edited_by: None }
    }

    pub fn edit(data: impl Into<String>, edited_by: impl Into<String>) -> Self {
        Self::Content { data: data.into(), edited_by: Some(edited_by.into()) }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Content { .. } => "content",
            Self::Presence { .. } => "presence",
            Self::Role { .. } => "role",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InboundError {
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
    #[error("binary frame is not a content envelope")]
    NotAnEnvelope,
    #[error("unsupported message type `{0}`")]
    UnsupportedType(String),
}

/// Wrap document text in the envelope accepted on binary frames.
pub fn encode_content_envelope(data: &str) -> String {
    serde_json::json!({ "type": "content", "data": data }).to_string()
}

/// Extract the document text from a binary frame.
///
/// The payload must be exactly `{"type":"content","data":"..."}`: no other
/// keys, `data` a string. Text frames never pass through here; they are the
/// document verbatim.
pub fn decode_content_envelope(payload: &[u8]) -> Result<String, InboundError> {
    let raw = std::str::from_utf8(payload).map_err(|_| InboundError::NotUtf8)?;
    let Ok(serde_json::Value::Object(mut fields)) = serde_json::from_str(raw) else {
        return Err(InboundError::NotAnEnvelope);
    };
    if fields.len() != 2 {
        return Err(InboundError::NotAnEnvelope);
    }

    match fields.remove("type") {
        Some(serde_json::Value::String(kind)) if kind == "content" => {}
        Some(serde_json::Value::String(kind)) => return Err(InboundError::UnsupportedType(kind)),
        _ => return Err(InboundError::NotAnEnvelope),
    }

    match fields.remove("data") {
        Some(serde_json::Value::String(data)) => Ok(data),
        _ => Err(InboundError::NotAnEnvelope),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_envelope_is_unwrapped() {
        let decoded = decode_content_envelope(br#"{"type":"content","data":"Hello"}"#);
        assert_eq!(decoded.as_deref(), Ok("Hello"));
    }

    #[test]
    fn encoded_envelope_decodes_to_the_same_text() {
        let text = r#"{"type":"content","data":"x"}"#;
        let envelope = encode_content_envelope(text);
        assert_eq!(decode_content_envelope(envelope.as_bytes()).as_deref(), Ok(text));
    }

    #[test]
    fn envelopes_with_extra_keys_are_not_content() {
        assert_eq!(
            decode_content_envelope(br#"{"type":"content","data":"x","edited_by":"eve"}"#),
            Err(InboundError::NotAnEnvelope)
        );
        assert_eq!(
            decode_content_envelope(br#"{"type":"content","data":42}"#),
            Err(InboundError::NotAnEnvelope)
        );
        assert_eq!(decode_content_envelope(b"plain text"), Err(InboundError::NotAnEnvelope));
    }

    #[test]
    fn other_envelope_types_are_rejected() {
        assert_eq!(
            decode_content_envelope(br#"{"type":"presence","users":[]}"#),
            Err(InboundError::UnsupportedType("presence".to_string()))
        );
    }

    #[test]
    fn non_utf8_payload_is_rejected() {
        assert_eq!(decode_content_envelope(&[0xff, 0xfe, 0x00]), Err(InboundError::NotUtf8));
    }

    #[test]
    fn snapshot_omits_edited_by() {
        let encoded =
            serde_json::to_value(ServerMessage::snapshot("Hello")).expect("should serialize");
        assert_eq!(encoded, serde_json::json!({ "type": "content", "data": "Hello" }));
    }
}
